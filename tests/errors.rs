//! Tests for how handler failures reach the client: code classification,
//! detail scrubbing, internal error masking and error-handler vetoes.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use rstest::rstest;
use serde_json::json;
use wsdispatch::{
    ConnectOptions,
    ErrorCode,
    MessageContext,
    RouterConfig,
    WsError,
    WsRouter,
    hooks::ErrorSite,
};
use wsdispatch_testing::{RecordingSocket, assert_error_frame, message, rpc_request};

async fn explode(_ctx: MessageContext) -> Result<(), WsError> { panic!("kaboom") }

async fn panicking_error_hook(_err: WsError, _site: ErrorSite) -> Result<bool, WsError> {
    panic!("error hook bug")
}

fn failing_router(err: WsError) -> WsRouter {
    WsRouter::new()
        .on("FAIL", move |_ctx| {
            let err = err.clone();
            async move { Err(err) }
        })
        .expect("route")
        .on("SYNC", |ctx| async move { ctx.send("SYNCED", None) })
        .expect("route")
}

#[rstest]
#[case(ErrorCode::InvalidArgument)]
#[case(ErrorCode::NotFound)]
#[case(ErrorCode::PermissionDenied)]
#[case(ErrorCode::FailedPrecondition)]
#[case(ErrorCode::AlreadyExists)]
#[case(ErrorCode::Unimplemented)]
#[tokio::test]
async fn terminal_codes_never_carry_retry_hints(#[case] code: ErrorCode) {
    let router = failing_router(WsError::new(code.clone(), "nope").with_retry_after_ms(500));
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(message("FAIL", None));
    let frames = socket.wait_for_frames(1).await;

    assert_error_frame!(frames[0], "ERROR", code.as_str());
    assert!(frames[0]["payload"].get("retryAfterMs").is_none());
    assert_eq!(frames[0]["payload"]["retryable"], false);
}

#[tokio::test]
async fn transient_codes_keep_clamped_retry_hints() {
    let router = failing_router(WsError::unavailable("busy").with_retry_after_ms(i64::MAX));
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(message("FAIL", None));
    let frames = socket.wait_for_frames(1).await;

    assert_error_frame!(frames[0], "ERROR", "UNAVAILABLE");
    assert_eq!(frames[0]["payload"]["retryable"], true);
    assert_eq!(frames[0]["payload"]["retryAfterMs"], 86_400_000_u64);
}

#[tokio::test]
async fn secret_detail_keys_are_stripped() {
    let err = WsError::invalid_argument("bad")
        .with_detail("field", "name")
        .with_detail("Password", "hunter2")
        .with_detail("nested", json!({"api_key": "k", "ok": true}));
    let router = failing_router(err);
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(message("FAIL", None));
    let frames = socket.wait_for_frames(1).await;

    let details = &frames[0]["payload"]["details"];
    assert_eq!(details, &json!({"field": "name", "nested": {"ok": true}}));
}

#[tokio::test]
async fn details_made_only_of_secrets_are_omitted() {
    let err = WsError::invalid_argument("bad").with_detail("apiKey", "k");
    let router = failing_router(err);
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(message("FAIL", None));
    let frames = socket.wait_for_frames(1).await;

    assert!(frames[0]["payload"].get("details").is_none());
}

#[rstest]
#[case(false, "Internal server error")]
#[case(true, "db exploded")]
#[tokio::test]
async fn internal_messages_are_masked_unless_exposed(
    #[case] expose: bool,
    #[case] expected: &str,
) {
    let config = RouterConfig {
        expose_error_details: expose,
        ..RouterConfig::default()
    };
    let router = failing_router(WsError::internal("db exploded").with_detail("table", "users"))
        .with_config(config)
        .expect("config");
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(message("FAIL", None));
    let frames = socket.wait_for_frames(1).await;

    assert_error_frame!(frames[0], "ERROR", "INTERNAL");
    assert_eq!(frames[0]["payload"]["message"], expected);
    assert_eq!(frames[0]["payload"].get("details").is_some(), expose);
}

#[tokio::test]
async fn panicking_handler_reports_internal_and_keeps_the_connection() {
    let router = WsRouter::new()
        .rpc("BOOM", "BOOM_RESULT", explode)
        .expect("route")
        .on("SYNC", |ctx| async move { ctx.send("SYNCED", None) })
        .expect("route");
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(rpc_request("BOOM", "r1", None, None));
    handle.deliver(message("SYNC", None));
    let frames = socket.wait_for_frames(2).await;

    assert_error_frame!(frames[0], "RPC_ERROR", "INTERNAL");
    assert_eq!(frames[0]["payload"]["message"], "Internal server error");
    assert_eq!(frames[1]["type"], "SYNCED");
    assert!(socket.close_frame().is_none());
}

#[tokio::test]
async fn unknown_type_is_unimplemented() {
    let router = failing_router(WsError::internal("unused"));
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(message("NOPE", None));
    let frames = socket.wait_for_frames(1).await;

    assert_error_frame!(frames[0], "ERROR", "UNIMPLEMENTED");
}

#[rstest]
#[case("not json")]
#[case(r#"{"payload": 1}"#)]
#[case(r#"{"type": ""}"#)]
#[case(r#"{"type": "SYNC", "meta": []}"#)]
#[tokio::test]
async fn malformed_frames_are_rejected_without_closing(#[case] raw: &str) {
    let router = failing_router(WsError::internal("unused"));
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(raw.to_owned());
    handle.deliver(message("SYNC", None));
    let frames = socket.wait_for_frames(2).await;

    assert_error_frame!(frames[0], "ERROR", "INVALID_ARGUMENT");
    assert_eq!(frames[1]["type"], "SYNCED");
    assert!(socket.close_frame().is_none());
}

#[tokio::test]
async fn reserved_types_are_permission_denied() {
    let router = failing_router(WsError::internal("unused"));
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(message("__admin", None));
    let frames = socket.wait_for_frames(1).await;

    assert_error_frame!(frames[0], "ERROR", "PERMISSION_DENIED");
}

#[tokio::test]
async fn error_handler_can_suppress_the_error_frame() {
    let seen = Arc::new(AtomicUsize::new(0));
    let s = seen.clone();
    let router = failing_router(WsError::not_found("gone"))
        .on_error(move |err, site| {
            let s = s.clone();
            async move {
                assert_eq!(err.code(), &ErrorCode::NotFound);
                assert_eq!(site.message_type.as_deref(), Some("FAIL"));
                s.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            }
        })
        .expect("hook");
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(message("FAIL", None));
    handle.deliver(message("SYNC", None));
    let frames = socket.wait_for_frames(1).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "SYNCED");
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_error_handler_does_not_block_later_handlers() {
    let seen = Arc::new(AtomicUsize::new(0));
    let s = seen.clone();
    let router = failing_router(WsError::not_found("gone"))
        .on_error(panicking_error_hook)
        .expect("hook")
        .on_error(|_err, _site| async move { Err(WsError::internal("hook failed")) })
        .expect("hook")
        .on_error(move |_err, _site| {
            let s = s.clone();
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        })
        .expect("hook");
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(message("FAIL", None));
    let frames = socket.wait_for_frames(1).await;

    assert_error_frame!(frames[0], "ERROR", "NOT_FOUND");
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn thrown_errors_are_not_sent_when_auto_send_is_disabled() {
    let config = RouterConfig {
        auto_send_error_on_throw: false,
        ..RouterConfig::default()
    };
    let router = failing_router(WsError::not_found("gone"))
        .with_config(config)
        .expect("config");
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(message("FAIL", None));
    handle.deliver(message("NOPE", None));
    let frames = socket.wait_for_frames(1).await;

    // Router-raised errors are still reported.
    assert_eq!(frames.len(), 1);
    assert_error_frame!(frames[0], "ERROR", "UNIMPLEMENTED");
}
