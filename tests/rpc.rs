//! Tests for the RPC lifecycle: exactly-once terminal replies, deadlines,
//! deduplication, aborts and the idle sweep.

use std::{
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use serde_json::json;
use wsdispatch::{ConnectOptions, RouterConfig, WsError, WsRouter};
use wsdispatch_testing::{
    RecordingSocket,
    abort,
    assert_error_frame,
    message,
    rpc_request,
    wait_idle,
};

fn sync_route(router: WsRouter) -> WsRouter {
    router
        .on("SYNC", |ctx| async move { ctx.send("SYNCED", None) })
        .expect("route")
}

#[tokio::test]
async fn only_the_first_terminal_reply_reaches_the_client() {
    let router = sync_route(
        WsRouter::new()
            .rpc("GET", "GET_RESULT", |ctx| async move {
                assert!(ctx.reply(Some(json!({"value": 1})))?);
                assert!(!ctx.error(&WsError::not_found("late"))?);
                assert!(!ctx.reply(None)?);
                Err(WsError::internal("thrown after reply"))
            })
            .expect("route"),
    );
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(rpc_request("GET", "r1", None, None));
    handle.deliver(message("SYNC", None));
    let frames = socket.wait_for_frames(2).await;
    wait_idle(&handle).await;

    let frames_after = socket.frames();
    assert_eq!(frames_after.len(), 2, "unexpected frames {frames_after:?}");
    assert_eq!(frames[0]["type"], "GET_RESULT");
    assert_eq!(frames[0]["meta"]["correlationId"], "r1");
    assert_eq!(frames[0]["payload"]["value"], 1);
    assert_eq!(frames[1]["type"], "SYNCED");
}

#[tokio::test]
async fn handler_error_becomes_the_terminal_rpc_error() {
    let router = WsRouter::new()
        .rpc("GET", "GET_RESULT", |_ctx| async move {
            Err(WsError::not_found("no such item").with_detail("id", 7))
        })
        .expect("route");
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(rpc_request("GET", "r1", None, None));
    let frames = socket.wait_for_frames(1).await;

    assert_error_frame!(frames[0], "RPC_ERROR", "NOT_FOUND");
    assert_eq!(frames[0]["meta"]["correlationId"], "r1");
    assert_eq!(frames[0]["payload"]["details"]["id"], 7);
    assert_eq!(frames[0]["payload"]["retryable"], false);
}

#[tokio::test]
async fn rpc_without_correlation_id_is_rejected() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let router = WsRouter::new()
        .rpc("GET", "GET_RESULT", move |ctx| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                ctx.reply(None).map(drop)
            }
        })
        .expect("route");
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(message("GET", None));
    let frames = socket.wait_for_frames(1).await;

    assert_error_frame!(frames[0], "ERROR", "INVALID_ARGUMENT");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn answered_correlation_id_is_rejected_as_duplicate() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let router = WsRouter::new()
        .rpc("ADD", "ADD_RESULT", move |ctx| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                ctx.reply(Some(json!(3))).map(drop)
            }
        })
        .expect("route");
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(rpc_request("ADD", "r1", None, None));
    socket.wait_for_frames(1).await;
    handle.deliver(rpc_request("ADD", "r1", None, None));
    let frames = socket.wait_for_frames(2).await;

    assert_eq!(frames[0]["type"], "ADD_RESULT");
    assert_error_frame!(frames[1], "RPC_ERROR", "ALREADY_EXISTS");
    assert_eq!(frames[1]["meta"]["correlationId"], "r1");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn default_deadline_applies_and_time_remaining_floors_at_zero() {
    let samples = Arc::new(Mutex::new(Vec::new()));
    let s = samples.clone();
    let config = RouterConfig {
        rpc_timeout_ms: 1_000,
        ..RouterConfig::default()
    };
    let router = WsRouter::new()
        .with_config(config)
        .expect("config")
        .rpc("SLOW", "SLOW_RESULT", move |ctx| {
            let s = s.clone();
            async move {
                let record = |ctx: &wsdispatch::MessageContext| {
                    s.lock()
                        .expect("lock poisoned")
                        .push(ctx.time_remaining().expect("rpc context"));
                };
                record(&ctx);
                tokio::time::sleep(Duration::from_millis(300)).await;
                record(&ctx);
                tokio::time::sleep(Duration::from_millis(2_000)).await;
                record(&ctx);
                ctx.reply(None).map(drop)
            }
        })
        .expect("route");
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(rpc_request("SLOW", "r1", None, None));
    let frames = socket.wait_for_frames(1).await;
    assert_eq!(frames[0]["type"], "SLOW_RESULT");

    let samples = samples.lock().expect("lock poisoned").clone();
    assert_eq!(samples.len(), 3);
    assert!(samples[0] <= Duration::from_millis(1_000));
    assert!(samples[0] > Duration::from_millis(900));
    assert!(samples[1] < samples[0]);
    assert_eq!(samples[2], Duration::ZERO);
}

#[tokio::test]
async fn client_timeout_overrides_the_default() {
    let remaining = Arc::new(Mutex::new(None));
    let r = remaining.clone();
    let router = WsRouter::new()
        .rpc("GET", "GET_RESULT", move |ctx| {
            let r = r.clone();
            async move {
                *r.lock().expect("lock poisoned") = ctx.time_remaining();
                ctx.reply(None).map(drop)
            }
        })
        .expect("route");
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(rpc_request("GET", "r1", None, Some(250)));
    socket.wait_for_frames(1).await;

    let remaining = remaining
        .lock()
        .expect("lock poisoned")
        .expect("rpc context");
    assert!(remaining <= Duration::from_millis(250));
}

#[tokio::test]
async fn abort_cancels_a_running_rpc() {
    let cancelled = Arc::new(AtomicBool::new(false));
    let late_reply = Arc::new(Mutex::new(None));
    let (c, l) = (cancelled.clone(), late_reply.clone());
    let router = sync_route(
        WsRouter::new()
            .rpc("LONG", "LONG_RESULT", move |ctx| {
                let (c, l) = (c.clone(), l.clone());
                async move {
                    ctx.on_cancel(move || c.store(true, Ordering::SeqCst))?;
                    ctx.send("STARTED", None)?;
                    ctx.signal().expect("rpc context").cancelled().await;
                    *l.lock().expect("lock poisoned") = Some(ctx.reply(None)?);
                    Ok(())
                }
            })
            .expect("route"),
    );
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(rpc_request("LONG", "r1", None, None));
    socket.wait_for_frames(1).await;
    handle.deliver(abort("r1"));
    handle.deliver(message("SYNC", None));
    let frames = socket.wait_for_frames(2).await;
    wait_idle(&handle).await;

    assert!(cancelled.load(Ordering::SeqCst));
    assert_eq!(*late_reply.lock().expect("lock poisoned"), Some(false));
    assert_eq!(frames[1]["type"], "SYNCED");
    assert!(socket.frames_of_type("LONG_RESULT").is_empty());
    assert_eq!(handle.info().rpc_inflight(), 0);
}

#[tokio::test]
async fn peer_close_cancels_every_open_rpc() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let o = order.clone();
    let router = WsRouter::new()
        .rpc("LONG", "LONG_RESULT", move |ctx| {
            let o = o.clone();
            async move {
                let id = ctx.correlation_id().expect("correlation id");
                let (first, second) = (o.clone(), o.clone());
                let (a, b) = (id.clone(), id.clone());
                ctx.on_cancel(move || {
                    first.lock().expect("lock poisoned").push(format!("{a}:1"));
                })?;
                ctx.on_cancel(move || {
                    second.lock().expect("lock poisoned").push(format!("{b}:2"));
                })?;
                ctx.send("STARTED", None)?;
                ctx.signal().expect("rpc context").cancelled().await;
                Ok(())
            }
        })
        .expect("route");
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(rpc_request("LONG", "r1", None, None));
    socket.wait_for_frames(1).await;
    assert_eq!(handle.info().rpc_inflight(), 1);

    handle.close(1000, "bye");
    handle.closed().await;

    assert_eq!(
        *order.lock().expect("lock poisoned"),
        vec!["r1:1".to_owned(), "r1:2".to_owned()]
    );
    assert_eq!(handle.info().rpc_inflight(), 0);
    assert!(socket.frames_of_type("LONG_RESULT").is_empty());
    assert!(socket.frames_of_type("RPC_ERROR").is_empty());
    assert_eq!(socket.frames().len(), 1);
}

#[tokio::test]
async fn abort_for_unknown_rpc_is_ignored() {
    let router = sync_route(WsRouter::new());
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(abort("missing"));
    handle.deliver(message("SYNC", None));
    let frames = socket.wait_for_frames(1).await;

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "SYNCED");
}

#[tokio::test(start_paused = true)]
async fn idle_sweep_expires_unanswered_rpcs() {
    let responder = Arc::new(Mutex::new(None));
    let r = responder.clone();
    let config = RouterConfig {
        rpc_timeout_ms: 100,
        rpc_idle_timeout_ms: Some(200),
        rpc_cleanup_cadence_ms: 50,
        ..RouterConfig::default()
    };
    let router = WsRouter::new()
        .with_config(config)
        .expect("config")
        .rpc("PARK", "PARK_RESULT", move |ctx| {
            let r = r.clone();
            async move {
                *r.lock().expect("lock poisoned") = ctx.responder();
                ctx.send("PARKED", None)
            }
        })
        .expect("route");
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(rpc_request("PARK", "r1", None, None));
    socket.wait_for_frames(1).await;
    assert_eq!(handle.info().rpc_inflight(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(handle.info().rpc_inflight(), 0);
    let responder = responder
        .lock()
        .expect("lock poisoned")
        .clone()
        .expect("responder captured");
    assert!(responder.is_settled());
    assert!(responder.signal().is_cancelled());
    assert!(!responder.reply(None).expect("reply"));
}

#[tokio::test]
async fn responder_can_reply_after_the_handler_returns() {
    let responder = Arc::new(Mutex::new(None));
    let r = responder.clone();
    let router = WsRouter::new()
        .rpc("DEFER", "DEFER_RESULT", move |ctx| {
            let r = r.clone();
            async move {
                *r.lock().expect("lock poisoned") = ctx.responder();
                ctx.send("ACCEPTED", None)
            }
        })
        .expect("route");
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(rpc_request("DEFER", "r1", None, None));
    socket.wait_for_frames(1).await;
    let responder = responder
        .lock()
        .expect("lock poisoned")
        .clone()
        .expect("responder captured");
    assert!(responder.progress(Some(json!({"pct": 50}))));
    assert!(responder.reply(Some(json!("done"))).expect("reply"));
    assert!(!responder.progress(None));

    let frames = socket.wait_for_frames(3).await;
    assert_eq!(frames[1]["type"], "__rpc_progress");
    assert_eq!(frames[1]["payload"]["pct"], 50);
    assert_eq!(frames[2]["type"], "DEFER_RESULT");
    assert_eq!(frames[2]["payload"], "done");
}

#[tokio::test]
async fn terminal_reply_under_backpressure_becomes_resource_exhausted() {
    let config = RouterConfig {
        socket_buffer_limit_bytes: Some(10),
        ..RouterConfig::default()
    };
    let router = WsRouter::new()
        .with_config(config)
        .expect("config")
        .rpc("GET", "GET_RESULT", |ctx| async move {
            assert!(!ctx.progress(None)?);
            ctx.reply(Some(json!("big"))).map(drop)
        })
        .expect("route");
    let socket = RecordingSocket::new();
    socket.set_buffered_amount(100);
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(rpc_request("GET", "r1", None, None));
    let frames = socket.wait_for_frames(1).await;

    assert_eq!(frames.len(), 1);
    assert_error_frame!(frames[0], "RPC_ERROR", "RESOURCE_EXHAUSTED");
    assert_eq!(frames[0]["meta"]["correlationId"], "r1");
}

#[tokio::test]
async fn inflight_ceiling_rejects_new_rpcs() {
    let config = RouterConfig {
        rpc_max_inflight_per_socket: Some(1),
        ..RouterConfig::default()
    };
    let router = WsRouter::new()
        .with_config(config)
        .expect("config")
        .rpc("PARK", "PARK_RESULT", |ctx| async move { ctx.send("PARKED", None) })
        .expect("route");
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(rpc_request("PARK", "r1", None, None));
    socket.wait_for_frames(1).await;
    handle.deliver(rpc_request("PARK", "r2", None, None));
    let frames = socket.wait_for_frames(2).await;

    assert_error_frame!(frames[1], "RPC_ERROR", "RESOURCE_EXHAUSTED");
    assert_eq!(frames[1]["meta"]["correlationId"], "r2");
}
