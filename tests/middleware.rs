//! Tests for middleware ordering, halting and the rate limit middleware.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use wsdispatch::{
    ConnectOptions,
    MessageContext,
    Middleware,
    Next,
    Route,
    WsError,
    WsRouter,
    handler_fn,
    rate_limit::{RateLimit, RateLimitPolicy, TokenBucketLimiter},
};
use wsdispatch_testing::{RecordingSocket, assert_error_frame, message, wait_idle};

type Trace = Arc<Mutex<Vec<String>>>;

struct Tag {
    name: &'static str,
    trace: Trace,
}

impl Tag {
    fn new(name: &'static str, trace: &Trace) -> Self {
        Self {
            name,
            trace: trace.clone(),
        }
    }

    fn push(&self, entry: String) { self.trace.lock().expect("lock poisoned").push(entry); }
}

#[async_trait]
impl Middleware for Tag {
    async fn call(&self, ctx: MessageContext, next: Next<'_>) -> Result<(), WsError> {
        self.push(format!("{}:before", self.name));
        let result = next.run(ctx).await;
        self.push(format!("{}:after", self.name));
        result
    }
}

/// Answers without calling `next`.
struct Halt;

#[async_trait]
impl Middleware for Halt {
    async fn call(&self, ctx: MessageContext, _next: Next<'_>) -> Result<(), WsError> {
        ctx.send("HALTED", None)
    }
}

fn traced_handler(trace: &Trace) -> wsdispatch::Handler {
    let trace = trace.clone();
    handler_fn(move |ctx| {
        let trace = trace.clone();
        async move {
            trace.lock().expect("lock poisoned").push("handler".into());
            ctx.send("DONE", None)
        }
    })
}

#[tokio::test]
async fn global_then_route_middleware_wrap_the_handler() {
    let trace = Trace::default();
    let route = Route::event("GO", traced_handler(&trace)).wrap(Tag::new("R1", &trace));
    let router = WsRouter::new()
        .wrap(Tag::new("G1", &trace))
        .expect("wrap")
        .wrap(Tag::new("G2", &trace))
        .expect("wrap")
        .route(route)
        .expect("route");
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(message("GO", None));
    socket.wait_for_frames(1).await;
    wait_idle(&handle).await;

    let trace = trace.lock().expect("lock poisoned").clone();
    assert_eq!(
        trace,
        [
            "G1:before",
            "G2:before",
            "R1:before",
            "handler",
            "R1:after",
            "G2:after",
            "G1:after",
        ]
    );
}

#[tokio::test]
async fn middleware_can_halt_the_chain() {
    let trace = Trace::default();
    let route = Route::event("GO", traced_handler(&trace)).wrap(Halt);
    let router = WsRouter::new()
        .wrap(Tag::new("G1", &trace))
        .expect("wrap")
        .route(route)
        .expect("route");
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(message("GO", None));
    let frames = socket.wait_for_frames(1).await;
    wait_idle(&handle).await;

    assert_eq!(frames[0]["type"], "HALTED");
    let trace = trace.lock().expect("lock poisoned").clone();
    assert_eq!(trace, ["G1:before", "G1:after"]);
}

#[tokio::test]
async fn route_middleware_only_wraps_its_route() {
    let trace = Trace::default();
    let router = WsRouter::new()
        .route(Route::event("A", traced_handler(&trace)).wrap(Tag::new("RA", &trace)))
        .expect("route")
        .route(Route::event("B", traced_handler(&trace)))
        .expect("route");
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    handle.deliver(message("B", None));
    socket.wait_for_frames(1).await;
    wait_idle(&handle).await;

    assert_eq!(*trace.lock().expect("lock poisoned"), ["handler"]);
}

#[tokio::test]
async fn rate_limit_rejects_once_the_bucket_is_empty() {
    let policy = RateLimitPolicy::new(2, 1).expect("policy");
    let limiter = Arc::new(TokenBucketLimiter::with_clock(policy, Arc::new(|| 1_000_u64)));
    let router = WsRouter::new()
        .wrap(RateLimit::new(limiter))
        .expect("wrap")
        .on("HIT", |ctx| async move { ctx.send("OK", None) })
        .expect("route");
    let socket = RecordingSocket::new();
    let handle = router.connect(socket.clone(), ConnectOptions::default());

    for _ in 0..3 {
        handle.deliver(message("HIT", None));
    }
    let frames = socket.wait_for_frames(3).await;

    assert_eq!(frames[0]["type"], "OK");
    assert_eq!(frames[1]["type"], "OK");
    assert_error_frame!(frames[2], "ERROR", "RESOURCE_EXHAUSTED");
    assert_eq!(frames[2]["payload"]["retryable"], true);
    assert_eq!(frames[2]["payload"]["retryAfterMs"], 1_000);
}
