//! Lifecycle hook runner.
//!
//! Hooks for each lifecycle edge run strictly in registration order, each
//! fully awaited before the next starts. A failing or panicking hook is
//! logged and isolated; it never tears down the connection by itself. A hook
//! that wants the connection gone returns [`HookSignal::Close`], which is an
//! intentional close and is not reported to error handlers.

use std::{fmt, future::Future, panic::AssertUnwindSafe, pin::Pin, sync::Arc};

use futures::FutureExt;
use log::{debug, warn};

use crate::{
    connection::{CloseInfo, ConnectionInfo},
    error::WsError,
    limits::LimitExceeded,
    panic::format_panic,
};

/// Boxed future returned by hooks.
pub type HookFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Non-success outcome of a hook.
#[derive(Debug, Clone)]
pub enum HookSignal {
    /// Close the connection deliberately with `code` and `reason`.
    Close { code: u16, reason: String },
    /// The hook failed.
    Error(WsError),
}

impl HookSignal {
    #[must_use]
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close {
            code,
            reason: reason.into(),
        }
    }
}

impl From<WsError> for HookSignal {
    fn from(err: WsError) -> Self { Self::Error(err) }
}

pub type HookResult = Result<(), HookSignal>;

/// Runs when a connection opens.
pub type OpenHook = dyn Fn(ConnectionInfo) -> HookFuture<HookResult> + Send + Sync;

/// Runs once after a connection closed.
pub type CloseHook = dyn Fn(ConnectionInfo, CloseInfo) -> HookFuture<HookResult> + Send + Sync;

/// Decides whether a connection may route messages. `Ok(false)` denies.
pub type AuthHook = dyn Fn(ConnectionInfo) -> HookFuture<Result<bool, HookSignal>> + Send + Sync;

/// Runs when a frame is rejected by a limit.
pub type LimitHook = dyn Fn(ConnectionInfo, LimitExceeded) -> HookFuture<HookResult> + Send + Sync;

/// Observes errors before they are sent. `Ok(false)` suppresses the
/// automatic error frame.
pub type ErrorHook = dyn Fn(WsError, ErrorSite) -> HookFuture<Result<bool, WsError>> + Send + Sync;

/// Where an error surfaced.
#[derive(Clone, Debug)]
pub struct ErrorSite {
    pub connection: ConnectionInfo,
    /// Type of the inbound message, when the error came from the pipeline.
    pub message_type: Option<String>,
    pub correlation_id: Option<String>,
}

/// Result of running the auth hooks.
#[derive(Debug)]
pub enum AuthOutcome {
    Allowed,
    Denied(WsError),
    Close { code: u16, reason: String },
}

/// Outcome of a hook sequence that may request a close.
#[derive(Debug, Default)]
pub struct HookReport {
    /// First close requested by a hook.
    pub close: Option<(u16, String)>,
    /// Hook failures, in order, for error reporting.
    pub errors: Vec<WsError>,
}

/// Registered hooks for every lifecycle edge.
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    open: Vec<Arc<OpenHook>>,
    close: Vec<Arc<CloseHook>>,
    auth: Vec<Arc<AuthHook>>,
    limit: Vec<Arc<LimitHook>>,
    error: Vec<Arc<ErrorHook>>,
}

impl LifecycleHooks {
    pub fn on_open<F, Fut>(&mut self, f: F)
    where
        F: Fn(ConnectionInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.open.push(Arc::new(move |conn| Box::pin(f(conn))));
    }

    pub fn on_close<F, Fut>(&mut self, f: F)
    where
        F: Fn(ConnectionInfo, CloseInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.close
            .push(Arc::new(move |conn, info| Box::pin(f(conn, info))));
    }

    pub fn on_auth<F, Fut>(&mut self, f: F)
    where
        F: Fn(ConnectionInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, HookSignal>> + Send + 'static,
    {
        self.auth.push(Arc::new(move |conn| Box::pin(f(conn))));
    }

    pub fn on_limit_exceeded<F, Fut>(&mut self, f: F)
    where
        F: Fn(ConnectionInfo, LimitExceeded) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.limit
            .push(Arc::new(move |conn, limit| Box::pin(f(conn, limit))));
    }

    pub fn on_error<F, Fut>(&mut self, f: F)
    where
        F: Fn(WsError, ErrorSite) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, WsError>> + Send + 'static,
    {
        self.error
            .push(Arc::new(move |err, site| Box::pin(f(err, site))));
    }

    /// Append every hook of `other` after the existing ones.
    pub fn extend(&mut self, other: &LifecycleHooks) {
        self.open.extend(other.open.iter().cloned());
        self.close.extend(other.close.iter().cloned());
        self.auth.extend(other.auth.iter().cloned());
        self.limit.extend(other.limit.iter().cloned());
        self.error.extend(other.error.iter().cloned());
    }

    #[must_use]
    pub fn has_auth(&self) -> bool { !self.auth.is_empty() }

    /// Run the open hooks. A close request stops the remaining hooks.
    pub async fn run_open(&self, conn: &ConnectionInfo) -> HookReport {
        let mut report = HookReport::default();
        for hook in &self.open {
            match isolate("on_open", hook(conn.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(HookSignal::Close { code, reason })) => {
                    report.close = Some((code, reason));
                    break;
                }
                Ok(Err(HookSignal::Error(err))) | Err(err) => report.errors.push(err),
            }
        }
        report
    }

    /// Run every close hook; failures are logged and never stop the rest.
    pub async fn run_close(&self, conn: &ConnectionInfo, info: &CloseInfo) {
        for hook in &self.close {
            match isolate("on_close", hook(conn.clone(), info.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(HookSignal::Close { .. })) => {
                    debug!("close requested by on_close hook ignored: id={}", conn.id());
                }
                Ok(Err(HookSignal::Error(err))) | Err(err) => {
                    warn!("on_close hook failed: id={}, error={err}", conn.id());
                }
            }
        }
    }

    /// Run the auth hooks; every hook must allow.
    pub async fn run_auth(&self, conn: &ConnectionInfo) -> AuthOutcome {
        for hook in &self.auth {
            match isolate("on_auth", hook(conn.clone())).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    return AuthOutcome::Denied(WsError::unauthenticated("authentication required"));
                }
                Ok(Err(HookSignal::Close { code, reason })) => {
                    return AuthOutcome::Close { code, reason };
                }
                Ok(Err(HookSignal::Error(err))) | Err(err) => {
                    warn!("on_auth hook failed: id={}, error={err}", conn.id());
                    return AuthOutcome::Denied(err);
                }
            }
        }
        AuthOutcome::Allowed
    }

    /// Run every limit hook.
    pub async fn run_limit(&self, conn: &ConnectionInfo, limit: &LimitExceeded) -> HookReport {
        let mut report = HookReport::default();
        for hook in &self.limit {
            match isolate("on_limit_exceeded", hook(conn.clone(), *limit)).await {
                Ok(Ok(())) => {}
                Ok(Err(HookSignal::Close { code, reason })) => {
                    report.close.get_or_insert((code, reason));
                }
                Ok(Err(HookSignal::Error(err))) | Err(err) => {
                    warn!("on_limit_exceeded hook failed: id={}, error={err}", conn.id());
                }
            }
        }
        report
    }

    /// Run every error handler independently.
    ///
    /// Returns `false` if any handler vetoed the automatic error frame.
    /// Failing handlers never veto.
    pub async fn run_error(&self, err: &WsError, site: &ErrorSite) -> bool {
        let mut send = true;
        for hook in &self.error {
            match isolate("on_error", hook(err.clone(), site.clone())).await {
                Ok(Ok(allow)) => send &= allow,
                Ok(Err(failure)) | Err(failure) => {
                    warn!(
                        "error handler failed: id={}, error={failure}",
                        site.connection.id()
                    );
                }
            }
        }
        send
    }
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("open", &self.open.len())
            .field("close", &self.close.len())
            .field("auth", &self.auth.len())
            .field("limit", &self.limit.len())
            .field("error", &self.error.len())
            .finish()
    }
}

/// Await `fut`, converting a panic into an `INTERNAL` error.
async fn isolate<T>(edge: &str, fut: HookFuture<T>) -> Result<T, WsError> {
    AssertUnwindSafe(fut).catch_unwind().await.map_err(|panic| {
        let message = format_panic(&*panic).to_string();
        warn!("{edge} hook panicked: panic={message}");
        WsError::internal(format!("{edge} hook panicked: {message}"))
    })
}
