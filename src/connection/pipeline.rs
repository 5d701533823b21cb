//! Sequential message pipeline of one connection.
//!
//! Authenticate, look up the route, admit the RPC,
//! validate, run the middleware chain, then translate any failure into the
//! single error frame the client sees.

use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
};

use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::time::Instant;

use super::{CLOSE_PERMISSION_DENIED, CLOSE_UNAUTHENTICATED, ConnectionInfo, event::Work};
use crate::{
    app::RouterCore,
    config::OnExceeded,
    context::MessageContext,
    envelope::{Envelope, unix_millis},
    error::{ErrorCode, WsError},
    hooks::{AuthOutcome, ErrorSite},
    limits::LimitExceeded,
    metrics,
    middleware::Next,
    panic::{format_panic, panic_error},
    registry::RouteKind,
    rpc::{AcceptError, Responder},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AuthState {
    Pending,
    Allowed,
    Denied,
}

/// Where an error frame goes.
#[derive(Clone, Copy)]
enum Target<'a> {
    OneWay,
    /// An RPC that was never admitted.
    Correlated(&'a str),
    Rpc(&'a Responder),
}

impl<'a> Target<'a> {
    fn for_request(correlation_id: Option<&'a str>) -> Self {
        correlation_id.map_or(Self::OneWay, Self::Correlated)
    }
}

pub(crate) struct Pipeline {
    core: Arc<RouterCore>,
    conn: ConnectionInfo,
    auth: Mutex<AuthState>,
}

impl Pipeline {
    pub(crate) fn new(core: Arc<RouterCore>, conn: ConnectionInfo) -> Self {
        let auth = if core.hooks.has_auth() {
            AuthState::Pending
        } else {
            AuthState::Allowed
        };
        Self {
            core,
            conn,
            auth: Mutex::new(auth),
        }
    }

    /// Settle one unit of work. A frame's pending slot is released when this
    /// returns or unwinds.
    pub(crate) async fn process(self: Arc<Self>, work: Work) {
        match work {
            Work::Invalid { error, slot } => {
                self.fail(error, Target::OneWay, self.site(None, None), false)
                    .await;
                drop(slot);
            }
            Work::Message {
                envelope,
                received_at,
                slot,
            } => {
                self.dispatch(envelope, received_at).await;
                drop(slot);
            }
        }
    }

    async fn dispatch(&self, mut envelope: Envelope, received_at: Instant) {
        let correlation_id = envelope.correlation_id();
        let site = self.site(Some(&envelope.message_type), correlation_id.as_deref());
        let target = Target::for_request(correlation_id.as_deref());

        match self.authorize().await {
            Ok(()) => {}
            Err(Some(err)) => {
                self.fail(err, target, site, false).await;
                return;
            }
            Err(None) => return,
        }

        let Some(route) = self.core.registry.get(&envelope.message_type) else {
            let err = WsError::unimplemented("no handler for message type")
                .with_detail("type", envelope.message_type.clone());
            self.fail(err, target, site, false).await;
            return;
        };

        let responder = match route.kind() {
            RouteKind::Event => None,
            RouteKind::Rpc { response_type } => match self.conn.0.rpc.accept(
                correlation_id.clone(),
                response_type,
                envelope.timeout_ms(),
                received_at,
            ) {
                Ok(state) => Some(Responder::new(
                    state,
                    Arc::clone(&self.conn.0.rpc),
                    self.conn.0.outbound.clone(),
                    self.core.config.expose_error_details,
                )),
                Err(AcceptError::Limit(limit)) => {
                    self.on_limit(limit, correlation_id.as_deref(), 1).await;
                    return;
                }
                Err(AcceptError::Rejected(err)) => {
                    self.fail(err, target, site, false).await;
                    return;
                }
            },
        };
        let target = responder.as_ref().map_or(target, Target::Rpc);

        if let Some(check) = route.check() {
            match check(envelope.payload.as_ref()) {
                Ok(payload) => envelope.payload = payload,
                Err(err) => {
                    self.fail(err, target, site, false).await;
                    return;
                }
            }
        }

        let ctx = MessageContext::new(self.conn.clone(), envelope, responder.clone());
        let chain = Next::new(&self.core.global, route.middleware(), route.handler());
        let err = match AssertUnwindSafe(chain.run(ctx)).catch_unwind().await {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(panic) => {
                error!(
                    "handler panicked: id={}, type={}, panic={}",
                    self.conn.id(),
                    route.message_type(),
                    format_panic(&*panic)
                );
                panic_error(&*panic)
            }
        };
        self.fail(err, target, site, true).await;
    }

    /// Run the auth hooks once. `Err(None)` means a hook closed the
    /// connection.
    async fn authorize(&self) -> Result<(), Option<WsError>> {
        let state = *self.auth.lock().expect("lock poisoned");
        match state {
            AuthState::Allowed => Ok(()),
            AuthState::Denied => Err(Some(WsError::unauthenticated(
                "connection is not authenticated",
            ))),
            AuthState::Pending => {
                let outcome = self.core.hooks.run_auth(&self.conn).await;
                let (next, result) = match outcome {
                    AuthOutcome::Allowed => (AuthState::Allowed, Ok(())),
                    AuthOutcome::Denied(err) => {
                        info!("authentication denied: id={}, code={}", self.conn.id(), err.code());
                        (AuthState::Denied, Err(Some(err)))
                    }
                    AuthOutcome::Close { code, reason } => {
                        self.conn.close(code, &reason);
                        (AuthState::Denied, Err(None))
                    }
                };
                *self.auth.lock().expect("lock poisoned") = next;
                result
            }
        }
    }

    /// Report `err` to the error handlers, then send it unless vetoed.
    ///
    /// `automatic` marks errors escaping the middleware chain, which are
    /// only sent when automatic error replies are enabled.
    async fn fail(&self, err: WsError, target: Target<'_>, site: ErrorSite, automatic: bool) {
        if err.code() == &ErrorCode::Internal {
            warn!(
                "message failed: id={}, type={}, error={err}, cause={:?}",
                self.conn.id(),
                site.message_type.as_deref().unwrap_or("-"),
                err.cause().map(ToString::to_string)
            );
        } else {
            debug!(
                "message rejected: id={}, type={}, error={err}",
                self.conn.id(),
                site.message_type.as_deref().unwrap_or("-")
            );
        }
        let allowed = self.core.hooks.run_error(&err, &site).await;
        if allowed && (!automatic || self.core.config.auto_send_error_on_throw) {
            self.send_error(&err, target);
        }
        self.enforce_auth_close(&err);
    }

    fn send_error(&self, err: &WsError, target: Target<'_>) {
        let payload = err.to_payload(self.core.config.expose_error_details);
        let result = match target {
            Target::Rpc(responder) => match responder.error(err) {
                Ok(true) => Ok(()),
                Ok(false) => {
                    debug!(
                        "error after terminal reply not sent: id={}, correlation_id={}",
                        self.conn.id(),
                        responder.correlation_id()
                    );
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Target::Correlated(correlation_id) => {
                metrics::inc_errors(err.code());
                self.conn
                    .0
                    .outbound
                    .send(&Envelope::rpc_error(correlation_id, &payload, unix_millis()))
            }
            Target::OneWay => {
                metrics::inc_errors(err.code());
                self.conn
                    .0
                    .outbound
                    .send(&Envelope::error(&payload, unix_millis()))
            }
        };
        if let Err(e) = result {
            debug!("error frame not sent: id={}, error={e}", self.conn.id());
        }
    }

    fn enforce_auth_close(&self, err: &WsError) {
        let auth = self.core.config.auth;
        match err.code() {
            ErrorCode::Unauthenticated if auth.close_on_unauthenticated => {
                self.conn.close(CLOSE_UNAUTHENTICATED, "unauthenticated");
            }
            ErrorCode::PermissionDenied if auth.close_on_permission_denied => {
                self.conn.close(CLOSE_PERMISSION_DENIED, "permission denied");
            }
            _ => {}
        }
    }

    /// Report a limit violation. `count` is how many refusals this report
    /// covers; a flood of rejected frames collapses into one report.
    pub(crate) async fn on_limit(
        &self,
        limit: LimitExceeded,
        correlation_id: Option<&str>,
        count: usize,
    ) {
        metrics::inc_limit_exceeded(limit.kind);
        warn!(
            "limit exceeded: id={}, kind={}, observed={}, limit={}, count={count}",
            self.conn.id(),
            limit.kind,
            limit.observed,
            limit.limit
        );
        let report = self.core.hooks.run_limit(&self.conn, &limit).await;
        if let Some((code, reason)) = report.close {
            self.conn.close(code, &reason);
            return;
        }
        let limits = &self.core.config.limits;
        match limits.on_exceeded {
            OnExceeded::Send => {
                let mut err = limit.to_error();
                if count > 1 {
                    err = err.with_detail("rejected", count);
                }
                self.send_error(&err, Target::for_request(correlation_id));
            }
            OnExceeded::Close => {
                self.conn.close(limits.close_code, "limit exceeded");
            }
            OnExceeded::Custom => {}
        }
    }

    fn site(&self, message_type: Option<&str>, correlation_id: Option<&str>) -> ErrorSite {
        ErrorSite {
            connection: self.conn.clone(),
            message_type: message_type.map(str::to_owned),
            correlation_id: correlation_id.map(str::to_owned),
        }
    }
}
