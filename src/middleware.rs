//! Middleware chain executor.
//!
//! A chain is the router's global middleware in registration order, then the
//! route's own middleware in registration order, ending in the handler. Each
//! middleware receives the [`MessageContext`] and a [`Next`] continuation.
//! Returning without running `next` halts the chain so the handler never
//! runs. `Next::run` consumes the continuation, so proceeding twice is
//! rejected at compile time.

use std::{future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;

use crate::{context::MessageContext, error::WsError};

/// Boxed future returned by handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), WsError>> + Send>>;

/// Route handler.
pub type Handler = Arc<dyn Fn(MessageContext) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
///
/// ```
/// use wsdispatch::middleware::{Handler, handler_fn};
///
/// let handler: Handler = handler_fn(|ctx| async move {
///     ctx.send("PONG", None)?;
///     Ok(())
/// });
/// # drop(handler);
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WsError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Middleware wrapped around route handlers.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Inspect or reject `ctx`, optionally running the rest of the chain.
    async fn call(&self, ctx: MessageContext, next: Next<'_>) -> Result<(), WsError>;
}

/// Continuation to the remainder of the chain.
pub struct Next<'a> {
    global: &'a [Arc<dyn Middleware>],
    route: &'a [Arc<dyn Middleware>],
    handler: &'a Handler,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        global: &'a [Arc<dyn Middleware>],
        route: &'a [Arc<dyn Middleware>],
        handler: &'a Handler,
    ) -> Self {
        Self {
            global,
            route,
            handler,
        }
    }

    /// Run the next middleware, or the handler once the chain is exhausted.
    ///
    /// # Errors
    ///
    /// Propagates the first error raised further down the chain.
    pub async fn run(self, ctx: MessageContext) -> Result<(), WsError> {
        if let Some((first, rest)) = self.global.split_first() {
            let next = Next {
                global: rest,
                ..self
            };
            return first.call(ctx, next).await;
        }
        if let Some((first, rest)) = self.route.split_first() {
            let next = Next { route: rest, ..self };
            return first.call(ctx, next).await;
        }
        (self.handler)(ctx).await
    }

    /// Middleware still to run before the handler.
    #[must_use]
    pub fn remaining(&self) -> usize { self.global.len() + self.route.len() }
}
