//! Router builder.
//!
//! Methods return [`Result<Self>`] so registrations chain with `?`.

use std::{future::Future, sync::Arc};

use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::error::{Result, RouterError};
use crate::{
    config::RouterConfig,
    connection::{CloseInfo, ConnectionInfo},
    context::MessageContext,
    error::WsError,
    hooks::{ErrorSite, HookResult, HookSignal, LifecycleHooks},
    limits::LimitExceeded,
    middleware::{Middleware, handler_fn},
    pubsub::PubSubAdapter,
    registry::{ConflictPolicy, PayloadCheck, Registry, Route},
    validation::{SchemaRef, ValidatorAdapter, payload_check},
};

/// Optional API surface installed on a router.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// Schema-validated routes.
    Validation,
    /// Topic publish and subscribe.
    PubSub,
}

impl Capability {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::PubSub => "pubsub",
        }
    }
}

/// Everything a connection needs from its router, shared by all of them.
#[derive(Clone, Default)]
pub(crate) struct RouterCore {
    pub(crate) config: RouterConfig,
    pub(crate) registry: Registry,
    pub(crate) global: Vec<Arc<dyn Middleware>>,
    pub(crate) hooks: LifecycleHooks,
    pub(crate) validator: Option<Arc<dyn ValidatorAdapter>>,
    pub(crate) pubsub: Option<Arc<dyn PubSubAdapter>>,
}

/// Message router for WebSocket connections.
///
/// ```
/// use wsdispatch::{app::WsRouter, registry::ConflictPolicy};
///
/// let auth = WsRouter::new()
///     .on("LOGIN", |ctx| async move {
///         ctx.send("WELCOME", None)?;
///         Ok(())
///     })
///     .expect("route");
/// let router = WsRouter::new()
///     .mount("a.", &auth, ConflictPolicy::Error)
///     .and_then(|r| r.mount("b.", &auth, ConflictPolicy::Error))
///     .expect("mount");
/// assert_eq!(router.registry().message_types(), vec!["a.LOGIN", "b.LOGIN"]);
/// ```
///
/// Clones share the connection tracker and shutdown signal; routes added to
/// a clone stay local to it.
#[derive(Clone, Default)]
pub struct WsRouter {
    pub(super) core: Arc<RouterCore>,
    pub(super) tracker: TaskTracker,
    pub(super) shutdown: CancellationToken,
}

impl WsRouter {
    /// Router with the default configuration.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn core_mut(&mut self) -> &mut RouterCore { Arc::make_mut(&mut self.core) }

    /// Replace the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Config`] if the configuration is invalid.
    pub fn with_config(mut self, config: RouterConfig) -> Result<Self> {
        config.validate()?;
        self.core_mut().config = config;
        Ok(self)
    }

    #[must_use]
    pub fn config(&self) -> &RouterConfig { &self.core.config }

    #[must_use]
    pub fn registry(&self) -> &Registry { &self.core.registry }

    /// Install the validation capability.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn ValidatorAdapter>) -> Self {
        self.core_mut().validator = Some(validator);
        self
    }

    /// Install the Pub/Sub capability.
    #[must_use]
    pub fn with_pubsub(mut self, adapter: Arc<dyn PubSubAdapter>) -> Self {
        self.core_mut().pubsub = Some(adapter);
        self
    }

    #[must_use]
    pub fn has_capability(&self, capability: Capability) -> bool {
        match capability {
            Capability::Validation => self.core.validator.is_some(),
            Capability::PubSub => self.core.pubsub.is_some(),
        }
    }

    /// Register a fire-and-forget handler for `message_type`.
    ///
    /// # Errors
    ///
    /// See [`Registry::register`].
    pub fn on<F, Fut>(self, message_type: &str, handler: F) -> Result<Self>
    where
        F: Fn(MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), WsError>> + Send + 'static,
    {
        self.route(Route::event(message_type, handler_fn(handler)))
    }

    /// Register an RPC handler for `message_type` replying with
    /// `response_type`.
    ///
    /// # Errors
    ///
    /// See [`Registry::register`].
    pub fn rpc<F, Fut>(self, message_type: &str, response_type: &str, handler: F) -> Result<Self>
    where
        F: Fn(MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), WsError>> + Send + 'static,
    {
        self.route(Route::rpc(message_type, response_type, handler_fn(handler)))
    }

    /// Register a fully configured route, including its own middleware.
    ///
    /// # Errors
    ///
    /// See [`Registry::register`].
    pub fn route(mut self, route: Route) -> Result<Self> {
        self.core_mut().registry.register(route)?;
        Ok(self)
    }

    /// Payload check validating against `schema` with the installed
    /// validator, for use with [`Route::with_check`].
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::CapabilityUnavailable`] without a validator.
    pub fn schema_check(&self, schema: SchemaRef) -> Result<PayloadCheck> {
        let validator = self.validator("schema routes")?;
        Ok(payload_check(Arc::clone(validator), schema))
    }

    fn validator(&self, operation: &'static str) -> Result<&Arc<dyn ValidatorAdapter>> {
        self.core
            .validator
            .as_ref()
            .ok_or(RouterError::CapabilityUnavailable {
                capability: Capability::Validation.as_str(),
                operation,
            })
    }

    fn schema_type(&self, schema: &SchemaRef, operation: &'static str) -> Result<String> {
        self.validator(operation)?
            .message_type(schema)
            .ok_or(RouterError::UntypedSchema)
    }

    /// Register an event handler whose type and payload come from `schema`.
    ///
    /// # Errors
    ///
    /// [`RouterError::CapabilityUnavailable`] without a validator,
    /// [`RouterError::UntypedSchema`] if the schema names no type, or any
    /// registration error.
    pub fn on_schema<F, Fut>(self, schema: SchemaRef, handler: F) -> Result<Self>
    where
        F: Fn(MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), WsError>> + Send + 'static,
    {
        let message_type = self.schema_type(&schema, "on_schema")?;
        let check = self.schema_check(schema)?;
        self.route(Route::event(message_type, handler_fn(handler)).with_check(check))
    }

    /// Register an RPC whose request type and payload come from `request`
    /// and whose reply type comes from `response`.
    ///
    /// # Errors
    ///
    /// As [`WsRouter::on_schema`].
    pub fn rpc_schema<F, Fut>(self, request: SchemaRef, response: &SchemaRef, handler: F) -> Result<Self>
    where
        F: Fn(MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), WsError>> + Send + 'static,
    {
        let message_type = self.schema_type(&request, "rpc_schema")?;
        let response_type = self.schema_type(response, "rpc_schema")?;
        let check = self.schema_check(request)?;
        self.route(Route::rpc(message_type, response_type, handler_fn(handler)).with_check(check))
    }

    /// Append global middleware, run before every route's own middleware.
    ///
    /// # Errors
    ///
    /// This function always succeeds currently but uses [`Result`] for
    /// consistency with other builder methods.
    pub fn wrap<M: Middleware>(mut self, middleware: M) -> Result<Self> {
        self.core_mut().global.push(Arc::new(middleware));
        Ok(self)
    }

    /// Copy the routes of `other` into this router.
    ///
    /// # Errors
    ///
    /// See [`Registry::merge`].
    pub fn merge(mut self, other: &WsRouter, policy: ConflictPolicy) -> Result<Self> {
        let incoming = other.core.registry.clone();
        self.core_mut().registry.merge(&incoming, policy)?;
        Ok(self)
    }

    /// Copy the routes of `other` under `prefix`.
    ///
    /// Each mounted route is an independent registry entry, but it calls the
    /// same handler value as the original. Mounting one router at two
    /// prefixes therefore shares whatever its handlers capture.
    ///
    /// # Errors
    ///
    /// See [`Registry::mount`].
    pub fn mount(mut self, prefix: &str, other: &WsRouter, policy: ConflictPolicy) -> Result<Self> {
        let incoming = other.core.registry.clone();
        self.core_mut().registry.mount(prefix, &incoming, policy)?;
        Ok(self)
    }

    /// Run `f` when a connection opens, before any message is routed.
    ///
    /// # Errors
    ///
    /// This function always succeeds currently but uses [`Result`] for
    /// consistency with other builder methods.
    pub fn on_open<F, Fut>(mut self, f: F) -> Result<Self>
    where
        F: Fn(ConnectionInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.core_mut().hooks.on_open(f);
        Ok(self)
    }

    /// Run `f` once after a connection closed.
    ///
    /// # Errors
    ///
    /// Always succeeds; see [`WsRouter::on_open`].
    pub fn on_close<F, Fut>(mut self, f: F) -> Result<Self>
    where
        F: Fn(ConnectionInfo, CloseInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.core_mut().hooks.on_close(f);
        Ok(self)
    }

    /// Gate message routing on `f`, run once before the first message.
    ///
    /// # Errors
    ///
    /// Always succeeds; see [`WsRouter::on_open`].
    pub fn on_auth<F, Fut>(mut self, f: F) -> Result<Self>
    where
        F: Fn(ConnectionInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<bool, HookSignal>> + Send + 'static,
    {
        self.core_mut().hooks.on_auth(f);
        Ok(self)
    }

    /// Run `f` whenever a frame is rejected by a limit.
    ///
    /// # Errors
    ///
    /// Always succeeds; see [`WsRouter::on_open`].
    pub fn on_limit_exceeded<F, Fut>(mut self, f: F) -> Result<Self>
    where
        F: Fn(ConnectionInfo, LimitExceeded) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.core_mut().hooks.on_limit_exceeded(f);
        Ok(self)
    }

    /// Observe errors before they are sent; returning `Ok(false)` suppresses
    /// the automatic error frame.
    ///
    /// # Errors
    ///
    /// Always succeeds; see [`WsRouter::on_open`].
    pub fn on_error<F, Fut>(mut self, f: F) -> Result<Self>
    where
        F: Fn(WsError, ErrorSite) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<bool, WsError>> + Send + 'static,
    {
        self.core_mut().hooks.on_error(f);
        Ok(self)
    }
}

impl std::fmt::Debug for WsRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsRouter")
            .field("routes", &self.core.registry.len())
            .field("middleware", &self.core.global.len())
            .field("hooks", &self.core.hooks)
            .field("validation", &self.core.validator.is_some())
            .field("pubsub", &self.core.pubsub.is_some())
            .finish_non_exhaustive()
    }
}
