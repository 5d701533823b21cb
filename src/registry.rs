//! Handler registry.
//!
//! Maps a message type to one [`Route`]: its kind (event or RPC), its own
//! middleware, an optional payload validator and the handler. Registries
//! compose through [`Registry::merge`] and [`Registry::mount`], each applying
//! a [`ConflictPolicy`] to types present on both sides.

use std::{collections::HashMap, fmt, sync::Arc};

use serde_json::Value;

use crate::{
    app::RouterError,
    envelope,
    error::WsError,
    middleware::{Handler, Middleware},
};

/// Validates and normalises an inbound payload before the handler runs.
pub type PayloadCheck = Arc<dyn Fn(Option<&Value>) -> Result<Option<Value>, WsError> + Send + Sync>;

/// Whether a route is fire-and-forget or request/response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteKind {
    Event,
    /// Terminal replies are sent with `response_type`.
    Rpc { response_type: String },
}

/// How to resolve a message type registered on both sides of a merge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Abort the whole merge and leave the target untouched.
    #[default]
    Error,
    /// Keep the existing route.
    Skip,
    /// Overwrite with the incoming route.
    Replace,
}

/// One registered message type.
#[derive(Clone)]
pub struct Route {
    message_type: String,
    kind: RouteKind,
    middleware: Vec<Arc<dyn Middleware>>,
    handler: Handler,
    check: Option<PayloadCheck>,
}

impl Route {
    /// A fire-and-forget route.
    pub fn event(message_type: impl Into<String>, handler: Handler) -> Self {
        Self {
            message_type: message_type.into(),
            kind: RouteKind::Event,
            middleware: Vec::new(),
            handler,
            check: None,
        }
    }

    /// A request/response route replying with `response_type`.
    pub fn rpc(
        message_type: impl Into<String>,
        response_type: impl Into<String>,
        handler: Handler,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            kind: RouteKind::Rpc {
                response_type: response_type.into(),
            },
            middleware: Vec::new(),
            handler,
            check: None,
        }
    }

    /// Append route-level middleware, run after the router's global chain.
    #[must_use]
    pub fn wrap<M: Middleware>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Validate payloads with `check` before the chain reaches the handler.
    #[must_use]
    pub fn with_check(mut self, check: PayloadCheck) -> Self {
        self.check = Some(check);
        self
    }

    #[must_use]
    pub fn message_type(&self) -> &str { &self.message_type }

    #[must_use]
    pub fn kind(&self) -> &RouteKind { &self.kind }

    #[must_use]
    pub fn is_rpc(&self) -> bool { matches!(self.kind, RouteKind::Rpc { .. }) }

    #[must_use]
    pub fn middleware(&self) -> &[Arc<dyn Middleware>] { &self.middleware }

    #[must_use]
    pub fn handler(&self) -> &Handler { &self.handler }

    #[must_use]
    pub fn check(&self) -> Option<&PayloadCheck> { self.check.as_ref() }

    /// Copy under `prefix`. The handler and middleware are shared, not
    /// rebuilt, so state they capture is common to every mount point.
    fn prefixed(&self, prefix: &str) -> Self {
        let mut route = self.clone();
        route.message_type = format!("{prefix}{}", self.message_type);
        route
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("message_type", &self.message_type)
            .field("kind", &self.kind)
            .field("middleware", &self.middleware.len())
            .field("validated", &self.check.is_some())
            .finish_non_exhaustive()
    }
}

/// Route table keyed by message type.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    routes: HashMap<String, Route>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Register `route`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::EmptyType`] for an empty type,
    /// [`RouterError::ReservedType`] for types under the reserved prefix and
    /// [`RouterError::DuplicateRoute`] if the type is already registered.
    pub fn register(&mut self, route: Route) -> Result<(), RouterError> {
        validate_type(route.message_type())?;
        if self.routes.contains_key(route.message_type()) {
            return Err(RouterError::DuplicateRoute(route.message_type));
        }
        self.routes.insert(route.message_type.clone(), route);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, message_type: &str) -> Option<&Route> { self.routes.get(message_type) }

    #[must_use]
    pub fn contains(&self, message_type: &str) -> bool { self.routes.contains_key(message_type) }

    #[must_use]
    pub fn len(&self) -> usize { self.routes.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.routes.is_empty() }

    /// Registered message types in sorted order.
    #[must_use]
    pub fn message_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Copy every route of `other` into this registry.
    ///
    /// # Errors
    ///
    /// With [`ConflictPolicy::Error`], returns [`RouterError::MergeConflict`]
    /// naming the first conflicting type and leaves `self` unchanged.
    pub fn merge(&mut self, other: &Registry, policy: ConflictPolicy) -> Result<(), RouterError> {
        self.absorb(other.routes.values().cloned().collect(), policy)
    }

    /// Copy every route of `other` under `prefix + type`.
    ///
    /// The same registry can be mounted at several prefixes.
    ///
    /// # Errors
    ///
    /// As [`Registry::merge`], plus [`RouterError::ReservedType`] if the
    /// prefix produces reserved types.
    pub fn mount(
        &mut self,
        prefix: &str,
        other: &Registry,
        policy: ConflictPolicy,
    ) -> Result<(), RouterError> {
        let routes: Vec<Route> = other.routes.values().map(|r| r.prefixed(prefix)).collect();
        for route in &routes {
            validate_type(route.message_type())?;
        }
        self.absorb(routes, policy)
    }

    fn absorb(&mut self, mut incoming: Vec<Route>, policy: ConflictPolicy) -> Result<(), RouterError> {
        if policy == ConflictPolicy::Error {
            incoming.sort_by(|a, b| a.message_type.cmp(&b.message_type));
            if let Some(conflict) = incoming.iter().find(|r| self.contains(r.message_type())) {
                return Err(RouterError::MergeConflict(conflict.message_type.clone()));
            }
        }
        for route in incoming {
            if policy == ConflictPolicy::Skip && self.contains(route.message_type()) {
                continue;
            }
            self.routes.insert(route.message_type.clone(), route);
        }
        Ok(())
    }
}

fn validate_type(message_type: &str) -> Result<(), RouterError> {
    if message_type.is_empty() {
        return Err(RouterError::EmptyType);
    }
    if envelope::is_reserved(message_type) {
        return Err(RouterError::ReservedType(message_type.to_owned()));
    }
    Ok(())
}
