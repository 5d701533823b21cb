#![doc(html_root_url = "https://docs.rs/wsdispatch/latest")]
//! Public API for the `wsdispatch` library.
//!
//! This crate routes JSON messages arriving on WebSocket connections to
//! handlers through a middleware chain, and manages RPC lifecycles,
//! heartbeats, limits and error envelopes for each connection.

pub mod app;
/// Result type alias re-exported for convenience when working with the
/// router builder.
pub use app::Result;
pub mod config;
pub mod connection;
pub mod context;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod hooks;
pub mod limits;
pub mod metrics;
pub mod middleware;
pub mod panic;
pub mod prelude;
pub mod pubsub;
pub mod rate_limit;
pub mod registry;
pub mod rpc;
pub mod socket;
pub mod validation;

pub use app::{Capability, RouterError, WsRouter};
pub use config::RouterConfig;
pub use connection::{CloseInfo, CloseSource, ConnectOptions, ConnectionHandle, ConnectionInfo};
pub use context::MessageContext;
pub use envelope::Envelope;
pub use error::{ErrorCode, WsError};
pub use hooks::HookSignal;
pub use metrics::{CONNECTIONS_ACTIVE, Direction, ERRORS_TOTAL, FRAMES_TOTAL};
pub use middleware::{Handler, Middleware, Next, handler_fn};
pub use registry::{ConflictPolicy, Route};
pub use rpc::Responder;
pub use socket::PlatformSocket;
