//! Router surface: builder, capabilities and error types.
//!
//! [`WsRouter`] collects routes, middleware, lifecycle hooks and optional
//! capabilities, then serves connections through [`WsRouter::connect`].

mod builder;
mod error;
mod runtime;

pub use builder::{Capability, WsRouter};
pub(crate) use builder::RouterCore;
pub use error::{Result, RouterError};
