//! Optional convenience imports for common router workflows.
//!
//! Prefer importing specialised APIs directly from their owning modules.
//!
//! # Examples
//!
//! ```rust,no_run
//! use wsdispatch::prelude::*;
//!
//! fn build() -> Result<WsRouter> {
//!     WsRouter::new().rpc("ADD", "ADD_RESULT", |ctx: MessageContext| async move {
//!         ctx.reply(None)?;
//!         Ok(())
//!     })
//! }
//! ```

pub use crate::{
    app::{Result, RouterError, WsRouter},
    connection::{ConnectOptions, ConnectionHandle, ConnectionInfo},
    context::MessageContext,
    error::{ErrorCode, WsError},
    hooks::HookSignal,
    middleware::{Middleware, Next},
    registry::{ConflictPolicy, Route},
    socket::PlatformSocket,
};
