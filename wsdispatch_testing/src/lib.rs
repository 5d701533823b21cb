//! Utilities for driving a [`WsRouter`](wsdispatch::WsRouter) in tests.
//!
//! [`RecordingSocket`] stands in for a platform socket and keeps every frame
//! the router sends, so tests can deliver raw frames through a
//! [`ConnectionHandle`](wsdispatch::ConnectionHandle) and assert on the
//! parsed output.
//!
//! ```rust
//! use wsdispatch::{ConnectOptions, WsRouter};
//! use wsdispatch_testing::{RecordingSocket, message};
//!
//! # async fn example() {
//! let router = WsRouter::new()
//!     .on("PING", |ctx| async move { ctx.send("PONG", None) })
//!     .expect("route");
//! let socket = RecordingSocket::new();
//! let handle = router.connect(socket.clone(), ConnectOptions::default());
//! handle.deliver(message("PING", None));
//! let frames = socket.wait_for_frames(1).await;
//! assert_eq!(frames[0]["type"], "PONG");
//! # }
//! ```

pub mod frames;
pub mod handle;
pub mod logging;
mod macros;
pub mod socket;

pub use frames::{abort, heartbeat, message, rpc_request};
pub use handle::wait_idle;
pub use logging::{LoggerHandle, logger};
pub use socket::RecordingSocket;
