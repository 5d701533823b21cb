//! Formatting of panic payloads caught at isolation boundaries.
//!
//! Handlers, hooks, error handlers and cancellation callbacks run behind
//! `catch_unwind`; these helpers turn the payload into something loggable and
//! into the `INTERNAL` error reported to the client.

use std::{any::Any, fmt};

use crate::error::WsError;

/// Borrowed panic payload that formats as its message.
///
/// ```
/// use wsdispatch::panic::format_panic;
///
/// let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
/// assert_eq!(format_panic(&*payload).to_string(), "boom");
/// ```
#[derive(Debug)]
#[must_use]
pub struct PanicMessage<'a>(&'a (dyn Any + Send + 'static));

impl fmt::Display for PanicMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.0.downcast_ref::<String>() {
            f.write_str(s)
        } else if let Some(s) = self.0.downcast_ref::<&'static str>() {
            f.write_str(s)
        } else {
            f.write_str("non-string panic payload")
        }
    }
}

/// Wrap a caught payload for display.
///
/// Pass the payload itself (`&*boxed`), not a reference to the box.
pub fn format_panic<'a>(panic: &'a (dyn Any + Send + 'static)) -> PanicMessage<'a> {
    PanicMessage(panic)
}

/// The `INTERNAL` error reported for a panicking handler or middleware.
#[must_use]
pub fn panic_error(panic: &(dyn Any + Send + 'static)) -> WsError {
    WsError::internal(format!("handler panicked: {}", format_panic(panic)))
}
