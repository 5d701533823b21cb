//! Canonical error record and its translation into wire payloads.
//!
//! Every failure that reaches a client passes through [`WsError`]: decode
//! failures, limiter rejections, middleware and handler errors alike. The
//! record resolves retryability from the code table in [`ErrorCode`], drops
//! retry hints that make no sense for the code, and scrubs details via
//! [`sanitize`] before [`WsError::to_payload`] produces the wire shape.

mod code;
pub mod sanitize;

use std::{fmt, sync::Arc, time::Duration};

pub use code::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Message substituted for internal failures unless details are exposed.
pub const GENERIC_INTERNAL_MESSAGE: &str = "Internal server error";

/// Upper bound applied to `retryAfterMs` hints (one day).
pub const MAX_RETRY_AFTER_MS: u64 = 86_400_000;

type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Error record carried through the dispatch pipeline.
///
/// The optional `cause` keeps the original error for logs and is never
/// serialised to clients.
#[derive(Clone)]
pub struct WsError {
    code: ErrorCode,
    message: String,
    details: Option<Map<String, Value>>,
    retryable: Option<bool>,
    retry_after_ms: Option<i64>,
    cause: Option<Cause>,
}

impl WsError {
    /// Create an error with the given code and message.
    pub fn new(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
            cause: None,
        }
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthenticated, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::FailedPrecondition, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self { Self::new(ErrorCode::NotFound, message) }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyExists, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self { Self::new(ErrorCode::Aborted, message) }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self { Self::new(ErrorCode::Internal, message) }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeadlineExceeded, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ResourceExhausted, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self { Self::new(ErrorCode::Cancelled, message) }

    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionClosed, message)
    }

    /// Attach a details map, replacing any previous one.
    #[must_use]
    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details = Some(details);
        self
    }

    /// Add a single detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Override the retryability derived from the code.
    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    /// Suggest a retry delay in milliseconds.
    ///
    /// Negative values are clamped to zero and values above
    /// [`MAX_RETRY_AFTER_MS`] to that bound when the payload is built.
    #[must_use]
    pub fn with_retry_after_ms(mut self, retry_after_ms: i64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    /// Suggest a retry delay.
    #[must_use]
    pub fn with_retry_after(self, delay: Duration) -> Self {
        let ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        self.with_retry_after_ms(ms)
    }

    /// Record the error that caused this one.
    #[must_use]
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    #[must_use]
    pub fn code(&self) -> &ErrorCode { &self.code }

    #[must_use]
    pub fn message(&self) -> &str { &self.message }

    /// Unsanitised details as supplied by the caller.
    #[must_use]
    pub fn details(&self) -> Option<&Map<String, Value>> { self.details.as_ref() }

    /// The wrapped cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Resolved retryability.
    ///
    /// An explicit value wins. Otherwise a retry hint on a non-terminal code
    /// implies `true`, and the static code table decides the rest.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.retryable.unwrap_or_else(|| {
            (self.retry_after_ms.is_some() && !self.code.is_terminal())
                || self.code.default_retryable()
        })
    }

    /// Resolved retry hint: absent for terminal codes or non-retryable errors.
    #[must_use]
    pub fn retry_after_ms(&self) -> Option<u64> {
        if self.code.is_terminal() || !self.is_retryable() {
            return None;
        }
        self.retry_after_ms
            .map(|ms| u64::try_from(ms).unwrap_or(0).min(MAX_RETRY_AFTER_MS))
    }

    /// Build the client-facing payload.
    ///
    /// Internal failures have their message replaced and details withheld
    /// unless `expose_details` is set.
    #[must_use]
    pub fn to_payload(&self, expose_details: bool) -> ErrorPayload {
        let hide = self.code == ErrorCode::Internal && !expose_details;
        let message = if hide {
            GENERIC_INTERNAL_MESSAGE.to_owned()
        } else {
            self.message.clone()
        };
        let details = if hide {
            None
        } else {
            self.details.clone().and_then(sanitize::sanitize_details)
        };
        ErrorPayload {
            code: self.code.clone(),
            message: (!message.is_empty()).then_some(message),
            details,
            retryable: Some(self.is_retryable()),
            retry_after_ms: self.retry_after_ms(),
        }
    }
}

impl fmt::Debug for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("details", &self.details)
            .field("retryable", &self.retryable)
            .field("retry_after_ms", &self.retry_after_ms)
            .field("cause", &self.cause.as_ref().map(ToString::to_string))
            .finish()
    }
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for WsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<serde_json::Error> for WsError {
    fn from(error: serde_json::Error) -> Self {
        Self::invalid_argument(format!("invalid payload: {error}")).with_cause(error)
    }
}

impl From<CapabilityError> for WsError {
    fn from(error: CapabilityError) -> Self {
        Self::unimplemented(error.to_string()).with_cause(error)
    }
}

/// Error payload carried by `ERROR` and `RPC_ERROR` frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Raised when an optional API surface is used without its plugin installed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CapabilityError {
    /// The capability was never installed on the router.
    #[error("{operation} requires the {capability} capability, which is not installed")]
    Unavailable {
        capability: &'static str,
        operation: &'static str,
    },
}
