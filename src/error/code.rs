//! Canonical error codes and their retry semantics.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Error codes understood by clients.
///
/// The closed set follows the gRPC status vocabulary. Anything else is carried
/// as [`ErrorCode::App`] and treated as non-retryable unless the error says
/// otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Unauthenticated,
    PermissionDenied,
    InvalidArgument,
    FailedPrecondition,
    NotFound,
    AlreadyExists,
    Aborted,
    Unimplemented,
    Internal,
    DeadlineExceeded,
    ResourceExhausted,
    Unavailable,
    Cancelled,
    ConnectionClosed,
    /// Application-defined code outside the canonical set.
    App(String),
}

impl ErrorCode {
    /// All canonical codes, terminal ones first.
    pub const CANONICAL: [ErrorCode; 14] = [
        ErrorCode::Unauthenticated,
        ErrorCode::PermissionDenied,
        ErrorCode::InvalidArgument,
        ErrorCode::FailedPrecondition,
        ErrorCode::NotFound,
        ErrorCode::AlreadyExists,
        ErrorCode::Aborted,
        ErrorCode::Unimplemented,
        ErrorCode::Internal,
        ErrorCode::DeadlineExceeded,
        ErrorCode::ResourceExhausted,
        ErrorCode::Unavailable,
        ErrorCode::Cancelled,
        ErrorCode::ConnectionClosed,
    ];

    /// Wire representation of the code.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::Aborted => "ABORTED",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::Unavailable => "UNAVAILABLE",
            Self::Cancelled => "CANCELLED",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::App(code) => code,
        }
    }

    /// Parse a wire code, falling back to [`ErrorCode::App`].
    #[must_use]
    pub fn parse(code: &str) -> Self {
        Self::CANONICAL
            .iter()
            .find(|c| c.as_str() == code)
            .cloned()
            .unwrap_or_else(|| Self::App(code.to_owned()))
    }

    /// Terminal codes never carry a retry hint.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Unauthenticated
                | Self::PermissionDenied
                | Self::InvalidArgument
                | Self::FailedPrecondition
                | Self::NotFound
                | Self::AlreadyExists
                | Self::Aborted
                | Self::Unimplemented
                | Self::Internal
        )
    }

    /// Default retryability when an error does not state one explicitly.
    #[must_use]
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            Self::DeadlineExceeded
                | Self::ResourceExhausted
                | Self::Unavailable
                | Self::Cancelled
                | Self::ConnectionClosed
        )
    }

    /// Whether the code belongs to the canonical set.
    #[must_use]
    pub fn is_canonical(&self) -> bool { !matches!(self, Self::App(_)) }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self { Self::parse(code) }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}
