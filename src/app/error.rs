//! Error types for router setup.

use thiserror::Error;

use crate::config::ConfigError;

/// Registration and composition failures.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RouterError {
    /// A route for this message type already exists.
    #[error("message type {0:?} was already registered")]
    DuplicateRoute(String),
    /// The type uses the engine's reserved prefix.
    #[error("message type {0:?} uses the reserved prefix")]
    ReservedType(String),
    #[error("message type must not be empty")]
    EmptyType,
    /// A merge or mount found this type on both sides.
    #[error("message type {0:?} exists in both routers")]
    MergeConflict(String),
    /// A schema did not name the message type it describes.
    #[error("schema does not declare a message type")]
    UntypedSchema,
    /// An operation needs a capability that was not installed.
    #[error("{operation} requires the {capability} capability")]
    CapabilityUnavailable {
        capability: &'static str,
        operation: &'static str,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type used throughout the builder API.
pub type Result<T> = std::result::Result<T, RouterError>;
