//! Payload validation capability.
//!
//! A [`ValidatorAdapter`] binds the router to a schema library. Schemas are
//! opaque to the router; the adapter names the message type a schema
//! describes and validates payloads against it.

use std::{any::Any, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::WsError, registry::PayloadCheck};

/// Opaque schema handle.
pub type SchemaRef = Arc<dyn Any + Send + Sync>;

/// One validation failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Location of the offending value, outermost key first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            path: Vec::new(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn at(mut self, segment: impl Into<String>) -> Self {
        self.path.push(segment.into());
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.path.join("."), self.message)
        }
    }
}

/// Schema library binding.
pub trait ValidatorAdapter: Send + Sync + 'static {
    /// Message type described by `schema`, if it declares one.
    fn message_type(&self, schema: &SchemaRef) -> Option<String>;

    /// Validate `data`, returning the normalised value or every issue found.
    ///
    /// # Errors
    ///
    /// Returns the validation issues when `data` does not match `schema`.
    fn safe_parse(&self, schema: &SchemaRef, data: &Value) -> Result<Value, Vec<ValidationIssue>>;
}

/// Turn a failed parse into the `INVALID_ARGUMENT` reported to the client.
#[must_use]
pub fn issues_error(issues: &[ValidationIssue]) -> WsError {
    let message = issues
        .first()
        .map_or_else(|| "payload validation failed".to_owned(), |i| format!("invalid payload: {i}"));
    let listed = serde_json::to_value(issues).unwrap_or(Value::Null);
    WsError::invalid_argument(message).with_detail("issues", listed)
}

/// Build the registry check validating payloads against `schema`.
///
/// A missing payload is validated as `null`; a `null` result means no
/// payload.
pub(crate) fn payload_check(validator: Arc<dyn ValidatorAdapter>, schema: SchemaRef) -> PayloadCheck {
    Arc::new(move |payload| {
        let data = payload.cloned().unwrap_or(Value::Null);
        match validator.safe_parse(&schema, &data) {
            Ok(Value::Null) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(issues) => Err(issues_error(&issues)),
        }
    })
}
