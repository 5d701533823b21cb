//! Scrubbing of error details before they reach a client.
//!
//! Keys that look like credentials are removed at every nesting level, then
//! any top-level value whose serialised form exceeds [`MAX_DETAIL_VALUE_CHARS`]
//! is dropped. An emptied map is reported as `None` so the wire payload omits
//! `details` entirely.

use serde_json::{Map, Value};

/// Largest serialised size, in characters, of a single top-level detail value.
pub const MAX_DETAIL_VALUE_CHARS: usize = 500;

/// Fragments that mark a key as secret-shaped once lower-cased and stripped of
/// `_` and `-`.
const DENYLIST_FRAGMENTS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "authorization",
    "bearer",
    "cookie",
    "apikey",
    "credential",
    "privatekey",
    "sessionid",
];

/// Keys that are only secret when they match exactly, such as `auth`.
const DENYLIST_EXACT: &[&str] = &["auth", "jwt", "pin"];

/// Return `true` when `key` names a value that must never leave the server.
#[must_use]
pub fn is_secret_key(key: &str) -> bool {
    let normalised: String = key
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect();
    DENYLIST_EXACT.contains(&normalised.as_str())
        || DENYLIST_FRAGMENTS
            .iter()
            .any(|fragment| normalised.contains(fragment))
}

/// Sanitise a details map, returning `None` when nothing survives.
#[must_use]
pub fn sanitize_details(details: Map<String, Value>) -> Option<Map<String, Value>> {
    let cleaned: Map<String, Value> = details
        .into_iter()
        .filter(|(key, _)| !is_secret_key(key))
        .map(|(key, value)| (key, strip_nested(value)))
        .filter(|(_, value)| serialized_len(value) <= MAX_DETAIL_VALUE_CHARS)
        .collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

fn strip_nested(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| !is_secret_key(key))
                .map(|(key, inner)| (key, strip_nested(inner)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nested).collect()),
        other => other,
    }
}

fn serialized_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count() + 2,
        other => other.to_string().chars().count(),
    }
}
