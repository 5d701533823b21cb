//! Per-connection data bag.

use serde_json::{Map, Value};

/// Mutable key/value record attached to a connection.
///
/// Updates are shallow: [`ConnectionData::assign`] overwrites the given keys
/// and removes keys mapped to `null`, leaving everything else in place.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionData(Map<String, Value>);

impl ConnectionData {
    #[must_use]
    pub fn new(initial: Map<String, Value>) -> Self {
        let mut data = Self::default();
        data.assign(initial);
        data
    }

    /// Merge `partial` into the bag.
    pub fn assign(&mut self, partial: Map<String, Value>) {
        for (key, value) in partial {
            if value.is_null() {
                self.0.remove(&key);
            } else {
                self.0.insert(key, value);
            }
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> { self.0.get(key) }

    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> { &self.0 }

    #[must_use]
    pub fn len(&self) -> usize { self.0.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}
