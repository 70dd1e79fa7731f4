//! Structured ledger metadata
//!
//! Metadata is opaque to the ledger but must always be writable. Values that
//! cannot be represented in a JSON row (integers wider than 64 bits, for
//! example) are stored as strings instead of failing the write.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Ordered key/value metadata attached to a ledger entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    /// Empty metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, stringifying it when it does not serialize
    pub fn insert<V>(&mut self, key: impl Into<String>, value: V) -> &mut Self
    where
        V: Serialize + fmt::Debug,
    {
        let value = match serde_json::to_value(&value) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "Stringifying metadata value");
                Value::String(format!("{:?}", value))
            }
        };
        self.0.insert(key.into(), value);
        self
    }

    /// Builder-style insert
    pub fn with<V>(mut self, key: impl Into<String>, value: V) -> Self
    where
        V: Serialize + fmt::Debug,
    {
        self.insert(key, value);
        self
    }

    /// Get a value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Merge another metadata map into this one (other wins on conflict)
    pub fn extend(&mut self, other: Metadata) {
        self.0.extend(other.0);
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no keys
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Normalize an arbitrary JSON payload so it survives a storage round trip.
    ///
    /// Floats that are not finite cannot exist in a `Value`, but integral
    /// floats beyond 2^53 lose precision in most JSON consumers and are
    /// stringified here.
    pub fn sanitized(self) -> Self {
        Self(
            self.0
                .into_iter()
                .map(|(k, v)| (k, sanitize_value(v)))
                .collect(),
        )
    }

    /// Borrow the underlying JSON map
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for Metadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

const MAX_SAFE_FLOAT_INTEGER: f64 = 9_007_199_254_740_992.0;

fn sanitize_value(value: Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.is_finite() && f.abs() < MAX_SAFE_FLOAT_INTEGER => Value::Number(n),
            _ => Value::String(n.to_string()),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, sanitize_value(v)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_plain_values() {
        let meta = Metadata::new()
            .with("gift_slug", "rose")
            .with("quantity", 4u32)
            .with("tier", json!({"level": 2}));

        assert_eq!(meta.len(), 3);
        assert_eq!(meta.get("gift_slug"), Some(&json!("rose")));
        assert_eq!(meta.get("quantity"), Some(&json!(4)));
    }

    #[test]
    fn test_wide_integers_are_stringified() {
        let meta = Metadata::new().with("big", u128::MAX);
        assert_eq!(
            meta.get("big"),
            Some(&Value::String(u128::MAX.to_string()))
        );
    }

    #[test]
    fn test_sanitize_large_floats() {
        let map = json!({
            "ok": 1.5,
            "huge": 1.0e300,
            "nested": [{"huge": 2.0e20}]
        });
        let meta = Metadata::from(map.as_object().unwrap().clone()).sanitized();

        assert_eq!(meta.get("ok"), Some(&json!(1.5)));
        assert!(meta.get("huge").unwrap().is_string());
        assert!(meta.get("nested").unwrap()[0]["huge"].is_string());
    }

    #[test]
    fn test_round_trip_through_json() {
        let meta = Metadata::new().with("admin_reason", "manual").with("big", u128::MAX);
        let encoded = serde_json::to_vec(&meta).unwrap();
        let decoded: Metadata = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, meta);
    }
}
