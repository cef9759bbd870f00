//! Tree Values
//!
//! The store is JSON-shaped but string-leafed: every value is a string, a
//! sequence of values, a mapping from string keys to values, or empty.
//! Empty values are semantically absent and are swept out by
//! [`Value::normalize`] after every query.

use std::collections::BTreeMap;

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

/// A single level of the database tree.
///
/// Mappings use `BTreeMap` so key order is always sorted, which gives
/// `--keys` and `--edit` their deterministic output for free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Empty,
    String(String),
    Seq(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Empty
    }
}

impl Value {
    /// An empty mapping, the shape of a freshly created tree root.
    pub fn root() -> Value {
        Value::Map(BTreeMap::new())
    }

    /// Empty string, empty sequence, empty mapping and `Empty` itself are
    /// all treated as absent.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Empty => true,
            Value::String(s) => s.is_empty(),
            Value::Seq(items) => items.is_empty(),
            Value::Map(map) => map.is_empty(),
        }
    }

    /// Human-readable type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Empty => "empty",
            Value::String(_) => "string",
            Value::Seq(_) => "sequence",
            Value::Map(_) => "mapping",
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Convert parsed JSON into a tree value. Objects become mappings,
    /// arrays become sequences and `null` becomes `Empty`. Numbers and
    /// booleans are flattened to their JSON text once on the way in; the
    /// store itself has no numeric types.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Empty,
            serde_json::Value::Bool(b) => Value::String(b.to_string()),
            serde_json::Value::Number(n) => Value::String(n.to_string()),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Seq(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Render back to JSON. `Empty` renders as `{}` so that an `--edit` of
    /// a missing key round-trips through `--set` as a no-op.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Empty => serde_json::Value::Object(serde_json::Map::new()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Seq(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Pretty-printed JSON with four-space indentation and sorted keys,
    /// the `--edit` output format.
    pub fn pretty(&self) -> String {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        // serializing a serde_json::Value into a byte vector cannot fail
        if self.to_json().serialize(&mut ser).is_ok() {
            String::from_utf8(out).unwrap_or_default()
        } else {
            String::new()
        }
    }

    /// Compact single-line JSON, used for nested values inside sequence
    /// output and for the on-disk snapshot.
    pub fn compact(&self) -> String {
        serde_json::to_string(&self.to_json()).unwrap_or_default()
    }

    /// Structural cleanup run on the whole tree after every query:
    /// sequences of one element collapse to that element, and mapping
    /// children with empty values are deleted, so chains of now-empty
    /// ancestors vanish in a single pass. Sequence contents are not
    /// descended into. Idempotent.
    pub fn normalize(&mut self) {
        if let Value::Map(map) = self {
            let keys: Vec<String> = map.keys().cloned().collect();
            for key in keys {
                if let Some(child) = map.get_mut(&key) {
                    if let Value::Seq(items) = child {
                        if items.len() == 1 {
                            if let Some(only) = items.pop() {
                                *child = only;
                            }
                        }
                    }
                    child.normalize();
                    if child.is_empty() {
                        map.remove(&key);
                    }
                }
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from_json(json))
    }
}
