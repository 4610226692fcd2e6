//! Schemaless configuration values.
//!
//! User-supplied component configuration is arbitrary JSON. Inside the
//! configuration tree, leaves hold a [`Value`]: a scalar or a list (lists are
//! replaced whole on merge, never element-wise). Objects become interior
//! nodes of the tree, so [`Value`] deliberately has no map variant.

use serde::{Deserialize, Serialize};

/// A leaf value in the configuration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// JSON null.
    Null,

    /// Boolean.
    Bool(bool),

    /// Integer (64-bit).
    Int(i64),

    /// Floating point.
    Float(f64),

    /// UTF-8 string.
    String(String),

    /// List, replaced wholesale on merge.
    List(Vec<Value>),
}

impl Value {
    /// Converts a JSON value into a leaf value.
    ///
    /// Returns `None` for objects; those are interior nodes, not leaves.
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Option<Self> {
        match json {
            serde_json::Value::Null => Some(Self::Null),
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n.as_i64().map_or_else(
                || n.as_f64().map(Self::Float),
                |i| Some(Self::Int(i)),
            ),
            serde_json::Value::String(s) => Some(Self::String(s.clone())),
            serde_json::Value::Array(items) => {
                // A list containing an object cannot be represented as a
                // leaf; such lists are rejected by coercion.
                let converted: Option<Vec<Self>> = items.iter().map(Self::from_json).collect();
                converted.map(Self::List)
            }
            serde_json::Value::Object(_) => None,
        }
    }

    /// Converts this leaf value back to JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
        }
    }

    /// Returns the string content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer content, if this is an integer.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the float content; integers coerce.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Returns the boolean content, if this is a boolean.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Renders the value for token interpolation.
    ///
    /// Scalars render bare (no quotes); lists render as JSON.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::String(s) => s.clone(),
            Self::List(_) => self.to_json().to_string(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}
