// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device values and value-type declarations.

use serde::{Deserialize, Serialize};

/// A value carried by a device node or a protocol expression.
///
/// `Null` is only accepted by nullable nodes and clears the node's target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the value's shape, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Text(_) => "text",
            Value::List(_) => "list",
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => f.write_str(s),
            Value::List(items) => {
                f.write_str("[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// Declared shape of a node's value, published to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueType {
    Boolean,
    Numeric {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        range: Option<(f64, f64)>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resolution: Option<f64>,
    },
    Enum {
        cases: Vec<String>,
    },
    Scalar,
    Collection,
}

impl ValueType {
    /// Whether `value` fits this declaration. `Null` is judged by the
    /// node's nullable flag, not here.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ValueType::Boolean, Value::Bool(_)) => true,
            (ValueType::Numeric { range, .. }, Value::Number(n)) => match range {
                Some((lo, hi)) => *n >= *lo && *n <= *hi,
                None => true,
            },
            (ValueType::Enum { cases }, Value::Text(s)) => cases.iter().any(|c| c == s),
            (ValueType::Scalar, Value::Number(_) | Value::Text(_) | Value::Bool(_)) => true,
            (ValueType::Collection, Value::List(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
#[path = "value_tests.rs"]
mod tests;
