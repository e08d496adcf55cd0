// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tagged dynamic value type shared by the expression evaluator, context store,
//! and step inputs/outputs.
//!
//! Step outputs are heterogeneous dicts at the boundary (LLM JSON, tool results).
//! Rather than threading `serde_json::Value` through the whole engine, internal
//! code works against this tree so that evaluator semantics (null-safety, path
//! indexing) are defined once, independent of the JSON representation.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truthiness per the expression evaluator's boolean semantics: `None`, `false`,
    /// `0`, `""`, empty list/map are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(m) => m.get(key),
            _ => None,
        }
    }

    pub fn get_index(&self, idx: usize) -> Option<&Value> {
        match self {
            Value::List(l) => l.get(idx),
            _ => None,
        }
    }

    /// Collects every string leaf reachable from this value, depth first.
    /// Mirrors the artifact extractor's recursive string harvester.
    pub fn collect_strings(&self, out: &mut Vec<String>) {
        match self {
            Value::String(s) => out.push(s.clone()),
            Value::List(items) => {
                for item in items {
                    item.collect_strings(out);
                }
            }
            Value::Map(map) => {
                for v in map.values() {
                    v.collect_strings(out);
                }
            }
            _ => {}
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(_) | Value::Map(_) => {
                write!(f, "{}", serde_json::to_string(self).unwrap_or_default())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => {
                Value::List(arr.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => Value::Map(
                obj.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Number(n) => serde_json::json!(n),
            Value::String(s) => serde_json::Value::String(s),
            Value::Bytes(b) => serde_json::json!(b),
            Value::List(l) => serde_json::Value::Array(l.into_iter().map(Into::into).collect()),
            Value::Map(m) => serde_json::Value::Object(
                m.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_matches_expression_evaluator_rules() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::String(String::new()).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(Value::Number(1.0).is_truthy());
        assert!(!Value::List(vec![]).is_truthy());
    }

    #[test]
    fn json_round_trip_preserves_shape() {
        let json = serde_json::json!({"a": [1, "x", null], "b": true});
        let value: Value = json.clone().into();
        let back: serde_json::Value = value.into();
        assert_eq!(json, back);
    }

    #[test]
    fn collect_strings_walks_nested_structures() {
        let value = Value::Map(BTreeMap::from([
            ("a".to_string(), Value::String("x".to_string())),
            (
                "b".to_string(),
                Value::List(vec![Value::String("y".to_string()), Value::Number(1.0)]),
            ),
        ]));
        let mut out = Vec::new();
        value.collect_strings(&mut out);
        out.sort();
        assert_eq!(out, vec!["x".to_string(), "y".to_string()]);
    }
}
