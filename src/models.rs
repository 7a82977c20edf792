//! Snapshot models for persisting workflows
//!
//! A snapshot is the JSON form of a workflow or operation that callers store
//! and later restore. Nested payloads (the graph and cached values) are
//! carried as base64 of their JSON text.

use crate::error::{FlowError, Result};
use crate::shape::{Field, Shape};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Serialized function reference; the callable itself is never stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSnapshot {
    pub id: String,
    pub hash: String,
}

/// Serialized cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Hash of the input the value was computed from
    pub hash: String,
    /// base64 of the cached value's JSON
    pub value: String,
}

/// Serialized operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSnapshot {
    pub id: String,
    pub func: FunctionSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheSnapshot>,
}

/// Serialized workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// base64 of the [`GraphSnapshot`] JSON
    pub graph: String,
    pub operations: Vec<OperationSnapshot>,
}

/// Graph topology in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<NodeSnapshot>,
    pub edges: Vec<EdgeSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSnapshot {
    pub from: String,
    pub to: String,
}

impl FunctionSnapshot {
    pub fn shape() -> Shape {
        Shape::Object(vec![
            Field::required("id", Shape::String),
            Field::required("hash", Shape::String),
        ])
    }
}

impl CacheSnapshot {
    pub fn shape() -> Shape {
        Shape::Object(vec![
            Field::required("hash", Shape::String),
            Field::required("value", Shape::String),
        ])
    }
}

impl OperationSnapshot {
    pub fn shape() -> Shape {
        Shape::Object(vec![
            Field::required("id", Shape::String),
            Field::required("func", FunctionSnapshot::shape()),
            Field::optional("cache", CacheSnapshot::shape()),
        ])
    }
}

impl WorkflowSnapshot {
    pub fn shape() -> Shape {
        Shape::Object(vec![
            Field::required("graph", Shape::String),
            Field::required("operations", Shape::array_of(OperationSnapshot::shape())),
        ])
    }
}

impl GraphSnapshot {
    pub fn shape() -> Shape {
        Shape::Object(vec![
            Field::required(
                "nodes",
                Shape::array_of(Shape::Object(vec![Field::required("id", Shape::String)])),
            ),
            Field::required(
                "edges",
                Shape::array_of(Shape::Object(vec![
                    Field::required("from", Shape::String),
                    Field::required("to", Shape::String),
                ])),
            ),
        ])
    }
}

/// Check `value` against `shape`, then convert it into `T`
pub fn decode_validated<T: DeserializeOwned>(value: Value, shape: &Shape) -> Result<T> {
    let errors = shape.validate(&value);
    if !errors.is_empty() {
        return Err(FlowError::ValueValidationFailed { errors });
    }
    serde_json::from_value(value).map_err(|e| FlowError::invalid("$", e.to_string()))
}

/// base64 of the JSON text of `value`; `null` is stored as `{}`
pub(crate) fn encode_value(value: &Value) -> String {
    let text = if value.is_null() {
        "{}".to_string()
    } else {
        value.to_string()
    };
    STANDARD.encode(text)
}

/// Inverse of [`encode_value`]; `path` names the field for error reports
pub(crate) fn decode_value(path: &str, encoded: &str) -> Result<Value> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| FlowError::invalid(path, format!("invalid base64: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| FlowError::invalid(path, format!("invalid JSON payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_operation_snapshot_omits_empty_cache() {
        let snapshot = OperationSnapshot {
            id: "a".to_string(),
            func: FunctionSnapshot {
                id: "a".to_string(),
                hash: "abc".to_string(),
            },
            cache: None,
        };
        let text = serde_json::to_string(&snapshot).unwrap();
        assert_eq!(text, r#"{"id":"a","func":{"id":"a","hash":"abc"}}"#);
    }

    #[test]
    fn test_null_value_stored_as_empty_object() {
        let encoded = encode_value(&Value::Null);
        assert_eq!(decode_value("$.value", &encoded).unwrap(), json!({}));
    }

    #[test]
    fn test_value_codec_preserves_structure() {
        let value = json!({"a": [1, 2, {"b": "c"}]});
        let encoded = encode_value(&value);
        assert_eq!(decode_value("$.value", &encoded).unwrap(), value);
    }

    #[test]
    fn test_decode_value_rejects_bad_base64() {
        let err = decode_value("$.cache.value", "not base64!!").unwrap_err();
        match err {
            FlowError::ValueValidationFailed { errors } => {
                assert_eq!(errors[0].path, "$.cache.value");
                assert!(errors[0].message.starts_with("invalid base64"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_validated_reports_shape_errors() {
        let err = decode_validated::<OperationSnapshot>(
            json!({"id": 7, "func": {"id": "a"}}),
            &OperationSnapshot::shape(),
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ValueValidationFailed);
        match err {
            FlowError::ValueValidationFailed { errors } => {
                let paths: Vec<_> = errors.iter().map(|e| e.path.as_str()).collect();
                assert_eq!(paths, vec!["$.id", "$.func.hash"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_validated_accepts_missing_cache() {
        let snapshot: OperationSnapshot = decode_validated(
            json!({"id": "a", "func": {"id": "a", "hash": "h"}, "cache": null}),
            &OperationSnapshot::shape(),
        )
        .unwrap();
        assert!(snapshot.cache.is_none());
    }
}
