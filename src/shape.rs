//! Structural validation of decoded JSON payloads
//!
//! Snapshots arrive as untrusted JSON. Before they are turned into typed
//! models they are checked against a declarative [`Shape`], which reports
//! every mismatch with the JSON path where it occurred instead of stopping
//! at the first one.

use serde_json::Value;
use std::fmt;

/// A single field-level validation failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeError {
    /// JSON path of the offending value, rooted at `$`
    pub path: String,
    pub message: String,
}

impl ShapeError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Expected structure of a JSON value
#[derive(Debug, Clone)]
pub enum Shape {
    String,
    Array(Box<Shape>),
    Object(Vec<Field>),
}

/// A named member of an object shape
#[derive(Debug, Clone)]
pub struct Field {
    pub name: &'static str,
    pub shape: Shape,
    pub required: bool,
}

impl Field {
    pub fn required(name: &'static str, shape: Shape) -> Self {
        Self {
            name,
            shape,
            required: true,
        }
    }

    /// Optional fields may be absent or `null`
    pub fn optional(name: &'static str, shape: Shape) -> Self {
        Self {
            name,
            shape,
            required: false,
        }
    }
}

impl Shape {
    pub fn array_of(item: Shape) -> Self {
        Shape::Array(Box::new(item))
    }

    /// Validate `value`, returning every mismatch found
    ///
    /// Unknown object members are ignored.
    pub fn validate(&self, value: &Value) -> Vec<ShapeError> {
        let mut errors = Vec::new();
        self.check(value, "$", &mut errors);
        errors
    }

    fn check(&self, value: &Value, path: &str, errors: &mut Vec<ShapeError>) {
        match (self, value) {
            (Shape::String, Value::String(_)) => {}
            (Shape::Array(item), Value::Array(values)) => {
                for (index, element) in values.iter().enumerate() {
                    item.check(element, &format!("{}[{}]", path, index), errors);
                }
            }
            (Shape::Object(fields), Value::Object(map)) => {
                for field in fields {
                    let field_path = format!("{}.{}", path, field.name);
                    match map.get(field.name) {
                        None | Some(Value::Null) if !field.required => {}
                        None => errors.push(ShapeError::new(field_path, "missing required field")),
                        Some(member) => field.shape.check(member, &field_path, errors),
                    }
                }
            }
            (expected, actual) => errors.push(ShapeError::new(
                path,
                format!("expected {}, found {}", expected.name(), type_name(actual)),
            )),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Shape::String => "string",
            Shape::Array(_) => "array",
            Shape::Object(_) => "object",
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
