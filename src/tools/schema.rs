//! Parameter schemas for tools, with validation and lenient type coercion.
//!
//! Model output is loosely typed: `"42"` where an integer is expected, `true`
//! where a string is expected. A schema declares what each tool accepts; the
//! validator coerces values that convert losslessly and rejects the rest,
//! always naming the offending field.

use serde_json::{json, Map, Number, Value};

use crate::util::json_type;

/// JSON type a parameter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamKind {
    pub fn json_type(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Object => "object",
            ParamKind::Array => "array",
        }
    }

    /// Convert `value` to this kind, or `None` if it cannot be done without loss.
    fn coerce(&self, value: Value) -> Option<Value> {
        match (self, value) {
            (ParamKind::String, Value::String(s)) => Some(Value::String(s)),
            (ParamKind::String, Value::Number(n)) => Some(Value::String(n.to_string())),
            (ParamKind::String, Value::Bool(b)) => Some(Value::String(b.to_string())),

            (ParamKind::Integer, Value::Number(n)) => {
                if n.is_i64() || n.is_u64() {
                    Some(Value::Number(n))
                } else {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| Value::Number(Number::from(f as i64)))
                }
            }
            (ParamKind::Integer, Value::String(s)) => {
                s.trim().parse::<i64>().ok().map(|i| Value::Number(i.into()))
            }

            (ParamKind::Number, Value::Number(n)) => Some(Value::Number(n)),
            (ParamKind::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number),

            (ParamKind::Boolean, Value::Bool(b)) => Some(Value::Bool(b)),
            (ParamKind::Boolean, Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },

            (ParamKind::Object, Value::Object(o)) => Some(Value::Object(o)),
            (ParamKind::Object, Value::String(s)) => match serde_json::from_str(&s) {
                Ok(Value::Object(o)) => Some(Value::Object(o)),
                _ => None,
            },

            (ParamKind::Array, Value::Array(a)) => Some(Value::Array(a)),
            (ParamKind::Array, Value::String(s)) => match serde_json::from_str(&s) {
                Ok(Value::Array(a)) => Some(Value::Array(a)),
                _ => None,
            },

            _ => None,
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub description: &'static str,
}

impl ParamSpec {
    pub fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            description,
        }
    }

    pub fn optional(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            description,
        }
    }
}

/// Argument validation failure, naming exactly one field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct SchemaError {
    pub field: String,
    pub message: String,
}

impl From<SchemaError> for crate::error::FleetError {
    fn from(e: SchemaError) -> Self {
        crate::error::FleetError::Validation {
            field: e.field,
            message: e.message,
        }
    }
}

/// Declared parameters of one tool.
#[derive(Debug, Clone, Default)]
pub struct ToolSchema {
    params: Vec<ParamSpec>,
}

impl ToolSchema {
    pub fn new(params: Vec<ParamSpec>) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Validate and coerce `args`.
    ///
    /// Unknown fields are rejected before anything else, then parameters are
    /// checked in declaration order. Explicit `null` counts as absent.
    pub fn validate(&self, args: Map<String, Value>) -> Result<Map<String, Value>, SchemaError> {
        let mut unknown: Vec<&String> = args
            .keys()
            .filter(|k| !self.params.iter().any(|p| p.name == k.as_str()))
            .collect();
        unknown.sort();
        if let Some(field) = unknown.first() {
            return Err(SchemaError {
                field: field.to_string(),
                message: "unknown parameter".to_string(),
            });
        }

        let mut args = args;
        let mut out = Map::new();
        for param in &self.params {
            match args.remove(param.name) {
                None | Some(Value::Null) => {
                    if param.required {
                        return Err(SchemaError {
                            field: param.name.to_string(),
                            message: "required parameter is missing".to_string(),
                        });
                    }
                }
                Some(value) => {
                    let found = json_type(&value);
                    let coerced = param.kind.coerce(value).ok_or_else(|| SchemaError {
                        field: param.name.to_string(),
                        message: format!(
                            "expected {}, found {}",
                            param.kind.json_type(),
                            found
                        ),
                    })?;
                    out.insert(param.name.to_string(), coerced);
                }
            }
        }
        Ok(out)
    }

    /// JSON Schema for `tools/list` and for the prompt's tool catalogue.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for param in &self.params {
            properties.insert(
                param.name.to_string(),
                json!({
                    "type": param.kind.json_type(),
                    "description": param.description,
                }),
            );
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name)
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }
}
