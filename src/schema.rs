//! Tool argument validation against declared JSON schemas.
//!
//! Supports the subset tools declare: a top-level `object` with
//! `properties`, `required`, per-property `type` and `enum`, and
//! `default` values that are filled in for missing optional properties.
//! Properties not listed in the schema are passed through unchanged.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SchemaViolation {
    #[error("arguments must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("missing required parameter: {0}")]
    MissingRequired(String),

    #[error("parameter '{name}' must be of type '{expected}', got {actual}")]
    WrongType {
        name: String,
        expected: String,
        actual: &'static str,
    },

    #[error("parameter '{name}' must be one of [{allowed}], got {value}")]
    NotInEnum {
        name: String,
        allowed: String,
        value: Value,
    },
}

/// Check `args` against `schema`, returning the arguments with defaults
/// applied.
pub fn validate(schema: &Value, args: &Value) -> Result<Value, SchemaViolation> {
    let empty = Map::new();
    let args_obj = match args {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => return Err(SchemaViolation::NotAnObject(json_type_name(other))),
    };

    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !args_obj.contains_key(name) {
                return Err(SchemaViolation::MissingRequired(name.to_string()));
            }
        }
    }

    let mut result = args_obj.clone();
    for (name, prop) in &properties {
        let Some(value) = args_obj.get(name) else {
            if let Some(default) = prop.get("default") {
                result.insert(name.clone(), default.clone());
            }
            continue;
        };

        if let Some(expected) = prop.get("type").and_then(Value::as_str) {
            if !type_matches(expected, value) {
                return Err(SchemaViolation::WrongType {
                    name: name.clone(),
                    expected: expected.to_string(),
                    actual: json_type_name(value),
                });
            }
        }

        if let Some(allowed) = prop.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                let allowed: Vec<String> = allowed.iter().map(Value::to_string).collect();
                return Err(SchemaViolation::NotInEnum {
                    name: name.clone(),
                    allowed: allowed.join(", "),
                    value: value.clone(),
                });
            }
        }
    }

    Ok(Value::Object(result))
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "max_results": { "type": "integer", "default": 5 },
                "source": { "type": "string", "enum": ["local_file", "gmail", "calendar", "drive"] }
            },
            "required": ["query"]
        })
    }

    #[test]
    fn test_valid_args_get_defaults() {
        let out = validate(&schema(), &json!({ "query": "budget" })).unwrap();
        assert_eq!(out, json!({ "query": "budget", "max_results": 5 }));
    }

    #[test]
    fn test_missing_required() {
        let err = validate(&schema(), &json!({ "max_results": 3 })).unwrap_err();
        assert_eq!(err, SchemaViolation::MissingRequired("query".into()));
    }

    #[test]
    fn test_wrong_type() {
        let err = validate(&schema(), &json!({ "query": "x", "max_results": "ten" })).unwrap_err();
        assert!(matches!(err, SchemaViolation::WrongType { ref name, .. } if name == "max_results"));
        assert_eq!(
            err.to_string(),
            "parameter 'max_results' must be of type 'integer', got string"
        );
    }

    #[test]
    fn test_enum_violation() {
        let err = validate(&schema(), &json!({ "query": "x", "source": "slack" })).unwrap_err();
        assert!(matches!(err, SchemaViolation::NotInEnum { .. }));
    }

    #[test]
    fn test_non_object_arguments() {
        let err = validate(&schema(), &json!("query")).unwrap_err();
        assert_eq!(err, SchemaViolation::NotAnObject("string"));
    }

    #[test]
    fn test_null_arguments_treated_as_empty() {
        let no_required = json!({ "type": "object", "properties": {} });
        assert_eq!(validate(&no_required, &Value::Null).unwrap(), json!({}));
    }
}
