//! Manual-trigger parameter validation.

use serde_json::{Map, Value};

use super::types::ParameterSpec;
use crate::error::{Error, Result};

/// Validate caller parameters against declared specs and apply defaults.
///
/// Undeclared parameters pass through unchanged.
pub fn validate_parameters(specs: &[ParameterSpec], input: &Value) -> Result<Value> {
    let input_obj = match input {
        Value::Object(map) => Some(map),
        Value::Null => None,
        other => {
            return Err(Error::Validation(format!(
                "Parameters must be an object, got '{}'",
                json_type_name(other)
            )))
        }
    };

    let mut result = Map::new();
    let mut errors = Vec::new();

    for spec in specs {
        let value = input_obj.and_then(|obj| obj.get(&spec.name));
        match validate_parameter(spec, value) {
            Ok(Some(validated)) => {
                result.insert(spec.name.clone(), validated);
            }
            Ok(None) => {}
            Err(e) => errors.push(e),
        }
    }

    if !errors.is_empty() {
        return Err(Error::Validation(format!(
            "Parameter validation failed: {}",
            errors.join("; ")
        )));
    }

    if let Some(obj) = input_obj {
        for (key, value) in obj {
            if !result.contains_key(key) {
                result.insert(key.clone(), value.clone());
            }
        }
    }

    Ok(Value::Object(result))
}

fn validate_parameter(
    spec: &ParameterSpec,
    value: Option<&Value>,
) -> std::result::Result<Option<Value>, String> {
    match value {
        None | Some(Value::Null) => {
            if let Some(default) = &spec.default {
                return Ok(Some(default.clone()));
            }
            if spec.required {
                return Err(format!("missing required parameter '{}'", spec.name));
            }
            Ok(None)
        }
        Some(v) => {
            validate_type(&spec.name, &spec.param_type, v)?;
            if !spec.allowed.is_empty() && !spec.allowed.contains(v) {
                return Err(format!(
                    "parameter '{}' must be one of {}",
                    spec.name,
                    Value::Array(spec.allowed.clone())
                ));
            }
            Ok(Some(v.clone()))
        }
    }
}

fn validate_type(name: &str, expected_type: &str, value: &Value) -> std::result::Result<(), String> {
    let valid = match expected_type {
        "string" => value.is_string(),
        "number" | "float" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" | "bool" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "date" => value
            .as_str()
            .map(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok())
            .unwrap_or(false),
        _ => true,
    };

    if !valid {
        return Err(format!(
            "parameter '{}' expected type '{}', got '{}'",
            name,
            expected_type,
            json_type_name(value)
        ));
    }

    Ok(())
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
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

    fn spec(name: &str, ty: &str, required: bool, default: Option<Value>) -> ParameterSpec {
        ParameterSpec {
            name: name.to_string(),
            param_type: ty.to_string(),
            required,
            default,
            description: String::new(),
            allowed: Vec::new(),
        }
    }

    fn specs() -> Vec<ParameterSpec> {
        vec![
            spec("customer_id", "string", true, None),
            spec("count", "integer", false, Some(json!(10))),
            spec("run_date", "date", false, None),
        ]
    }

    #[test]
    fn test_validate_required_param() {
        let err = validate_parameters(&specs(), &json!({})).unwrap_err();
        assert!(err.to_string().contains("customer_id"));
        assert!(validate_parameters(&specs(), &json!({"customer_id": "c-1"})).is_ok());
    }

    #[test]
    fn test_default_values_and_passthrough() {
        let result =
            validate_parameters(&specs(), &json!({"customer_id": "c-1", "extra": true})).unwrap();
        assert_eq!(result["count"], 10);
        assert_eq!(result["extra"], true);
        assert!(result.get("run_date").is_none());
    }

    #[test]
    fn test_type_validation() {
        let bad = json!({"customer_id": "c-1", "count": 1.5});
        assert!(validate_parameters(&specs(), &bad).is_err());
        let bad_date = json!({"customer_id": "c-1", "run_date": "05/03/2024"});
        assert!(validate_parameters(&specs(), &bad_date).is_err());
        let good = json!({"customer_id": "c-1", "count": 3, "run_date": "2024-03-05"});
        assert!(validate_parameters(&specs(), &good).is_ok());
    }

    #[test]
    fn test_allowed_values() {
        let mut region = spec("region", "string", true, None);
        region.allowed = vec![json!("eu"), json!("us")];
        assert!(validate_parameters(&[region.clone()], &json!({"region": "eu"})).is_ok());
        assert!(validate_parameters(&[region], &json!({"region": "apac"})).is_err());
    }

    #[test]
    fn test_non_object_parameters_rejected() {
        assert!(validate_parameters(&specs(), &json!([1, 2])).is_err());
    }
}
