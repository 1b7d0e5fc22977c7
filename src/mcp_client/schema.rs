//! Parameter schemas: normalization at discovery time and argument
//! validation at invocation time.
//!
//! Validation covers the JSON Schema subset tool servers actually use:
//! `type`, `required`, `properties`, `additionalProperties: false`, `enum`,
//! `items`, `minimum` and `maximum`. Anything else is accepted as-is and left
//! for the server to enforce.

use serde_json::{json, Map, Value};

/// Schema used when a server reports none.
pub fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// Turn a reported `inputSchema` into an object schema the execution loop
/// can hand to a model.
pub fn normalize_schema(raw: &Value) -> Result<Value, String> {
    let mut schema: Map<String, Value> = match raw {
        Value::Null => return Ok(empty_object_schema()),
        Value::Object(map) => map.clone(),
        other => {
            return Err(format!(
                "inputSchema must be an object, got {}",
                type_name(other)
            ))
        }
    };

    match schema.get("type") {
        None => {
            schema.insert("type".into(), json!("object"));
        }
        Some(Value::String(t)) if t == "object" => {}
        Some(other) => {
            return Err(format!(
                "inputSchema must describe an object, got type {other}"
            ))
        }
    }

    match schema.get("properties") {
        None | Some(Value::Null) => {
            schema.insert("properties".into(), json!({}));
        }
        Some(Value::Object(_)) => {}
        Some(_) => return Err("inputSchema 'properties' must be an object".into()),
    }

    Ok(Value::Object(schema))
}

/// Check `arguments` against `schema`. The error names the offending path.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), String> {
    validate_at(schema, arguments, "$")
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        check_type(expected, value, path)?;
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!("{path}: {value} is not one of the allowed values"));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                return Err(format!("{path}: {n} is below the minimum {min}"));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                return Err(format!("{path}: {n} is above the maximum {max}"));
            }
        }
    }

    if let Some(obj) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for field in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(field) {
                    return Err(format!("{path}: missing required field '{field}'"));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));

        for (key, item) in obj {
            match properties.and_then(|p| p.get(key)) {
                Some(sub) => validate_at(sub, item, &format!("{path}.{key}"))?,
                None if closed => return Err(format!("{path}: unexpected field '{key}'")),
                None => {}
            }
        }
    }

    if let (Some(items), Some(item_schema)) = (value.as_array(), schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            validate_at(item_schema, item, &format!("{path}[{i}]"))?;
        }
    }

    Ok(())
}

fn check_type(expected: &Value, value: &Value, path: &str) -> Result<(), String> {
    let names: Vec<&str> = match expected {
        Value::String(name) => vec![name.as_str()],
        Value::Array(names) => names.iter().filter_map(Value::as_str).collect(),
        _ => return Ok(()),
    };

    if names.is_empty() || names.iter().any(|name| matches_type(name, value)) {
        Ok(())
    } else {
        Err(format!(
            "{path}: expected {}, got {}",
            names.join(" or "),
            type_name(value)
        ))
    }
}

fn matches_type(name: &str, value: &Value) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        _ => true,
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

// ─── Tests ───────────────────────────────────────────────────────────────────
