// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Runtime input validation.
//!
//! Procedure input schemas are declared as plain JSON Schema objects (the
//! same `json!({...})` idiom tools use for their parameter schemas) and
//! validated here before the resolver runs.  The validator covers the
//! subset the catalog actually uses: `type`, `properties`, `required`,
//! `items`, `enum`, `minimum`/`maximum`, `minLength`/`maxLength`,
//! `additionalProperties: false`.  Unknown keywords are ignored.

use serde_json::Value;

use crate::RpcError;

/// Validate `input` against `schema`.  Returns a [`RpcError::validation`]
/// naming the offending path on the first mismatch.
pub fn validate_input(schema: &Value, input: &Value) -> Result<(), RpcError> {
    let mut path = String::from("input");
    check(schema, input, &mut path).map_err(RpcError::validation)
}

fn check(schema: &Value, value: &Value, path: &mut String) -> Result<(), String> {
    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!("{path}: value not in enum"));
        }
        return Ok(());
    }

    let Some(ty) = schema.get("type").and_then(Value::as_str) else {
        // No type constraint: anything goes.
        return Ok(());
    };

    match ty {
        "object" => {
            let Some(obj) = value.as_object() else {
                return Err(format!("{path}: expected object"));
            };
            let props = schema.get("properties").and_then(Value::as_object);
            if let Some(required) = schema.get("required").and_then(Value::as_array) {
                for key in required.iter().filter_map(Value::as_str) {
                    if !obj.contains_key(key) {
                        return Err(format!("{path}: missing required field {key:?}"));
                    }
                }
            }
            if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                if let Some(props) = props {
                    for key in obj.keys() {
                        if !props.contains_key(key) {
                            return Err(format!("{path}: unknown field {key:?}"));
                        }
                    }
                }
            }
            if let Some(props) = props {
                for (key, sub) in props {
                    if let Some(v) = obj.get(key) {
                        if v.is_null() && !required_contains(schema, key) {
                            continue;
                        }
                        let len = path.len();
                        path.push('.');
                        path.push_str(key);
                        check(sub, v, path)?;
                        path.truncate(len);
                    }
                }
            }
            Ok(())
        }
        "array" => {
            let Some(items) = value.as_array() else {
                return Err(format!("{path}: expected array"));
            };
            if let Some(sub) = schema.get("items") {
                for (i, v) in items.iter().enumerate() {
                    let len = path.len();
                    path.push_str(&format!("[{i}]"));
                    check(sub, v, path)?;
                    path.truncate(len);
                }
            }
            Ok(())
        }
        "string" => {
            let Some(s) = value.as_str() else {
                return Err(format!("{path}: expected string"));
            };
            if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                if (s.chars().count() as u64) < min {
                    return Err(format!("{path}: shorter than minLength {min}"));
                }
            }
            if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                if (s.chars().count() as u64) > max {
                    return Err(format!("{path}: longer than maxLength {max}"));
                }
            }
            Ok(())
        }
        "integer" => {
            let Some(n) = value.as_i64() else {
                return Err(format!("{path}: expected integer"));
            };
            if let Some(min) = schema.get("minimum").and_then(Value::as_i64) {
                if n < min {
                    return Err(format!("{path}: below minimum {min}"));
                }
            }
            if let Some(max) = schema.get("maximum").and_then(Value::as_i64) {
                if n > max {
                    return Err(format!("{path}: above maximum {max}"));
                }
            }
            Ok(())
        }
        "number" => {
            if !value.is_number() {
                return Err(format!("{path}: expected number"));
            }
            Ok(())
        }
        "boolean" => {
            if !value.is_boolean() {
                return Err(format!("{path}: expected boolean"));
            }
            Ok(())
        }
        "null" => {
            if !value.is_null() {
                return Err(format!("{path}: expected null"));
            }
            Ok(())
        }
        other => Err(format!("{path}: unsupported schema type {other:?}")),
    }
}

fn required_contains(schema: &Value, key: &str) -> bool {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().any(|v| v.as_str() == Some(key)))
        .unwrap_or(false)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
