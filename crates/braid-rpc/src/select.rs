// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Field selection.
//!
//! A `select` specifier is a recursive shape mirroring the output: an
//! object whose keys name the wanted fields.  A primitive truthy leaf
//! selects the field whole; a nested object recurses.  Unknown keys are
//! ignored.  Applied server-side before transmission — and, for
//! subscriptions, to **every** update, not only the first snapshot.

use serde_json::{Map, Value};

/// Prune `output` down to the projection described by `select`.
///
/// `None` (or a non-object specifier) returns the output unchanged.
/// Arrays are projected element-wise.
pub fn apply_select(output: Value, select: Option<&Value>) -> Value {
    match select {
        Some(spec) if spec.is_object() => project(output, spec),
        _ => output,
    }
}

fn project(value: Value, spec: &Value) -> Value {
    match value {
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|v| project(v, spec)).collect())
        }
        Value::Object(mut obj) => {
            let Some(fields) = spec.as_object() else {
                return Value::Object(obj);
            };
            let mut out = Map::new();
            for (key, sub) in fields {
                if !truthy(sub) {
                    continue;
                }
                if let Some(v) = obj.remove(key) {
                    if sub.is_object() {
                        out.insert(key.clone(), project(v, sub));
                    } else {
                        out.insert(key.clone(), v);
                    }
                }
            }
            Value::Object(out)
        }
        // Primitive output with an object selector: nothing to prune.
        other => other,
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64() != Some(0.0),
        _ => true,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn no_select_returns_output_unchanged() {
        let out = json!({ "a": 1, "b": 2 });
        assert_eq!(apply_select(out.clone(), None), out);
    }

    #[test]
    fn top_level_fields_are_pruned() {
        let out = json!({ "id": "s1", "title": "t", "totalTokens": 42 });
        let sel = json!({ "id": true, "title": true });
        assert_eq!(
            apply_select(out, Some(&sel)),
            json!({ "id": "s1", "title": "t" })
        );
    }

    #[test]
    fn nested_objects_recurse() {
        let out = json!({ "session": { "id": "s1", "flags": { "x": true } }, "extra": 1 });
        let sel = json!({ "session": { "id": true } });
        assert_eq!(
            apply_select(out, Some(&sel)),
            json!({ "session": { "id": "s1" } })
        );
    }

    #[test]
    fn arrays_are_projected_elementwise() {
        let out = json!([{ "id": 1, "x": "a" }, { "id": 2, "x": "b" }]);
        let sel = json!({ "id": true });
        assert_eq!(apply_select(out, Some(&sel)), json!([{ "id": 1 }, { "id": 2 }]));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let out = json!({ "id": "s1" });
        let sel = json!({ "id": true, "doesNotExist": true });
        assert_eq!(apply_select(out, Some(&sel)), json!({ "id": "s1" }));
    }

    #[test]
    fn false_leaves_deselect() {
        let out = json!({ "id": "s1", "title": "t" });
        let sel = json!({ "id": true, "title": false });
        assert_eq!(apply_select(out, Some(&sel)), json!({ "id": "s1" }));
    }

    #[test]
    fn primitive_output_passes_through() {
        assert_eq!(apply_select(json!(42), Some(&json!({ "a": true }))), json!(42));
    }
}
