// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Optimistic specs for the session-mutating procedures.
//!
//! These are client-side declarations: each names the cached entity type,
//! how to extract its id from the mutation input, and a pure draft
//! transformation.  The server never sees them — a client pairs them with
//! the matching mutation path via `RpcClient::mutate_optimistic`.

use braid_rpc::OptimisticSpec;
use serde_json::Value;

fn session_id(input: &Value) -> Option<String> {
    input["sessionId"].as_str().map(str::to_string)
}

pub fn update_title() -> OptimisticSpec {
    OptimisticSpec::new("session", session_id, |draft, input, t| {
        draft["title"] = input["title"].clone();
        draft["updatedAt"] = Value::String(t.to_rfc3339());
    })
}

pub fn update_model() -> OptimisticSpec {
    OptimisticSpec::new("session", session_id, |draft, input, t| {
        draft["modelId"] = input["modelId"].clone();
        draft["baseContextTokens"] = Value::Null;
        draft["updatedAt"] = Value::String(t.to_rfc3339());
    })
}

pub fn update_provider() -> OptimisticSpec {
    OptimisticSpec::new("session", session_id, |draft, input, t| {
        draft["providerId"] = input["providerId"].clone();
        if let Some(model) = input.get("modelId").filter(|m| m.is_string()) {
            draft["modelId"] = model.clone();
        }
        draft["baseContextTokens"] = Value::Null;
        draft["updatedAt"] = Value::String(t.to_rfc3339());
    })
}

pub fn update_rules() -> OptimisticSpec {
    OptimisticSpec::new("session", session_id, |draft, input, t| {
        draft["enabledRuleIds"] = input["ruleIds"].clone();
        draft["baseContextTokens"] = Value::Null;
        draft["updatedAt"] = Value::String(t.to_rfc3339());
    })
}

pub fn update_agent() -> OptimisticSpec {
    OptimisticSpec::new("session", session_id, |draft, input, t| {
        draft["agentId"] = input["agentId"].clone();
        draft["baseContextTokens"] = Value::Null;
        draft["updatedAt"] = Value::String(t.to_rfc3339());
    })
}

pub fn todo_update() -> OptimisticSpec {
    OptimisticSpec::new("todos", session_id, |draft, input, _t| {
        draft["todos"] = input["todos"].clone();
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn title_spec_applies_to_draft() {
        let spec = update_title();
        let input = json!({ "sessionId": "s1", "title": "new" });
        assert_eq!((spec.id)(&input).as_deref(), Some("s1"));
        let mut draft = json!({ "id": "s1", "title": "old" });
        (spec.apply)(&mut draft, &input, chrono::Utc::now());
        assert_eq!(draft["title"], "new");
    }

    #[test]
    fn provider_spec_keeps_model_when_absent() {
        let spec = update_provider();
        let input = json!({ "sessionId": "s1", "providerId": "openai" });
        let mut draft = json!({ "providerId": "mock", "modelId": "mock-model" });
        (spec.apply)(&mut draft, &input, chrono::Utc::now());
        assert_eq!(draft["providerId"], "openai");
        assert_eq!(draft["modelId"], "mock-model");
    }

    #[test]
    fn missing_session_id_yields_none() {
        let spec = update_title();
        assert!((spec.id)(&json!({ "title": "x" })).is_none());
    }
}
