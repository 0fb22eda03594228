// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_agent() -> String {
    "coder".to_string()
}

/// Default provider/model/agent used when `session.create` (or a direct
/// `triggerStream` without a session) does not name them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    pub provider: String,
    pub model: String,
    #[serde(default = "default_agent")]
    pub agent: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            model: "claude-3-5-sonnet".into(),
            agent: default_agent(),
        }
    }
}

/// One rule: a reusable system-prompt block a session can enable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub enabled_by_default: bool,
}

/// The whole persisted configuration.
///
/// `providers` maps a provider id to its key/value settings.  Fields the
/// provider's schema marks `secret` hold credential ids (`cred_…`), never
/// raw values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub providers: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fall_back_to_coder_agent() {
        let d: Defaults = serde_yaml::from_str("provider: mock\nmodel: mock-model\n").unwrap();
        assert_eq!(d.agent, "coder");
    }

    #[test]
    fn empty_config_deserialises() {
        let c: Config = serde_yaml::from_str("{}").unwrap();
        assert!(c.providers.is_empty());
        assert!(c.rules.is_empty());
    }

    #[test]
    fn config_yaml_round_trip() {
        let mut c = Config::default();
        c.providers
            .entry("openai".into())
            .or_default()
            .insert("api_key".into(), "cred_1".into());
        c.rules.push(RuleConfig {
            id: "r1".into(),
            name: "Style".into(),
            content: "Prefer short functions.".into(),
            enabled_by_default: true,
        });
        let yaml = serde_yaml::to_string(&c).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.providers["openai"]["api_key"], "cred_1");
        assert_eq!(back.rules[0].name, "Style");
    }
}
