// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider registry: the closed set of supported providers.
//!
//! This module is the single source of truth for which provider ids exist.
//! New providers are added by declaration here, not by constructing
//! provider objects elsewhere.  Every declared provider speaks the
//! OpenAI-compatible wire format through [`OpenAiCompatClient`]; the mock
//! provider lives in [`crate::mock`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::warn;

use crate::{
    catalog, openai_compat, CapabilitySet, ModelClient, ModelInfo, OpenAiCompatClient, Provider,
    ProviderConfig, ProviderConfigField,
};

/// Declaration of one OpenAI-compatible provider.
struct ProviderDecl {
    id: &'static str,
    name: &'static str,
    description: &'static str,
    default_base_url: Option<&'static str>,
    requires_api_key: bool,
}

static DECLS: &[ProviderDecl] = &[
    ProviderDecl {
        id: "anthropic",
        name: "Anthropic",
        description: "Anthropic Claude models (OpenAI-compatible endpoint)",
        default_base_url: Some("https://api.anthropic.com/v1"),
        requires_api_key: true,
    },
    ProviderDecl {
        id: "openai",
        name: "OpenAI",
        description: "OpenAI GPT and o-series models",
        default_base_url: Some("https://api.openai.com/v1"),
        requires_api_key: true,
    },
    ProviderDecl {
        id: "openrouter",
        name: "OpenRouter",
        description: "OpenRouter gateway (many models from many providers)",
        default_base_url: Some("https://openrouter.ai/api/v1"),
        requires_api_key: true,
    },
    ProviderDecl {
        id: "ollama",
        name: "Ollama",
        description: "Ollama local model runner (http://localhost:11434)",
        default_base_url: Some("http://localhost:11434/v1"),
        requires_api_key: false,
    },
];

/// Bounded retry count for the models-metadata fetch.  Transient network
/// failures are retried; anything persistent falls back to the embedded
/// catalog.
const FETCH_ATTEMPTS: u32 = 2;

struct DeclaredProvider {
    decl: &'static ProviderDecl,
    /// Live catalog cache filled by `fetch_models`.
    models: RwLock<HashMap<String, ModelInfo>>,
}

impl DeclaredProvider {
    fn new(decl: &'static ProviderDecl) -> Self {
        let seeded: HashMap<String, ModelInfo> = catalog::embedded_catalog(decl.id)
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();
        Self {
            decl,
            models: RwLock::new(seeded),
        }
    }

    fn base_url(&self, config: &ProviderConfig) -> Option<String> {
        config
            .get("base_url")
            .filter(|v| !v.is_empty())
            .cloned()
            .or_else(|| self.decl.default_base_url.map(str::to_string))
    }

    fn cache(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ModelInfo>> {
        self.models.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Provider for DeclaredProvider {
    fn id(&self) -> &str {
        self.decl.id
    }

    fn name(&self) -> &str {
        self.decl.name
    }

    fn description(&self) -> &str {
        self.decl.description
    }

    fn config_schema(&self) -> Vec<ProviderConfigField> {
        vec![
            ProviderConfigField::secret("api_key", "API key", self.decl.requires_api_key),
            ProviderConfigField::plain(
                "base_url",
                "Base URL",
                self.decl.default_base_url.is_none(),
            ),
        ]
    }

    async fn fetch_models(&self, config: &ProviderConfig) -> anyhow::Result<Vec<ModelInfo>> {
        let Some(base_url) = self.base_url(config) else {
            anyhow::bail!("provider {} has no base_url configured", self.decl.id);
        };
        let api_key = config.get("api_key").map(String::as_str);

        let mut last_err = None;
        for attempt in 1..=FETCH_ATTEMPTS {
            match openai_compat::fetch_model_ids(&base_url, api_key).await {
                Ok(ids) => {
                    let infos: Vec<ModelInfo> = ids
                        .into_iter()
                        .map(|id| {
                            catalog::lookup(self.decl.id, &id).unwrap_or(ModelInfo {
                                name: id.clone(),
                                id,
                                context_window: 0,
                                max_output_tokens: 0,
                                // Unknown model: conservative default.
                                capabilities: CapabilitySet::text_only(),
                            })
                        })
                        .collect();
                    let mut cache = self.models.write().unwrap_or_else(|e| e.into_inner());
                    for m in &infos {
                        cache.insert(m.id.clone(), m.clone());
                    }
                    return Ok(infos);
                }
                Err(e) => {
                    warn!(
                        provider = self.decl.id,
                        attempt, "model fetch failed: {e}"
                    );
                    last_err = Some(e);
                }
            }
        }
        // Persistent failure: registry-embedded metadata keeps the runtime
        // usable offline.
        let fallback = catalog::embedded_catalog(self.decl.id);
        if fallback.is_empty() {
            Err(last_err.unwrap_or_else(|| anyhow::anyhow!("model fetch failed")))
        } else {
            Ok(fallback)
        }
    }

    fn get_model_details(&self, model: &str) -> Option<ModelInfo> {
        self.cache().get(model).cloned()
    }

    fn get_model_capabilities(&self, model: &str) -> CapabilitySet {
        self.cache()
            .get(model)
            .map(|m| m.capabilities.clone())
            .unwrap_or_default()
    }

    fn create_client(
        &self,
        config: &ProviderConfig,
        model: &str,
    ) -> anyhow::Result<Arc<dyn ModelClient>> {
        let Some(base_url) = self.base_url(config) else {
            anyhow::bail!("provider {} has no base_url configured", self.decl.id);
        };
        let api_key = config.get("api_key").cloned();
        if self.decl.requires_api_key && api_key.as_deref().unwrap_or("").is_empty() {
            anyhow::bail!("provider {} requires an api_key", self.decl.id);
        }
        Ok(Arc::new(OpenAiCompatClient::new(&base_url, api_key, model)))
    }
}

/// Immutable provider lookup table, built once at startup.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// The standard registry: every declared provider plus the mock.
    pub fn standard() -> Arc<Self> {
        let mut providers: Vec<Arc<dyn Provider>> = DECLS
            .iter()
            .map(|d| Arc::new(DeclaredProvider::new(d)) as Arc<dyn Provider>)
            .collect();
        providers.push(Arc::new(crate::MockProvider::default()));
        Arc::new(Self { providers })
    }

    /// A registry with an explicit provider set.  Used by tests to install
    /// scripted providers; the table is still immutable after construction.
    pub fn with(providers: Vec<Arc<dyn Provider>>) -> Arc<Self> {
        Arc::new(Self { providers })
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.iter().find(|p| p.id() == id).cloned()
    }

    pub fn list(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }
}

/// All known provider ids in declaration order.
pub fn provider_ids() -> Vec<&'static str> {
    let mut ids: Vec<&'static str> = DECLS.iter().map(|d| d.id).collect();
    ids.push("mock");
    ids
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_contains_declared_ids() {
        let reg = ProviderRegistry::standard();
        for id in ["anthropic", "openai", "openrouter", "ollama", "mock"] {
            assert!(reg.get(id).is_some(), "missing provider: {id}");
        }
    }

    #[test]
    fn unknown_provider_is_none() {
        let reg = ProviderRegistry::standard();
        assert!(reg.get("no-such-provider").is_none());
    }

    #[test]
    fn all_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for id in provider_ids() {
            assert!(seen.insert(id), "duplicate provider id: {id}");
        }
    }

    #[test]
    fn api_key_field_is_marked_secret() {
        let reg = ProviderRegistry::standard();
        let p = reg.get("anthropic").unwrap();
        let schema = p.config_schema();
        let key = schema.iter().find(|f| f.key == "api_key").unwrap();
        assert!(key.secret);
        assert!(key.required);
    }

    #[test]
    fn local_provider_needs_no_api_key() {
        let reg = ProviderRegistry::standard();
        let p = reg.get("ollama").unwrap();
        assert!(p.is_configured(&ProviderConfig::new()));
    }

    #[test]
    fn capabilities_come_from_embedded_catalog_before_any_fetch() {
        let reg = ProviderRegistry::standard();
        let p = reg.get("anthropic").unwrap();
        let caps = p.get_model_capabilities("claude-3-5-sonnet");
        assert!(caps.supports_tools());
    }

    #[test]
    fn unknown_model_has_empty_capabilities() {
        let reg = ProviderRegistry::standard();
        let p = reg.get("anthropic").unwrap();
        assert!(p.get_model_capabilities("never-heard-of-it").is_empty());
    }

    #[test]
    fn create_client_without_required_key_fails() {
        let reg = ProviderRegistry::standard();
        let p = reg.get("openai").unwrap();
        assert!(p.create_client(&ProviderConfig::new(), "gpt-4o").is_err());
    }

    #[tokio::test]
    async fn fetch_models_falls_back_to_embedded_catalog() {
        let reg = ProviderRegistry::standard();
        let p = reg.get("anthropic").unwrap();
        // Point at a dead endpoint; after the bounded retries the embedded
        // catalog is returned instead of an error.
        let mut cfg = ProviderConfig::new();
        cfg.insert("base_url".into(), "http://127.0.0.1:1".into());
        cfg.insert("api_key".into(), "k".into());
        let models = p.fetch_models(&cfg).await.unwrap();
        assert!(models.iter().any(|m| m.id == "claude-3-5-sonnet"));
    }
}
