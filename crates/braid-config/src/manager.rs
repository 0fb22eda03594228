// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Context;
use tracing::debug;

use braid_model::{ProviderConfig, ProviderRegistry};
use braid_types::new_id;

use crate::schema::{Config, RuleConfig};

struct State {
    config: Config,
    /// credential id → secret value.  Never serialized into `config.yaml`
    /// and never returned over RPC.
    credentials: HashMap<String, String>,
}

/// Owner of the on-disk configuration.
pub struct ConfigManager {
    config_path: PathBuf,
    credentials_path: PathBuf,
    registry: std::sync::Arc<ProviderRegistry>,
    state: RwLock<State>,
}

impl ConfigManager {
    /// Load (or initialize) configuration in `dir`.
    pub fn open(dir: impl AsRef<Path>, registry: std::sync::Arc<ProviderRegistry>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating config dir {}", dir.display()))?;
        let config_path = dir.join("config.yaml");
        let credentials_path = dir.join("credentials.yaml");

        let config: Config = if config_path.is_file() {
            debug!(path = %config_path.display(), "loading config");
            let text = std::fs::read_to_string(&config_path)
                .with_context(|| format!("reading {}", config_path.display()))?;
            serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", config_path.display()))?
        } else {
            Config::default()
        };
        let credentials: HashMap<String, String> = if credentials_path.is_file() {
            let text = std::fs::read_to_string(&credentials_path)
                .with_context(|| format!("reading {}", credentials_path.display()))?;
            serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", credentials_path.display()))?
        } else {
            HashMap::new()
        };

        Ok(Self {
            config_path,
            credentials_path,
            registry,
            state: RwLock::new(State {
                config,
                credentials,
            }),
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, state: &State) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(&state.config).context("serializing config")?;
        std::fs::write(&self.config_path, yaml)
            .with_context(|| format!("writing {}", self.config_path.display()))?;
        let creds = serde_yaml::to_string(&state.credentials).context("serializing credentials")?;
        std::fs::write(&self.credentials_path, creds)
            .with_context(|| format!("writing {}", self.credentials_path.display()))?;
        Ok(())
    }

    fn secret_keys(&self, provider_id: &str) -> Vec<String> {
        self.registry
            .get(provider_id)
            .map(|p| {
                p.config_schema()
                    .into_iter()
                    .filter(|f| f.secret)
                    .map(|f| f.key)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The config as transmitted to clients: every secret field removed.
    pub fn sanitized(&self) -> Config {
        let mut config = self.read().config.clone();
        for (provider_id, settings) in config.providers.iter_mut() {
            for key in self.secret_keys(provider_id) {
                settings.remove(&key);
            }
        }
        config
    }

    /// Save a client-submitted config.
    ///
    /// Secret fields in `incoming` are ignored outright; the prior on-disk
    /// values are merged back in.  Returns the sanitized result.
    pub fn save(&self, mut incoming: Config) -> anyhow::Result<Config> {
        let mut state = self.write();
        for (provider_id, settings) in incoming.providers.iter_mut() {
            let secrets = self.secret_keys(provider_id);
            for key in &secrets {
                settings.remove(key);
            }
            if let Some(prior) = state.config.providers.get(provider_id) {
                for key in &secrets {
                    if let Some(v) = prior.get(key) {
                        settings.insert(key.clone(), v.clone());
                    }
                }
            }
        }
        state.config = incoming;
        self.persist(&state)?;
        drop(state);
        Ok(self.sanitized())
    }

    /// The only write path for secrets: store the value as a credential
    /// record and point the provider's field at the credential id.
    pub fn set_provider_secret(
        &self,
        provider_id: &str,
        key: &str,
        value: &str,
    ) -> anyhow::Result<String> {
        if !self.secret_keys(provider_id).iter().any(|k| k == key) {
            anyhow::bail!("field {key:?} of provider {provider_id:?} is not a secret field");
        }
        let credential_id = format!("cred_{}", new_id());
        let mut state = self.write();
        state
            .credentials
            .insert(credential_id.clone(), value.to_string());
        state
            .config
            .providers
            .entry(provider_id.to_string())
            .or_default()
            .insert(key.to_string(), credential_id.clone());
        self.persist(&state)?;
        Ok(credential_id)
    }

    /// Update one provider's non-secret settings.  Secret fields submitted
    /// here are ignored, same as `save`.
    pub fn update_provider_config(
        &self,
        provider_id: &str,
        fields: HashMap<String, String>,
    ) -> anyhow::Result<()> {
        let secrets = self.secret_keys(provider_id);
        let mut state = self.write();
        let settings = state
            .config
            .providers
            .entry(provider_id.to_string())
            .or_default();
        for (k, v) in fields {
            if !secrets.contains(&k) {
                settings.insert(k, v);
            }
        }
        self.persist(&state)
    }

    pub fn remove_provider(&self, provider_id: &str) -> anyhow::Result<bool> {
        let mut state = self.write();
        let removed = state.config.providers.remove(provider_id);
        if let Some(settings) = &removed {
            // Drop the credentials the removed config referenced.
            for v in settings.values() {
                state.credentials.remove(v);
            }
        }
        self.persist(&state)?;
        Ok(removed.is_some())
    }

    pub fn update_rules(&self, rules: Vec<RuleConfig>) -> anyhow::Result<()> {
        let mut state = self.write();
        state.config.rules = rules;
        self.persist(&state)
    }

    pub fn rules(&self) -> Vec<RuleConfig> {
        self.read().config.rules.clone()
    }

    pub fn defaults(&self) -> crate::Defaults {
        self.read().config.defaults.clone()
    }

    /// The provider config with credential ids resolved to secret values —
    /// what `create_client` and `fetch_models` actually consume.  Never
    /// leaves the server.
    pub fn resolved_provider_config(&self, provider_id: &str) -> ProviderConfig {
        let state = self.read();
        let mut out = ProviderConfig::new();
        if let Some(settings) = state.config.providers.get(provider_id) {
            let secrets = self.secret_keys(provider_id);
            for (k, v) in settings {
                let value = if secrets.contains(k) {
                    state.credentials.get(v).cloned().unwrap_or_default()
                } else {
                    v.clone()
                };
                out.insert(k.clone(), value);
            }
        }
        out
    }

    pub fn registry(&self) -> &std::sync::Arc<ProviderRegistry> {
        &self.registry
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> ConfigManager {
        ConfigManager::open(dir, ProviderRegistry::standard()).unwrap()
    }

    #[test]
    fn fresh_dir_starts_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        assert_eq!(m.defaults().agent, "coder");
    }

    #[test]
    fn set_provider_secret_returns_credential_id_and_hides_value() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let cred = m
            .set_provider_secret("openai", "api_key", "sk-verysecret")
            .unwrap();
        assert!(cred.starts_with("cred_"));

        // The sanitized config exposes neither the credential id nor the
        // raw secret.
        let sanitized = m.sanitized();
        assert!(sanitized
            .providers
            .get("openai")
            .map_or(true, |s| !s.contains_key("api_key")));

        // The config file on disk holds the credential id, not the secret.
        let on_disk = std::fs::read_to_string(dir.path().join("config.yaml")).unwrap();
        assert!(on_disk.contains(&cred));
        assert!(!on_disk.contains("sk-verysecret"));

        // The resolved runtime config holds the real value.
        let resolved = m.resolved_provider_config("openai");
        assert_eq!(resolved.get("api_key").unwrap(), "sk-verysecret");
    }

    #[test]
    fn save_ignores_client_submitted_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let cred = m
            .set_provider_secret("openai", "api_key", "sk-original")
            .unwrap();

        // A malicious/buggy client submits its own api_key on save.
        let mut incoming = m.sanitized();
        incoming
            .providers
            .entry("openai".into())
            .or_default()
            .insert("api_key".into(), "attacker-value".into());
        incoming
            .providers
            .entry("openai".into())
            .or_default()
            .insert("base_url".into(), "https://proxy.example".into());
        let saved = m.save(incoming).unwrap();

        // Non-secret field landed, secret field was merged from disk.
        assert!(saved.providers["openai"]
            .get("api_key")
            .is_none(), "sanitized result never shows secrets");
        let resolved = m.resolved_provider_config("openai");
        assert_eq!(resolved["api_key"], "sk-original");
        assert_eq!(resolved["base_url"], "https://proxy.example");

        // And the stored reference is still the original credential.
        let on_disk = std::fs::read_to_string(dir.path().join("config.yaml")).unwrap();
        assert!(on_disk.contains(&cred));
        assert!(!on_disk.contains("attacker-value"));
    }

    #[test]
    fn set_secret_on_non_secret_field_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        assert!(m
            .set_provider_secret("openai", "base_url", "https://x")
            .is_err());
    }

    #[test]
    fn remove_provider_drops_its_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        m.set_provider_secret("openai", "api_key", "sk-1").unwrap();
        assert!(m.remove_provider("openai").unwrap());
        assert!(m.resolved_provider_config("openai").is_empty());
        let creds = std::fs::read_to_string(dir.path().join("credentials.yaml")).unwrap();
        assert!(!creds.contains("sk-1"));
    }

    #[test]
    fn config_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let m = manager(dir.path());
            m.set_provider_secret("openai", "api_key", "sk-persist")
                .unwrap();
            m.update_rules(vec![RuleConfig {
                id: "r1".into(),
                name: "n".into(),
                content: "c".into(),
                enabled_by_default: false,
            }])
            .unwrap();
        }
        let m2 = manager(dir.path());
        assert_eq!(m2.resolved_provider_config("openai")["api_key"], "sk-persist");
        assert_eq!(m2.rules().len(), 1);
    }
}
