// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::{CapabilitySet, StreamChunk, StreamRequest};

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

/// Runtime configuration of one provider: plain string key/value pairs.
/// Secret fields (per the schema) hold credential ids, never raw secrets.
pub type ProviderConfig = HashMap<String, String>;

/// One field of a provider's configuration schema.
///
/// Fields marked `secret` obey the zero-knowledge contract: clients never
/// transmit their values on save; the server merges the on-disk value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfigField {
    pub key: String,
    pub label: String,
    pub secret: bool,
    pub required: bool,
}

impl ProviderConfigField {
    pub fn plain(key: &str, label: &str, required: bool) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            secret: false,
            required,
        }
    }

    pub fn secret(key: &str, label: &str, required: bool) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            secret: true,
            required,
        }
    }
}

/// Metadata for one model offered by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub capabilities: CapabilitySet,
}

/// Whether a session's `(provider, model)` pair can currently be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Available,
    Unavailable,
    Unknown,
}

/// A live streaming handle for one `(provider config, model)` pair.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Issue one single-step streaming request.
    async fn stream(&self, req: StreamRequest) -> anyhow::Result<ChunkStream>;
}

/// The interface every provider implements.  Variants are closed — the
/// registry declares the full set; nothing constructs providers ad hoc.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider id used in session rows and config keys.
    fn id(&self) -> &str;

    /// Human-readable display name.
    fn name(&self) -> &str;

    /// One-line description for provider listings.
    fn description(&self) -> &str;

    /// Declared configuration fields, including `secret` markers.
    fn config_schema(&self) -> Vec<ProviderConfigField>;

    /// True when every required field of [`Self::config_schema`] is present.
    fn is_configured(&self, config: &ProviderConfig) -> bool {
        self.config_schema()
            .iter()
            .filter(|f| f.required)
            .all(|f| config.get(&f.key).is_some_and(|v| !v.is_empty()))
    }

    /// Query the live model list.  Implementations retry transient failures
    /// a bounded number of times and fall back to the embedded catalog.
    async fn fetch_models(&self, config: &ProviderConfig) -> anyhow::Result<Vec<ModelInfo>>;

    /// Metadata for one model, from the last fetched (or embedded) catalog.
    fn get_model_details(&self, model: &str) -> Option<ModelInfo>;

    /// Capability set for a model.  Empty when the model is unknown — the
    /// orchestrator then refreshes the catalog and retries once.
    fn get_model_capabilities(&self, model: &str) -> CapabilitySet;

    /// Construct a streaming client for `model` under `config`.
    fn create_client(
        &self,
        config: &ProviderConfig,
        model: &str,
    ) -> anyhow::Result<Arc<dyn ModelClient>>;
}
