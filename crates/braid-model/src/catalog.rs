// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Embedded model catalog.
//!
//! Registry-embedded metadata used as the fallback when a provider's live
//! `fetch_models` endpoint is unreachable.  Entries are intentionally
//! conservative — the live catalog always wins when available.

use crate::{Capability, CapabilitySet, ModelInfo};

struct CatalogEntry {
    provider: &'static str,
    model: &'static str,
    context_window: u32,
    max_output_tokens: u32,
    caps: &'static [Capability],
}

const T: Capability = Capability::Tools;
const I: Capability = Capability::ImageInput;
const R: Capability = Capability::Reasoning;
const S: Capability = Capability::StructuredOutput;

static CATALOG: &[CatalogEntry] = &[
    // ── Anthropic ─────────────────────────────────────────────────────────────
    CatalogEntry {
        provider: "anthropic",
        model: "claude-3-5-sonnet",
        context_window: 200_000,
        max_output_tokens: 8_192,
        caps: &[T, I],
    },
    CatalogEntry {
        provider: "anthropic",
        model: "claude-3-5-haiku",
        context_window: 200_000,
        max_output_tokens: 8_192,
        caps: &[T],
    },
    CatalogEntry {
        provider: "anthropic",
        model: "claude-opus-4",
        context_window: 200_000,
        max_output_tokens: 32_000,
        caps: &[T, I, R],
    },
    // ── OpenAI ────────────────────────────────────────────────────────────────
    CatalogEntry {
        provider: "openai",
        model: "gpt-4o",
        context_window: 128_000,
        max_output_tokens: 16_384,
        caps: &[T, I, S],
    },
    CatalogEntry {
        provider: "openai",
        model: "gpt-4o-mini",
        context_window: 128_000,
        max_output_tokens: 16_384,
        caps: &[T, I, S],
    },
    CatalogEntry {
        provider: "openai",
        model: "o3-mini",
        context_window: 200_000,
        max_output_tokens: 100_000,
        caps: &[T, R, S],
    },
    // ── OpenRouter (pass-through ids) ─────────────────────────────────────────
    CatalogEntry {
        provider: "openrouter",
        model: "anthropic/claude-3.5-sonnet",
        context_window: 200_000,
        max_output_tokens: 8_192,
        caps: &[T, I],
    },
    // ── Local ─────────────────────────────────────────────────────────────────
    CatalogEntry {
        provider: "ollama",
        model: "llama3.2",
        context_window: 32_768,
        max_output_tokens: 8_192,
        caps: &[T],
    },
    // ── Testing ───────────────────────────────────────────────────────────────
    CatalogEntry {
        provider: "mock",
        model: "mock-model",
        context_window: 32_768,
        max_output_tokens: 4_096,
        caps: &[T, I, R],
    },
];

fn to_info(e: &CatalogEntry) -> ModelInfo {
    ModelInfo {
        id: e.model.to_string(),
        name: e.model.to_string(),
        context_window: e.context_window,
        max_output_tokens: e.max_output_tokens,
        capabilities: CapabilitySet::new(e.caps.iter().copied()),
    }
}

/// All embedded entries for one provider.
pub fn embedded_catalog(provider: &str) -> Vec<ModelInfo> {
    CATALOG
        .iter()
        .filter(|e| e.provider == provider)
        .map(to_info)
        .collect()
}

/// Look up a single `(provider, model)` entry.
pub fn lookup(provider: &str, model: &str) -> Option<ModelInfo> {
    CATALOG
        .iter()
        .find(|e| e.provider == provider && e.model == model)
        .map(to_info)
}
