// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Configuration and credential storage.
//!
//! Two files on disk: `config.yaml` (defaults, provider settings, rules)
//! and `credentials.yaml` (secret values, keyed by credential id).  The
//! config file never contains raw secrets — a provider's secret fields
//! hold credential ids.  The zero-knowledge contract is enforced here:
//! whatever a client submits for a secret field on save is ignored and the
//! on-disk value merged back in; the only write path for secrets is
//! [`ConfigManager::set_provider_secret`].

mod manager;
mod schema;

pub use manager::ConfigManager;
pub use schema::{Config, Defaults, RuleConfig};
