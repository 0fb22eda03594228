// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A feature tag describing what a model can accept or produce.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Structured tool calling.
    Tools,
    /// Binary image/file input parts.
    ImageInput,
    /// Extended thinking / reasoning output.
    Reasoning,
    /// JSON-schema constrained output.
    StructuredOutput,
}

/// The capability set of one model.
///
/// Drives tool availability and file-vs-text encoding in the orchestrator:
/// a model without `ImageInput` gets binary file parts re-encoded as
/// XML-wrapped text, a model without `Tools` gets no tool catalog at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new(caps: impl IntoIterator<Item = Capability>) -> Self {
        Self(caps.into_iter().collect())
    }

    /// Conservative default for unknown models: text in, text out.
    pub fn text_only() -> Self {
        Self::default()
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    pub fn supports_tools(&self) -> bool {
        self.has(Capability::Tools)
    }

    pub fn supports_images(&self) -> bool {
        self.has(Capability::ImageInput)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
