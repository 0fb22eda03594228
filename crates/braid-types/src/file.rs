// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::new_id;

/// An entry in the file object store.
///
/// `sha256` enables content-addressed deduplication: uploading identical
/// bytes twice returns the existing record.  `step_id` is the back-reference
/// to the step that consumed the file; `None` marks an orphan eligible for
/// cleanup after the grace window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub id: String,
    pub relative_path: String,
    pub media_type: String,
    pub size: u64,
    /// Key into the backing blob store (filesystem path or object key).
    pub storage_key: String,
    /// Extracted text for search, when the media type allows it.
    pub text_content: Option<String>,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
    pub step_id: Option<String>,
}

impl FileContent {
    pub fn new(
        relative_path: impl Into<String>,
        media_type: impl Into<String>,
        size: u64,
        storage_key: impl Into<String>,
        sha256: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            relative_path: relative_path.into(),
            media_type: media_type.into(),
            size,
            storage_key: storage_key.into(),
            text_content: None,
            sha256: sha256.into(),
            created_at: Utc::now(),
            step_id: None,
        }
    }

    pub fn is_orphan(&self) -> bool {
        self.step_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_upload_is_an_orphan() {
        let f = FileContent::new("src/main.rs", "text/x-rust", 120, "blobs/ab", "abcd");
        assert!(f.is_orphan());
    }

    #[test]
    fn referenced_file_is_not_an_orphan() {
        let mut f = FileContent::new("a.png", "image/png", 10, "blobs/cd", "ef01");
        f.step_id = Some("step-1".into());
        assert!(!f.is_orphan());
    }
}
