// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backing store failed.  Callers treat this as fatal for the
    /// current operation; streaming code treats it as fatal for the step.
    #[error("storage error: {0}")]
    Storage(String),

    /// A record could not be (de)serialized to its column form.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn storage(e: impl std::fmt::Display) -> Self {
        Self::Storage(e.to_string())
    }

    pub fn corrupt(e: impl std::fmt::Display) -> Self {
        Self::Corrupt(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
