// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport-agnostic error kinds.  The framework serializes kind + message;
/// clients rethrow a structured error the caller can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Input failed its schema.  Never fatal.
    Validation,
    /// Entity id not in the store.
    NotFound,
    /// Provider exists but has no usable configuration.
    ProviderNotConfigured,
    /// The provider stream failed mid-flight.
    Provider,
    /// The backing store failed.
    Storage,
    /// A deadline elapsed.
    Timeout,
    /// Anything else.
    Internal,
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct RpcError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn storage(message: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Storage, message.to_string())
    }

    /// Serialized form carried over every transport.
    pub fn to_wire(&self) -> WireError {
        WireError {
            kind: self.kind,
            message: self.message.clone(),
        }
    }
}

/// The wire shape of an error: `{kind, message}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<WireError> for RpcError {
    fn from(w: WireError) -> Self {
        Self {
            kind: w.kind,
            message: w.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip_preserves_kind() {
        let e = RpcError::validation("limit out of range");
        let json = serde_json::to_string(&e.to_wire()).unwrap();
        let back: WireError = serde_json::from_str(&json).unwrap();
        let rethrown: RpcError = back.into();
        assert_eq!(rethrown.kind, ErrorKind::Validation);
        assert_eq!(rethrown.message, "limit out of range");
    }

    #[test]
    fn kind_serialises_kebab_case() {
        let s = serde_json::to_string(&ErrorKind::ProviderNotConfigured).unwrap();
        assert_eq!(s, "\"provider-not-configured\"");
    }
}
