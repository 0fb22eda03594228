// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use uuid::Uuid;

/// Generate a fresh opaque entity id.
///
/// Ids are UUIDv4 strings.  They are treated as opaque everywhere — no code
/// may parse structure out of an id.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_id(), new_id());
    }

    #[test]
    fn ids_are_not_empty() {
        assert!(!new_id().is_empty());
    }
}
