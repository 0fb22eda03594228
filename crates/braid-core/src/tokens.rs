// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Token accounting for live usage display.
//!
//! Uses the chars/4 approximation everywhere; the provider's authoritative
//! usage replaces the estimate when the step finishes.  The base-context
//! estimate (system prompt + tool descriptions) is cached on the session,
//! keyed by the `(model, agent, sorted rules)` triple, so it is only
//! recomputed when the prompt-shaping inputs change.

use braid_model::ToolSchema;

/// chars/4 heuristic, minimum one token for non-empty text.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    ((text.len() / 4) as u64).max(1)
}

/// Cache key for the base-context estimate.
pub fn base_context_key(model: &str, agent: &str, rule_ids: &[String]) -> String {
    let mut rules = rule_ids.to_vec();
    rules.sort();
    format!("{model}\u{1f}{agent}\u{1f}{}", rules.join(","))
}

/// Estimate of everything sent with every request but not part of the
/// conversation history: system blocks and tool schemas.
pub fn estimate_base_context(system_blocks: &[String], tools: &[ToolSchema]) -> u64 {
    let system: u64 = system_blocks.iter().map(|b| estimate_tokens(b)).sum();
    let tools: u64 = tools
        .iter()
        .map(|t| {
            estimate_tokens(&t.name)
                + estimate_tokens(&t.description)
                + estimate_tokens(&t.parameters.to_string())
        })
        .sum();
    system + tools
}

/// Folds streamed deltas into a live completion-token estimate.
#[derive(Debug, Default)]
pub struct TokenTracker {
    base_context: u64,
    history: u64,
    streamed_chars: u64,
    /// Authoritative totals from finished steps.
    confirmed: u64,
}

impl TokenTracker {
    pub fn new(base_context: u64, history_tokens: u64) -> Self {
        Self {
            base_context,
            history: history_tokens,
            streamed_chars: 0,
            confirmed: 0,
        }
    }

    /// Fold in one text/reasoning delta.
    pub fn feed(&mut self, delta: &str) {
        self.streamed_chars += delta.len() as u64;
    }

    /// Replace the running estimate for the current step with the
    /// provider's reported usage.
    pub fn confirm_step(&mut self, total_tokens: u64) {
        self.confirmed += total_tokens;
        self.streamed_chars = 0;
    }

    /// The live total shown to subscribers.
    pub fn total(&self) -> u64 {
        self.base_context + self.history + self.confirmed + self.streamed_chars / 4
    }

    pub fn confirmed_total(&self) -> u64 {
        self.confirmed
    }

    pub fn base_context(&self) -> u64 {
        self.base_context
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn estimate_divides_by_four_with_floor_of_one() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("ab"), 1);
        assert_eq!(estimate_tokens("12345678"), 2);
    }

    #[test]
    fn base_context_key_is_order_insensitive_in_rules() {
        let a = base_context_key("m", "coder", &["r2".into(), "r1".into()]);
        let b = base_context_key("m", "coder", &["r1".into(), "r2".into()]);
        assert_eq!(a, b);
        let c = base_context_key("m", "planner", &["r1".into(), "r2".into()]);
        assert_ne!(a, c);
    }

    #[test]
    fn base_context_counts_system_and_tools() {
        let tools = vec![ToolSchema {
            name: "bash".into(),
            description: "run a shell command".into(),
            parameters: json!({ "type": "object" }),
        }];
        let est = estimate_base_context(&["prompt text here".to_string()], &tools);
        assert!(est > 0);
    }

    #[test]
    fn tracker_grows_with_deltas_and_confirms_per_step() {
        let mut t = TokenTracker::new(100, 50);
        assert_eq!(t.total(), 150);
        t.feed("12345678");
        assert_eq!(t.total(), 152);
        t.confirm_step(10);
        assert_eq!(t.total(), 160);
        assert_eq!(t.confirmed_total(), 10);
        // Streamed estimate reset on confirmation.
        t.feed("abcd");
        assert_eq!(t.total(), 161);
    }

    #[test]
    fn live_total_is_monotonic_across_a_step() {
        let mut t = TokenTracker::new(0, 0);
        let mut last = t.total();
        for _ in 0..20 {
            t.feed("delta text");
            assert!(t.total() >= last);
            last = t.total();
        }
    }
}
