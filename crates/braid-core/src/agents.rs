// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent personas.
//!
//! An agent is a named system-prompt base the session selects with
//! `agent_id`.  The built-in set is fixed; the default is `coder`.

use std::collections::HashMap;

pub const DEFAULT_AGENT: &str = "coder";

const CODER_PROMPT: &str = "\
You are a precise software engineering assistant working inside a project \
workspace. Make the smallest correct change. Read code before modifying it. \
When you run shell commands, prefer non-interactive invocations. Report what \
you did plainly; when tests fail, show the failing output instead of hiding \
it. If a task is ambiguous, ask before guessing.";

const PLANNER_PROMPT: &str = "\
You are a planning assistant. Break the user's goal into a concrete ordered \
task list with clear completion criteria. Do not write code; produce plans, \
estimates, and risks. Revise the plan as new information arrives.";

const REVIEWER_PROMPT: &str = "\
You are a code reviewer. Read the presented changes carefully and report \
correctness issues first, style issues second. For every finding, name the \
file and line and describe a concrete failure scenario. Do not propose \
rewrites unless asked.";

/// Immutable library of agent personas.
pub struct AgentLibrary {
    prompts: HashMap<&'static str, &'static str>,
}

impl Default for AgentLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentLibrary {
    pub fn new() -> Self {
        let mut prompts = HashMap::new();
        prompts.insert("coder", CODER_PROMPT);
        prompts.insert("planner", PLANNER_PROMPT);
        prompts.insert("reviewer", REVIEWER_PROMPT);
        Self { prompts }
    }

    /// The system-prompt base for an agent.  Unknown ids fall back to the
    /// default agent so a stale session row still streams.
    pub fn prompt(&self, agent_id: &str) -> &'static str {
        self.prompts
            .get(agent_id)
            .or_else(|| self.prompts.get(DEFAULT_AGENT))
            .copied()
            .unwrap_or("")
    }

    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<_> = self.prompts.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.prompts.contains_key(agent_id)
    }
}
