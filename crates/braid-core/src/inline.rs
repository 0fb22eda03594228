// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Streaming inline-action parser.
//!
//! The assistant may embed XML-like directives in its text, e.g.
//! `<title>Fix the flaky test</title>`.  The UI must never see the
//! directive; the orchestrator extracts it and dispatches the side effect.
//! Directives arrive split across arbitrarily many deltas, so this is a
//! streaming scanner: text that could still turn into a directive opening
//! is held back until it can be decided.

/// A directive extracted from the text stream.
#[derive(Debug, Clone, PartialEq)]
pub enum InlineAction {
    /// `<title>…</title>` — set the session title.
    SetTitle(String),
}

const TAGS: &[(&str, &str)] = &[("<title>", "</title>")];

enum State {
    /// Passing text through; `held` may contain a partial opening tag.
    Scanning,
    /// Inside a directive body, accumulating until the closing tag.
    InTag { tag_index: usize, body: String },
}

pub struct InlineActionParser {
    state: State,
    /// Bytes held back because they might be the start of an opening tag
    /// (Scanning) or the start of a closing tag (InTag).
    held: String,
}

impl Default for InlineActionParser {
    fn default() -> Self {
        Self::new()
    }
}

impl InlineActionParser {
    pub fn new() -> Self {
        Self {
            state: State::Scanning,
            held: String::new(),
        }
    }

    /// Feed one delta.  Returns the visible text to show and any actions
    /// completed by this delta.
    pub fn feed(&mut self, delta: &str) -> (String, Vec<InlineAction>) {
        let mut visible = String::new();
        let mut actions = Vec::new();
        self.held.push_str(delta);

        loop {
            match &mut self.state {
                State::Scanning => {
                    let Some(lt) = self.held.find('<') else {
                        visible.push_str(&self.held);
                        self.held.clear();
                        break;
                    };
                    // Everything before '<' is definitely visible.
                    visible.push_str(&self.held[..lt]);
                    self.held.drain(..lt);

                    // Try to match an opening tag at the buffer start.
                    let mut matched = None;
                    let mut maybe_prefix = false;
                    for (i, (open, _)) in TAGS.iter().enumerate() {
                        if self.held.starts_with(open) {
                            matched = Some(i);
                            break;
                        }
                        if open.starts_with(&self.held as &str) {
                            maybe_prefix = true;
                        }
                    }
                    match matched {
                        Some(i) => {
                            let open_len = TAGS[i].0.len();
                            self.held.drain(..open_len);
                            self.state = State::InTag {
                                tag_index: i,
                                body: String::new(),
                            };
                        }
                        None if maybe_prefix => {
                            // Could still become a tag with more input.
                            break;
                        }
                        None => {
                            // A '<' that is not ours; emit it and rescan.
                            visible.push('<');
                            self.held.drain(..1);
                        }
                    }
                }
                State::InTag { tag_index, body } => {
                    let close = TAGS[*tag_index].1;
                    if let Some(pos) = self.held.find(close) {
                        body.push_str(&self.held[..pos]);
                        let action = match *tag_index {
                            0 => InlineAction::SetTitle(body.trim().to_string()),
                            _ => unreachable!(),
                        };
                        actions.push(action);
                        self.held.drain(..pos + close.len());
                        self.state = State::Scanning;
                    } else {
                        // Keep a tail that might be a partial closing tag;
                        // the rest is directive body.
                        let keep = partial_suffix_len(&self.held, close);
                        let cut = self.held.len() - keep;
                        body.push_str(&self.held[..cut]);
                        self.held.drain(..cut);
                        break;
                    }
                }
            }
        }
        (visible, actions)
    }

    /// End of stream: flush whatever is still held.  An unterminated
    /// directive is surfaced as visible text (the model never closed it).
    pub fn finish(&mut self) -> String {
        let mut out = String::new();
        if let State::InTag { tag_index, body } = &self.state {
            out.push_str(TAGS[*tag_index].0);
            out.push_str(body);
        }
        out.push_str(&self.held);
        self.held.clear();
        self.state = State::Scanning;
        out
    }
}

/// Length of the longest suffix of `s` that is a proper prefix of `pat`.
fn partial_suffix_len(s: &str, pat: &str) -> usize {
    let max = pat.len().saturating_sub(1).min(s.len());
    for len in (1..=max).rev() {
        if s.is_char_boundary(s.len() - len) && pat.starts_with(&s[s.len() - len..]) {
            return len;
        }
    }
    0
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn run(deltas: &[&str]) -> (String, Vec<InlineAction>) {
        let mut p = InlineActionParser::new();
        let mut text = String::new();
        let mut actions = Vec::new();
        for d in deltas {
            let (v, a) = p.feed(d);
            text.push_str(&v);
            actions.extend(a);
        }
        text.push_str(&p.finish());
        (text, actions)
    }

    #[test]
    fn plain_text_passes_through() {
        let (text, actions) = run(&["hello ", "world"]);
        assert_eq!(text, "hello world");
        assert!(actions.is_empty());
    }

    #[test]
    fn whole_directive_in_one_delta() {
        let (text, actions) = run(&["before <title>My Session</title> after"]);
        assert_eq!(text, "before  after");
        assert_eq!(actions, vec![InlineAction::SetTitle("My Session".into())]);
    }

    #[test]
    fn directive_split_across_many_deltas() {
        let (text, actions) = run(&["a<ti", "tle>Fix ", "the bug</ti", "tle>b"]);
        assert_eq!(text, "ab");
        assert_eq!(actions, vec![InlineAction::SetTitle("Fix the bug".into())]);
    }

    #[test]
    fn split_at_every_character_still_parses() {
        let input = "x<title>T</title>y";
        let deltas: Vec<String> = input.chars().map(String::from).collect();
        let refs: Vec<&str> = deltas.iter().map(String::as_str).collect();
        let (text, actions) = run(&refs);
        assert_eq!(text, "xy");
        assert_eq!(actions, vec![InlineAction::SetTitle("T".into())]);
    }

    #[test]
    fn unknown_angle_bracket_text_is_visible() {
        let (text, actions) = run(&["a < b and <tip> stays"]);
        assert_eq!(text, "a < b and <tip> stays");
        assert!(actions.is_empty());
    }

    #[test]
    fn unterminated_directive_flushes_as_text() {
        let (text, actions) = run(&["x<title>never closed"]);
        assert_eq!(text, "x<title>never closed");
        assert!(actions.is_empty());
    }

    #[test]
    fn title_is_trimmed() {
        let (_, actions) = run(&["<title>  padded  </title>"]);
        assert_eq!(actions, vec![InlineAction::SetTitle("padded".into())]);
    }

    #[test]
    fn two_directives_in_one_stream() {
        let (text, actions) = run(&["<title>one</title>mid<title>two</title>"]);
        assert_eq!(text, "mid");
        assert_eq!(actions.len(), 2);
    }
}
