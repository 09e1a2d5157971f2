//! Splitting free-form text into individual generation prompts.
//!
//! Two shapes are recognised, tried in order:
//!
//! 1. numbered items with a quoted payload, e.g. `1. "a red fox in snow ..."`
//!    (ASCII `"` as well as `“ ”` and `＂`);
//! 2. plain numbered lines, e.g. `2、a red fox in snow ...`.
//!
//! Anything at or under the minimum length is dropped silently.  An empty
//! result means "not a batch"; the caller then sends the text as one prompt.

use std::sync::LazyLock;

use regex::Regex;

/// Extracted prompts must be strictly longer than this many characters.
pub const DEFAULT_MIN_PROMPT_CHARS: usize = 20;

static QUOTED_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\d+\.\s*["“＂]([^"“”＂\n]+)["”＂]"#).expect("quoted item pattern is valid")
});

static NUMBERED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)[.、。]\s*(.+)$").expect("numbered line pattern is valid")
});

#[derive(Debug, Clone)]
pub struct PromptExtractor {
    min_chars: usize,
}

impl Default for PromptExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_PROMPT_CHARS)
    }
}

impl PromptExtractor {
    pub fn new(min_chars: usize) -> Self {
        Self { min_chars }
    }

    /// Extract candidate prompts in input order.  Never fails; duplicates
    /// are kept.
    pub fn extract(&self, text: &str) -> Vec<String> {
        let quoted: Vec<String> = QUOTED_ITEM
            .captures_iter(text)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|p| self.long_enough(p))
            .collect();
        if !quoted.is_empty() {
            return quoted;
        }

        text.lines()
            .filter_map(|line| NUMBERED_LINE.captures(line.trim()))
            .filter_map(|c| c.get(2))
            .map(|m| m.as_str().trim().to_string())
            .filter(|p| self.long_enough(p))
            .collect()
    }

    fn long_enough(&self, prompt: &str) -> bool {
        prompt.chars().count() > self.min_chars
    }
}
