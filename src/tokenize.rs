//! Text normalization shared by indexing and querying.
//!
//! [`Analyzer`] is the only place text is turned into tokens. The index
//! builds a record's term frequencies with [`Analyzer::term_frequencies`]
//! and the query processor builds its token set with
//! [`Analyzer::query_terms`]; both go through [`Analyzer::tokens`], so
//! the two sides cannot drift apart.
//!
//! Text is lowercased and punctuation turned into whitespace before it is
//! split. Tokens shorter than `min_token_len` characters and stop words
//! are dropped.

use std::collections::{BTreeMap, BTreeSet};

/// Fixed English stop-word list. Sorted so lookups can binary search.
const STOP_WORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has",
    "have", "he", "her", "his", "i", "in", "is", "it", "its", "me", "my", "of", "on", "or",
    "our", "she", "that", "the", "their", "them", "they", "this", "to", "was", "we", "were",
    "will", "with", "you", "your",
];

/// Term frequencies of one record: the derived search representation.
///
/// A `BTreeMap` so serialization and iteration order are stable.
pub type TermFrequencies = BTreeMap<String, u32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Analyzer {
    min_token_len: usize,
}

impl Analyzer {
    pub fn new(min_token_len: usize) -> Self {
        Self {
            min_token_len: min_token_len.max(1),
        }
    }

    /// Identifies the normalization policy. Persisted alongside the index
    /// so a database built under a different policy is detected on open.
    pub fn signature(&self) -> String {
        format!("v1;min_len={};stop={}", self.min_token_len, STOP_WORDS.len())
    }

    /// Normalized tokens of `text`, in order of appearance, duplicates kept.
    pub fn tokens(&self, text: &str) -> Vec<String> {
        let folded: String = text
            .chars()
            .flat_map(char::to_lowercase)
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();

        folded
            .split_whitespace()
            .filter(|t| t.chars().count() >= self.min_token_len)
            .filter(|t| !is_stop_word(t))
            .map(str::to_string)
            .collect()
    }

    pub fn term_frequencies(&self, text: &str) -> TermFrequencies {
        let mut tf = TermFrequencies::new();
        for token in self.tokens(text) {
            *tf.entry(token).or_insert(0) += 1;
        }
        tf
    }

    /// Distinct query tokens in a fixed (sorted) order.
    pub fn query_terms(&self, query: &str) -> BTreeSet<String> {
        self.tokens(query).into_iter().collect()
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new(2)
    }
}

fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.binary_search(&token).is_ok()
}
