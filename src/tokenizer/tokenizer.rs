use std::collections::BTreeSet;

use crate::config::TokenizerConfig;

/// Bumped whenever tokenization output changes; persisted postings built by an
/// older version are discarded and rebuilt on load.
pub const TOKENIZER_VERSION: u32 = 1;

/// Keyword tokenizer: lowercase, split on every non-alphanumeric character,
/// drop empty pieces. No stemming and no stop words.
#[derive(Clone, Debug)]
pub struct Tokenizer {
    config: TokenizerConfig,
}

impl Tokenizer {
    /// Create a new tokenizer from configuration
    pub fn new(config: &TokenizerConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Identifies the tokenizer output format for index markers
    pub fn fingerprint(&self) -> String {
        format!("v{}-lowercase={}", TOKENIZER_VERSION, self.config.lowercase)
    }

    /// Tokenize text into a vector of terms, in order, duplicates kept
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|piece| !piece.is_empty())
            .map(|piece| {
                if self.config.lowercase {
                    piece.to_lowercase()
                } else {
                    piece.to_string()
                }
            })
            .collect()
    }

    /// Get unique terms from text
    pub fn unique_terms(&self, text: &str) -> BTreeSet<String> {
        self.tokenize(text).into_iter().collect()
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(&TokenizerConfig::default())
    }
}
