//! Token accounting boundary.
//!
//! Counting is an injected pure function `text -> u32`. The engine wraps
//! whatever counter it is given in a [`CachedTokenCounter`] keyed by text hash,
//! so identical text is only counted once.

use parking_lot::Mutex;

use crate::cache::LruCache;

/// Pure token counting function
pub trait TokenCounter: Send + Sync {
    /// Tokens in `text`; must be deterministic
    fn count(&self, text: &str) -> u32;
}

/// Rough estimate for English text and code: one token per four characters,
/// never less than the number of whitespace-separated words.
#[derive(Clone, Copy, Debug, Default)]
pub struct ApproxTokenCounter;

impl TokenCounter for ApproxTokenCounter {
    fn count(&self, text: &str) -> u32 {
        let chars = text.chars().count() as u32;
        let by_chars = chars.div_ceil(4);
        let words = text.split_whitespace().count() as u32;
        by_chars.max(words)
    }
}

impl<F> TokenCounter for F
where
    F: Fn(&str) -> u32 + Send + Sync,
{
    fn count(&self, text: &str) -> u32 {
        self(text)
    }
}

/// Memoizing wrapper around another counter
pub struct CachedTokenCounter {
    inner: Box<dyn TokenCounter>,
    cache: Mutex<LruCache<String, u32>>,
}

impl CachedTokenCounter {
    pub fn new(inner: impl TokenCounter + 'static, capacity: usize) -> Self {
        Self {
            inner: Box::new(inner),
            cache: Mutex::new(LruCache::new(capacity.max(1))),
        }
    }

    /// Count tokens for `text` whose digest is `text_hash`
    pub fn count_hashed(&self, text_hash: &str, text: &str) -> u32 {
        if let Some(count) = self.cache.lock().get(&text_hash.to_string()) {
            return count;
        }
        let count = self.inner.count(text);
        self.cache.lock().insert(text_hash.to_string(), count);
        count
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().len()
    }
}

impl TokenCounter for CachedTokenCounter {
    fn count(&self, text: &str) -> u32 {
        let hash = crate::models::compute_text_hash(text);
        self.count_hashed(&hash, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_approx_counter() {
        let counter = ApproxTokenCounter;
        assert_eq!(counter.count(""), 0);
        assert_eq!(counter.count("abcd"), 1);
        assert_eq!(counter.count("abcde"), 2);
        // Many short words: word count dominates
        assert_eq!(counter.count("a b c d e f"), 6);
    }

    #[test]
    fn test_closure_counter() {
        let counter = |text: &str| text.len() as u32;
        assert_eq!(counter.count("hello"), 5);
    }

    #[test]
    fn test_cache_avoids_recount() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_inner = calls.clone();
        let counter = CachedTokenCounter::new(
            move |text: &str| {
                calls_inner.fetch_add(1, Ordering::SeqCst);
                text.split_whitespace().count() as u32
            },
            8,
        );

        assert_eq!(counter.count("one two three"), 3);
        assert_eq!(counter.count("one two three"), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(counter.cached_entries(), 1);

        assert_eq!(counter.count("four"), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
