//! Process-wide translation cache.
//! Key: blake3 hash of (len(target_lang) | target_lang | source_text). Entries never expire and
//! are never evicted: the cached texts are static UI labels.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

/// Hashed (target language, source text) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn compute(target_lang: &str, source_text: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        // Length prefix keeps "hi" + "a|b" apart from "hi|a" + "b".
        hasher.update(&(target_lang.len() as u64).to_le_bytes());
        hasher.update(target_lang.as_bytes());
        hasher.update(b"|");
        hasher.update(source_text.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

pub struct TranslationCache {
    base_language: String,
    inner: Mutex<HashMap<CacheKey, String>>,
}

impl TranslationCache {
    pub fn new(base_language: impl Into<String>) -> Self {
        Self {
            base_language: base_language.into(),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Construct the shared instance handed to the coalescer and scheduler.
    pub fn init(base_language: impl Into<String>) -> Arc<Self> {
        let cache = Self::new(base_language);
        info!(base_language = %cache.base_language, "translation cache initialized");
        Arc::new(cache)
    }

    pub fn base_language(&self) -> &str {
        &self.base_language
    }

    #[inline]
    pub fn is_base(&self, lang: &str) -> bool {
        lang == self.base_language
    }

    /// Look up a translation. The base language always passes the source
    /// text through unchanged, without touching the store.
    pub fn get(&self, lang: &str, text: &str) -> Option<String> {
        if self.is_base(lang) {
            return Some(text.to_string());
        }
        self.get_by_key(&CacheKey::compute(lang, text))
    }

    pub fn get_by_key(&self, key: &CacheKey) -> Option<String> {
        self.inner.lock().get(key).cloned()
    }

    /// Store a translation. First write wins; base-language writes are ignored.
    pub fn put(&self, lang: &str, text: &str, translated: String) {
        if self.is_base(lang) {
            return;
        }
        self.inner
            .lock()
            .entry(CacheKey::compute(lang, text))
            .or_insert(translated);
    }

    pub fn contains(&self, lang: &str, text: &str) -> bool {
        self.is_base(lang) || self.inner.lock().contains_key(&CacheKey::compute(lang, text))
    }

    /// Number of stored (non-base) entries.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
