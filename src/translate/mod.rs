//! Translation engine: process-wide cache, request coalescing, debounced
//! batching, and the upstream translator seam.
//!
//! Callers go through [`RequestCoalescer::request`]; the [`BatchScheduler`]
//! is driven by it and never called directly by UI consumers.

pub mod batch;
pub mod cache;
pub mod coalescer;
pub mod llm;

use async_trait::async_trait;
use thiserror::Error;

pub use batch::{BatchConfig, BatchScheduler, DrainReport};
pub use cache::{CacheKey, TranslationCache};
pub use coalescer::{PendingTranslation, RequestCoalescer};
pub use llm::LlmTranslator;

/// Upstream translator (adapter for different backends).
///
/// `text` may hold several entries joined by the batch separator; the
/// implementation is expected to return them in the same order, separated
/// the same way.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String, TranslateError>;
}

/// Failure of one upstream call. Cloned to every waiter of the failed batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("translation timeout")]
    Timeout,
    #[error("unexpected status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("malformed upstream response: {0}")]
    UpstreamFormat(String),
    #[error("{0} environment variable not set")]
    MissingApiKey(String),
    #[error("translation scheduler shut down")]
    Shutdown,
}

impl TranslateError {
    /// Network, timeout and rate-limit failures: worth retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TranslateError::Network(_) | TranslateError::RateLimited { .. } | TranslateError::Timeout
        )
    }
}

/// Empty or whitespace-only text is never sent upstream.
#[inline]
pub fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}
