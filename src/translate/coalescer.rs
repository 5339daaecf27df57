//! Request coalescer: the single entry point for "translate this label".
//! Base-language and blank texts pass through, cache hits resolve at once,
//! and concurrent callers for the same (lang, text) share one upstream need.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tracing::{debug, trace};

use super::batch::{Attachment, BatchScheduler, WaiterRx};
use super::cache::TranslationCache;
use super::{is_blank, TranslateError};
use crate::metrics::metric_names;

/// Outcome of [`RequestCoalescer::request`]. Already settled for passthrough
/// and cache hits; otherwise settles when the owning batch does.
///
/// Dropping it does not cancel anything: the batch still runs and fills the
/// cache for later callers.
#[derive(Debug)]
pub struct PendingTranslation {
    inner: Inner,
}

#[derive(Debug)]
enum Inner {
    Ready(Option<Result<String, TranslateError>>),
    Waiting(WaiterRx),
}

impl PendingTranslation {
    fn ready(result: Result<String, TranslateError>) -> Self {
        Self {
            inner: Inner::Ready(Some(result)),
        }
    }

    fn waiting(rx: WaiterRx) -> Self {
        Self {
            inner: Inner::Waiting(rx),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.inner, Inner::Ready(Some(_)))
    }

    /// Take the result if it is already known, otherwise hand `self` back.
    pub fn try_ready(self) -> Result<Result<String, TranslateError>, Self> {
        match self.inner {
            Inner::Ready(Some(result)) => Ok(result),
            inner => Err(Self { inner }),
        }
    }
}

impl Future for PendingTranslation {
    type Output = Result<String, TranslateError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            Inner::Ready(slot) => Poll::Ready(slot.take().unwrap_or(Err(TranslateError::Shutdown))),
            // A dropped sender means the scheduler went away without settling.
            Inner::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(TranslateError::Shutdown))),
        }
    }
}

#[derive(Clone)]
pub struct RequestCoalescer {
    scheduler: Arc<BatchScheduler>,
}

impl RequestCoalescer {
    pub fn new(scheduler: Arc<BatchScheduler>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Arc<BatchScheduler> {
        &self.scheduler
    }

    pub fn cache(&self) -> &Arc<TranslationCache> {
        self.scheduler.cache()
    }

    pub fn base_language(&self) -> &str {
        self.cache().base_language()
    }

    pub fn is_base(&self, lang: &str) -> bool {
        self.cache().is_base(lang)
    }

    /// Resolve without queueing anything: passthrough or cache hit.
    pub fn lookup(&self, lang: &str, text: &str) -> Option<String> {
        if self.is_base(lang) || is_blank(text) {
            return Some(text.to_string());
        }
        self.cache().get(lang, text)
    }

    pub fn request(&self, lang: &str, text: &str) -> PendingTranslation {
        let metrics = self.scheduler.metrics();

        if self.is_base(lang) || is_blank(text) {
            metrics.increment(metric_names::PASSTHROUGH);
            return PendingTranslation::ready(Ok(text.to_string()));
        }
        if let Some(hit) = self.cache().get(lang, text) {
            metrics.increment(metric_names::CACHE_HITS);
            trace!(lang, "translation cache hit");
            return PendingTranslation::ready(Ok(hit));
        }

        match self.scheduler.attach_or_enqueue(lang, text) {
            Attachment::Cached(hit) => {
                metrics.increment(metric_names::CACHE_HITS);
                PendingTranslation::ready(Ok(hit))
            }
            Attachment::Joined(rx) => {
                metrics.increment(metric_names::COALESCED_JOINS);
                debug!(lang, "joined pending translation");
                PendingTranslation::waiting(rx)
            }
            Attachment::Enqueued(rx) => {
                metrics.increment(metric_names::ENQUEUED);
                debug!(lang, "translation enqueued");
                PendingTranslation::waiting(rx)
            }
            Attachment::Closed => PendingTranslation::ready(Err(TranslateError::Shutdown)),
        }
    }
}
