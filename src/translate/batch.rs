//! Debounced batch scheduler.
//! One queue of (lang, text) needs spans all consumers. After a quiet period
//! the queue is drained, grouped by target language, and each language's
//! distinct uncached texts go upstream as one separator-joined payload.
//! The response is split back by index, the cache is populated, and every
//! waiter of a now-cached key is resolved in one pass.
//!
//! The queue and waiter table share one lock so the coalescer's
//! check-then-enqueue is atomic. The lock is never held across an await.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::{CacheKey, TranslationCache};
use super::{TranslateError, Translator};
use crate::config::I18nConfig;
use crate::metrics::{metric_names, MetricsRegistry};

type Outcome = Result<String, TranslateError>;
pub(crate) type WaiterRx = oneshot::Receiver<Outcome>;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub debounce: Duration,
    pub separator: String,
    /// 0 means one upstream call per language per drain, whatever its size.
    pub max_batch_chars: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::from(&I18nConfig::default())
    }
}

impl From<&I18nConfig> for BatchConfig {
    fn from(config: &I18nConfig) -> Self {
        Self {
            debounce: config.debounce(),
            separator: config.separator.clone(),
            max_batch_chars: config.max_batch_chars,
        }
    }
}

/// One queued need: the first caller for a (lang, text) pair.
struct Need {
    key: CacheKey,
    lang: String,
    text: String,
    enqueued_at: Instant,
}

#[derive(Default)]
struct QueueState {
    /// First-enqueue order; at most one need per key.
    queue: Vec<Need>,
    /// Continuations per key, for keys queued or in flight.
    waiters: HashMap<CacheKey, Vec<oneshot::Sender<Outcome>>>,
}

impl QueueState {
    /// Resolve every waiter whose key now has a cache entry. Idempotent.
    fn resolve_cached(&mut self, cache: &TranslationCache) -> usize {
        let mut resolved = 0;
        self.waiters.retain(|key, list| match cache.get_by_key(key) {
            Some(value) => {
                for waiter in list.drain(..) {
                    let _ = waiter.send(Ok(value.clone()));
                    resolved += 1;
                }
                false
            }
            None => true,
        });
        self.queue.retain(|need| cache.get_by_key(&need.key).is_none());
        resolved
    }

    fn resolve(&mut self, key: &CacheKey, value: &str) -> usize {
        let list = self.waiters.remove(key).unwrap_or_default();
        let count = list.len();
        for waiter in list {
            let _ = waiter.send(Ok(value.to_string()));
        }
        count
    }

    fn reject<'a>(&mut self, keys: impl IntoIterator<Item = &'a CacheKey>, err: &TranslateError) -> usize {
        let mut rejected = 0;
        for key in keys {
            for waiter in self.waiters.remove(key).unwrap_or_default() {
                let _ = waiter.send(Err(err.clone()));
                rejected += 1;
            }
        }
        rejected
    }
}

/// How a request attached to the scheduler.
pub(crate) enum Attachment {
    Cached(String),
    /// Joined a need already queued or in flight.
    Joined(WaiterRx),
    Enqueued(WaiterRx),
    Closed,
}

/// Counts for one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub languages: usize,
    pub upstream_calls: usize,
    /// Waiters resolved with a translation (or a per-entry source fallback).
    pub resolved: usize,
    /// Waiters rejected because their upstream call failed.
    pub failed: usize,
    /// Entries that fell back to source text because the response was short.
    pub fallbacks: usize,
}

impl DrainReport {
    fn merge(&mut self, other: DrainReport) {
        self.upstream_calls += other.upstream_calls;
        self.resolved += other.resolved;
        self.failed += other.failed;
        self.fallbacks += other.fallbacks;
    }
}

#[derive(Debug)]
struct BatchEntry {
    key: CacheKey,
    text: String,
}

/// Distinct texts for one language, in first-enqueue order.
struct LanguageBatch {
    lang: String,
    entries: Vec<BatchEntry>,
    seen: HashSet<CacheKey>,
}

impl LanguageBatch {
    fn new(lang: String) -> Self {
        Self {
            lang,
            entries: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn push(&mut self, need: Need) {
        if self.seen.insert(need.key) {
            self.entries.push(BatchEntry {
                key: need.key,
                text: need.text,
            });
        }
    }
}

pub struct BatchScheduler {
    cache: Arc<TranslationCache>,
    translator: Arc<dyn Translator>,
    config: BatchConfig,
    metrics: Arc<MetricsRegistry>,
    state: Mutex<QueueState>,
    wake: Notify,
    shutdown: CancellationToken,
}

impl BatchScheduler {
    pub fn new(
        cache: Arc<TranslationCache>,
        translator: Arc<dyn Translator>,
        config: BatchConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            cache,
            translator,
            config,
            metrics,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn cache(&self) -> &Arc<TranslationCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Needs waiting for the next drain.
    pub fn queued_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Keys queued or in flight that still have waiters.
    pub fn waiting_keys(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Start the debounce loop on the current Tokio runtime.
    /// Each wake-up waits `debounce`, then drains. Enqueues that land while
    /// a drain is running leave a stored permit, so the loop goes around again.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                debounce_ms = scheduler.config.debounce.as_millis() as u64,
                "batch scheduler started"
            );
            loop {
                tokio::select! {
                    _ = scheduler.wake.notified() => {}
                    _ = scheduler.shutdown.cancelled() => break,
                }
                tokio::select! {
                    _ = tokio::time::sleep(scheduler.config.debounce) => {}
                    _ = scheduler.shutdown.cancelled() => break,
                }
                scheduler.drain().await;
            }
            info!("batch scheduler stopped");
        })
    }

    /// Stop the loop and reject needs that have not been drained yet.
    /// Batches already in flight still settle their waiters.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        self.shutdown.cancel();
        let queued: Vec<CacheKey> = state.queue.drain(..).map(|need| need.key).collect();
        let rejected = state.reject(queued.iter(), &TranslateError::Shutdown);
        info!(rejected, "batch scheduler shutting down");
    }

    /// Attach a caller to the (lang, text) need: cache hit, join an existing
    /// need, or enqueue a new one. All three checks run under one lock.
    pub(crate) fn attach_or_enqueue(&self, lang: &str, text: &str) -> Attachment {
        let key = CacheKey::compute(lang, text);
        let mut state = self.state.lock();
        if self.shutdown.is_cancelled() {
            return Attachment::Closed;
        }
        if let Some(hit) = self.cache.get_by_key(&key) {
            return Attachment::Cached(hit);
        }

        let (tx, rx) = oneshot::channel();
        if let Some(list) = state.waiters.get_mut(&key) {
            list.push(tx);
            return Attachment::Joined(rx);
        }

        state.waiters.insert(key, vec![tx]);
        state.queue.push(Need {
            key,
            lang: lang.to_string(),
            text: text.to_string(),
            enqueued_at: Instant::now(),
        });
        drop(state);
        self.wake.notify_one();
        Attachment::Enqueued(rx)
    }

    /// Drain the queue once: one upstream call per language (per chunk when
    /// `max_batch_chars` is set). Languages are translated concurrently.
    pub async fn drain(&self) -> DrainReport {
        let needs = std::mem::take(&mut self.state.lock().queue);
        let mut report = DrainReport::default();
        if needs.is_empty() {
            return report;
        }

        let mut groups: Vec<LanguageBatch> = Vec::new();
        for need in needs {
            self.metrics.record(
                metric_names::QUEUE_WAIT,
                need.enqueued_at.elapsed().as_micros() as f64,
            );
            match groups.iter_mut().find(|group| group.lang == need.lang) {
                Some(group) => group.push(need),
                None => {
                    let mut group = LanguageBatch::new(need.lang.clone());
                    group.push(need);
                    groups.push(group);
                }
            }
        }

        // A translation may have landed during the debounce window.
        report.resolved += self.state.lock().resolve_cached(&self.cache);
        for group in &mut groups {
            group
                .entries
                .retain(|entry| self.cache.get_by_key(&entry.key).is_none());
        }
        groups.retain(|group| !group.entries.is_empty());
        report.languages = groups.len();

        let outcomes = join_all(groups.iter().map(|group| self.translate_language(group))).await;
        for outcome in outcomes {
            report.merge(outcome);
        }

        let requeued = self.state.lock().queue.len();
        if requeued > 0 {
            debug!(requeued, "needs arrived during drain, scheduling another");
            self.wake.notify_one();
        }
        info!(
            languages = report.languages,
            upstream_calls = report.upstream_calls,
            resolved = report.resolved,
            failed = report.failed,
            fallbacks = report.fallbacks,
            "drain complete"
        );
        report
    }

    async fn translate_language(&self, group: &LanguageBatch) -> DrainReport {
        let mut report = DrainReport::default();
        let lang = group.lang.as_str();

        for chunk in chunk_entries(&group.entries, &self.config.separator, self.config.max_batch_chars) {
            let texts: Vec<&str> = chunk.iter().map(|entry| entry.text.as_str()).collect();
            let payload = texts.join(&self.config.separator);
            let batch_id = uuid::Uuid::new_v4();

            debug!(%batch_id, lang, size = texts.len(), "upstream batch start");
            self.metrics.record(metric_names::BATCH_SIZE, texts.len() as f64);
            self.metrics.increment(metric_names::UPSTREAM_CALLS);
            report.upstream_calls += 1;

            let timer = self.metrics.timer(metric_names::UPSTREAM_LATENCY);
            let result = self.translator.translate(&payload, lang).await;
            let elapsed_ms = timer.stop().as_millis() as u64;

            match result {
                Ok(response) => {
                    let fragments = split_response(&response, &self.config.separator, texts.len());
                    let parts = response.split(self.config.separator.as_str()).count();
                    if texts.len() > 1 && parts != texts.len() {
                        warn!(
                            %batch_id,
                            lang,
                            expected = texts.len(),
                            received = parts,
                            "upstream response part count mismatch"
                        );
                        self.metrics.increment(metric_names::PARTIAL_MISMATCHES);
                    }

                    let mut state = self.state.lock();
                    for (entry, fragment) in chunk.iter().zip(fragments) {
                        match fragment {
                            Some(translated) => self.cache.put(lang, &entry.text, translated),
                            None => {
                                // Fallbacks are not cached so a later batch can retry them.
                                report.fallbacks += 1;
                                report.resolved += state.resolve(&entry.key, &entry.text);
                            }
                        }
                    }
                    report.resolved += state.resolve_cached(&self.cache);
                    debug!(%batch_id, lang, elapsed_ms, "upstream batch settled");
                }
                Err(err) => {
                    warn!(%batch_id, lang, size = texts.len(), error = %err, "upstream batch failed");
                    self.metrics.increment(metric_names::UPSTREAM_FAILURES);
                    report.failed += self
                        .state
                        .lock()
                        .reject(chunk.iter().map(|entry| &entry.key), &err);
                }
            }
        }
        report
    }
}

/// Split an upstream response back into one fragment per input, by index.
/// Missing or empty fragments are `None`; the caller falls back to the
/// source text for those entries only. A single-entry batch takes the whole
/// response.
pub fn split_response(response: &str, separator: &str, expected: usize) -> Vec<Option<String>> {
    if expected == 1 {
        return vec![non_empty(response)];
    }
    let mut parts = response.split(separator);
    (0..expected)
        .map(|_| parts.next().and_then(non_empty))
        .collect()
}

fn non_empty(fragment: &str) -> Option<String> {
    let trimmed = fragment.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Cut a language batch into consecutive chunks, keeping order.
/// A text that itself contains the separator always travels alone, since
/// its response cannot be split by index.
fn chunk_entries<'a>(entries: &'a [BatchEntry], separator: &str, max_chars: usize) -> Vec<&'a [BatchEntry]> {
    let sep_len = separator.chars().count();
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut size = 0;
    let mut open_isolated = false;

    for (i, entry) in entries.iter().enumerate() {
        let len = entry.text.chars().count();
        let isolated = entry.text.contains(separator);
        if i > start {
            let over = max_chars > 0 && size + sep_len + len > max_chars;
            if isolated || open_isolated || over {
                chunks.push(&entries[start..i]);
                start = i;
                size = 0;
            }
        }
        size += if i > start { sep_len + len } else { len };
        open_isolated = isolated;
    }
    if start < entries.len() {
        chunks.push(&entries[start..]);
    }
    chunks
}
