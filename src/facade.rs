//! Consumer-facing translation facade.
//!
//! A facade owns one consumer's ordered `key -> source text` set and the
//! active language. Reads never block: keys already in the cache show their
//! translation immediately, the rest show their source text until the
//! owning batch settles. Resolved strings are published through a `watch`
//! channel so a UI can re-render on every update.
//!
//! State machine: `Idle` (base language) -> `Resolving` -> `Resolved`, back
//! to `Resolving` on the next language change, or `Idle` when the base
//! language returns. There is no terminal state.

use std::fmt;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cancellation::{EpochGuard, ResolutionEpochs};
use crate::translate::{PendingTranslation, RequestCoalescer, TranslateError};

/// Ordered `key -> string` mapping compared structurally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextMap {
    entries: Vec<(String, String)>,
}

/// What a consumer hands the facade: semantic key -> source string.
pub type ConsumerTextSet = TextMap;

impl TextMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; a replaced key keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TextMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = TextMap::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

impl Serialize for TextMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Reads a JSON object keeping its key order; a repeated key keeps its
/// first position and its last value.
impl<'de> Deserialize<'de> for TextMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TextMapVisitor;

        impl<'de> Visitor<'de> for TextMapVisitor {
            type Value = TextMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object of string keys to string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<TextMap, A::Error> {
                let mut map = TextMap::new();
                while let Some((key, value)) = access.next_entry::<String, String>()? {
                    map.insert(key, value);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(TextMapVisitor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum FacadeState {
    Idle,
    Resolving,
    Resolved,
}

impl fmt::Display for FacadeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FacadeState::Idle => write!(f, "Idle"),
            FacadeState::Resolving => write!(f, "Resolving"),
            FacadeState::Resolved => write!(f, "Resolved"),
        }
    }
}

/// Point-in-time view published to subscribers.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FacadeSnapshot {
    pub language: String,
    pub state: FacadeState,
    pub resolved: TextMap,
    pub is_translating: bool,
    /// At least one key fell back to its source text after a failure.
    pub degraded: bool,
}

struct FacadeInner {
    language: String,
    texts: ConsumerTextSet,
    resolved: TextMap,
    state: FacadeState,
    outstanding: usize,
    degraded: bool,
}

impl FacadeInner {
    fn snapshot(&self) -> FacadeSnapshot {
        FacadeSnapshot {
            language: self.language.clone(),
            state: self.state,
            resolved: self.resolved.clone(),
            is_translating: self.state == FacadeState::Resolving,
            degraded: self.degraded,
        }
    }

    fn transition(&mut self, next: FacadeState) {
        if self.state != next {
            info!(from = %self.state, to = %next, language = %self.language, "facade_transition");
        }
        self.state = next;
    }
}

struct Shared {
    inner: Mutex<FacadeInner>,
    snapshot_tx: watch::Sender<FacadeSnapshot>,
}

impl Shared {
    fn publish(&self, inner: &FacadeInner) {
        self.snapshot_tx.send_replace(inner.snapshot());
    }
}

pub struct TranslationFacade {
    coalescer: RequestCoalescer,
    shared: Arc<Shared>,
    epochs: ResolutionEpochs,
}

impl TranslationFacade {
    /// Start in the base language, showing `texts` verbatim.
    pub fn new(coalescer: RequestCoalescer, texts: ConsumerTextSet) -> Self {
        let inner = FacadeInner {
            language: coalescer.base_language().to_string(),
            resolved: texts.clone(),
            texts,
            state: FacadeState::Idle,
            outstanding: 0,
            degraded: false,
        };
        let (snapshot_tx, _) = watch::channel(inner.snapshot());
        Self {
            coalescer,
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                snapshot_tx,
            }),
            epochs: ResolutionEpochs::new(),
        }
    }

    /// Switch the active language. A no-op when it is already active.
    ///
    /// Must be called within a Tokio runtime: outstanding keys are awaited
    /// on a spawned task.
    pub fn set_language(&self, lang: &str) {
        let mut inner = self.shared.inner.lock();
        if inner.language == lang {
            return;
        }
        inner.language = lang.to_string();
        self.resolve(&mut inner);
    }

    /// Replace the consumer's text set. A structurally equal set is a no-op.
    pub fn set_texts(&self, texts: ConsumerTextSet) {
        let mut inner = self.shared.inner.lock();
        if inner.texts == texts {
            return;
        }
        inner.texts = texts;
        self.resolve(&mut inner);
    }

    fn resolve(&self, inner: &mut FacadeInner) {
        let guard = self.epochs.begin();
        let lang = inner.language.clone();
        inner.degraded = false;
        inner.outstanding = 0;

        if self.coalescer.is_base(&lang) {
            inner.resolved = inner.texts.clone();
            inner.transition(FacadeState::Idle);
            self.shared.publish(inner);
            return;
        }

        let mut resolved = TextMap::new();
        let waiting = FuturesUnordered::new();
        for (key, source) in inner.texts.iter() {
            match self.coalescer.request(&lang, source).try_ready() {
                Ok(Ok(value)) => resolved.insert(key, value),
                Ok(Err(err)) => {
                    warn!(key, language = %lang, error = %err, "translation unavailable, using source text");
                    inner.degraded = true;
                    resolved.insert(key, source);
                }
                Err(pending) => {
                    resolved.insert(key, source);
                    waiting.push(await_key(key.to_string(), source.to_string(), pending));
                }
            }
        }
        inner.resolved = resolved;
        inner.outstanding = waiting.len();

        if waiting.is_empty() {
            inner.transition(FacadeState::Resolved);
            self.shared.publish(inner);
            return;
        }

        inner.transition(FacadeState::Resolving);
        self.shared.publish(inner);
        debug!(language = %lang, outstanding = inner.outstanding, "awaiting translations");
        tokio::spawn(apply_results(Arc::clone(&self.shared), guard, waiting));
    }

    pub fn snapshot(&self) -> FacadeSnapshot {
        self.shared.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FacadeSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    /// Resolved string for `key`: translation, else source text, else the key.
    pub fn t(&self, key: &str) -> String {
        let inner = self.shared.inner.lock();
        inner
            .resolved
            .get(key)
            .or_else(|| inner.texts.get(key))
            .unwrap_or(key)
            .to_string()
    }

    pub fn resolved(&self) -> TextMap {
        self.shared.inner.lock().resolved.clone()
    }

    pub fn is_translating(&self) -> bool {
        self.state() == FacadeState::Resolving
    }

    pub fn state(&self) -> FacadeState {
        self.shared.inner.lock().state
    }

    pub fn language(&self) -> String {
        self.shared.inner.lock().language.clone()
    }

    /// Wait until no key is outstanding.
    pub async fn wait_settled(&self) -> FacadeSnapshot {
        let mut rx = self.subscribe();
        let settled = match rx.wait_for(|snapshot| snapshot.state != FacadeState::Resolving).await {
            Ok(snapshot) => FacadeSnapshot::clone(&snapshot),
            Err(_) => self.snapshot(),
        };
        settled
    }
}

impl Drop for TranslationFacade {
    fn drop(&mut self) {
        self.epochs.close();
    }
}

async fn await_key(
    key: String,
    source: String,
    pending: PendingTranslation,
) -> (String, String, Result<String, TranslateError>) {
    let result = pending.await;
    (key, source, result)
}

/// Apply each key's result as it settles, until the epoch is superseded.
async fn apply_results<F>(shared: Arc<Shared>, guard: EpochGuard, mut waiting: FuturesUnordered<F>)
where
    F: std::future::Future<Output = (String, String, Result<String, TranslateError>)>,
{
    loop {
        let next = tokio::select! {
            next = waiting.next() => next,
            _ = guard.closed() => {
                debug!(epoch = guard.epoch(), "resolution superseded");
                return;
            }
        };
        let Some((key, source, result)) = next else {
            return;
        };

        let mut inner = shared.inner.lock();
        if !guard.is_live() {
            return;
        }
        match result {
            Ok(value) => inner.resolved.insert(key, value),
            Err(err) => {
                warn!(key = %key, error = %err, "translation failed, using source text");
                inner.degraded = true;
                inner.resolved.insert(key, source);
            }
        }
        inner.outstanding = inner.outstanding.saturating_sub(1);
        if inner.outstanding == 0 {
            inner.transition(FacadeState::Resolved);
        }
        shared.publish(&inner);
    }
}
