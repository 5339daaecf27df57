// Shared helpers for integration tests: a recording upstream translator and
// engine builders that skip the debounce loop so tests can drain by hand.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use agrivision_i18n::{
    BatchConfig, BatchScheduler, MetricsRegistry, RequestCoalescer, TranslateError,
    TranslationCache, Translator,
};

type Responder = dyn Fn(&str, &str) -> Result<String, TranslateError> + Send + Sync;

/// One upstream call as seen by the translator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub payload: String,
    pub lang: String,
}

/// Records every upstream call and answers through a closure.
/// With `gated()`, each call blocks until the test releases a permit.
pub struct RecordingTranslator {
    calls: Mutex<Vec<Call>>,
    responder: Box<Responder>,
    gate: Option<Semaphore>,
    started: Notify,
}

impl RecordingTranslator {
    pub fn new(
        responder: impl Fn(&str, &str) -> Result<String, TranslateError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
            gate: None,
            started: Notify::new(),
        }
    }

    /// Answers with `"<lang>:<payload>"`.
    pub fn tagging() -> Self {
        Self::new(|text, lang| Ok(tag(lang, text)))
    }

    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    pub fn release(&self, calls: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(calls);
        }
    }

    /// Resolves once a call has reached the translator.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, lang: &str) -> usize {
        self.calls.lock().iter().filter(|call| call.lang == lang).count()
    }
}

#[async_trait]
impl Translator for RecordingTranslator {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String, TranslateError> {
        self.calls.lock().push(Call {
            payload: text.to_string(),
            lang: target_lang.to_string(),
        });
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        (self.responder)(text, target_lang)
    }
}

/// Tag every separator-delimited entry of `payload` with `lang`.
pub fn tag(lang: &str, payload: &str) -> String {
    payload
        .split("\n---\n")
        .map(|entry| format!("{lang}:{entry}"))
        .collect::<Vec<_>>()
        .join("\n---\n")
}

pub struct Engine {
    pub translator: Arc<RecordingTranslator>,
    pub scheduler: Arc<BatchScheduler>,
    pub coalescer: RequestCoalescer,
}

impl Engine {
    pub fn cache(&self) -> &Arc<TranslationCache> {
        self.coalescer.cache()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        self.scheduler.metrics()
    }
}

/// Engine without a running debounce loop; call `scheduler.drain()` by hand.
pub fn engine(translator: RecordingTranslator) -> Engine {
    engine_with(translator, BatchConfig::default())
}

pub fn engine_with(translator: RecordingTranslator, config: BatchConfig) -> Engine {
    let translator = Arc::new(translator);
    let scheduler = Arc::new(BatchScheduler::new(
        TranslationCache::init("en"),
        Arc::clone(&translator) as Arc<dyn Translator>,
        config,
        Arc::new(MetricsRegistry::new()),
    ));
    let coalescer = RequestCoalescer::new(Arc::clone(&scheduler));
    Engine {
        translator,
        scheduler,
        coalescer,
    }
}
