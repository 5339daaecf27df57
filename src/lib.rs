//! AgriVision i18n: translation memoization and request coalescing for UI labels.
//! Main library: engine wiring, tracing setup, and the market-data helper.

pub mod cancellation;
pub mod config;
pub mod facade;
pub mod market;
pub mod metrics;
pub mod translate;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

pub use config::{ConfigError, I18nConfig};
pub use facade::{ConsumerTextSet, FacadeSnapshot, FacadeState, TextMap, TranslationFacade};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use translate::{
    BatchConfig, BatchScheduler, PendingTranslation, RequestCoalescer, TranslateError,
    TranslationCache, Translator,
};

/// Shared engine state: one cache, one scheduler loop, any number of facades.
pub struct I18nContext {
    pub config: I18nConfig,
    pub cache: Arc<TranslationCache>,
    pub scheduler: Arc<BatchScheduler>,
    pub coalescer: RequestCoalescer,
    pub metrics: Arc<MetricsRegistry>,
    worker: JoinHandle<()>,
}

impl I18nContext {
    /// Build the engine and start the scheduler loop on the current runtime.
    pub fn start(config: I18nConfig, translator: Arc<dyn Translator>) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let cache = TranslationCache::init(config.base_language.clone());
        let scheduler = Arc::new(BatchScheduler::new(
            Arc::clone(&cache),
            translator,
            BatchConfig::from(&config),
            Arc::clone(&metrics),
        ));
        let worker = scheduler.spawn();
        let coalescer = RequestCoalescer::new(Arc::clone(&scheduler));
        info!(
            base_language = %config.base_language,
            debounce_ms = config.debounce_ms,
            "translation engine started"
        );

        Self {
            config,
            cache,
            scheduler,
            coalescer,
            metrics,
            worker,
        }
    }

    /// A facade for one consumer, starting in the base language.
    pub fn facade(&self, texts: ConsumerTextSet) -> TranslationFacade {
        TranslationFacade::new(self.coalescer.clone(), texts)
    }

    /// Stop the scheduler loop; queued needs are rejected.
    pub async fn shutdown(self) {
        self.scheduler.shutdown();
        if let Err(e) = self.worker.await {
            tracing::error!(error = %e, "scheduler task panicked");
        }
        info!(metrics = ?self.metrics.snapshot(), "translation engine stopped");
    }
}

/// Install the global tracing subscriber. Later calls are no-ops.
/// Filter comes from `RUST_LOG`, defaulting to `agrivision_i18n=info`.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("agrivision_i18n=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
