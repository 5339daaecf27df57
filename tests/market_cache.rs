use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;

use agrivision_i18n::market::{MarketDataCache, MarketError, MarketRecord, MarketSource};
use agrivision_i18n::metrics::metric_names;
use agrivision_i18n::MetricsRegistry;

struct FakeSource {
    fetches: AtomicUsize,
    failing: AtomicBool,
}

impl FakeSource {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fetches: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        })
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketSource for FakeSource {
    async fn fetch_all(&self) -> Result<Vec<MarketRecord>, MarketError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(50)).await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(MarketError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        Ok(vec![MarketRecord {
            state: Some("Punjab".into()),
            commodity: Some("Wheat".into()),
            modal_price: Some(format!("{}", 2000 + n)),
            ..MarketRecord::default()
        }])
    }
}

fn cache_over(source: &Arc<FakeSource>, ttl: Duration) -> (MarketDataCache, Arc<MetricsRegistry>) {
    let metrics = Arc::new(MetricsRegistry::new());
    let cache = MarketDataCache::new(
        Arc::clone(source) as Arc<dyn MarketSource>,
        ttl,
        Arc::clone(&metrics),
    );
    (cache, metrics)
}

#[tokio::test(start_paused = true)]
async fn records_are_reused_until_the_ttl_expires() {
    let source = FakeSource::new();
    let (cache, _) = cache_over(&source, Duration::from_secs(600));

    let first = cache.get().await.unwrap();
    tokio::time::advance(Duration::from_secs(300)).await;
    let second = cache.get().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(source.fetches(), 1);

    tokio::time::advance(Duration::from_secs(301)).await;
    let third = cache.get().await.unwrap();
    assert_eq!(source.fetches(), 2);
    assert_eq!(third[0].modal_price.as_deref(), Some("2002"));
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_one_fetch() {
    let source = FakeSource::new();
    let (cache, metrics) = cache_over(&source, Duration::from_secs(600));

    let results = join_all((0..8).map(|_| cache.get())).await;

    assert_eq!(source.fetches(), 1);
    assert_eq!(metrics.counter(metric_names::MARKET_FETCHES), 1);
    assert!(results.iter().all(|r| r.as_ref().is_ok_and(|records| records.len() == 1)));
}

#[tokio::test(start_paused = true)]
async fn failures_are_not_cached() {
    let source = FakeSource::new();
    let (cache, _) = cache_over(&source, Duration::from_secs(600));

    source.failing.store(true, Ordering::SeqCst);
    let err = cache.get().await.unwrap_err();
    assert!(matches!(err, MarketError::Status { status: 503, .. }));

    source.failing.store(false, Ordering::SeqCst);
    let records = cache.get().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(source.fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn invalidate_forces_a_refetch() {
    let source = FakeSource::new();
    let (cache, _) = cache_over(&source, Duration::from_secs(600));

    cache.get().await.unwrap();
    cache.invalidate();
    cache.get().await.unwrap();
    assert_eq!(source.fetches(), 2);
}
