mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use agrivision_i18n::metrics::metric_names;
use agrivision_i18n::{BatchConfig, I18nConfig, I18nContext, TranslateError, Translator};
use common::{engine, engine_with, tag, RecordingTranslator};

#[tokio::test]
async fn repeated_request_hits_the_cache() {
    let engine = engine(RecordingTranslator::tagging());

    let first = engine.coalescer.request("hi", "Dashboard");
    engine.scheduler.drain().await;
    assert_eq!(first.await.unwrap(), "hi:Dashboard");

    let second = engine.coalescer.request("hi", "Dashboard");
    assert!(second.is_ready());
    assert_eq!(second.await.unwrap(), "hi:Dashboard");
    assert_eq!(engine.scheduler.drain().await.upstream_calls, 0);
    assert_eq!(engine.translator.call_count(), 1);
}

#[tokio::test]
async fn concurrent_requests_share_one_upstream_call() {
    let engine = engine(RecordingTranslator::tagging());

    let pending: Vec<_> = (0..10)
        .map(|_| engine.coalescer.request("hi", "Dashboard"))
        .collect();
    assert_eq!(engine.scheduler.queued_len(), 1);

    engine.scheduler.drain().await;
    let results = join_all(pending).await;

    assert_eq!(engine.translator.call_count(), 1);
    assert_eq!(results.len(), 10);
    assert!(results.iter().all(|r| r.as_deref() == Ok("hi:Dashboard")));
    assert_eq!(engine.metrics().counter(metric_names::COALESCED_JOINS), 9);
}

#[tokio::test]
async fn distinct_texts_form_one_joined_payload() {
    let engine = engine(RecordingTranslator::new(|text, _| Ok(text.to_lowercase())));

    let a = engine.coalescer.request("hi", "A");
    let b = engine.coalescer.request("hi", "B");
    let c = engine.coalescer.request("hi", "C");
    let report = engine.scheduler.drain().await;

    assert_eq!(report.upstream_calls, 1);
    let calls = engine.translator.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].payload, "A\n---\nB\n---\nC");
    assert_eq!(calls[0].lang, "hi");
    assert_eq!(a.await.unwrap(), "a");
    assert_eq!(b.await.unwrap(), "b");
    assert_eq!(c.await.unwrap(), "c");
}

#[tokio::test]
async fn short_response_falls_back_for_missing_entries_only() {
    let engine = engine(RecordingTranslator::new(|_, _| Ok("a\n---\nb".to_string())));

    let pending = vec![
        engine.coalescer.request("hi", "A"),
        engine.coalescer.request("hi", "B"),
        engine.coalescer.request("hi", "C"),
    ];
    let report = engine.scheduler.drain().await;
    let results = join_all(pending).await;

    assert_eq!(
        results,
        vec![Ok("a".to_string()), Ok("b".to_string()), Ok("C".to_string())]
    );
    assert_eq!(report.fallbacks, 1);
    assert_eq!(report.failed, 0);
    assert!(engine.cache().contains("hi", "A"));
    assert!(!engine.cache().contains("hi", "C"));
    assert_eq!(engine.metrics().counter(metric_names::PARTIAL_MISMATCHES), 1);
}

#[tokio::test]
async fn base_language_never_goes_upstream() {
    let engine = engine(RecordingTranslator::tagging());

    let pending = engine.coalescer.request("en", "Dashboard");
    assert!(pending.is_ready());
    assert_eq!(pending.await.unwrap(), "Dashboard");
    assert_eq!(engine.scheduler.queued_len(), 0);
    assert_eq!(engine.translator.call_count(), 0);
}

#[tokio::test]
async fn upstream_failure_rejects_every_waiter_in_the_batch() {
    let engine = engine(RecordingTranslator::new(|_, _| {
        Err(TranslateError::RateLimited { retry_after_ms: 1000 })
    }));

    let pending = vec![
        engine.coalescer.request("hi", "Dashboard"),
        engine.coalescer.request("hi", "Dashboard"),
        engine.coalescer.request("hi", "Settings"),
    ];
    let report = engine.scheduler.drain().await;
    let results = join_all(pending).await;

    assert_eq!(report.failed, 3);
    assert!(results
        .iter()
        .all(|r| *r == Err(TranslateError::RateLimited { retry_after_ms: 1000 })));
    assert!(engine.cache().is_empty());
    assert_eq!(engine.scheduler.waiting_keys(), 0);
    assert_eq!(engine.translator.call_count(), 1);
}

#[tokio::test]
async fn one_call_per_language_per_drain() {
    let engine = engine(RecordingTranslator::tagging());

    let hi = engine.coalescer.request("hi", "Crop");
    let ta = engine.coalescer.request("ta", "Crop");
    let hi2 = engine.coalescer.request("hi", "Price");
    let report = engine.scheduler.drain().await;

    assert_eq!(report.languages, 2);
    assert_eq!(engine.translator.calls_for("hi"), 1);
    assert_eq!(engine.translator.calls_for("ta"), 1);
    assert_eq!(hi.await.unwrap(), "hi:Crop");
    assert_eq!(hi2.await.unwrap(), "hi:Price");
    assert_eq!(ta.await.unwrap(), "ta:Crop");
}

#[tokio::test]
async fn request_joins_a_batch_already_in_flight() {
    let engine = engine(RecordingTranslator::tagging().gated());

    let first = engine.coalescer.request("hi", "Dashboard");
    let scheduler = Arc::clone(&engine.scheduler);
    let drain = tokio::spawn(async move { scheduler.drain().await });
    engine.translator.wait_started().await;

    // In flight: not queued any more, but still has waiters.
    let late = engine.coalescer.request("hi", "Dashboard");
    assert!(!late.is_ready());
    assert_eq!(engine.scheduler.queued_len(), 0);
    assert_eq!(engine.scheduler.waiting_keys(), 1);

    engine.translator.release(1);
    drain.await.unwrap();
    assert_eq!(first.await.unwrap(), "hi:Dashboard");
    assert_eq!(late.await.unwrap(), "hi:Dashboard");
    assert_eq!(engine.translator.call_count(), 1);
}

#[tokio::test]
async fn needs_arriving_mid_drain_wait_for_the_next_cycle() {
    let engine = engine(RecordingTranslator::tagging().gated());

    let first = engine.coalescer.request("hi", "Dashboard");
    let scheduler = Arc::clone(&engine.scheduler);
    let drain = tokio::spawn(async move { scheduler.drain().await });
    engine.translator.wait_started().await;

    let other = engine.coalescer.request("hi", "Settings");
    assert_eq!(engine.scheduler.queued_len(), 1);

    engine.translator.release(2);
    drain.await.unwrap();
    assert_eq!(first.await.unwrap(), "hi:Dashboard");

    engine.scheduler.drain().await;
    assert_eq!(other.await.unwrap(), "hi:Settings");
    assert_eq!(engine.translator.call_count(), 2);
}

#[tokio::test]
async fn cache_hit_during_debounce_is_honored() {
    let engine = engine(RecordingTranslator::tagging());

    let pending = engine.coalescer.request("hi", "Dashboard");
    engine.cache().put("hi", "Dashboard", "डैशबोर्ड".into());
    let report = engine.scheduler.drain().await;

    assert_eq!(report.upstream_calls, 0);
    assert_eq!(pending.await.unwrap(), "डैशबोर्ड");
    assert_eq!(engine.translator.call_count(), 0);
}

#[tokio::test]
async fn dropped_request_still_fills_the_cache() {
    let engine = engine(RecordingTranslator::tagging());

    drop(engine.coalescer.request("hi", "Weather"));
    engine.scheduler.drain().await;

    assert_eq!(engine.cache().get("hi", "Weather").as_deref(), Some("hi:Weather"));
}

#[tokio::test]
async fn char_limit_splits_a_language_into_ordered_chunks() {
    let config = BatchConfig {
        max_batch_chars: 13,
        ..BatchConfig::default()
    };
    let engine = engine_with(RecordingTranslator::tagging(), config);

    let pending = vec![
        engine.coalescer.request("hi", "Soil"),
        engine.coalescer.request("hi", "Rain"),
        engine.coalescer.request("hi", "Humidity"),
    ];
    let report = engine.scheduler.drain().await;
    let results = join_all(pending).await;

    assert_eq!(report.upstream_calls, 2);
    let payloads: Vec<String> = engine.translator.calls().into_iter().map(|c| c.payload).collect();
    assert_eq!(payloads, vec!["Soil\n---\nRain", "Humidity"]);
    assert_eq!(
        results,
        vec![
            Ok("hi:Soil".to_string()),
            Ok("hi:Rain".to_string()),
            Ok("hi:Humidity".to_string())
        ]
    );
}

#[tokio::test]
async fn shutdown_rejects_queued_needs() {
    let engine = engine(RecordingTranslator::tagging());

    let pending = engine.coalescer.request("hi", "Dashboard");
    engine.scheduler.shutdown();

    assert_eq!(pending.await, Err(TranslateError::Shutdown));
    assert!(engine.scheduler.is_shut_down());
    assert_eq!(engine.scheduler.drain().await.upstream_calls, 0);
}

#[tokio::test(start_paused = true)]
async fn debounce_loop_collapses_a_burst_into_one_batch() {
    let translator = Arc::new(RecordingTranslator::tagging());
    let context = I18nContext::start(
        I18nConfig::default(),
        Arc::clone(&translator) as Arc<dyn Translator>,
    );

    let pending: Vec<_> = ["Welcome", "Tagline", "Welcome", "Diagnose Crop"]
        .into_iter()
        .map(|text| context.coalescer.request("hi", text))
        .collect();
    let results = join_all(pending).await;

    assert_eq!(translator.call_count(), 1);
    assert_eq!(translator.calls()[0].payload, "Welcome\n---\nTagline\n---\nDiagnose Crop");
    assert_eq!(results[2].as_deref(), Ok(tag("hi", "Welcome").as_str()));

    // A later burst gets its own drain.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let later = context.coalescer.request("ta", "Welcome").await.unwrap();
    assert_eq!(later, "ta:Welcome");
    assert_eq!(translator.call_count(), 2);

    context.shutdown().await;
}
