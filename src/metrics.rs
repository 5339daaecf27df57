//! Engine metrics: sliding-window histograms and monotonic counters.
//! Histograms keep the most recent samples per name and report p50/p95/p99;
//! counters only ever go up. Both are keyed by the names in [`metric_names`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

const WINDOW: usize = 1024;

/// Times one operation and records it (in microseconds) when stopped.
#[must_use = "a timer records nothing unless stopped"]
pub struct LatencyTimer {
    metric: &'static str,
    started: Instant,
    registry: Arc<MetricsRegistry>,
}

impl LatencyTimer {
    pub fn stop(self) -> Duration {
        let elapsed = self.started.elapsed();
        self.registry.record(self.metric, elapsed.as_micros() as f64);
        elapsed
    }
}

/// Most recent `capacity` samples, oldest first.
#[derive(Debug)]
struct Window {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl Window {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn sorted(&self) -> Vec<f64> {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        sorted
    }

    fn percentiles(&self) -> Percentiles {
        let sorted = self.sorted();
        Percentiles {
            p50: rank(&sorted, 50.0),
            p95: rank(&sorted, 95.0),
            p99: rank(&sorted, 99.0),
            samples: sorted.len(),
        }
    }
}

/// Nearest-rank value at `p` (0-100) of an ascending slice; 0 when empty.
fn rank(sorted: &[f64], p: f64) -> f64 {
    let Some(last) = sorted.len().checked_sub(1) else {
        return 0.0;
    };
    let idx = ((p.clamp(0.0, 100.0) / 100.0) * last as f64).round() as usize;
    sorted[idx.min(last)]
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub samples: usize,
}

/// Point-in-time copy of every metric, ordered by name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub histograms: BTreeMap<&'static str, Percentiles>,
    pub counters: BTreeMap<&'static str, u64>,
}

#[derive(Default)]
pub struct MetricsRegistry {
    windows: Mutex<HashMap<&'static str, Window>>,
    counters: Mutex<HashMap<&'static str, u64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, metric: &'static str, value: f64) {
        self.windows
            .lock()
            .entry(metric)
            .or_insert_with(|| Window::with_capacity(WINDOW))
            .push(value);
        tracing::trace!(metric, value, "metric recorded");
    }

    pub fn increment(&self, counter: &'static str) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: &'static str, delta: u64) {
        *self.counters.lock().entry(counter).or_default() += delta;
    }

    /// Current value of a counter; 0 if it was never touched.
    pub fn counter(&self, counter: &str) -> u64 {
        self.counters.lock().get(counter).copied().unwrap_or_default()
    }

    pub fn timer(self: &Arc<Self>, metric: &'static str) -> LatencyTimer {
        LatencyTimer {
            metric,
            started: Instant::now(),
            registry: Arc::clone(self),
        }
    }

    /// Value at percentile `p` (0-100) of the named histogram.
    pub fn percentile(&self, metric: &str, p: f64) -> f64 {
        self.windows
            .lock()
            .get(metric)
            .map_or(0.0, |window| rank(&window.sorted(), p))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let histograms = self
            .windows
            .lock()
            .iter()
            .map(|(&name, window)| (name, window.percentiles()))
            .collect();
        let counters = self
            .counters
            .lock()
            .iter()
            .map(|(&name, &value)| (name, value))
            .collect();
        MetricsSnapshot {
            histograms,
            counters,
        }
    }
}

pub mod metric_names {
    /// Microseconds spent in one upstream translate call.
    pub const UPSTREAM_LATENCY: &str = "upstream_latency_us";
    /// Distinct texts carried by one upstream call.
    pub const BATCH_SIZE: &str = "batch_size";
    /// Microseconds a need waited in the queue before its drain.
    pub const QUEUE_WAIT: &str = "queue_wait_us";

    pub const CACHE_HITS: &str = "cache_hits";
    pub const PASSTHROUGH: &str = "passthrough";
    pub const COALESCED_JOINS: &str = "coalesced_joins";
    pub const ENQUEUED: &str = "enqueued";
    pub const UPSTREAM_CALLS: &str = "upstream_calls";
    pub const UPSTREAM_FAILURES: &str = "upstream_failures";
    pub const PARTIAL_MISMATCHES: &str = "partial_mismatches";
    pub const MARKET_FETCHES: &str = "market_fetches";
}
