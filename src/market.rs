//! Mandi price feed from data.gov.in behind a single-key TTL cache.
//! The whole record set is one cache entry; concurrent callers that find it
//! stale queue on one refresh instead of each hitting the API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::MarketConfig;
use crate::metrics::{metric_names, MetricsRegistry};

/// One commodity price row as published by the API. Every field may be null.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketRecord {
    pub state: Option<String>,
    pub district: Option<String>,
    pub market: Option<String>,
    pub commodity: Option<String>,
    pub variety: Option<String>,
    pub arrival_date: Option<String>,
    pub min_price: Option<String>,
    pub max_price: Option<String>,
    pub modal_price: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarketError {
    #[error("{0} environment variable not set")]
    MissingApiKey(String),
    #[error("request to market data API timed out")]
    Timeout,
    #[error("market data request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("could not decode market data: {0}")]
    Decode(String),
}

#[async_trait]
pub trait MarketSource: Send + Sync {
    async fn fetch_all(&self) -> Result<Vec<MarketRecord>, MarketError>;
}

pub struct DataGovClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    limit: u32,
}

impl DataGovClient {
    /// Build a client; the API key is read from `config.api_key_env`.
    pub fn new(config: &MarketConfig) -> Result<Self, MarketError> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| MarketError::MissingApiKey(config.api_key_env.clone()))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MarketError::Network(e.to_string()))?;
        Ok(Self {
            http,
            url: format!(
                "{}/resource/{}",
                config.base_url.trim_end_matches('/'),
                config.resource_id
            ),
            api_key,
            limit: config.limit,
        })
    }
}

#[async_trait]
impl MarketSource for DataGovClient {
    async fn fetch_all(&self) -> Result<Vec<MarketRecord>, MarketError> {
        let limit = self.limit.to_string();
        let response = self
            .http
            .get(&self.url)
            .query(&[
                ("api-key", self.api_key.as_str()),
                ("format", "json"),
                ("limit", limit.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MarketError::Timeout
                } else {
                    MarketError::Network(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(200)
                .collect();
            return Err(MarketError::Status { status, body });
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MarketError::Decode(e.to_string()))?;
        parse_records(payload)
    }
}

/// Pull the `records` array out of an API payload. A payload without one is
/// treated as "no data", not as an error.
pub fn parse_records(mut payload: serde_json::Value) -> Result<Vec<MarketRecord>, MarketError> {
    match payload.get_mut("records").map(serde_json::Value::take) {
        Some(records @ serde_json::Value::Array(_)) => {
            serde_json::from_value(records).map_err(|e| MarketError::Decode(e.to_string()))
        }
        _ => {
            warn!("market data API returned an unexpected response format");
            Ok(Vec::new())
        }
    }
}

struct CachedRecords {
    records: Arc<Vec<MarketRecord>>,
    fetched_at: Instant,
}

pub struct MarketDataCache {
    source: Arc<dyn MarketSource>,
    ttl: Duration,
    entry: RwLock<Option<CachedRecords>>,
    refresh: tokio::sync::Mutex<()>,
    metrics: Arc<MetricsRegistry>,
}

impl MarketDataCache {
    pub fn new(source: Arc<dyn MarketSource>, ttl: Duration, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            source,
            ttl,
            entry: RwLock::new(None),
            refresh: tokio::sync::Mutex::new(()),
            metrics,
        }
    }

    fn fresh(&self) -> Option<Arc<Vec<MarketRecord>>> {
        self.entry
            .read()
            .as_ref()
            .filter(|cached| cached.fetched_at.elapsed() < self.ttl)
            .map(|cached| Arc::clone(&cached.records))
    }

    /// Cached records while younger than the TTL, otherwise one fetch shared
    /// by every caller waiting on it. Failures are not cached; a caller that
    /// queued behind a failed refresh tries again itself.
    pub async fn get(&self) -> Result<Arc<Vec<MarketRecord>>, MarketError> {
        if let Some(records) = self.fresh() {
            return Ok(records);
        }

        let _flight = self.refresh.lock().await;
        if let Some(records) = self.fresh() {
            debug!("market data refreshed by a concurrent caller");
            return Ok(records);
        }

        self.metrics.increment(metric_names::MARKET_FETCHES);
        let records = Arc::new(self.source.fetch_all().await?);
        info!(records = records.len(), "market data refreshed");
        *self.entry.write() = Some(CachedRecords {
            records: Arc::clone(&records),
            fetched_at: Instant::now(),
        });
        Ok(records)
    }

    pub fn invalidate(&self) {
        *self.entry.write() = None;
    }
}

/// Records for one state, compared case-insensitively.
pub fn records_for_state(records: &[MarketRecord], state: &str) -> Vec<MarketRecord> {
    records
        .iter()
        .filter(|record| {
            record
                .state
                .as_deref()
                .is_some_and(|s| s.trim().eq_ignore_ascii_case(state.trim()))
        })
        .cloned()
        .collect()
}

/// Distinct state names, sorted.
pub fn states(records: &[MarketRecord]) -> Vec<String> {
    let mut names: Vec<String> = records
        .iter()
        .filter_map(|record| record.state.clone())
        .collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(state: &str, commodity: &str) -> MarketRecord {
        MarketRecord {
            state: Some(state.into()),
            commodity: Some(commodity.into()),
            ..MarketRecord::default()
        }
    }

    #[test]
    fn parses_records_array() {
        let payload = serde_json::json!({
            "records": [
                {"state": "Punjab", "commodity": "Wheat", "modal_price": "2275", "min_price": null}
            ]
        });
        let records = parse_records(payload).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].modal_price.as_deref(), Some("2275"));
        assert_eq!(records[0].min_price, None);
    }

    #[test]
    fn payload_without_records_is_empty() {
        assert!(parse_records(serde_json::json!({"message": "quota"})).unwrap().is_empty());
        assert!(parse_records(serde_json::json!({"records": "nope"})).unwrap().is_empty());
    }

    #[test]
    fn state_filter_ignores_case() {
        let records = vec![record("Punjab", "Wheat"), record("Kerala", "Banana"), record("punjab", "Rice")];
        let punjab = records_for_state(&records, "PUNJAB");
        assert_eq!(punjab.len(), 2);
        assert_eq!(states(&records), vec!["Kerala", "Punjab", "punjab"]);
    }
}
