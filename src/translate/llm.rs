//! OpenAI-compatible chat-completions translator.
//! Requests are paced to a minimum interval and retried here at the
//! transport level; the coalescing layer above never retries.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{is_blank, TranslateError, Translator};
use crate::config::UpstreamConfig;

/// Prompt asks the model to keep the batch separator intact.
fn build_prompt(text: &str, target_lang: &str, separator: &str) -> String {
    let shown = separator.escape_default();
    format!(
        "Translate the following text to the language with code '{target_lang}'. \
         The text may contain multiple distinct entries separated by \"{shown}\". \
         Maintain this separator in your output. Return only the translated text, \
         preserving the separators exactly as they appear in the input.\n\n\
         Text to translate: \"{text}\""
    )
}

/// Spaces requests at least `interval` apart.
struct Pacer {
    interval: Duration,
    next_slot: tokio::sync::Mutex<Instant>,
}

impl Pacer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: tokio::sync::Mutex::new(Instant::now()),
        }
    }

    async fn wait_turn(&self) {
        let mut slot = self.next_slot.lock().await;
        let wait = slot.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        *slot = Instant::now() + self.interval;
    }
}

/// What to do with one attempt's outcome.
enum Next {
    Done(reqwest::Response),
    RetryAfter(Duration),
    Fail(TranslateError),
}

#[derive(Debug, Default)]
struct Attempts {
    rate_limited: u32,
    server_errors: u32,
    timed_out: bool,
}

pub struct LlmTranslator {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    separator: String,
    pacer: Pacer,
    max_rate_limit_retries: u32,
    max_server_retries: u32,
}

impl LlmTranslator {
    /// Build a client; the API key is read from `config.api_key_env`.
    pub fn new(config: &UpstreamConfig, separator: &str) -> Result<Self, TranslateError> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| TranslateError::MissingApiKey(config.api_key_env.clone()))?;
        Self::with_api_key(config, separator, api_key)
    }

    pub fn with_api_key(
        config: &UpstreamConfig,
        separator: &str,
        api_key: String,
    ) -> Result<Self, TranslateError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| TranslateError::Network(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            separator: separator.to_string(),
            pacer: Pacer::new(config.min_interval()),
            max_rate_limit_retries: config.max_rate_limit_retries,
            max_server_retries: config.max_server_retries,
        })
    }

    /// POST `body`, retrying 429s (Retry-After, else 1s/2s/4s...), 5xx
    /// (500ms doubling), both capped at a minute, and a single timeout.
    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, TranslateError> {
        let mut attempts = Attempts::default();
        loop {
            self.pacer.wait_turn().await;
            let sent = self
                .http
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await;

            match self.next_step(sent, &mut attempts).await {
                Next::Done(resp) => return Ok(resp),
                Next::RetryAfter(wait) => tokio::time::sleep(wait).await,
                Next::Fail(err) => return Err(err),
            }
        }
    }

    async fn next_step(
        &self,
        sent: Result<reqwest::Response, reqwest::Error>,
        attempts: &mut Attempts,
    ) -> Next {
        let resp = match sent {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() && !attempts.timed_out => {
                attempts.timed_out = true;
                warn!("upstream timeout, retrying once");
                return Next::RetryAfter(Duration::ZERO);
            }
            Err(e) if e.is_timeout() => return Next::Fail(TranslateError::Timeout),
            Err(e) => return Next::Fail(TranslateError::Network(e.to_string())),
        };

        let status = resp.status();
        if status.is_success() {
            return Next::Done(resp);
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after(&resp);
            if attempts.rate_limited >= self.max_rate_limit_retries {
                return Next::Fail(TranslateError::RateLimited {
                    retry_after_ms: retry_after.map_or(0, |d| d.as_millis() as u64),
                });
            }
            let wait = retry_after.unwrap_or_else(|| rate_limit_backoff(attempts.rate_limited));
            attempts.rate_limited += 1;
            warn!(attempt = attempts.rate_limited, wait_ms = wait.as_millis() as u64, "upstream rate limited");
            return Next::RetryAfter(wait);
        }

        if status.is_server_error() && attempts.server_errors < self.max_server_retries {
            let wait = server_error_backoff(attempts.server_errors);
            attempts.server_errors += 1;
            warn!(
                attempt = attempts.server_errors,
                status = status.as_u16(),
                wait_ms = wait.as_millis() as u64,
                "upstream server error"
            );
            return Next::RetryAfter(wait);
        }

        Next::Fail(TranslateError::Api {
            status: status.as_u16(),
            body: truncated_body(resp).await,
        })
    }
}

/// 1s, 2s, 4s ... capped at `MAX_BACKOFF`.
fn rate_limit_backoff(attempt: u32) -> Duration {
    doubling(Duration::from_secs(1), attempt)
}

/// 500ms, 1s, 2s ... capped at `MAX_BACKOFF`.
fn server_error_backoff(attempt: u32) -> Duration {
    doubling(Duration::from_millis(500), attempt)
}

const MAX_BACKOFF: Duration = Duration::from_secs(60);

fn doubling(base: Duration, attempt: u32) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(MAX_BACKOFF, |wait| wait.min(MAX_BACKOFF))
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl Translator for LlmTranslator {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String, TranslateError> {
        // Nothing to translate: empty input or a lone separator.
        if is_blank(text) || text.trim() == self.separator.trim() {
            return Ok(text.to_string());
        }

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": build_prompt(text, target_lang, &self.separator)}
            ],
            "temperature": 0.1
        });

        let started = Instant::now();
        let response = self.post(&body).await?;
        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| TranslateError::UpstreamFormat(e.to_string()))?;
        let content = extract_content(completion)?;
        debug!(
            target_lang,
            chars = text.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "upstream translation complete"
        );
        Ok(content)
    }
}

async fn truncated_body(resp: reqwest::Response) -> String {
    resp.text()
        .await
        .unwrap_or_default()
        .chars()
        .take(200)
        .collect()
}

fn extract_content(completion: ChatCompletion) -> Result<String, TranslateError> {
    completion
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| TranslateError::UpstreamFormat("response carried no content".into()))
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}
