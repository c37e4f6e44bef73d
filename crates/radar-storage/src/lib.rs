//! HTTP fetch utilities + a read-through TTL cache for the radar.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::{RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "radar-storage";

/// Trimmed value of `key`, or `None` when unset or blank.
pub fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parsed value of `key`; unset, blank or unparsable values fall back to `default`.
pub fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_non_empty(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// No retries: every attempt is paid for, so callers of paid APIs opt out.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body_snippet}")]
    HttpStatus {
        status: u16,
        url: String,
        body_snippet: String,
    },
    #[error("could not decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl HttpError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpError::Request(err) if err.is_timeout())
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, HttpError::HttpStatus { status: 401 | 403, .. })
    }
}

const BODY_SNIPPET_CHARS: usize = 200;

fn body_snippet(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(BODY_SNIPPET_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Shared reqwest client with bounded concurrency, a per-request timeout and
/// retry with exponential backoff on transient failures.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn get_bytes(&self, label: &str, url: &str) -> Result<FetchedResponse, HttpError> {
        let span = info_span!("http_fetch", label, url, method = "GET");
        self.send_with_retries(|| self.client.get(url))
            .instrument(span)
            .await
    }

    pub async fn post_json<B, R>(
        &self,
        label: &str,
        url: &str,
        bearer: Option<&str>,
        body: &B,
    ) -> Result<R, HttpError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let span = info_span!("http_fetch", label, url, method = "POST");
        let resp = self
            .send_with_retries(|| {
                let req = self.client.post(url).json(body);
                match bearer {
                    Some(token) => req.bearer_auth(token),
                    None => req,
                }
            })
            .instrument(span)
            .await?;
        serde_json::from_slice(&resp.body).map_err(|source| HttpError::Decode {
            url: resp.final_url,
            source,
        })
    }

    async fn send_with_retries<F>(&self, build: F) -> Result<FetchedResponse, HttpError>
    where
        F: Fn() -> RequestBuilder,
    {
        // The semaphore is never closed, so acquire only fails if it were.
        let _permit = self.limit.acquire().await.ok();

        let mut attempt = 0usize;
        loop {
            let last_attempt = attempt >= self.backoff.max_retries;
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "http fetch ok");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && !last_attempt {
                        warn!(status = status.as_u16(), attempt, "retryable http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.bytes().await.map(|b| body_snippet(&b)).unwrap_or_default();
                    return Err(HttpError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body_snippet: body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && !last_attempt {
                        warn!(error = %err, attempt, "retryable request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(HttpError::Request(err));
                }
            }
        }
    }
}

struct CachedValue<T> {
    value: T,
    stored_at: Instant,
}

/// Process-wide memo with expiry. Loads run under the lock, so concurrent
/// readers of a stale value trigger a single refresh. Failed loads are not
/// stored.
pub struct ReadThroughCache<T> {
    ttl: Duration,
    slot: Mutex<Option<CachedValue<T>>>,
}

impl<T: Clone> ReadThroughCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get_or_load<F, Fut, E>(&self, load: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref() {
            if cached.stored_at.elapsed() < self.ttl {
                return Ok(cached.value.clone());
            }
        }
        let value = load().await?;
        *slot = Some(CachedValue {
            value: value.clone(),
            stored_at: Instant::now(),
        });
        Ok(value)
    }

    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }

    pub async fn peek(&self) -> Option<T> {
        self.slot.lock().await.as_ref().map(|c| c.value.clone())
    }
}
