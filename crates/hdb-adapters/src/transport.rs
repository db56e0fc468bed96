//! HTTP transport shared by the dataset and geocoding clients.
//!
//! Each client owns one [`Transport`]: a reqwest client plus an in-flight cap,
//! an optional request spacing, and a bounded retry loop for transient failures.

use std::time::Duration;

use reqwest::{Request, StatusCode};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request to {0} cannot be retried because its body is not replayable")]
    NotReplayable(String),
    #[error("transport is closed")]
    Closed,
}

/// Bounded exponential backoff for 5xx, 429, timeouts and connect failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn retries_status(status: StatusCode) -> bool {
        status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
    }

    pub fn retries_error(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect()
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    /// Minimum gap between request starts, across all callers.
    pub spacing: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 4,
            spacing: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl TransportConfig {
    /// Space request starts evenly so no more than `per_minute` begin in any minute.
    pub fn paced_per_minute(mut self, per_minute: u32) -> Self {
        self.spacing = Some(Duration::from_secs(60) / per_minute.max(1));
        self
    }
}

/// Hands out start slots `spacing` apart.
#[derive(Debug)]
struct Pacer {
    spacing: Duration,
    next_free: Mutex<Option<Instant>>,
}

impl Pacer {
    async fn wait_turn(&self) {
        let slot = {
            let mut next_free = self.next_free.lock().await;
            let slot = next_slot(*next_free, Instant::now());
            *next_free = Some(slot + self.spacing);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

fn next_slot(next_free: Option<Instant>, now: Instant) -> Instant {
    next_free.map_or(now, |free| free.max(now))
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct Transport {
    name: &'static str,
    client: reqwest::Client,
    in_flight: Semaphore,
    pacer: Option<Pacer>,
    retry: RetryPolicy,
}

impl Transport {
    pub fn new(name: &'static str, config: TransportConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            name,
            client: builder.build().map_err(FetchError::Client)?,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            pacer: config.spacing.map(|spacing| Pacer {
                spacing,
                next_free: Mutex::new(None),
            }),
            retry: config.retry,
        })
    }

    /// Client used to build requests passed to [`Transport::execute`].
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn get(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let request = self.client.get(url).build()?;
        self.execute(run_id, request).await
    }

    /// Send `request`, retrying transient failures. Non-2xx responses become
    /// [`FetchError::HttpStatus`].
    pub async fn execute(&self, run_id: Uuid, request: Request) -> Result<FetchedResponse, FetchError> {
        let _permit = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
        let span = info_span!(
            "http",
            transport = self.name,
            %run_id,
            method = %request.method(),
            url = %request.url()
        );
        self.execute_with_retries(request).instrument(span).await
    }

    async fn execute_with_retries(&self, request: Request) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0u32;
        loop {
            let attempt = request
                .try_clone()
                .ok_or_else(|| FetchError::NotReplayable(request.url().to_string()))?;
            if let Some(pacer) = &self.pacer {
                pacer.wait_turn().await;
            }

            let outcome = self.client.execute(attempt).await;
            let transient = match &outcome {
                Ok(resp) => RetryPolicy::retries_status(resp.status()),
                Err(err) => RetryPolicy::retries_error(err),
            };
            if transient && retry < self.retry.max_retries {
                match &outcome {
                    Ok(resp) => warn!(status = resp.status().as_u16(), retry, "retrying after http status"),
                    Err(err) => warn!(error = %err, retry, "retrying after request error"),
                }
                tokio::time::sleep(self.retry.delay(retry)).await;
                retry += 1;
                continue;
            }

            let resp = outcome?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            return Ok(FetchedResponse {
                status,
                final_url,
                body,
            });
        }
    }
}
