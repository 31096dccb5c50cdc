// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP event collector client.
//!
//! One [`Forwarder`] per listener posts each stored line as its own request:
//!
//! ```text
//!   line ──> [gzip?] ──> POST ──> 2xx ──────────────> Ok
//!                          │
//!                          ├─ 408/429/5xx/transport ──> sleep 100ms, 300ms ──> POST (max 3)
//!                          └─ other status ──────────> Terminal
//! ```
//!
//! The caller's cancellation token aborts both the in-flight request and any backoff sleep.

use std::io::Write;
use std::time::Duration;

use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE,
};
use reqwest::{StatusCode, Url};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HecConfig;
use crate::errors::{ForwardError, RelayError};
use crate::health::HealthStatus;
use crate::http::build_client;

pub const SOURCE_TYPE_HEADER: &str = "x-splunk-sourcetype";

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            multiplier: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `failed + 1`, where `failed` is the 1-based attempt that just failed.
    #[must_use]
    pub fn backoff(&self, failed: u32) -> Duration {
        let exponent = failed.saturating_sub(1);
        self.initial_backoff
            .saturating_mul(self.multiplier.saturating_pow(exponent))
    }
}

/// Successful delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOutcome {
    pub attempts: u32,
    pub status: StatusCode,
}

#[must_use]
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

#[derive(Debug, Clone)]
pub struct Forwarder {
    listener: String,
    url: Url,
    client: reqwest::Client,
    headers: HeaderMap,
    gzip: bool,
    retry: RetryPolicy,
}

impl Forwarder {
    /// Builds the pooled client and the fixed request headers.
    pub fn new(listener: &str, hec: &HecConfig) -> Result<Self, RelayError> {
        let client_error = |reason: String| RelayError::HttpClient {
            listener: listener.to_string(),
            reason,
        };

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Splunk {}", hec.token))
            .map_err(|_| client_error("hec_token contains invalid header characters".into()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if hec.gzip {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }
        if let Some(source_type) = &hec.source_type {
            let value = HeaderValue::from_str(source_type)
                .map_err(|_| client_error("source_type contains invalid header characters".into()))?;
            headers.insert(HeaderName::from_static(SOURCE_TYPE_HEADER), value);
        }

        let client = build_client(hec.timeout).map_err(|e| client_error(e.to_string()))?;

        Ok(Forwarder {
            listener: listener.to_string(),
            url: hec.url.clone(),
            client,
            headers,
            gzip: hec.gzip,
            retry: RetryPolicy::default(),
        })
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn listener(&self) -> &str {
        &self.listener
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Posts `line` verbatim (or gzipped), retrying transient failures.
    pub async fn forward(
        &self,
        line: Bytes,
        cancel: &CancellationToken,
    ) -> Result<ForwardOutcome, ForwardError> {
        let body = if self.gzip { gzip(&line)? } else { line };

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ForwardError::Cancelled { attempts: attempt });
            }
            attempt += 1;

            let request = self
                .client
                .post(self.url.clone())
                .headers(self.headers.clone())
                .body(body.clone());
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ForwardError::Cancelled { attempts: attempt }),
                result = send(request) => result,
            };

            let last_error = match result {
                Ok(status) if status.is_success() => {
                    return Ok(ForwardOutcome {
                        attempts: attempt,
                        status,
                    });
                }
                Ok(status) if is_retryable_status(status) => format!("status {status}"),
                Ok(status) => {
                    return Err(ForwardError::Terminal {
                        status,
                        attempts: attempt,
                    });
                }
                Err(e) => e.to_string(),
            };

            if attempt >= self.retry.max_attempts {
                return Err(ForwardError::Exhausted {
                    attempts: attempt,
                    last_error,
                });
            }

            let delay = self.retry.backoff(attempt);
            debug!(
                attempt,
                "Forward to {} failed ({}), retrying in {} ms",
                self.url,
                last_error,
                delay.as_millis()
            );
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ForwardError::Cancelled { attempts: attempt }),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Probes the endpoint with an authenticated `GET`.
    pub async fn health_check(&self) -> HealthStatus {
        let mut request = self.client.get(self.url.clone());
        if let Some(auth) = self.headers.get(AUTHORIZATION) {
            request = request.header(AUTHORIZATION, auth.clone());
        }
        match send(request).await {
            Ok(status) => classify_probe(status),
            Err(e) => {
                warn!("Health probe to {} failed: {}", self.url, e);
                HealthStatus::Unreachable(e.to_string())
            }
        }
    }
}

/// Raw endpoints answer GET with a 4xx while being perfectly usable, so only auth failures
/// and server errors count against the collector.
#[must_use]
pub fn classify_probe(status: StatusCode) -> HealthStatus {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        HealthStatus::Unauthorized(status.as_u16())
    } else if status.is_server_error() {
        HealthStatus::Unavailable(status.as_u16())
    } else {
        HealthStatus::Healthy
    }
}

async fn send(request: reqwest::RequestBuilder) -> Result<StatusCode, reqwest::Error> {
    let response = request.send().await?;
    let status = response.status();
    // read the body so the pooled connection can be reused
    if let Err(e) = response.bytes().await {
        debug!("Failed to read collector response body: {}", e);
    }
    Ok(status)
}

fn gzip(line: &[u8]) -> Result<Bytes, ForwardError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(line.len() / 2 + 32), Compression::default());
    encoder
        .write_all(line)
        .map_err(|e| ForwardError::Payload(e.to_string()))?;
    encoder
        .finish()
        .map(Bytes::from)
        .map_err(|e| ForwardError::Payload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use std::time::Instant;

    const RAW_PATH: &str = "/services/collector/raw";

    fn hec(server: &mockito::Server) -> HecConfig {
        let url = Url::parse(&format!("{}{RAW_PATH}", server.url())).unwrap();
        let mut hec = HecConfig::new(url, "secret-token");
        hec.source_type = Some("zpa:user-activity".to_string());
        hec.timeout = Duration::from_secs(5);
        hec
    }

    #[test]
    fn test_default_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(300));
    }

    #[test]
    fn test_retryable_statuses() {
        for code in [408, 429, 500, 502, 503, 504] {
            assert!(is_retryable_status(StatusCode::from_u16(code).unwrap()), "{code}");
        }
        for code in [400, 401, 403, 404, 413, 501] {
            assert!(!is_retryable_status(StatusCode::from_u16(code).unwrap()), "{code}");
        }
    }

    #[test]
    fn test_probe_classification() {
        assert_eq!(classify_probe(StatusCode::OK), HealthStatus::Healthy);
        assert_eq!(classify_probe(StatusCode::METHOD_NOT_ALLOWED), HealthStatus::Healthy);
        assert_eq!(
            classify_probe(StatusCode::FORBIDDEN),
            HealthStatus::Unauthorized(403)
        );
        assert_eq!(
            classify_probe(StatusCode::SERVICE_UNAVAILABLE),
            HealthStatus::Unavailable(503)
        );
    }

    #[tokio::test]
    async fn test_forward_sends_headers_and_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", RAW_PATH)
            .match_header("authorization", "Splunk secret-token")
            .match_header("content-type", "application/json")
            .match_header("x-splunk-sourcetype", "zpa:user-activity")
            .match_header("content-encoding", Matcher::Missing)
            .match_body(r#"{"a":1}"#)
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let forwarder = Forwarder::new("ua", &hec(&server)).unwrap();
        let outcome = forwarder
            .forward(Bytes::from_static(br#"{"a":1}"#), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.status, StatusCode::OK);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_forward_gzip_header() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", RAW_PATH)
            .match_header("content-encoding", "gzip")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let mut config = hec(&server);
        config.gzip = true;
        let forwarder = Forwarder::new("ua", &config).unwrap();
        assert!(forwarder
            .forward(Bytes::from_static(br#"{"a":1}"#), &CancellationToken::new())
            .await
            .is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_no_source_type_header_when_unset() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", RAW_PATH)
            .match_header("x-splunk-sourcetype", Matcher::Missing)
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let mut config = hec(&server);
        config.source_type = None;
        let forwarder = Forwarder::new("ua", &config).unwrap();
        let outcome = forwarder
            .forward(Bytes::from_static(b"1"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, StatusCode::NO_CONTENT);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_bad_request_is_terminal_after_one_attempt() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", RAW_PATH)
            .with_status(400)
            .expect(1)
            .create_async()
            .await;

        let forwarder = Forwarder::new("ua", &hec(&server)).unwrap();
        let err = forwarder
            .forward(Bytes::from_static(b"{}"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "terminal");
        assert_eq!(err.attempts(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_persistent_503_exhausts_retries() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", RAW_PATH)
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let forwarder = Forwarder::new("ua", &hec(&server)).unwrap();
        let started = Instant::now();
        let err = forwarder
            .forward(Bytes::from_static(b"{}"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "forward_exhausted");
        assert_eq!(err.attempts(), 3);
        assert!(started.elapsed() >= Duration::from_millis(400));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_transport_error_is_retried() {
        // nothing listens on port 1
        let url = Url::parse("http://127.0.0.1:1/services/collector/raw").unwrap();
        let mut config = HecConfig::new(url, "t");
        config.timeout = Duration::from_secs(2);
        let forwarder = Forwarder::new("ua", &config).unwrap().with_retry_policy(RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            multiplier: 1,
        });
        let err = forwarder
            .forward(Bytes::from_static(b"{}"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "forward_exhausted");
        assert_eq!(err.attempts(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", RAW_PATH)
            .with_status(503)
            .create_async()
            .await;

        let forwarder = Forwarder::new("ua", &hec(&server))
            .unwrap()
            .with_retry_policy(RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_secs(10),
                multiplier: 1,
            });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = forwarder
            .forward(Bytes::from_static(b"{}"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
        assert_eq!(err.attempts(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_already_cancelled_sends_nothing() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", RAW_PATH)
            .with_status(200)
            .expect(0)
            .create_async()
            .await;

        let forwarder = Forwarder::new("ua", &hec(&server)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = forwarder
            .forward(Bytes::from_static(b"{}"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_health_check_statuses() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", RAW_PATH)
            .match_header("authorization", "Splunk secret-token")
            .with_status(403)
            .create_async()
            .await;

        let forwarder = Forwarder::new("ua", &hec(&server)).unwrap();
        assert_eq!(forwarder.health_check().await, HealthStatus::Unauthorized(403));
    }

    #[tokio::test]
    async fn test_health_check_unreachable() {
        let url = Url::parse("http://127.0.0.1:1/services/collector/raw").unwrap();
        let forwarder = Forwarder::new("ua", &HecConfig::new(url, "t")).unwrap();
        assert!(matches!(
            forwarder.health_check().await,
            HealthStatus::Unreachable(_)
        ));
    }

    #[test]
    fn test_invalid_token_rejected() {
        let url = Url::parse("http://127.0.0.1:8088/raw").unwrap();
        let err = Forwarder::new("ua", &HecConfig::new(url, "bad\ntoken")).unwrap_err();
        assert!(matches!(err, RelayError::HttpClient { .. }));
    }
}
