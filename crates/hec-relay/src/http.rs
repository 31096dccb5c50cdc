// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client construction for the collector leg.

use core::time::Duration;

/// Idle pooled connections are closed after this long.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// TCP keep-alive probe interval, detects collectors that vanished without a FIN.
const TCP_KEEPALIVE: Duration = Duration::from_secs(120);

/// Builds the pooled client a forwarder reuses for every request.
///
/// Requests are plain HTTP/1.1; TLS is negotiated when the collector URL is `https`, with
/// certificates verified against the bundled web PKI roots. `HTTPS_PROXY`/`HTTP_PROXY` from
/// the environment are honoured by reqwest itself.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .pool_idle_timeout(Some(POOL_IDLE_TIMEOUT))
        .tcp_keepalive(Some(TCP_KEEPALIVE))
        .http1_only()
        .user_agent(concat!("hec-relay/", env!("CARGO_PKG_VERSION")))
        .build()
}
