// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector health: cached probe results and the HTTP endpoint that reports them.
//!
//! A background prober calls [`Forwarder::health_check`] for every listener with a collector
//! configured and stores the result in the [`HealthRegistry`]. `GET /health` answers 200 only
//! when every entry is healthy; a listener that has not been probed yet counts as unhealthy.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::RelayError;
use crate::forwarder::Forwarder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Not probed yet.
    Unknown,
    Healthy,
    Unauthorized(u16),
    Unavailable(u16),
    Unreachable(String),
}

impl HealthStatus {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Unknown => f.write_str("unknown"),
            HealthStatus::Healthy => f.write_str("ok"),
            HealthStatus::Unauthorized(code) => write!(f, "unauthorized ({code})"),
            HealthStatus::Unavailable(code) => write!(f, "unavailable ({code})"),
            HealthStatus::Unreachable(reason) => write!(f, "unreachable: {reason}"),
        }
    }
}

/// Latest probe result per listener.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    entries: RwLock<BTreeMap<String, HealthStatus>>,
}

impl HealthRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(listener.to_string())
            .or_insert(HealthStatus::Unknown);
    }

    pub fn record(&self, listener: &str, status: HealthStatus) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(listener.to_string(), status);
    }

    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, HealthStatus> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// True when every registered listener is healthy, or none is registered.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .all(HealthStatus::is_healthy)
    }
}

/// Probes every forwarder now and then every `interval` until `cancel` fires.
pub async fn run_prober(
    forwarders: Vec<Arc<Forwarder>>,
    registry: Arc<HealthRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    for forwarder in &forwarders {
        registry.register(forwarder.listener());
    }
    loop {
        for forwarder in &forwarders {
            let status = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                status = forwarder.health_check() => status,
            };
            if !status.is_healthy() {
                warn!(
                    listener = forwarder.listener(),
                    "Collector health check failed: {}", status
                );
            } else {
                debug!(listener = forwarder.listener(), "Collector healthy");
            }
            registry.record(forwarder.listener(), status);
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    listeners: BTreeMap<String, String>,
}

fn router(registry: Arc<HealthRegistry>) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/health", get(health_handler))
        .with_state(registry)
}

async fn health_handler(
    State(registry): State<Arc<HealthRegistry>>,
) -> (StatusCode, Json<HealthReport>) {
    let listeners = registry
        .snapshot()
        .into_iter()
        .map(|(name, status)| (name, status.to_string()))
        .collect();
    if registry.is_healthy() {
        (
            StatusCode::OK,
            Json(HealthReport {
                status: "ok",
                listeners,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthReport {
                status: "degraded",
                listeners,
            }),
        )
    }
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, RelayError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| RelayError::HealthBind { addr, source })
}

/// Serves the health endpoint on an already bound socket until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<HealthRegistry>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Health check server listening on {}", addr);
    }
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}
