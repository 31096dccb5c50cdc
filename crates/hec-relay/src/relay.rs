// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process orchestration: one writer, optional forwarder and supervisor per listener, the
//! optional health server, and signal-driven shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::errors::RelayError;
use crate::forwarder::Forwarder;
use crate::health::{self, HealthRegistry};
use crate::listener::{ListenerSupervisor, DEFAULT_DRAIN_TIMEOUT};
use crate::stats::{ListenerStats, StatsSnapshot};
use crate::storage::StorageWriter;

type SupervisorExit = (String, Result<(), RelayError>);

/// Startup options for a [`Config`].
#[derive(Debug, Clone)]
pub struct Relay {
    config: Config,
    drain_timeout: Duration,
}

struct ListenerRuntime {
    name: String,
    local_addr: SocketAddr,
    storage: Arc<StorageWriter>,
    stats: Arc<ListenerStats>,
}

/// A running relay.
pub struct RelayHandle {
    listeners: Vec<ListenerRuntime>,
    health_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    supervisors: JoinSet<SupervisorExit>,
    background: JoinSet<()>,
}

impl Relay {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Relay {
            config,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    #[must_use]
    pub fn drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Binds every listener and starts serving.
    ///
    /// A listener that fails to bind is logged and skipped; startup fails only when none
    /// could be started, when a collector client cannot be built, or when the health server
    /// cannot bind.
    pub async fn start(self) -> Result<RelayHandle, RelayError> {
        let shutdown = CancellationToken::new();
        let mut supervisors = JoinSet::new();
        let mut listeners = Vec::with_capacity(self.config.listeners.len());
        let mut forwarders = Vec::new();

        for listener_config in &self.config.listeners {
            let forwarder = listener_config
                .hec
                .as_ref()
                .map(|hec| Forwarder::new(&listener_config.name, hec).map(Arc::new))
                .transpose()?;
            let storage = Arc::new(StorageWriter::new(
                &listener_config.output_dir,
                &listener_config.file_prefix,
            ));
            let stats = Arc::new(ListenerStats::default());

            let supervisor = match ListenerSupervisor::bind(
                listener_config,
                Arc::clone(&storage),
                forwarder.clone(),
                Arc::clone(&stats),
                shutdown.clone(),
                CancellationToken::new(),
            )
            .await
            {
                Ok(supervisor) => supervisor.with_drain_timeout(self.drain_timeout),
                Err(e) => {
                    error!("{}", e);
                    continue;
                }
            };

            let local_addr = supervisor
                .local_addr()
                .unwrap_or(listener_config.listen_addr);
            let name = listener_config.name.clone();
            supervisors.spawn(async move {
                let result = supervisor.run().await;
                (name, result)
            });
            if let Some(forwarder) = forwarder {
                forwarders.push(forwarder);
            }
            listeners.push(ListenerRuntime {
                name: listener_config.name.clone(),
                local_addr,
                storage,
                stats,
            });
        }

        if listeners.is_empty() {
            return Err(RelayError::NoListenerStarted);
        }

        let mut background = JoinSet::new();
        let mut health_addr = None;
        if let Some(health_config) = self.config.health {
            let socket = match health::bind(health_config.addr).await {
                Ok(socket) => socket,
                Err(e) => {
                    shutdown.cancel();
                    while supervisors.join_next().await.is_some() {}
                    return Err(e);
                }
            };
            health_addr = socket.local_addr().ok();

            let registry = Arc::new(HealthRegistry::new());
            background.spawn(health::run_prober(
                forwarders,
                Arc::clone(&registry),
                health_config.interval,
                shutdown.clone(),
            ));
            let cancel = shutdown.clone();
            background.spawn(async move {
                if let Err(e) = health::serve(socket, registry, cancel).await {
                    error!("Health check server failed: {}", e);
                }
            });
        }

        info!("Relay started with {} listener(s)", listeners.len());
        Ok(RelayHandle {
            listeners,
            health_addr,
            shutdown,
            supervisors,
            background,
        })
    }
}

impl RelayHandle {
    /// Bound address of a listener, useful when it was configured with port 0.
    #[must_use]
    pub fn listener_addr(&self, name: &str) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|listener| listener.name == name)
            .map(|listener| listener.local_addr)
    }

    #[must_use]
    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health_addr
    }

    #[must_use]
    pub fn stats(&self, name: &str) -> Option<StatsSnapshot> {
        self.listeners
            .iter()
            .find(|listener| listener.name == name)
            .map(|listener| listener.stats.snapshot())
    }

    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serves until `signal` completes, then shuts down.
    ///
    /// Returns [`RelayError::AllListenersLost`] if every supervisor exits before the signal.
    pub async fn run_until<F>(mut self, signal: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(signal);
        loop {
            tokio::select! {
                () = &mut signal => {
                    info!("Termination signal received, shutting down");
                    break;
                }
                Some(exit) = self.supervisors.join_next() => {
                    log_supervisor_exit(exit);
                    if self.supervisors.is_empty() {
                        error!("All listeners terminated");
                        self.shutdown().await;
                        return Err(RelayError::AllListenersLost);
                    }
                }
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Stops accepting, drains connections, stops background tasks and closes every writer.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        while let Some(exit) = self.supervisors.join_next().await {
            log_supervisor_exit(exit);
        }
        while let Some(finished) = self.background.join_next().await {
            if let Err(e) = finished {
                warn!("Background task failed: {}", e);
            }
        }
        for listener in &self.listeners {
            if let Err(e) = listener.storage.close() {
                error!(listener = %listener.name, "Failed to close storage: {}", e);
            }
        }
        info!("Relay stopped");
    }
}

fn log_supervisor_exit(exit: Result<SupervisorExit, JoinError>) {
    match exit {
        Ok((_, Ok(()))) => {}
        Ok((name, Err(e))) => error!(listener = %name, "Listener terminated: {}", e),
        Err(e) => error!("Listener supervisor panicked: {:?}", e),
    }
}

/// Completes on SIGINT or SIGTERM.
pub async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot install SIGTERM handler: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Cannot listen for SIGINT: {}", e);
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {}", e);
        }
    }
}
