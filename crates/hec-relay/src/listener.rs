// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Accept loop for one configured listener.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ListenerConfig;
use crate::connection::{handle_connection, ConnectionContext};
use crate::dispatch::Dispatcher;
use crate::errors::RelayError;
use crate::forwarder::Forwarder;
use crate::stats::ListenerStats;
use crate::storage::StorageWriter;
use crate::tls::build_acceptor;

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
/// Pause after an accept error such as fd exhaustion before accepting again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Owns a bound socket and every connection accepted on it.
pub struct ListenerSupervisor {
    name: String,
    listener: TcpListener,
    context: Arc<ConnectionContext>,
    forward_worker: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
    force: CancellationToken,
    drain_timeout: Duration,
}

impl ListenerSupervisor {
    /// Loads TLS material, binds the socket and wires the forwarder.
    ///
    /// `force` is cancelled by the supervisor itself when its drain window runs out; pass a
    /// child token when several supervisors share one parent.
    pub async fn bind(
        config: &ListenerConfig,
        storage: Arc<StorageWriter>,
        forwarder: Option<Arc<Forwarder>>,
        stats: Arc<ListenerStats>,
        shutdown: CancellationToken,
        force: CancellationToken,
    ) -> Result<Self, RelayError> {
        let tls = config
            .tls
            .as_ref()
            .map(|tls| {
                build_acceptor(tls).map_err(|reason| RelayError::Tls {
                    listener: config.name.clone(),
                    reason,
                })
            })
            .transpose()?;

        let listener =
            TcpListener::bind(config.listen_addr)
                .await
                .map_err(|source| RelayError::Bind {
                    listener: config.name.clone(),
                    addr: config.listen_addr,
                    source,
                })?;

        let (dispatcher, forward_worker) = match forwarder {
            None => (None, None),
            Some(forwarder) if config.forward_queue_depth > 0 => {
                let (dispatcher, worker) = Dispatcher::queued(
                    forwarder,
                    config.forward_queue_depth,
                    Arc::clone(&stats),
                    force.clone(),
                );
                (Some(dispatcher), Some(worker))
            }
            Some(forwarder) => (
                Some(Dispatcher::inline(
                    forwarder,
                    Arc::clone(&stats),
                    force.clone(),
                )),
                None,
            ),
        };

        let local = listener.local_addr().unwrap_or(config.listen_addr);
        info!(
            listener = %config.name,
            tls = config.tls.is_some(),
            forwarding = dispatcher.is_some(),
            "Listening on {}",
            local
        );

        Ok(ListenerSupervisor {
            name: config.name.clone(),
            listener,
            context: Arc::new(ConnectionContext {
                listener: config.name.clone(),
                acl: config.acl.clone(),
                tls,
                max_line_bytes: config.max_line_bytes,
                storage,
                dispatcher,
                stats,
                shutdown: shutdown.clone(),
            }),
            forward_worker,
            shutdown,
            force,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts until shutdown, then drains connections within the drain window.
    pub async fn run(self) -> Result<(), RelayError> {
        let ListenerSupervisor {
            name,
            listener,
            context,
            forward_worker,
            shutdown,
            force,
            drain_timeout,
        } = self;

        let mut connections = JoinSet::new();
        let accept_result = loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break Ok(()),
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    log_join_error(&name, finished);
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(handle_connection(Arc::clone(&context), stream, peer));
                    }
                    Err(e) if is_connection_error(&e) => {
                        debug!(listener = %name, "Accept failed for one connection: {}", e);
                    }
                    Err(e) if is_resource_error(&e) => {
                        warn!(listener = %name, "Accept failed, backing off: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                    Err(e) => {
                        error!(listener = %name, "Accept loop failed: {}", e);
                        break Err(RelayError::Accept { listener: name.clone(), source: e });
                    }
                },
            }
        };
        drop(listener);

        let deadline = Instant::now() + drain_timeout;
        if !connections.is_empty() {
            info!(
                listener = %name,
                "Stopped accepting, draining {} connection(s)",
                connections.len()
            );
        }
        let drained = tokio::time::timeout_at(deadline, async {
            while let Some(finished) = connections.join_next().await {
                log_join_error(&name, finished);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                listener = %name,
                "Drain window elapsed, closing {} remaining connection(s)",
                connections.len()
            );
            force.cancel();
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        let stats = context.stats.snapshot();
        // last reference to the dispatcher: the forward worker sees its queue close
        drop(context);
        if let Some(mut worker) = forward_worker {
            if tokio::time::timeout_at(deadline, &mut worker).await.is_err() {
                warn!(listener = %name, "Forward queue not drained in time, abandoning it");
                force.cancel();
                worker.abort();
            }
        }

        info!(
            listener = %name,
            accepted = stats.connections_accepted,
            denied = stats.connections_denied,
            stored = stats.lines_stored,
            invalid = stats.lines_invalid,
            oversized = stats.lines_oversized,
            forwarded = stats.forwards_ok,
            forward_failed = stats.forwards_failed,
            forward_dropped = stats.forwards_dropped,
            "Listener stopped"
        );
        accept_result
    }
}

fn log_join_error(listener: &str, finished: Result<(), JoinError>) {
    match finished {
        Err(e) if e.is_panic() => {
            error!(listener = %listener, "Connection handler panicked: {:?}", e);
        }
        Ok(()) | Err(_) => {}
    }
}

/// Errors tied to a single incoming connection; the listener itself is fine.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
    )
}

/// EMFILE, ENFILE, ENOBUFS, ENOMEM: wait for resources to free up.
fn is_resource_error(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(23 | 24 | 105 | 12))
}
