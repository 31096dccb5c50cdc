// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hand-off of stored lines to a listener's forwarder.
//!
//! Inline dispatch forwards on the connection task, so forwards keep line order and the
//! retry budget bounds how long ingestion pauses. Queued dispatch feeds one worker per
//! listener through a bounded channel and drops lines when it is full.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::ForwardError;
use crate::forwarder::Forwarder;
use crate::stats::{incr, ListenerStats};

#[derive(Debug, Clone)]
enum Mode {
    Inline(Arc<Forwarder>),
    Queued(mpsc::Sender<Bytes>),
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    mode: Mode,
    stats: Arc<ListenerStats>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Forwards on the caller's task. `cancel` aborts in-flight retries.
    #[must_use]
    pub fn inline(
        forwarder: Arc<Forwarder>,
        stats: Arc<ListenerStats>,
        cancel: CancellationToken,
    ) -> Self {
        Dispatcher {
            mode: Mode::Inline(forwarder),
            stats,
            cancel,
        }
    }

    /// Spawns the listener's forward worker. The worker exits once every clone of the
    /// returned dispatcher is dropped and the queue is empty.
    #[must_use]
    pub fn queued(
        forwarder: Arc<Forwarder>,
        depth: usize,
        stats: Arc<ListenerStats>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Bytes>(depth.max(1));
        let worker = {
            let stats = Arc::clone(&stats);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    forward_and_record(&forwarder, line, &stats, &cancel).await;
                }
                debug!(listener = forwarder.listener(), "Forward worker stopped");
            })
        };
        (
            Dispatcher {
                mode: Mode::Queued(tx),
                stats,
                cancel,
            },
            worker,
        )
    }

    pub async fn dispatch(&self, line: Bytes) {
        match &self.mode {
            Mode::Inline(forwarder) => {
                forward_and_record(forwarder, line, &self.stats, &self.cancel).await;
            }
            Mode::Queued(tx) => match tx.try_send(line) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    incr(&self.stats.forwards_dropped);
                    warn!("Forward queue full, line stored but not forwarded");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    incr(&self.stats.forwards_dropped);
                    warn!("Forward worker is gone, line stored but not forwarded");
                }
            },
        }
    }
}

async fn forward_and_record(
    forwarder: &Forwarder,
    line: Bytes,
    stats: &ListenerStats,
    cancel: &CancellationToken,
) {
    match forwarder.forward(line, cancel).await {
        Ok(outcome) => {
            incr(&stats.forwards_ok);
            debug!(
                attempts = outcome.attempts,
                status = outcome.status.as_u16(),
                "Forwarded line"
            );
        }
        Err(ForwardError::Cancelled { attempts }) => {
            debug!(attempts, "Forward cancelled during shutdown");
        }
        Err(e) => {
            incr(&stats.forwards_failed);
            warn!(
                kind = e.kind(),
                attempts = e.attempts(),
                "Failed to forward line, it remains in the day file: {}",
                e
            );
        }
    }
}
