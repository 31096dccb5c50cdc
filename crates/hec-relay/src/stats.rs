// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-listener counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ListenerStats {
    pub connections_accepted: AtomicU64,
    pub connections_denied: AtomicU64,
    pub tls_failures: AtomicU64,
    pub lines_stored: AtomicU64,
    pub lines_invalid: AtomicU64,
    pub lines_oversized: AtomicU64,
    pub storage_failures: AtomicU64,
    pub forwards_ok: AtomicU64,
    pub forwards_failed: AtomicU64,
    pub forwards_dropped: AtomicU64,
}

/// Point-in-time copy of [`ListenerStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_denied: u64,
    pub tls_failures: u64,
    pub lines_stored: u64,
    pub lines_invalid: u64,
    pub lines_oversized: u64,
    pub storage_failures: u64,
    pub forwards_ok: u64,
    pub forwards_failed: u64,
    pub forwards_dropped: u64,
}

pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl ListenerStats {
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            connections_accepted: load(&self.connections_accepted),
            connections_denied: load(&self.connections_denied),
            tls_failures: load(&self.tls_failures),
            lines_stored: load(&self.lines_stored),
            lines_invalid: load(&self.lines_invalid),
            lines_oversized: load(&self.lines_oversized),
            storage_failures: load(&self.storage_failures),
            forwards_ok: load(&self.forwards_ok),
            forwards_failed: load(&self.forwards_failed),
            forwards_dropped: load(&self.forwards_dropped),
        }
    }
}
