// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `smoke-test`: probe the collector of every listener once and report.

use std::fmt;

use crate::config::Config;
use crate::forwarder::Forwarder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmokeResult {
    Passed,
    Failed(String),
    /// The listener has no collector configured.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeReport {
    pub results: Vec<(String, SmokeResult)>,
}

impl SmokeReport {
    /// At least one listener was probed and every probed listener passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        let mut tested = self
            .results
            .iter()
            .filter(|(_, result)| *result != SmokeResult::Skipped)
            .peekable();
        tested.peek().is_some() && tested.all(|(_, result)| *result == SmokeResult::Passed)
    }
}

impl fmt::Display for SmokeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (listener, result) in &self.results {
            match result {
                SmokeResult::Passed => writeln!(f, "{listener}: ok")?,
                SmokeResult::Failed(reason) => writeln!(f, "{listener}: FAILED ({reason})")?,
                SmokeResult::Skipped => writeln!(f, "{listener}: skipped (no HEC)")?,
            }
        }
        Ok(())
    }
}

pub async fn run(config: &Config) -> SmokeReport {
    let mut results = Vec::with_capacity(config.listeners.len());
    for listener in &config.listeners {
        let result = match &listener.hec {
            None => SmokeResult::Skipped,
            Some(hec) => match Forwarder::new(&listener.name, hec) {
                Err(e) => SmokeResult::Failed(e.to_string()),
                Ok(forwarder) => {
                    let status = forwarder.health_check().await;
                    if status.is_healthy() {
                        SmokeResult::Passed
                    } else {
                        SmokeResult::Failed(status.to_string())
                    }
                }
            },
        };
        results.push((listener.name.clone(), result));
    }
    SmokeReport { results }
}
