// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error kinds shared across the relay.
//!
//! Line-scoped problems (framing, JSON validation) are not errors here: the connection
//! handler logs them and moves on. What remains are the errors that cross a module boundary.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use reqwest::StatusCode;

/// Invalid or incomplete configuration. Always fatal before any listener binds.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("At least one listener must be configured")]
    NoListeners,

    #[error("Listener #{index}: missing required field '{field}'")]
    MissingField { index: usize, field: &'static str },

    #[error("Listener name '{0}' is used more than once")]
    DuplicateName(String),

    #[error(
        "Listeners '{first}' and '{second}' write to the same day files ({prefix} in {})",
        .dir.display()
    )]
    DuplicateOutput {
        first: String,
        second: String,
        dir: PathBuf,
        prefix: String,
    },

    #[error("Listener '{listener}': invalid {field} '{value}': {reason}")]
    InvalidValue {
        listener: String,
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid CIDR '{0}'")]
    InvalidCidr(String),

    #[error("Listener '{listener}': unknown log_type '{value}'")]
    UnknownLogType { listener: String, value: String },

    #[error("Listener '{listener}': HEC is half-specified, both hec_url and hec_token are required")]
    HalfSpecifiedHec { listener: String },

    #[error("Listener '{listener}': splunk.source_type is required when HEC forwarding is configured")]
    MissingSourceType { listener: String },

    #[error("Listener '{listener}': TLS requires both cert_file and key_file")]
    HalfSpecifiedTls { listener: String },

    #[error("Invalid health_check_addr '{0}'")]
    InvalidHealthAddr(String),
}

/// Failure of the day-file writer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage writer is closed")]
    Closed,

    #[error("Failed to create output directory {}: {source}", .path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Failed to open day file {}: {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("Failed to append to {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("Storage writer lock poisoned")]
    Poisoned,
}

/// Terminal outcome of a `Forwarder::forward` call.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// Every attempt failed with a retryable condition.
    #[error("Gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    /// The collector answered with a status that must not be retried.
    #[error("Collector rejected the event with status {status} after {attempts} attempt(s)")]
    Terminal { status: StatusCode, attempts: u32 },

    /// The caller's cancellation token fired while sending or waiting.
    #[error("Forwarding cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    /// The request body could not be prepared (compression failure).
    #[error("Failed to prepare payload: {0}")]
    Payload(String),
}

impl ForwardError {
    /// Stable classification used in log lines.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::Exhausted { .. } => "forward_exhausted",
            ForwardError::Terminal { .. } => "terminal",
            ForwardError::Cancelled { .. } => "cancelled",
            ForwardError::Payload(_) => "payload",
        }
    }

    /// Number of HTTP attempts that were made before giving up.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            ForwardError::Exhausted { attempts, .. }
            | ForwardError::Terminal { attempts, .. }
            | ForwardError::Cancelled { attempts } => *attempts,
            ForwardError::Payload(_) => 0,
        }
    }
}

/// Process-level failures surfaced by the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Listener '{listener}': failed to bind {addr}: {source}")]
    Bind {
        listener: String,
        addr: SocketAddr,
        source: io::Error,
    },

    #[error("Listener '{listener}': accept failed: {source}")]
    Accept { listener: String, source: io::Error },

    #[error("Listener '{listener}': TLS setup failed: {reason}")]
    Tls { listener: String, reason: String },

    #[error("Listener '{listener}': failed to build HEC client: {reason}")]
    HttpClient { listener: String, reason: String },

    #[error("Health check server failed to bind {addr}: {source}")]
    HealthBind { addr: SocketAddr, source: io::Error },

    #[error("No listener could be started")]
    NoListenerStarted,

    #[error("All listeners terminated unexpectedly")]
    AllListenersLost,
}

impl RelayError {
    /// Process exit code for this error: 1 for configuration/startup, 2 for runtime loss.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            RelayError::AllListenersLost => 2,
            _ => 1,
        }
    }
}
