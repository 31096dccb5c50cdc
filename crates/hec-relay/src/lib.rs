// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # hec-relay
//!
//! Terminates long-lived TCP (optionally TLS) streams of newline-delimited JSON, appends every
//! valid line to a day-rotated local file and, when configured, forwards it to an HTTP event
//! collector with bounded retry.
//!
//! ```text
//!  producer ──tcp/tls──> listener ──> connection ──> line reader ──> JSON check
//!                                                                       │
//!                                              day file <── storage <───┘
//!                                                               │
//!                                                               └──> forwarder ──> collector
//! ```
//!
//! - [`config`]: YAML loading and validation
//! - [`relay`]: startup, health server, shutdown
//! - [`listener`] / [`connection`]: accept loop and per-connection pipeline
//! - [`storage`]: day-file writer
//! - [`forwarder`] / [`dispatch`]: collector client and hand-off

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod acl;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod errors;
pub mod forwarder;
pub mod framing;
pub mod health;
pub mod http;
pub mod json;
pub mod listener;
pub mod logger;
pub mod relay;
pub mod smoke;
pub mod stats;
pub mod storage;
pub mod tls;

use std::fmt;

/// `"{version} ({build})"`, as printed by `relay --version`.
pub const VERSION_STRING: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("RELAY_BUILD"), ")");

/// Version and build identifier, fixed at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: &'static str,
    pub build: &'static str,
}

impl BuildInfo {
    #[must_use]
    pub const fn current() -> Self {
        BuildInfo {
            version: env!("CARGO_PKG_VERSION"),
            build: env!("RELAY_BUILD"),
        }
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.version, self.build)
    }
}
