// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Injects the build identifier reported by `relay --version`.
//!
//! Release pipelines export `RELAY_BUILD_ID` (commit sha, pipeline number, ...); local builds
//! fall back to `dev`.

use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=RELAY_BUILD_ID");
    let build = env::var("RELAY_BUILD_ID")
        .ok()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| "dev".to_string());
    println!("cargo:rustc-env=RELAY_BUILD={}", build.trim());
}
