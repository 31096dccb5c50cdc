// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Annotated configuration printed by `relay template`.

pub const TEMPLATE: &str = include_str!("template.yaml");
