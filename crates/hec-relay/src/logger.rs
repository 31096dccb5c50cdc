// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line format: `RELAY | LEVEL | span{fields}: message fields`.
//!
//! ```text
//! RELAY | INFO | Listening on 0.0.0.0:20001 listener=user-activity tls=false forwarding=true
//! RELAY | WARN | connection{listener=user-activity peer=10.1.2.3:50112}: Dropping line that is not valid JSON: not json
//! ```

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Dependencies that are too chatty at debug level.
const QUIET_TARGETS: &str = "h2=off,hyper=off,hyper_util=off,rustls=off,reqwest=off";

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "RELAY | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Builds the filter for `level` (`info`, `debug`, or a full directive list).
pub fn env_filter(level: &str) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    EnvFilter::try_new(format!("{QUIET_TARGETS},{}", level.trim().to_lowercase()))
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(level: &str) -> Result<(), String> {
    let filter = env_filter(level).map_err(|e| format!("invalid log_level '{level}': {e}"))?;
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(false)
        .without_time()
        .event_format(Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber).map_err(|e| e.to_string())
}
