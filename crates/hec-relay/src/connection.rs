// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-connection ingestion: admission, optional TLS, then read, validate, store, forward.
//!
//! A line is committed once the day file append succeeds. Forwarding happens only after that
//! and its outcome never feeds back into storage.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, trace, warn, Instrument};

use crate::acl::Acl;
use crate::dispatch::Dispatcher;
use crate::framing::{LineReader, ReadStatus};
use crate::json::{is_valid_json, truncate};
use crate::stats::{incr, ListenerStats};
use crate::storage::StorageWriter;

/// Bytes of a rejected line included in log messages.
pub const PREVIEW_BYTES: usize = 256;
/// Consecutive storage failures after which the connection is closed.
pub const MAX_CONSECUTIVE_STORAGE_FAILURES: u32 = 5;
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Everything the connections of one listener share.
pub struct ConnectionContext {
    pub listener: String,
    pub acl: Acl,
    pub tls: Option<TlsAcceptor>,
    pub max_line_bytes: usize,
    pub storage: Arc<StorageWriter>,
    pub dispatcher: Option<Dispatcher>,
    pub stats: Arc<ListenerStats>,
    /// Stops reading once the lines already received are handled.
    pub shutdown: CancellationToken,
}

/// Runs one accepted socket to completion. The socket is closed when this returns.
pub async fn handle_connection(ctx: Arc<ConnectionContext>, stream: TcpStream, peer: SocketAddr) {
    let span = info_span!("connection", listener = %ctx.listener, peer = %peer);
    async move {
        if !ctx.acl.admit(&peer) {
            incr(&ctx.stats.connections_denied);
            debug!("Connection denied by allowed_cidrs");
            return;
        }
        incr(&ctx.stats.connections_accepted);
        debug!("Connection accepted");

        match &ctx.tls {
            None => read_lines(&ctx, stream).await,
            Some(acceptor) => {
                match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(tls_stream)) => read_lines(&ctx, tls_stream).await,
                    Ok(Err(e)) => {
                        incr(&ctx.stats.tls_failures);
                        warn!("TLS handshake failed: {}", e);
                    }
                    Err(_) => {
                        incr(&ctx.stats.tls_failures);
                        warn!(
                            "TLS handshake did not complete within {}s",
                            TLS_HANDSHAKE_TIMEOUT.as_secs()
                        );
                    }
                }
            }
        }
    }
    .instrument(span)
    .await;
}

/// The read loop over an established (plain or TLS) stream.
pub async fn read_lines<S>(ctx: &ConnectionContext, stream: S)
where
    S: AsyncRead + Unpin,
{
    let mut reader = LineReader::new(
        BufReader::with_capacity(READ_BUFFER_BYTES, stream),
        ctx.max_line_bytes,
    );
    let mut line = Vec::new();
    let mut storage_failures = 0u32;
    let mut draining = false;

    loop {
        let status = if draining {
            if reader.is_mid_line() {
                // finish the line already started; the listener's force abort bounds this
                reader.read_line(&mut line).await
            } else {
                match tokio::time::timeout(Duration::ZERO, reader.read_line(&mut line)).await {
                    Ok(status) => status,
                    Err(_) if reader.is_mid_line() => continue,
                    Err(_) => {
                        debug!("Received lines drained, closing connection");
                        break;
                    }
                }
            }
        } else {
            tokio::select! {
                biased;
                () = ctx.shutdown.cancelled() => {
                    debug!("Shutdown requested, draining received lines");
                    draining = true;
                    continue;
                }
                status = reader.read_line(&mut line) => status,
            }
        };

        match status {
            ReadStatus::Line if line.is_empty() => continue,
            ReadStatus::Line => {
                if !is_valid_json(&line) {
                    incr(&ctx.stats.lines_invalid);
                    warn!(
                        "Dropping line that is not valid JSON: {}",
                        truncate(&line, PREVIEW_BYTES)
                    );
                    continue;
                }

                if let Err(e) = ctx.storage.write(&line) {
                    incr(&ctx.stats.storage_failures);
                    storage_failures += 1;
                    error!("Failed to store line, dropping it: {}", e);
                    if storage_failures >= MAX_CONSECUTIVE_STORAGE_FAILURES {
                        error!(
                            "Closing connection after {} consecutive storage failures",
                            storage_failures
                        );
                        break;
                    }
                    continue;
                }
                storage_failures = 0;
                incr(&ctx.stats.lines_stored);
                trace!(bytes = line.len(), "Stored line");

                if let Some(dispatcher) = &ctx.dispatcher {
                    dispatcher.dispatch(Bytes::copy_from_slice(&line)).await;
                }
            }
            ReadStatus::OverLimit { length } => {
                incr(&ctx.stats.lines_oversized);
                warn!(
                    "Dropping line of {} bytes, exceeds max_line_bytes {}: {}",
                    length,
                    reader.max_bytes(),
                    truncate(&line, PREVIEW_BYTES)
                );
            }
            ReadStatus::Eof => {
                debug!("Connection closed by peer");
                break;
            }
            ReadStatus::Io(e) => {
                warn!("Read failed, closing connection: {}", e);
                break;
            }
        }
    }
}
