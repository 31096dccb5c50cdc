// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Newline framing with a hard per-line byte ceiling.
//!
//! Producers keep sockets open for days, so a single runaway line must never be buffered in
//! full: once a line exceeds the ceiling the reader stops accumulating, skips ahead to the
//! next `\n` and reports the line as over-limit.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Outcome of one [`LineReader::read_line`] call.
#[derive(Debug)]
pub enum ReadStatus {
    /// A complete line is in the caller's buffer (possibly empty).
    Line,
    /// The stream ended on a line boundary; the buffer is empty.
    Eof,
    /// The line exceeded the ceiling and was skipped. The buffer holds its first
    /// `max_bytes` bytes for diagnostics only.
    OverLimit { length: usize },
    /// The underlying read failed; the stream should be abandoned.
    Io(io::Error),
}

/// Reads `\n`-terminated lines from a buffered async stream.
pub struct LineReader<R> {
    inner: R,
    max_bytes: usize,
    /// Bytes of the current line seen so far, including any dropped past the ceiling.
    length: usize,
    mid_line: bool,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    #[must_use]
    pub fn new(inner: R, max_bytes: usize) -> Self {
        LineReader {
            inner,
            max_bytes: max_bytes.max(1),
            length: 0,
            mid_line: false,
        }
    }

    #[must_use]
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// True once part of a line has been consumed but its terminator has not.
    #[must_use]
    pub fn is_mid_line(&self) -> bool {
        self.mid_line
    }

    /// Reads the next line into `line`, without its terminator.
    ///
    /// A trailing line without `\n` at end of stream is returned as [`ReadStatus::Line`]; the
    /// following call reports [`ReadStatus::Eof`]. After [`ReadStatus::OverLimit`] the stream
    /// is positioned at the start of the next line.
    ///
    /// Cancel safe: progress on a partially read line is kept in the reader and in `line`, so
    /// a dropped call resumes where it stopped as long as the same buffer is passed back in.
    /// `line` is cleared only when a new line starts.
    pub async fn read_line(&mut self, line: &mut Vec<u8>) -> ReadStatus {
        if !self.mid_line {
            line.clear();
            self.length = 0;
        }

        loop {
            let available = match self.inner.fill_buf().await {
                Ok(available) => available,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.mid_line = false;
                    return ReadStatus::Io(e);
                }
            };

            if available.is_empty() {
                let had_bytes = std::mem::take(&mut self.mid_line);
                return if self.length > self.max_bytes {
                    ReadStatus::OverLimit {
                        length: self.length,
                    }
                } else if had_bytes {
                    ReadStatus::Line
                } else {
                    ReadStatus::Eof
                };
            }
            self.mid_line = true;

            let (chunk_len, consumed, complete) = match memchr::memchr(b'\n', available) {
                Some(pos) => (pos, pos + 1, true),
                None => (available.len(), available.len(), false),
            };

            // keep accumulating only while under the ceiling; beyond it the bytes are counted
            // and dropped
            if self.length <= self.max_bytes {
                let room = self.max_bytes - self.length;
                line.extend_from_slice(&available[..chunk_len.min(room)]);
            }
            self.length = self.length.saturating_add(chunk_len);
            self.inner.consume(consumed);

            if complete {
                self.mid_line = false;
                return if self.length > self.max_bytes {
                    ReadStatus::OverLimit {
                        length: self.length,
                    }
                } else {
                    ReadStatus::Line
                };
            }
        }
    }
}
