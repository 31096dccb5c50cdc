// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Date-partitioned append-only NDJSON files.
//!
//! One [`StorageWriter`] exists per listener and is shared by all of its connections. Every
//! append takes the writer's mutex, re-checks the UTC date, rotates if it changed and writes
//! `line + "\n"` as one contiguous write, so lines never interleave or straddle two files.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::errors::StorageError;

const DAY_FILE_EXTENSION: &str = "ndjson";

/// Source of "now" for the rotation check.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Counters kept under the writer lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    pub lines_written: u64,
    pub bytes_written: u64,
    pub files_opened: u64,
}

struct DayFile {
    date: String,
    path: PathBuf,
    writer: BufWriter<File>,
}

struct WriterState {
    current: Option<DayFile>,
    closed: bool,
    stats: StorageStats,
}

/// Appends lines to `{prefix}-YYYY-MM-DD.ndjson` in the output directory, rotating at
/// midnight UTC.
pub struct StorageWriter {
    output_dir: PathBuf,
    file_prefix: String,
    clock: Arc<dyn Clock>,
    state: Mutex<WriterState>,
}

impl std::fmt::Debug for StorageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWriter")
            .field("output_dir", &self.output_dir)
            .field("file_prefix", &self.file_prefix)
            .finish_non_exhaustive()
    }
}

impl StorageWriter {
    /// Creates a writer. Nothing touches the filesystem until the first write.
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>, file_prefix: impl Into<String>) -> Self {
        Self::with_clock(output_dir, file_prefix, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(
        output_dir: impl Into<PathBuf>,
        file_prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        StorageWriter {
            output_dir: output_dir.into(),
            file_prefix: file_prefix.into(),
            clock,
            state: Mutex::new(WriterState {
                current: None,
                closed: false,
                stats: StorageStats::default(),
            }),
        }
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Path of the day file for a given `YYYY-MM-DD` date.
    #[must_use]
    pub fn path_for_date(&self, date: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}-{date}.{DAY_FILE_EXTENSION}", self.file_prefix))
    }

    /// Appends `line` followed by `\n` to today's file.
    pub fn write(&self, line: &[u8]) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(StorageError::Closed);
        }

        let today = self.clock.now().format("%Y-%m-%d").to_string();
        let needs_rotation = state
            .current
            .as_ref()
            .map_or(true, |current| current.date != today);
        if needs_rotation {
            self.rotate(&mut state, today)?;
        }

        let Some(current) = state.current.as_mut() else {
            return Err(StorageError::Closed);
        };
        let result = current
            .writer
            .write_all(line)
            .and_then(|()| current.writer.write_all(b"\n"))
            .and_then(|()| current.writer.flush());
        if let Err(source) = result {
            let path = current.path.clone();
            // a failed flush leaves a partial line buffered; discard it with the handle so
            // neither drop nor the next write appends the fragment
            if let Some(failed) = state.current.take() {
                let (_file, _unflushed) = failed.writer.into_parts();
            }
            return Err(StorageError::Write { path, source });
        }

        state.stats.lines_written += 1;
        state.stats.bytes_written += line.len() as u64 + 1;
        Ok(())
    }

    /// Active day file, if one is open.
    #[must_use]
    pub fn current_file(&self) -> Option<PathBuf> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.current.as_ref().map(|current| current.path.clone()))
    }

    #[must_use]
    pub fn stats(&self) -> StorageStats {
        self.state
            .lock()
            .map(|state| state.stats)
            .unwrap_or_default()
    }

    /// Flushes and closes the active file. Later writes fail with [`StorageError::Closed`].
    pub fn close(&self) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state.closed = true;
        if let Some(mut current) = state.current.take() {
            current
                .writer
                .flush()
                .map_err(|source| StorageError::Write {
                    path: current.path.clone(),
                    source,
                })?;
            debug!("Closed day file {}", current.path.display());
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, WriterState>, StorageError> {
        self.state.lock().map_err(|_| StorageError::Poisoned)
    }

    fn rotate(&self, state: &mut WriterState, date: String) -> Result<(), StorageError> {
        if let Some(mut previous) = state.current.take() {
            if let Err(e) = previous.writer.flush() {
                warn!(
                    "Failed to flush {} before rotation: {}",
                    previous.path.display(),
                    e
                );
            }
        }

        create_output_dir(&self.output_dir)?;
        let path = self.path_for_date(&date);
        let file = open_append(&path).map_err(|source| StorageError::Open {
            path: path.clone(),
            source,
        })?;
        info!("Writing to day file {}", path.display());

        state.stats.files_opened += 1;
        state.current = Some(DayFile {
            date,
            path,
            writer: BufWriter::new(file),
        });
        Ok(())
    }
}

fn create_output_dir(dir: &Path) -> Result<(), StorageError> {
    if dir.is_dir() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(dir).map_err(|source| StorageError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })
}

fn open_append(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    options.open(path)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::thread;

    /// Clock that only moves when told to.
    pub(crate) struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        pub(crate) fn at(time: DateTime<Utc>) -> Arc<Self> {
            Arc::new(ManualClock(Mutex::new(time)))
        }

        pub(crate) fn set(&self, time: DateTime<Utc>) {
            *self.0.lock().unwrap() = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_append_reopens_without_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let writer = StorageWriter::with_clock(dir.path(), "zpa", clock);
        let path = dir.path().join("zpa-2024-03-01.ndjson");

        // every write to /dev/full fails with ENOSPC
        std::os::unix::fs::symlink("/dev/full", &path).unwrap();
        let err = writer.write(br#"{"lost":true}"#).unwrap_err();
        assert!(matches!(err, StorageError::Write { .. }), "{err}");
        assert_eq!(writer.current_file(), None);

        fs::remove_file(&path).unwrap();
        writer.write(br#"{"kept":true}"#).unwrap();
        writer.close().unwrap();

        assert_eq!(read(&path), "{\"kept\":true}\n");
        assert_eq!(writer.stats().files_opened, 2);
        assert_eq!(writer.stats().lines_written, 1);
    }

    #[test]
    fn test_appends_lines_with_newline() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let writer = StorageWriter::with_clock(dir.path(), "zpa", clock);

        writer.write(br#"{"a":1}"#).unwrap();
        writer.write(br#"{"b":2}"#).unwrap();

        let path = dir.path().join("zpa-2024-03-01.ndjson");
        assert_eq!(writer.current_file(), Some(path.clone()));
        assert_eq!(read(&path), "{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(
            writer.stats(),
            StorageStats {
                lines_written: 2,
                bytes_written: 16,
                files_opened: 1,
            }
        );
    }

    #[test]
    fn test_no_file_before_first_write() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StorageWriter::new(dir.path().join("out"), "zpa");
        assert_eq!(writer.current_file(), None);
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_creates_nested_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a").join("b");
        let writer = StorageWriter::new(&out, "lss");
        writer.write(b"{}").unwrap();
        assert!(out.is_dir());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let file = writer.current_file().unwrap();
            let mode = fs::metadata(file).unwrap().permissions().mode();
            assert_eq!(mode & 0o022, 0, "day file must not be group/world writable");
        }
    }

    #[test]
    fn test_rotation_at_utc_midnight() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap());
        let writer = StorageWriter::with_clock(dir.path(), "zpa", clock.clone());

        writer.write(br#"{"day":"D"}"#).unwrap();
        clock.set(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 1).unwrap());
        writer.write(br#"{"day":"D+1"}"#).unwrap();

        let first = dir.path().join("zpa-2024-12-31.ndjson");
        let second = dir.path().join("zpa-2025-01-01.ndjson");
        assert_eq!(read(&first), "{\"day\":\"D\"}\n");
        assert_eq!(read(&second), "{\"day\":\"D+1\"}\n");
        assert_eq!(writer.current_file(), Some(second));
        assert_eq!(writer.stats().files_opened, 2);
    }

    #[test]
    fn test_same_day_opens_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        let writer = StorageWriter::with_clock(dir.path(), "zpa", clock.clone());
        for hour in 0..24 {
            clock.set(Utc.with_ymd_and_hms(2024, 6, 1, hour, 30, 0).unwrap());
            writer.write(b"{}").unwrap();
        }
        assert_eq!(writer.stats().files_opened, 1);
        assert_eq!(writer.stats().lines_written, 24);
    }

    #[test]
    fn test_reopening_appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap());
        let path = dir.path().join("zpa-2024-06-01.ndjson");
        fs::write(&path, "{\"old\":true}\n").unwrap();

        let writer = StorageWriter::with_clock(dir.path(), "zpa", clock);
        writer.write(br#"{"new":true}"#).unwrap();
        assert_eq!(read(&path), "{\"old\":true}\n{\"new\":true}\n");
    }

    #[test]
    fn test_write_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StorageWriter::new(dir.path(), "zpa");
        writer.write(b"1").unwrap();
        writer.close().unwrap();
        assert!(matches!(writer.write(b"2"), Err(StorageError::Closed)));
        assert_eq!(writer.current_file(), None);
        // closing twice is harmless
        writer.close().unwrap();
    }

    #[test]
    fn test_concurrent_writers_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(StorageWriter::new(dir.path(), "zpa"));
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let writer = Arc::clone(&writer);
                thread::spawn(move || {
                    for i in 0..200 {
                        let line = format!(r#"{{"thread":{t},"seq":{i},"pad":"{}"}}"#, "x".repeat(64));
                        writer.write(line.as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }

        let content = read(&writer.current_file().unwrap());
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1600);
        for line in &lines {
            assert!(crate::json::is_valid_json(line.as_bytes()), "torn line: {line}");
        }
        // per-thread order survives
        for t in 0..8 {
            let seqs: Vec<u64> = lines
                .iter()
                .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap())
                .filter(|v| v["thread"] == t)
                .map(|v| v["seq"].as_u64().unwrap())
                .collect();
            assert_eq!(seqs, (0..200).collect::<Vec<_>>());
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_unwritable_directory_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "file in the way").unwrap();
        let writer = StorageWriter::new(blocker.join("out"), "zpa");
        assert!(matches!(
            writer.write(b"{}"),
            Err(StorageError::CreateDir { .. })
        ));
    }
}
