//! Daemon log formatting and file handling on top of `tracing`.
//!
//! Every record renders as one fixed-format line:
//!
//! ```text
//! [YYYY-MM-DD HH:MM:SS] <5-char pid> <13-char label> <tabs*indent> <message>
//! ```
//!
//! The label is the last segment of the record's target; an `indent` field
//! on the record controls the tab run. When a log file is configured, a
//! column header is written exactly once per file open, and the path is
//! re-examined on multiples of 5 wall-clock minutes so an externally
//! rotated or removed file is reopened (with a fresh header) instead of
//! being written through a stale handle.

use std::fs::{File, OpenOptions};
use std::io;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;
use crate::error::{Error, Result};

/// Column header, written once per log-file open.
const HEADER: &str = "\nDate                  Pid   Label         Message\n";

/// The log path is re-examined when the wall clock crosses a multiple of
/// this many seconds.
const PATH_POLL_SECS: i64 = 300;

/// Install the global subscriber per the logging configuration. Safe to
/// call when a subscriber is already installed (the existing one wins).
///
/// # Errors
///
/// Currently only fails on subscriber installation, which callers may
/// choose to tolerate.
pub(crate) fn init(config: &LogConfig) -> Result<()> {
    let level: tracing::Level = config.level.into();
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let result = match &config.file {
        Some(path) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .event_format(DaemonFormat)
            .with_writer(DaemonLogWriter::new(path.clone()))
            .try_init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .event_format(DaemonFormat)
            .try_init(),
    };
    result.map_err(|e| Error::config(format!("failed to initialize logging: {e}")))
}

/// The fixed daemon line format.
struct DaemonFormat;

impl<S, N> FormatEvent<S, N> for DaemonFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut line = LineVisitor::default();
        event.record(&mut line);
        let label = event
            .metadata()
            .target()
            .rsplit("::")
            .next()
            .unwrap_or("daemon");

        write!(
            writer,
            "[{}] {:>5} {:<13.13} {}{}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            std::process::id(),
            label,
            "\t".repeat(line.indent),
            line.message
        )?;
        if !line.extra.is_empty() {
            write!(writer, " {}", line.extra.join(" "))?;
        }
        writeln!(writer)
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    indent: usize,
    extra: Vec<String>,
}

impl Visit for LineVisitor {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "indent" {
            self.indent = usize::try_from(value).unwrap_or(0);
        } else {
            self.extra.push(format!("{}={value}", field.name()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == "indent" {
            self.indent = usize::try_from(value).unwrap_or(0);
        } else {
            self.extra.push(format!("{}={value}", field.name()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.extra.push(format!("{}={value:?}", field.name()));
        }
    }
}

struct WriterInner {
    path: PathBuf,
    file: Option<File>,
    last_poll_slot: i64,
    #[cfg(unix)]
    inode: u64,
}

impl WriterInner {
    /// On 5-minute boundaries, drop the handle when the file underneath it
    /// changed identity or disappeared; the next write reopens.
    fn poll_path(&mut self) {
        let slot = Local::now().timestamp() / PATH_POLL_SECS;
        if slot == self.last_poll_slot {
            return;
        }
        self.last_poll_slot = slot;
        if self.file.is_none() {
            return;
        }
        match std::fs::metadata(&self.path) {
            Ok(meta) => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::MetadataExt;
                    if meta.ino() != self.inode {
                        self.file = None;
                    }
                }
                #[cfg(not(unix))]
                let _ = meta;
            }
            Err(_) => self.file = None,
        }
    }

    fn ensure_open(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            file.write_all(HEADER.as_bytes())?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::MetadataExt;
                self.inode = file.metadata()?.ino();
            }
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("log file unavailable"))
    }
}

/// Reopening, header-writing log file writer.
#[derive(Clone)]
pub(crate) struct DaemonLogWriter {
    inner: Arc<Mutex<WriterInner>>,
}

impl DaemonLogWriter {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WriterInner {
                path,
                file: None,
                last_poll_slot: Local::now().timestamp() / PATH_POLL_SECS,
                #[cfg(unix)]
                inode: 0,
            })),
        }
    }
}

pub(crate) struct LogWriterGuard {
    inner: Arc<Mutex<WriterInner>>,
}

impl io::Write for LogWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        inner.poll_path();
        inner.ensure_open()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self.inner.lock();
        match inner.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DaemonLogWriter {
    type Writer = LogWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[derive(Clone, Default)]
    struct Capture {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buffer.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Self;
        fn make_writer(&'a self) -> Self {
            self.clone()
        }
    }

    #[test]
    fn test_line_format() {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::fmt()
            .event_format(DaemonFormat)
            .with_writer(capture.clone())
            .with_max_level(tracing::Level::INFO)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(indent = 2, "lease acquired");
        });

        let bytes = capture.buffer.lock().clone();
        let line = String::from_utf8(bytes).unwrap();
        assert!(line.starts_with('['), "date column first: {line}");
        assert_eq!(line.as_bytes()[20], b']');
        assert!(line.contains(&format!("{:>5}", std::process::id())));
        // Label is the last target segment, padded to 13 columns.
        assert!(line.contains(" tests         "), "label column: {line}");
        assert!(line.ends_with("\t\tlease acquired\n"), "message last: {line}");
    }

    #[test]
    fn test_extra_fields_follow_the_message() {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::fmt()
            .event_format(DaemonFormat)
            .with_writer(capture.clone())
            .with_max_level(tracing::Level::INFO)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(pid = 42_u64, "child exited");
        });

        let bytes = capture.buffer.lock().clone();
        let line = String::from_utf8(bytes).unwrap();
        assert!(line.contains("child exited pid=42"), "{line}");
    }

    #[test]
    fn test_header_written_once_per_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        let writer = DaemonLogWriter::new(path.clone());

        let mut guard = writer.make_writer();
        guard.write_all(b"first line\n").unwrap();
        guard.write_all(b"second line\n").unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body.matches("Date").count(), 1);
        assert!(body.contains("first line\nsecond line\n"));
    }

    #[test]
    fn test_reopen_after_rotation_writes_new_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        let writer = DaemonLogWriter::new(path.clone());

        let mut guard = writer.make_writer();
        guard.write_all(b"before rotation\n").unwrap();

        // Rotate the file away and force the next poll boundary.
        std::fs::rename(&path, dir.path().join("daemon.log.1")).unwrap();
        writer.inner.lock().last_poll_slot = -1;
        guard.write_all(b"after rotation\n").unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body.matches("Date").count(), 1);
        assert!(body.contains("after rotation"));
        assert!(!body.contains("before rotation"));
    }
}
