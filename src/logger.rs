//! Rotating data log writers.
//!
//! [`SatLogger`] is the single merged sink: producers enqueue
//! `(bytes, timestamp)` and return immediately; a dedicated thread appends
//! `bytes ‖ pack7(timestamp)` to the current file, rotating on UTC day
//! change or after `file_length` of open time. [`CsvLogger`] writes the
//! per-sensor CSV streams (GPS, indexing table) with the same rotation
//! rules, a column-name line and a units line.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Datelike, Utc};
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::protocol::pack7;

/// How long a contended CSV write waits for the lock before dropping.
pub const CSV_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// Generate a non-colliding `<prefix>_YYYYMMDD_HHMMSS[_N].<ext>` path.
fn unique_log_path(dir: &Path, prefix: &str, ts: DateTime<Utc>, ext: &str) -> PathBuf {
    let stamp = ts.format("%Y%m%d_%H%M%S");
    let mut path = dir.join(format!("{prefix}_{stamp}.{ext}"));
    let mut suffix = 0;
    while path.exists() {
        path = dir.join(format!("{prefix}_{stamp}_{suffix}.{ext}"));
        suffix += 1;
    }
    path
}

/// Configuration of the merged binary sink.
#[derive(Debug, Clone)]
pub struct SatLoggerConfig {
    pub filename_prefix: String,
    pub filename_ext: String,
    pub path: PathBuf,
    /// Maximum open time of one file.
    pub file_length: Duration,
}

impl Default for SatLoggerConfig {
    fn default() -> Self {
        Self {
            filename_prefix: "pySAS".into(),
            filename_ext: "raw".into(),
            path: PathBuf::from("data"),
            file_length: Duration::from_secs(60 * 60),
        }
    }
}

enum SinkCommand {
    Write(Bytes, DateTime<Utc>),
    CloseFile,
    Sync(mpsc::Sender<()>),
    Shutdown,
}

/// Thread-safe merged frame sink in the instrument's native format.
pub struct SatLogger {
    tx: mpsc::Sender<SinkCommand>,
    depth: Arc<AtomicUsize>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SatLogger {
    pub fn new(cfg: SatLoggerConfig) -> SatLogger {
        let (tx, rx) = mpsc::channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let sink_depth = depth.clone();
        let handle = std::thread::Builder::new()
            .name("satlogger".into())
            .spawn(move || sink_loop(cfg, rx, sink_depth))
            .expect("spawn log sink thread");
        SatLogger {
            tx,
            depth,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue a frame for appending; never blocks on the filesystem.
    pub fn write(&self, data: impl Into<Bytes>, timestamp: Option<DateTime<Utc>>) {
        let ts = timestamp.unwrap_or_else(Utc::now);
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(SinkCommand::Write(data.into(), ts)).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            error!("log sink is gone, frame dropped");
        }
    }

    /// Close the current file after pending writes drain. Writes enqueued
    /// later reopen a new file.
    pub fn close(&self) {
        let _ = self.tx.send(SinkCommand::CloseFile);
    }

    /// Number of queued, not yet written items.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Block until everything enqueued so far hit the filesystem.
    pub fn sync(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.tx.send(SinkCommand::Sync(ack_tx)).is_ok() {
            let _ = ack_rx.recv_timeout(Duration::from_secs(10));
        }
    }
}

impl Drop for SatLogger {
    fn drop(&mut self) {
        let _ = self.tx.send(SinkCommand::Shutdown);
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
    }
}

struct SinkFile {
    file: fs::File,
    opened_at: DateTime<Utc>,
}

fn sink_loop(cfg: SatLoggerConfig, rx: mpsc::Receiver<SinkCommand>, depth: Arc<AtomicUsize>) {
    let mut current: Option<SinkFile> = None;
    loop {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(SinkCommand::Write(data, ts)) => {
                if let Err(e) = sink_write(&cfg, &mut current, &data, ts) {
                    error!("log write failed: {e}");
                }
                depth.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(SinkCommand::CloseFile) => {
                current = None;
            }
            Ok(SinkCommand::Sync(ack)) => {
                if let Some(sink) = current.as_mut() {
                    let _ = sink.file.flush();
                }
                let _ = ack.send(());
            }
            Ok(SinkCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

fn sink_write(
    cfg: &SatLoggerConfig,
    current: &mut Option<SinkFile>,
    data: &[u8],
    ts: DateTime<Utc>,
) -> Result<()> {
    let rotate = match current {
        None => true,
        Some(sink) => {
            sink.opened_at.ordinal() != ts.ordinal()
                || sink.opened_at.year() != ts.year()
                || ts.signed_duration_since(sink.opened_at).to_std().unwrap_or_default()
                    >= cfg.file_length
        }
    };
    if rotate {
        fs::create_dir_all(&cfg.path)?;
        let path = unique_log_path(&cfg.path, &cfg.filename_prefix, ts, &cfg.filename_ext);
        debug!("opening log file {}", path.display());
        *current = Some(SinkFile {
            file: fs::File::create(path)?,
            opened_at: ts,
        });
    }
    let sink = current.as_mut().expect("file opened above");
    sink.file.write_all(data)?;
    sink.file.write_all(&pack7(ts))?;
    Ok(())
}

/// Column names and units of a CSV stream.
#[derive(Debug, Clone)]
pub struct CsvColumns {
    pub names: &'static [&'static str],
    pub units: &'static [&'static str],
}

/// Rotating CSV writer for one sensor stream.
pub struct CsvLogger {
    prefix: String,
    path: PathBuf,
    file_length: Duration,
    columns: Option<CsvColumns>,
    file: Option<fs::File>,
    opened_at: Option<DateTime<Utc>>,
}

impl CsvLogger {
    pub fn new(
        prefix: impl Into<String>,
        path: impl Into<PathBuf>,
        file_length_minutes: u64,
        columns: Option<CsvColumns>,
    ) -> CsvLogger {
        CsvLogger {
            prefix: prefix.into(),
            path: path.into(),
            file_length: Duration::from_secs(file_length_minutes * 60),
            columns,
            file: None,
            opened_at: None,
        }
    }

    fn smart_open(&mut self, ts: DateTime<Utc>) -> Result<()> {
        let rotate = match self.opened_at {
            None => true,
            Some(opened) => {
                opened.ordinal() != ts.ordinal()
                    || opened.year() != ts.year()
                    || ts.signed_duration_since(opened).to_std().unwrap_or_default()
                        >= self.file_length
            }
        };
        if !rotate && self.file.is_some() {
            return Ok(());
        }
        fs::create_dir_all(&self.path)?;
        let path = unique_log_path(&self.path, &self.prefix, ts, "csv");
        let mut file = fs::File::create(path)?;
        if let Some(columns) = &self.columns {
            writeln!(file, "datetime, {}\r", columns.names.join(", "))?;
            writeln!(
                file,
                "yyyy/mm/dd HH:MM:SS.fff, {}\r",
                columns.units.join(", ")
            )?;
        }
        self.file = Some(file);
        self.opened_at = Some(ts);
        Ok(())
    }

    /// Append one row; the timestamp column is written first.
    pub fn write(&mut self, fields: &[String], ts: DateTime<Utc>) -> Result<()> {
        self.smart_open(ts)?;
        let file = self.file.as_mut().expect("file opened above");
        write!(file, "{}", ts.format("%Y/%m/%d %H:%M:%S%.3f"))?;
        for field in fields {
            write!(file, ", {field}")?;
        }
        write!(file, "\r\n")?;
        Ok(())
    }

    /// Close the current file so the next write starts a fresh one.
    pub fn close(&mut self) {
        self.file = None;
        self.opened_at = None;
    }
}

/// A CSV logger shared between a reader thread and start/stop control.
///
/// Writers take the guard with a bounded wait and drop the row when the
/// lock stays contended; the loss is logged, never silent.
#[derive(Clone)]
pub struct SharedCsvLogger(Arc<Mutex<CsvLogger>>);

impl SharedCsvLogger {
    pub fn new(logger: CsvLogger) -> Self {
        Self(Arc::new(Mutex::new(logger)))
    }

    /// Run `f` under the guard, waiting at most `timeout` for it.
    pub fn try_with<R>(
        &self,
        timeout: Duration,
        f: impl FnOnce(&mut CsvLogger) -> R,
    ) -> Option<R> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.0.try_lock() {
                Ok(mut guard) => return Some(f(&mut guard)),
                Err(std::sync::TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        warn!("CSV log busy, row dropped");
                        return None;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(std::sync::TryLockError::Poisoned(_)) => {
                    error!("CSV log lock poisoned");
                    return None;
                }
            }
        }
    }
}

/// Format a float with fixed precision, `nan` when not finite.
pub fn fmt_f(value: f64, precision: usize) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else {
        format!("{value:.precision$}")
    }
}

/// Format a bool the way the CSV streams spell it.
pub fn fmt_b(value: bool) -> String {
    value.to_string()
}
