//! Transition log: append-only JSONL, one self-contained object per line.
//!
//! Every state transition of a guard run, its verdict, the run result and
//! each alert outcome end up here, so a run can be audited after the fact.
//! Each line is built in memory and handed to a single `write_all`, so a
//! concurrent `tail -f` never sees half a line.
//!
//! When the log file cannot be written the writer falls back to
//! `fallback_path`, then to stderr (prefixed `[BSG-JSONL]`), then drops
//! lines. A logging failure never changes a run's outcome.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{GuardError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// What a log line records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ConfigLoaded,
    Transition,
    Verdict,
    RunResult,
    StagingSwept,
    AlertSent,
    AlertFailed,
}

/// A single JSONL log entry. Only `ts`, `event` and `severity` are always set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 UTC timestamp, millisecond precision.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projected_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimate_bytes: Option<u64>,
    /// Artifact path involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Artifact size in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// BSG error code when something failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// Create a new entry stamped with the current UTC time.
    #[must_use]
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: format_utc_now(),
            event,
            severity,
            from: None,
            to: None,
            projected_bytes: None,
            limit_bytes: None,
            estimate_bytes: None,
            artifact: None,
            size: None,
            duration_ms: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }

    /// A state machine edge.
    #[must_use]
    pub fn transition(from: &str, to: &str, severity: Severity) -> Self {
        Self {
            from: Some(from.to_string()),
            to: Some(to.to_string()),
            ..Self::new(EventType::Transition, severity)
        }
    }

    #[must_use]
    pub fn with_error(mut self, error: &GuardError) -> Self {
        self.error_code = Some(error.code().to_string());
        self.error_message = Some(error.to_string());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Where lines currently go. Each failure moves one step down the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sink {
    Primary,
    Fallback,
    Stderr,
    Discard,
}

impl Sink {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "normal",
            Self::Fallback => "fallback",
            Self::Stderr => "stderr",
            Self::Discard => "discard",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    /// Used when `path` cannot be opened or written, e.g. a read-only state dir.
    pub fallback_path: Option<PathBuf>,
    /// Rotate before the file grows past this size.
    pub max_size_bytes: u64,
    /// Rotated generations kept as `<path>.1` .. `<path>.N`.
    pub max_rotated_files: u32,
}

impl JsonlConfig {
    /// 10 MiB files, five generations, fallback in the temp dir.
    #[must_use]
    pub fn for_path(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            fallback_path: Some(std::env::temp_dir().join("bsg-transitions.jsonl")),
            max_size_bytes: 10 * 1024 * 1024,
            max_rotated_files: 5,
        }
    }
}

/// Append-only transition log. Never fails the caller: errors only move it
/// down the sink ladder.
pub struct JsonlWriter {
    config: JsonlConfig,
    sink: Sink,
    file: Option<BufWriter<File>>,
    /// Size of the active file, including what was there before we opened it.
    file_len: u64,
}

impl JsonlWriter {
    #[must_use]
    pub fn open(config: JsonlConfig) -> Self {
        let mut writer = Self {
            config,
            sink: Sink::Primary,
            file: None,
            file_len: 0,
        };
        writer.attach(Sink::Primary);
        writer
    }

    /// A writer that drops everything.
    #[must_use]
    pub fn discard() -> Self {
        Self {
            config: JsonlConfig {
                path: PathBuf::new(),
                fallback_path: None,
                max_size_bytes: u64::MAX,
                max_rotated_files: 0,
            },
            sink: Sink::Discard,
            file: None,
            file_len: 0,
        }
    }

    /// Append one entry and flush it. Runs are short and a line must survive
    /// whatever happens to the process afterwards.
    pub fn write_entry(&mut self, entry: &LogEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                let _ = writeln!(io::stderr(), "[BSG-JSONL] serialize error: {e}");
                return;
            }
        };
        line.push('\n');

        if self.needs_rotation(line.len() as u64) {
            self.rotate();
        }
        self.append(line.as_bytes());
    }

    /// Current rung of the sink ladder: normal, fallback, stderr or discard.
    #[must_use]
    pub fn state(&self) -> &str {
        self.sink.as_str()
    }

    // ──────────────────────── internals ────────────────────────

    fn active_path(&self, sink: Sink) -> Option<&Path> {
        match sink {
            Sink::Primary => Some(self.config.path.as_path()),
            Sink::Fallback => self.config.fallback_path.as_deref(),
            Sink::Stderr | Sink::Discard => None,
        }
    }

    /// Open the file behind `sink`, stepping further down on failure.
    fn attach(&mut self, sink: Sink) {
        self.file = None;
        self.file_len = 0;
        self.sink = sink;

        let Some(path) = self.active_path(sink).map(Path::to_path_buf) else {
            return;
        };
        match open_append(&path) {
            Ok((file, len)) => {
                if sink == Sink::Fallback {
                    let _ = writeln!(
                        io::stderr(),
                        "[BSG-JSONL] primary log unavailable, writing to {}",
                        path.display()
                    );
                }
                self.file = Some(BufWriter::new(file));
                self.file_len = len;
            }
            Err(e) => {
                let next = if sink == Sink::Primary && self.config.fallback_path.is_some() {
                    Sink::Fallback
                } else {
                    Sink::Stderr
                };
                if next == Sink::Stderr {
                    let _ = writeln!(io::stderr(), "[BSG-JSONL] {e}; logging to stderr");
                }
                self.attach(next);
            }
        }
    }

    /// Move one rung down after a write failure.
    fn step_down(&mut self) {
        match self.sink {
            Sink::Primary => {
                let next = if self.config.fallback_path.is_some() {
                    Sink::Fallback
                } else {
                    Sink::Stderr
                };
                self.attach(next);
            }
            Sink::Fallback => {
                let _ = writeln!(
                    io::stderr(),
                    "[BSG-JSONL] fallback log failed, logging to stderr"
                );
                self.attach(Sink::Stderr);
            }
            Sink::Stderr | Sink::Discard => self.attach(Sink::Discard),
        }
    }

    fn append(&mut self, bytes: &[u8]) {
        loop {
            match self.sink {
                Sink::Primary | Sink::Fallback => {
                    let written = self
                        .file
                        .as_mut()
                        .is_some_and(|f| f.write_all(bytes).and_then(|()| f.flush()).is_ok());
                    if written {
                        self.file_len += bytes.len() as u64;
                        return;
                    }
                    self.step_down();
                }
                Sink::Stderr => {
                    let mut err = io::stderr().lock();
                    if err
                        .write_all(b"[BSG-JSONL] ")
                        .and_then(|()| err.write_all(bytes))
                        .is_ok()
                    {
                        return;
                    }
                    drop(err);
                    self.step_down();
                }
                Sink::Discard => return,
            }
        }
    }

    fn needs_rotation(&self, incoming: u64) -> bool {
        self.file.is_some()
            && self.file_len > 0
            && self.file_len.saturating_add(incoming) > self.config.max_size_bytes
    }

    /// `<path>` becomes `<path>.1`, older generations shift up, the oldest is
    /// dropped.
    fn rotate(&mut self) {
        let Some(base) = self.active_path(self.sink).map(Path::to_path_buf) else {
            return;
        };
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }

        let keep = self.config.max_rotated_files;
        if keep == 0 {
            let _ = fs::remove_file(&base);
        } else {
            let _ = fs::remove_file(rotated_name(&base, keep));
            for generation in (1..keep).rev() {
                let _ = fs::rename(
                    rotated_name(&base, generation),
                    rotated_name(&base, generation + 1),
                );
            }
            let _ = fs::rename(&base, rotated_name(&base, 1));
        }

        self.attach(self.sink);
    }
}

impl Drop for JsonlWriter {
    fn drop(&mut self) {
        if let Some(file) = self.file.as_mut()
            && file.flush().is_ok()
        {
            let _ = file.get_ref().sync_data();
        }
    }
}

// ──────────────────────── helpers ────────────────────────

/// Create-or-append with mode 0600. Returns the file and its current length.
fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| GuardError::io(parent, e))?;
    }
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt as _;
        options.mode(0o600);
    }
    let file = options.open(path).map_err(|e| GuardError::io(path, e))?;
    let len = file.metadata().map_or(0, |m| m.len());
    Ok((file, len))
}

fn rotated_name(base: &Path, generation: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

fn format_utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ──────────────────────── tests ────────────────────────
