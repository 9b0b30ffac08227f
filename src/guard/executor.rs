//! Backup executor: runs the producer as a scoped, time-bounded resource.
//!
//! The producer writes into a hidden staging path (`BSG_ARTIFACT_PATH`, or the
//! `{artifact}` placeholder in its arguments). Only after a zero exit and a
//! successful stat is the staging artifact renamed to its final name. Every
//! other exit path, including timeout, cancellation and panics, drops the
//! [`StagedArtifact`] guard, which deletes whatever was written.
//!
//! Precondition: the orchestrator only calls [`BackupExecutor::run`] after an
//! `Admit` verdict. The executor does not re-check storage.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::config::{ExecutorConfig, HistoryConfig};
use crate::core::errors::{GuardError, Result};
use crate::core::paths::{artifact_file_name, is_staging_name, staging_path};
use crate::core::redact::{Redactor, tail_truncate};
use crate::guard::inspector::tree_size;
use crate::guard::signals::CancellationSignal;

/// Environment variable carrying the staging path to the producer.
pub const ARTIFACT_ENV: &str = "BSG_ARTIFACT_PATH";
/// Argument placeholder replaced by the staging path.
pub const ARTIFACT_PLACEHOLDER: &str = "{artifact}";

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long output capture may linger after a kill.
const READER_GRACE: Duration = Duration::from_millis(500);
/// Upper bound on buffered producer output per stream.
const CAPTURE_CAP_BYTES: usize = 64 * 1024;

// ──────────────────── invocation ────────────────────

/// Fully resolved producer invocation for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    /// Where the artifact ends up after promotion.
    pub artifact_path: PathBuf,
}

impl ProducerInvocation {
    /// Resolve the configured command against the history directory at `stamp`.
    pub fn from_config(
        executor: &ExecutorConfig,
        history: &HistoryConfig,
        stamp: DateTime<Utc>,
    ) -> Result<Self> {
        executor.ensure_runnable()?;
        let mut parts = executor.command.iter().cloned();
        let program = parts.next().unwrap_or_default();
        let name = artifact_file_name(&history.artifact_prefix, &history.artifact_suffix, stamp);
        Ok(Self {
            program,
            args: parts.collect(),
            working_dir: executor.working_dir.clone(),
            env: executor.env.clone(),
            timeout: Duration::from_secs(executor.timeout_secs),
            artifact_path: history.dir.join(name),
        })
    }

    #[must_use]
    pub fn staging_path(&self) -> PathBuf {
        staging_path(&self.artifact_path)
    }
}

// ──────────────────── result ────────────────────

/// Why a producer run did not yield an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    NonZeroExit {
        code: Option<i32>,
        signal: Option<i32>,
        diagnostics: String,
    },
    TimedOut {
        after_ms: u64,
        diagnostics: String,
    },
    Cancelled {
        diagnostics: String,
    },
    SpawnFailed {
        details: String,
    },
    MissingArtifact {
        path: PathBuf,
        diagnostics: String,
    },
    PromotionFailed {
        details: String,
    },
}

impl FailureCause {
    /// Stable short label for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NonZeroExit { .. } => "non_zero_exit",
            Self::TimedOut { .. } => "timed_out",
            Self::Cancelled { .. } => "cancelled",
            Self::SpawnFailed { .. } => "spawn_failed",
            Self::MissingArtifact { .. } => "missing_artifact",
            Self::PromotionFailed { .. } => "promotion_failed",
        }
    }

    /// Captured (already redacted) producer output, if any.
    #[must_use]
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::NonZeroExit { diagnostics, .. }
            | Self::TimedOut { diagnostics, .. }
            | Self::Cancelled { diagnostics }
            | Self::MissingArtifact { diagnostics, .. } => {
                Some(diagnostics.as_str()).filter(|d| !d.is_empty())
            }
            Self::SpawnFailed { .. } | Self::PromotionFailed { .. } => None,
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonZeroExit {
                code: Some(code), ..
            } => write!(f, "backup producer exited with status {code}"),
            Self::NonZeroExit {
                signal: Some(signal),
                ..
            } => write!(f, "backup producer was killed by signal {signal}"),
            Self::NonZeroExit { .. } => write!(f, "backup producer exited abnormally"),
            Self::TimedOut { after_ms, .. } => {
                write!(f, "backup producer timed out after {after_ms} ms")
            }
            Self::Cancelled { .. } => write!(f, "backup cancelled by signal"),
            Self::SpawnFailed { details } => {
                write!(f, "backup producer could not be started: {details}")
            }
            Self::MissingArtifact { path, .. } => write!(
                f,
                "backup producer succeeded but wrote no artifact at {}",
                path.display()
            ),
            Self::PromotionFailed { details } => {
                write!(f, "backup artifact could not be finalized: {details}")
            }
        }
    }
}

/// Outcome of one producer run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunResult {
    Success {
        artifact_path: PathBuf,
        artifact_size_bytes: u64,
        duration_ms: u64,
    },
    Failure {
        cause: FailureCause,
        duration_ms: u64,
    },
}

impl RunResult {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    #[must_use]
    pub const fn duration_ms(&self) -> u64 {
        match self {
            Self::Success { duration_ms, .. } | Self::Failure { duration_ms, .. } => *duration_ms,
        }
    }
}

// ──────────────────── staging guard ────────────────────

/// Owns the staging path for the duration of a run. Removes it on drop unless
/// it was promoted.
struct StagedArtifact {
    path: PathBuf,
    promoted: bool,
}

impl StagedArtifact {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            promoted: false,
        }
    }

    fn exists(&self) -> bool {
        fs::symlink_metadata(&self.path).is_ok()
    }

    /// Flush, measure and rename into place. Returns the artifact size.
    fn promote(mut self, final_path: &Path) -> Result<u64> {
        let meta = fs::symlink_metadata(&self.path).map_err(|e| GuardError::io(&self.path, e))?;
        let size = if meta.is_dir() {
            tree_size(&self.path)?
        } else {
            if let Ok(file) = File::open(&self.path) {
                let _ = file.sync_all();
            }
            meta.len()
        };
        fs::rename(&self.path, final_path).map_err(|e| GuardError::io(final_path, e))?;
        self.promoted = true;
        Ok(size)
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        if !self.promoted {
            if let Err(e) = remove_path(&self.path)
                && e.kind() != io::ErrorKind::NotFound
            {
                eprintln!(
                    "[BSG-EXEC] failed to remove partial artifact {}: {e}",
                    self.path.display()
                );
            }
        }
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

// ──────────────────── executor ────────────────────

enum Completion {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(io::Error),
}

/// Runs the backup producer and reports a [`RunResult`].
#[derive(Debug, Clone)]
pub struct BackupExecutor {
    redactor: Redactor,
    diagnostics_max_bytes: usize,
    poll_interval: Duration,
}

impl BackupExecutor {
    #[must_use]
    pub fn new(redactor: Redactor, diagnostics_max_bytes: usize) -> Self {
        Self {
            redactor,
            diagnostics_max_bytes: diagnostics_max_bytes.max(256),
            poll_interval: POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(
            Redactor::from_executor(config),
            config.diagnostics_max_bytes,
        )
    }

    /// Remove staging leftovers from a run that was killed before cleanup.
    /// Only names matching this guard's artifact pattern are touched.
    ///
    /// Only safe while holding the volume lock.
    pub fn sweep_stale_staging(&self, history: &HistoryConfig) -> Result<Vec<PathBuf>> {
        let history_dir = history.dir.as_path();
        let entries = match fs::read_dir(history_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(GuardError::io(history_dir, e)),
        };

        let mut removed = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| GuardError::io(history_dir, e))?;
            let name = entry.file_name();
            if name.to_str().is_some_and(|name| {
                is_staging_name(name, &history.artifact_prefix, &history.artifact_suffix)
            }) {
                let path = entry.path();
                remove_path(&path).map_err(|e| GuardError::io(&path, e))?;
                removed.push(path);
            }
        }
        Ok(removed)
    }

    /// Run the producer once. Never panics on producer misbehaviour and never
    /// leaves the staging artifact behind unless it was promoted.
    pub fn run(&self, invocation: &ProducerInvocation, cancel: &CancellationSignal) -> RunResult {
        let started = Instant::now();
        let failure = |cause: FailureCause| RunResult::Failure {
            cause,
            duration_ms: elapsed_ms(started),
        };

        if cancel.is_cancelled() {
            return failure(FailureCause::Cancelled {
                diagnostics: String::new(),
            });
        }
        if let Some(parent) = invocation.artifact_path.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            return failure(FailureCause::SpawnFailed {
                details: format!("cannot create {}: {e}", parent.display()),
            });
        }
        if fs::symlink_metadata(&invocation.artifact_path).is_ok() {
            return failure(FailureCause::SpawnFailed {
                details: format!(
                    "artifact {} already exists",
                    invocation.artifact_path.display()
                ),
            });
        }

        let staged = StagedArtifact::new(invocation.staging_path());
        let mut child = match self.spawn(invocation, &staged.path) {
            Ok(child) => child,
            Err(e) => {
                return failure(FailureCause::SpawnFailed {
                    details: self.redactor.redact(&e.to_string()).into_owned(),
                });
            }
        };

        let stdout = child.stdout.take().map(capture_stdout);
        let stderr = child.stderr.take().map(capture_stderr);

        let deadline = started + invocation.timeout;
        let completion = self.wait(&mut child, deadline, cancel);
        // Background children left by the producer still hold the pipes open.
        kill_group(&child);
        let drain_until = match completion {
            Completion::Exited(_) => deadline,
            _ => Instant::now() + READER_GRACE,
        };
        let (diagnostics, drained) = self.collect_diagnostics(stdout, stderr, drain_until);
        let completion = match completion {
            Completion::Exited(_) if !drained => Completion::TimedOut,
            other => other,
        };

        let cause = match completion {
            Completion::Exited(status) if status.success() => {
                if !staged.exists() {
                    FailureCause::MissingArtifact {
                        path: staged.path.clone(),
                        diagnostics,
                    }
                } else {
                    return match staged.promote(&invocation.artifact_path) {
                        Ok(size) => RunResult::Success {
                            artifact_path: invocation.artifact_path.clone(),
                            artifact_size_bytes: size,
                            duration_ms: elapsed_ms(started),
                        },
                        Err(e) => failure(FailureCause::PromotionFailed {
                            details: e.to_string(),
                        }),
                    };
                }
            }
            Completion::Exited(status) => FailureCause::NonZeroExit {
                code: status.code(),
                signal: exit_signal(status),
                diagnostics,
            },
            Completion::TimedOut => FailureCause::TimedOut {
                after_ms: u64::try_from(invocation.timeout.as_millis()).unwrap_or(u64::MAX),
                diagnostics,
            },
            Completion::Cancelled => FailureCause::Cancelled { diagnostics },
            Completion::WaitFailed(e) => FailureCause::SpawnFailed {
                details: format!("waiting for producer failed: {e}"),
            },
        };

        drop(staged);
        failure(cause)
    }

    fn spawn(&self, invocation: &ProducerInvocation, staging: &Path) -> io::Result<Child> {
        let staging_str = staging.to_string_lossy();
        let mut command = Command::new(&invocation.program);
        command
            .args(
                invocation
                    .args
                    .iter()
                    .map(|arg| arg.replace(ARTIFACT_PLACEHOLDER, &staging_str)),
            )
            .envs(&invocation.env)
            .env(ARTIFACT_ENV, staging)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }
        // Own process group so a timeout also reaches the producer's children.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        command.spawn()
    }

    fn wait(&self, child: &mut Child, deadline: Instant, cancel: &CancellationSignal) -> Completion {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Completion::Exited(status),
                Ok(None) => {}
                Err(e) => {
                    terminate(child);
                    return Completion::WaitFailed(e);
                }
            }
            if cancel.is_cancelled() {
                terminate(child);
                return Completion::Cancelled;
            }
            if Instant::now() >= deadline {
                terminate(child);
                return Completion::TimedOut;
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Join the capture threads, giving up at `until`. The flag is false when a
    /// stream was still open at the deadline; its thread is left detached.
    fn collect_diagnostics(
        &self,
        stdout: Option<JoinHandle<Vec<u8>>>,
        stderr: Option<JoinHandle<Vec<u8>>>,
        until: Instant,
    ) -> (String, bool) {
        while [&stdout, &stderr]
            .into_iter()
            .flatten()
            .any(|h| !h.is_finished())
            && Instant::now() < until
        {
            thread::sleep(self.poll_interval.min(Duration::from_millis(10)));
        }
        let mut drained = true;
        let mut join = |handle: Option<JoinHandle<Vec<u8>>>| match handle {
            Some(h) if h.is_finished() => h
                .join()
                .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
                .unwrap_or_default(),
            Some(_) => {
                drained = false;
                String::new()
            }
            None => String::new(),
        };
        let stdout = join(stdout);
        let stderr = join(stderr);

        let mut combined = String::new();
        if !stderr.is_empty() {
            combined.push_str("--- stderr ---\n");
            combined.push_str(&stderr);
        }
        if !stdout.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str("--- stdout ---\n");
            combined.push_str(&stdout);
        }

        let redacted = self.redactor.redact(&combined);
        (
            tail_truncate(&redacted, self.diagnostics_max_bytes),
            drained,
        )
    }
}

/// SIGKILL everything left in the producer's process group. The group id
/// outlives the leader while any member is alive.
#[cfg(unix)]
fn kill_group(child: &Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;
    if let Ok(pid) = i32::try_from(child.id()) {
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

/// Kill the producer and its process group, then reap it.
fn terminate(child: &mut Child) {
    kill_group(child);
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

fn capture_stdout(pipe: ChildStdout) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || read_tail(pipe, CAPTURE_CAP_BYTES))
}

fn capture_stderr(pipe: ChildStderr) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || read_tail(pipe, CAPTURE_CAP_BYTES))
}

/// Drain a reader, keeping only the last `cap` bytes.
fn read_tail(mut reader: impl Read, cap: usize) -> Vec<u8> {
    let mut kept = Vec::new();
    let mut chunk = [0_u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                kept.extend_from_slice(&chunk[..n]);
                if kept.len() > cap {
                    let excess = kept.len() - cap;
                    kept.drain(..excess);
                }
            }
        }
    }
    kept
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, dir: &Path, timeout: Duration) -> ProducerInvocation {
        ProducerInvocation {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: None,
            env: BTreeMap::new(),
            timeout,
            artifact_path: dir.join("backup-1.tar"),
        }
    }

    fn executor() -> BackupExecutor {
        BackupExecutor::new(Redactor::default(), 4096)
    }

    fn dir_is_empty(dir: &Path) -> bool {
        fs::read_dir(dir).unwrap().next().is_none()
    }

    #[test]
    fn success_promotes_staged_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let inv = sh(
            r#"printf hello > "$BSG_ARTIFACT_PATH""#,
            dir.path(),
            Duration::from_secs(10),
        );
        let result = executor().run(&inv, &CancellationSignal::new());
        match result {
            RunResult::Success {
                artifact_path,
                artifact_size_bytes,
                ..
            } => {
                assert_eq!(artifact_path, dir.path().join("backup-1.tar"));
                assert_eq!(artifact_size_bytes, 5);
            }
            other @ RunResult::Failure { .. } => panic!("unexpected failure: {other:?}"),
        }
        assert!(dir.path().join("backup-1.tar").exists());
        assert!(!inv.staging_path().exists());
    }

    #[test]
    fn placeholder_argument_receives_staging_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = sh(r#"printf abc > "$1""#, dir.path(), Duration::from_secs(10));
        inv.args.push("producer".to_string());
        inv.args.push(ARTIFACT_PLACEHOLDER.to_string());
        let result = executor().run(&inv, &CancellationSignal::new());
        assert!(result.is_success(), "{result:?}");
    }

    #[test]
    fn directory_artifacts_are_measured_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let inv = sh(
            r#"mkdir -p "$BSG_ARTIFACT_PATH/db" && printf 1234 > "$BSG_ARTIFACT_PATH/db/dump""#,
            dir.path(),
            Duration::from_secs(10),
        );
        match executor().run(&inv, &CancellationSignal::new()) {
            RunResult::Success {
                artifact_size_bytes,
                ..
            } => assert_eq!(artifact_size_bytes, 4),
            other @ RunResult::Failure { .. } => panic!("unexpected failure: {other:?}"),
        }
    }

    #[test]
    fn nonzero_exit_mid_write_removes_partial_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let inv = sh(
            r#"printf partial > "$BSG_ARTIFACT_PATH"; echo "disk quota exceeded" >&2; exit 3"#,
            dir.path(),
            Duration::from_secs(10),
        );
        let result = executor().run(&inv, &CancellationSignal::new());
        match &result {
            RunResult::Failure {
                cause:
                    FailureCause::NonZeroExit {
                        code, diagnostics, ..
                    },
                ..
            } => {
                assert_eq!(*code, Some(3));
                assert!(diagnostics.contains("disk quota exceeded"), "{diagnostics}");
            }
            other => panic!("expected non-zero exit, got {other:?}"),
        }
        assert!(dir_is_empty(dir.path()), "partial artifact left behind");
    }

    #[test]
    fn timeout_kills_producer_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let inv = sh(
            r#"printf partial > "$BSG_ARTIFACT_PATH"; sleep 30"#,
            dir.path(),
            Duration::from_millis(300),
        );
        let started = Instant::now();
        let result = executor().run(&inv, &CancellationSignal::new());
        assert!(started.elapsed() < Duration::from_secs(10));
        match result {
            RunResult::Failure {
                cause: FailureCause::TimedOut { after_ms, .. },
                ..
            } => assert_eq!(after_ms, 300),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(dir_is_empty(dir.path()));
    }

    #[test]
    fn cancellation_mid_run_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let inv = sh(
            r#"printf partial > "$BSG_ARTIFACT_PATH"; sleep 30"#,
            dir.path(),
            Duration::from_secs(60),
        );
        let cancel = CancellationSignal::new();
        let trigger = cancel.clone();
        let staging = inv.staging_path();
        let canceller = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(10);
            while !staging.exists() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            trigger.cancel();
        });

        let result = executor().run(&inv, &cancel);
        canceller.join().unwrap();
        assert!(
            matches!(
                result,
                RunResult::Failure {
                    cause: FailureCause::Cancelled { .. },
                    ..
                }
            ),
            "{result:?}"
        );
        assert!(dir_is_empty(dir.path()));
    }

    #[test]
    fn already_cancelled_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let inv = sh(
            &format!("touch {}", marker.display()),
            dir.path(),
            Duration::from_secs(10),
        );
        let cancel = CancellationSignal::new();
        cancel.cancel();
        let result = executor().run(&inv, &cancel);
        assert!(!result.is_success());
        assert!(!marker.exists());
    }

    #[test]
    fn zero_exit_without_artifact_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let inv = sh("exit 0", dir.path(), Duration::from_secs(10));
        let result = executor().run(&inv, &CancellationSignal::new());
        assert!(
            matches!(
                result,
                RunResult::Failure {
                    cause: FailureCause::MissingArtifact { .. },
                    ..
                }
            ),
            "{result:?}"
        );
    }

    #[test]
    fn missing_program_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = sh("", dir.path(), Duration::from_secs(10));
        inv.program = "/nonexistent/bsg-producer".to_string();
        let result = executor().run(&inv, &CancellationSignal::new());
        match result {
            RunResult::Failure { cause, .. } => assert_eq!(cause.kind(), "spawn_failed"),
            RunResult::Success { .. } => panic!("spawn should fail"),
        }
    }

    #[test]
    fn existing_final_artifact_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("backup-1.tar"), b"previous").unwrap();
        let inv = sh(
            r#"printf new > "$BSG_ARTIFACT_PATH""#,
            dir.path(),
            Duration::from_secs(10),
        );
        let result = executor().run(&inv, &CancellationSignal::new());
        assert!(!result.is_success());
        assert_eq!(
            fs::read(dir.path().join("backup-1.tar")).unwrap(),
            b"previous"
        );
    }

    #[test]
    fn diagnostics_are_redacted() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = sh(
            r#"echo "connect postgres://app:$PGPASSWORD@db/site failed" >&2; exit 1"#,
            dir.path(),
            Duration::from_secs(10),
        );
        inv.env
            .insert("PGPASSWORD".to_string(), "s3cr3t-value".to_string());
        let config = ExecutorConfig {
            env: inv.env.clone(),
            ..ExecutorConfig::default()
        };
        let result = BackupExecutor::from_config(&config).run(&inv, &CancellationSignal::new());
        let RunResult::Failure { cause, .. } = result else {
            panic!("expected failure");
        };
        let diagnostics = cause.diagnostics().unwrap_or_default().to_string();
        assert!(!diagnostics.contains("s3cr3t-value"), "{diagnostics}");
        assert!(diagnostics.contains("[REDACTED]"), "{diagnostics}");
    }

    fn history_in(dir: &Path) -> HistoryConfig {
        HistoryConfig {
            dir: dir.to_path_buf(),
            artifact_prefix: "backup-".to_string(),
            artifact_suffix: ".tar".to_string(),
            ..HistoryConfig::default()
        }
    }

    #[test]
    fn sweep_removes_only_staging_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".backup-0.tar.partial"), b"x").unwrap();
        fs::create_dir(dir.path().join(".backup-00.tar.partial")).unwrap();
        fs::write(dir.path().join("backup-1.tar"), b"keep").unwrap();

        let removed = executor().sweep_stale_staging(&history_in(dir.path())).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(dir.path().join("backup-1.tar").exists());
        assert!(
            executor()
                .sweep_stale_staging(&history_in(&dir.path().join("missing")))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn sweep_leaves_foreign_partials_alone() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".other.partial"), b"theirs").unwrap();
        fs::write(dir.path().join(".backup-0.tar.gz.partial"), b"other suffix").unwrap();
        fs::write(dir.path().join(".backup-0.tar.partial"), b"ours").unwrap();

        let removed = executor().sweep_stale_staging(&history_in(dir.path())).unwrap();
        assert_eq!(removed, vec![dir.path().join(".backup-0.tar.partial")]);
        assert!(dir.path().join(".other.partial").exists());
        assert!(dir.path().join(".backup-0.tar.gz.partial").exists());
    }

    #[test]
    fn exited_producer_cannot_outlive_timeout_through_background_child() {
        let dir = tempfile::tempdir().unwrap();
        let inv = sh(
            r#"printf x > "$BSG_ARTIFACT_PATH"; sleep 8 & exit 1"#,
            dir.path(),
            Duration::from_secs(1),
        );
        let started = Instant::now();
        let result = executor().run(&inv, &CancellationSignal::new());
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
        assert!(!result.is_success(), "{result:?}");
        assert!(dir_is_empty(dir.path()));
    }

    #[test]
    fn background_child_holding_pipes_after_success_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let inv = sh(
            r#"printf ok > "$BSG_ARTIFACT_PATH"; sleep 8 &"#,
            dir.path(),
            Duration::from_secs(5),
        );
        let started = Instant::now();
        let result = executor().run(&inv, &CancellationSignal::new());
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(result.is_success(), "{result:?}");
    }

    #[test]
    fn read_tail_keeps_last_bytes() {
        let data = vec![b'a'; 10_000]
            .into_iter()
            .chain(b"END".iter().copied())
            .collect::<Vec<u8>>();
        let kept = read_tail(io::Cursor::new(data), 100);
        assert_eq!(kept.len(), 100);
        assert!(kept.ends_with(b"END"));
    }

    #[test]
    fn invocation_from_config_builds_final_path() {
        use chrono::TimeZone;
        let history = HistoryConfig {
            dir: PathBuf::from("/srv/backups"),
            ..HistoryConfig::default()
        };
        let executor_cfg = ExecutorConfig {
            command: vec!["make-backup".to_string(), "--fast".to_string()],
            timeout_secs: 90,
            ..ExecutorConfig::default()
        };
        let stamp = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let inv = ProducerInvocation::from_config(&executor_cfg, &history, stamp).unwrap();
        assert_eq!(inv.program, "make-backup");
        assert_eq!(inv.args, vec!["--fast".to_string()]);
        assert_eq!(inv.timeout, Duration::from_secs(90));
        assert_eq!(
            inv.artifact_path,
            PathBuf::from("/srv/backups/backup-20260102T030405Z.tar.gz")
        );
        assert_eq!(
            inv.staging_path(),
            PathBuf::from("/srv/backups/.backup-20260102T030405Z.tar.gz.partial")
        );

        let empty = ExecutorConfig::default();
        assert!(ProducerInvocation::from_config(&empty, &history, stamp).is_err());
    }
}
