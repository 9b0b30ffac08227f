//! Guard run state machine.
//!
//! ```text
//! Start → Locking → Inspecting → Evaluating → Admitted → Executing → Succeeded | Failed
//!                                           ↘ Denied
//! ```
//!
//! Every edge is written to the transition log. Each invocation ends in exactly
//! one terminal state; nothing inside a run is retried except alert delivery.
//! `check` mode stops after evaluation: no lock, no producer, no alert.

#![allow(missing_docs)]

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::alert::event::{AlertEvent, AlertSeverity};
use crate::alert::notifier::{AlertNotifier, NotifyReceipt};
use crate::core::config::Config;
use crate::core::errors::GuardError;
use crate::guard::executor::{BackupExecutor, ProducerInvocation, RunResult};
use crate::guard::inspector::{StorageInspector, UsageSnapshot};
use crate::guard::lock::VolumeLock;
use crate::guard::signals::CancellationSignal;
use crate::guard::threshold::{SizeEstimator, Verdict, evaluate};
use crate::logger::jsonl::{EventType, JsonlWriter, LogEntry, Severity};
use crate::platform::pal::Platform;

// ──────────────────── states ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardState {
    Start,
    Locking,
    Inspecting,
    Evaluating,
    Admitted,
    Executing,
    Succeeded,
    Failed,
    Denied,
}

impl GuardState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Locking => "locking",
            Self::Inspecting => "inspecting",
            Self::Evaluating => "evaluating",
            Self::Admitted => "admitted",
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Denied => "denied",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Denied)
    }
}

impl fmt::Display for GuardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full run or dry-run preflight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Run,
    Check,
}

// ──────────────────── outcome ────────────────────

/// What happened to the alert for this run, if one was due.
#[derive(Debug)]
pub enum AlertOutcome {
    Delivered(NotifyReceipt),
    Failed(GuardError),
}

/// Everything a caller needs to report on one invocation.
#[derive(Debug)]
pub struct RunOutcome {
    pub mode: RunMode,
    /// Terminal state (or `Admitted` for a successful check).
    pub state: GuardState,
    pub snapshot: Option<UsageSnapshot>,
    pub verdict: Option<Verdict>,
    pub run_result: Option<RunResult>,
    /// The error that ended the run early, if any.
    pub error: Option<GuardError>,
    pub alert: Option<AlertOutcome>,
    /// Staging leftovers removed before this run.
    pub swept: Vec<PathBuf>,
}

impl RunOutcome {
    fn new(mode: RunMode) -> Self {
        Self {
            mode,
            state: GuardState::Start,
            snapshot: None,
            verdict: None,
            run_result: None,
            error: None,
            alert: None,
            swept: Vec::new(),
        }
    }

    /// Process exit status. An undeliverable alert overrides everything else.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if matches!(self.alert, Some(AlertOutcome::Failed(_))) {
            return 15;
        }
        match self.state {
            GuardState::Succeeded | GuardState::Admitted => 0,
            GuardState::Denied => match self.verdict.as_ref().and_then(Verdict::deny_reason) {
                Some(reason) if reason.is_configuration() => 11,
                _ => 10,
            },
            _ => self.error.as_ref().map_or(12, GuardError::exit_code),
        }
    }

    #[must_use]
    pub const fn succeeded(&self) -> bool {
        matches!(self.state, GuardState::Succeeded)
            || matches!((self.mode, self.state), (RunMode::Check, GuardState::Admitted))
    }
}

// ──────────────────── orchestrator ────────────────────

/// Drives one guard invocation.
pub struct GuardOrchestrator<N: AlertNotifier> {
    config: Config,
    inspector: StorageInspector,
    executor: BackupExecutor,
    notifier: N,
    log: JsonlWriter,
    cancel: CancellationSignal,
    state: GuardState,
    progress: bool,
}

impl<N: AlertNotifier> GuardOrchestrator<N> {
    #[must_use]
    pub fn new(
        config: Config,
        platform: Arc<dyn Platform>,
        notifier: N,
        log: JsonlWriter,
        cancel: CancellationSignal,
    ) -> Self {
        let inspector = StorageInspector::new(platform, &config.history);
        let executor = BackupExecutor::from_config(&config.executor);
        Self {
            config,
            inspector,
            executor,
            notifier,
            log,
            cancel,
            state: GuardState::Start,
            progress: false,
        }
    }

    /// Echo transitions to stderr as `[BSG-GUARD]` lines.
    #[must_use]
    pub const fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub const fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Run the guard once.
    pub fn run(&mut self, mode: RunMode) -> RunOutcome {
        let mut outcome = RunOutcome::new(mode);
        self.state = GuardState::Start;
        self.log_config();

        // Held until this function returns.
        let _lock = match mode {
            RunMode::Run => {
                if let Err(e) = self.config.executor.ensure_runnable() {
                    return self.fail(outcome, e);
                }
                self.advance(GuardState::Locking, Severity::Info);
                match VolumeLock::try_acquire(&self.config.paths.lock_file) {
                    Ok(lock) => {
                        outcome.swept = self.sweep_staging();
                        Some(lock)
                    }
                    Err(e) => return self.fail(outcome, e),
                }
            }
            RunMode::Check => None,
        };

        self.advance(GuardState::Inspecting, Severity::Info);
        let snapshot = match self.inspector.capture() {
            Ok(snapshot) => snapshot,
            Err(e) => return self.fail(outcome, e),
        };

        self.advance(GuardState::Evaluating, Severity::Info);
        let estimator = SizeEstimator::new(
            self.config.history.estimate,
            self.config.history.default_estimate_bytes,
        );
        let verdict = evaluate(&snapshot, &self.config.limits, &estimator);
        self.log_verdict(&verdict);

        if !verdict.is_admit() {
            self.advance(GuardState::Denied, Severity::Warning);
            outcome.state = GuardState::Denied;
            if mode == RunMode::Run
                && let Some(event) = AlertEvent::from_verdict(
                    &verdict,
                    snapshot.current_used_bytes,
                    self.inspector.history_dir(),
                    Utc::now(),
                )
            {
                outcome.alert = Some(self.alert(&event));
            }
            outcome.snapshot = Some(snapshot);
            outcome.verdict = Some(verdict);
            return outcome;
        }

        self.advance(GuardState::Admitted, Severity::Info);
        outcome.snapshot = Some(snapshot);
        outcome.verdict = Some(verdict);
        if mode == RunMode::Check {
            outcome.state = GuardState::Admitted;
            return outcome;
        }

        let invocation = match ProducerInvocation::from_config(
            &self.config.executor,
            &self.config.history,
            Utc::now(),
        ) {
            Ok(invocation) => invocation,
            Err(e) => return self.fail(outcome, e),
        };

        self.advance(GuardState::Executing, Severity::Info);
        let result = self.executor.run(&invocation, &self.cancel);
        self.log_run_result(&result, &invocation);

        match &result {
            RunResult::Success { .. } => {
                self.advance(GuardState::Succeeded, Severity::Info);
                outcome.state = GuardState::Succeeded;
            }
            RunResult::Failure { cause, duration_ms } => {
                self.advance(GuardState::Failed, Severity::Error);
                outcome.state = GuardState::Failed;
                let event = AlertEvent::from_failure(
                    cause,
                    &invocation.artifact_path,
                    *duration_ms,
                    Utc::now(),
                );
                outcome.alert = Some(self.alert(&event));
            }
        }
        outcome.run_result = Some(result);
        outcome
    }

    /// End the run in `Failed` because of `error`, alerting the operator.
    fn fail(&mut self, mut outcome: RunOutcome, error: GuardError) -> RunOutcome {
        let severity = match error {
            GuardError::InvalidConfig { .. }
            | GuardError::MissingConfig { .. }
            | GuardError::ConfigParse { .. } => Severity::Critical,
            _ => Severity::Error,
        };
        let entry = LogEntry::transition(self.state.as_str(), GuardState::Failed.as_str(), severity)
            .with_error(&error);
        self.log.write_entry(&entry);
        self.echo(GuardState::Failed);
        self.state = GuardState::Failed;

        outcome.state = GuardState::Failed;
        if outcome.mode == RunMode::Run {
            let event = AlertEvent::from_error(&error, Utc::now());
            outcome.alert = Some(self.alert(&event));
        }
        outcome.error = Some(error);
        outcome
    }

    fn advance(&mut self, to: GuardState, severity: Severity) {
        self.log.write_entry(&LogEntry::transition(
            self.state.as_str(),
            to.as_str(),
            severity,
        ));
        self.echo(to);
        self.state = to;
    }

    fn echo(&self, to: GuardState) {
        if self.progress {
            eprintln!("[BSG-GUARD] {} -> {to}", self.state);
        }
    }

    fn alert(&mut self, event: &AlertEvent) -> AlertOutcome {
        let severity = match event.severity {
            AlertSeverity::Warning => Severity::Warning,
            AlertSeverity::Error => Severity::Error,
            AlertSeverity::Critical => Severity::Critical,
        };
        match self.notifier.send(event) {
            Ok(receipt) => {
                let entry = LogEntry::new(EventType::AlertSent, severity).with_details(format!(
                    "{} via {}",
                    event.subject,
                    receipt.delivered.join(",")
                ));
                self.log.write_entry(&entry);
                for (transport, error) in &receipt.failed {
                    eprintln!("[BSG-NOTIFY] {transport} transport failed: {error}");
                    let entry = LogEntry::new(EventType::AlertFailed, Severity::Warning)
                        .with_details(format!("{}: {transport}: {error}", event.subject));
                    self.log.write_entry(&entry);
                }
                AlertOutcome::Delivered(receipt)
            }
            Err(e) => {
                eprintln!("[BSG-NOTIFY] alert could not be delivered: {e}");
                eprintln!("[BSG-NOTIFY] undelivered alert follows:\n{}", event.render());
                let entry = LogEntry::new(EventType::AlertFailed, Severity::Critical)
                    .with_error(&e)
                    .with_details(event.subject.clone());
                self.log.write_entry(&entry);
                AlertOutcome::Failed(e)
            }
        }
    }

    fn sweep_staging(&mut self) -> Vec<PathBuf> {
        match self
            .executor
            .sweep_stale_staging(&self.config.history)
        {
            Ok(removed) => {
                for path in &removed {
                    let mut entry = LogEntry::new(EventType::StagingSwept, Severity::Warning)
                        .with_details("removed stale partial artifact");
                    entry.artifact = Some(path.display().to_string());
                    self.log.write_entry(&entry);
                }
                removed
            }
            Err(e) => {
                let entry = LogEntry::new(EventType::StagingSwept, Severity::Error)
                    .with_error(&e)
                    .with_details("stale partial sweep failed");
                self.log.write_entry(&entry);
                Vec::new()
            }
        }
    }

    fn log_config(&mut self) {
        let mut entry = LogEntry::new(EventType::ConfigLoaded, Severity::Info);
        match self.config.stable_hash() {
            Ok(hash) => entry.details = Some(format!("config_hash={hash}")),
            Err(e) => entry = entry.with_error(&e),
        }
        self.log.write_entry(&entry);
    }

    fn log_verdict(&mut self, verdict: &Verdict) {
        let severity = if verdict.is_admit() {
            Severity::Info
        } else {
            Severity::Warning
        };
        let mut entry = LogEntry::new(EventType::Verdict, severity);
        entry.projected_bytes = Some(verdict.projected_usage_bytes());
        entry.limit_bytes = Some(verdict.limit_bytes());
        entry.estimate_bytes = Some(verdict.estimate().bytes);
        entry.details = Some(
            verdict
                .deny_reason()
                .map_or_else(|| "admit".to_string(), |r| format!("deny: {r}")),
        );
        self.log.write_entry(&entry);
    }

    fn log_run_result(&mut self, result: &RunResult, invocation: &ProducerInvocation) {
        let entry = match result {
            RunResult::Success {
                artifact_path,
                artifact_size_bytes,
                duration_ms,
            } => {
                let mut entry = LogEntry::new(EventType::RunResult, Severity::Info);
                entry.artifact = Some(artifact_path.display().to_string());
                entry.size = Some(*artifact_size_bytes);
                entry.duration_ms = Some(*duration_ms);
                entry
            }
            RunResult::Failure { cause, duration_ms } => {
                let mut entry = LogEntry::new(EventType::RunResult, Severity::Error);
                entry.artifact = Some(invocation.artifact_path.display().to_string());
                entry.duration_ms = Some(*duration_ms);
                entry.error_code = Some("BSG-3001".to_string());
                entry.error_message = Some(cause.to_string());
                entry.details = Some(cause.kind().to_string());
                entry
            }
        };
        self.log.write_entry(&entry);
    }
}
