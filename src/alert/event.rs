//! Operator alerts: one [`AlertEvent`] per Deny or failed run.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::fmt;
use std::fmt::Write as _;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::GuardError;
use crate::guard::executor::FailureCause;
use crate::guard::threshold::{EstimateSource, Verdict};

// ──────────────────── severity ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Storage pressure blocked a backup.
    Warning,
    /// A run failed: producer, inspection or lock.
    Error,
    /// The guard cannot make decisions with its current configuration.
    Critical,
}

impl AlertSeverity {
    /// syslog priority name used by the journal transport.
    #[must_use]
    pub const fn journal_priority(self) -> &'static str {
        match self {
            Self::Warning => "WARNING",
            Self::Error => "ERR",
            Self::Critical => "CRIT",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

// ──────────────────── event ────────────────────

/// A fully formatted operator notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub severity: AlertSeverity,
    pub subject: String,
    pub body: String,
    pub timestamp_utc: DateTime<Utc>,
}

impl AlertEvent {
    /// Alert for a Deny verdict. `None` for Admit.
    #[must_use]
    pub fn from_verdict(
        verdict: &Verdict,
        current_used_bytes: u64,
        history_dir: &Path,
        at: DateTime<Utc>,
    ) -> Option<Self> {
        let reason = verdict.deny_reason()?;
        let estimate = verdict.estimate();
        let severity = if reason.is_configuration() {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };

        let source = match estimate.source {
            EstimateSource::History => format!("history, {} sample(s)", estimate.samples),
            EstimateSource::Default => "configured default, no history".to_string(),
        };

        let mut body = String::new();
        let _ = writeln!(body, "Backup denied: {reason}.");
        let _ = writeln!(body);
        let _ = writeln!(body, "history directory: {}", history_dir.display());
        let _ = writeln!(
            body,
            "current usage:     {}",
            bytes_line(current_used_bytes)
        );
        let _ = writeln!(
            body,
            "estimated backup:  {} ({source})",
            bytes_line(estimate.bytes)
        );
        let _ = writeln!(
            body,
            "projected usage:   {}",
            bytes_line(verdict.projected_usage_bytes())
        );
        let _ = writeln!(
            body,
            "limit:             {}",
            bytes_line(verdict.limit_bytes())
        );
        let _ = writeln!(body);
        if reason.is_configuration() {
            let _ = writeln!(
                body,
                "The storage limits are inconsistent (safety margin must be below the total budget)."
            );
        } else {
            let _ = writeln!(
                body,
                "No backup was attempted. Free space on the backup volume or raise the budget."
            );
        }

        Some(Self {
            severity,
            subject: format!("backup denied: {reason}"),
            body,
            timestamp_utc: at,
        })
    }

    /// Alert for a failed producer run.
    #[must_use]
    pub fn from_failure(
        cause: &FailureCause,
        artifact_path: &Path,
        duration_ms: u64,
        at: DateTime<Utc>,
    ) -> Self {
        let mut body = String::new();
        let _ = writeln!(body, "Backup failed: {cause}.");
        let _ = writeln!(body);
        let _ = writeln!(body, "artifact:  {}", artifact_path.display());
        let _ = writeln!(body, "cause:     {}", cause.kind());
        let _ = writeln!(body, "duration:  {duration_ms} ms");
        let _ = writeln!(body, "The partial artifact, if any, was removed.");
        if let Some(diagnostics) = cause.diagnostics() {
            let _ = writeln!(body);
            let _ = writeln!(body, "Producer output (redacted, tail):");
            let _ = writeln!(body, "{diagnostics}");
        }

        Self {
            severity: AlertSeverity::Error,
            subject: format!("backup failed: {}", cause.kind().replace('_', " ")),
            body,
            timestamp_utc: at,
        }
    }

    /// Alert for an error that ended the run before or around evaluation.
    #[must_use]
    pub fn from_error(error: &GuardError, at: DateTime<Utc>) -> Self {
        let (severity, subject) = match error {
            GuardError::InvalidConfig { .. }
            | GuardError::MissingConfig { .. }
            | GuardError::ConfigParse { .. } => {
                (AlertSeverity::Critical, "backup guard misconfigured")
            }
            GuardError::LockHeld { .. } => {
                (AlertSeverity::Error, "backup skipped: another run holds the lock")
            }
            GuardError::Inspection { .. } => {
                (AlertSeverity::Error, "backup skipped: storage inspection failed")
            }
            _ => (AlertSeverity::Error, "backup guard failed"),
        };

        let mut body = String::new();
        let _ = writeln!(body, "{error}");
        let _ = writeln!(body);
        let _ = writeln!(body, "error code: {}", error.code());
        let _ = writeln!(body, "No backup was attempted.");

        Self {
            severity,
            subject: subject.to_string(),
            body,
            timestamp_utc: at,
        }
    }

    /// Plain-text rendering shared by every transport. Pure: the same event
    /// always renders to the same bytes.
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "[bsg] {subject}\nseverity: {severity}\ntime: {ts}\n\n{body}",
            subject = self.subject,
            severity = self.severity,
            ts = self.timestamp_rfc3339(),
            body = self.body,
        )
    }

    #[must_use]
    pub fn timestamp_rfc3339(&self) -> String {
        self.timestamp_utc
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

fn bytes_line(bytes: u64) -> String {
    format!("{bytes} bytes ({})", format_bytes(bytes))
}

/// Decimal units, matching how budgets are configured.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1_000;
    const MB: u64 = 1_000 * KB;
    const GB: u64 = 1_000 * MB;
    const TB: u64 = 1_000 * GB;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
