//! Threshold evaluator: the pure admit/deny decision.
//!
//! ```text
//! available = total_budget - safety_margin
//! ceiling   = available * abort_fraction        (inclusive)
//! projected = current_used + estimate(recent sizes)
//! ```
//!
//! Evaluation is total and side-effect free: a misconfigured budget is a
//! `Deny`, never an error, so the orchestrator always has a verdict to act on.

#![allow(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::guard::inspector::UsageSnapshot;

/// Fixed-point scale for the abort fraction (parts per billion).
const FRACTION_SCALE: u128 = 1_000_000_000;

// ──────────────────── limits ────────────────────

/// Immutable storage budget for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageLimits {
    /// Total bytes allocated to backups, safety margin included.
    pub total_budget_bytes: u64,
    /// Bytes reserved for the host OS; never available to backups.
    pub safety_margin_bytes: u64,
    /// Fraction of the usable budget that is the hard ceiling, in (0, 1].
    pub abort_fraction: f64,
}

impl Default for StorageLimits {
    fn default() -> Self {
        Self {
            total_budget_bytes: 20_000_000_000,
            safety_margin_bytes: 500_000_000,
            abort_fraction: 0.9,
        }
    }
}

impl StorageLimits {
    /// Usable budget, or `None` when the margin swallows the whole budget.
    #[must_use]
    pub fn available_bytes(&self) -> Option<u64> {
        self.total_budget_bytes
            .checked_sub(self.safety_margin_bytes)
            .filter(|available| *available > 0)
    }

    /// Hard ceiling in bytes, or `None` for an unusable configuration.
    #[must_use]
    pub fn ceiling_bytes(&self) -> Option<u64> {
        let available = self.available_bytes()?;
        if !(self.abort_fraction.is_finite()
            && self.abort_fraction > 0.0
            && self.abort_fraction <= 1.0)
        {
            return None;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let parts = (self.abort_fraction * 1e9).round() as u128;
        let ceiling = u128::from(available) * parts / FRACTION_SCALE;
        // parts <= FRACTION_SCALE, so the ceiling never exceeds `available`.
        u64::try_from(ceiling).ok()
    }
}

// ──────────────────── estimate ────────────────────

/// How recent backup sizes are folded into the next-backup estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EstimatePolicy {
    /// Largest recent backup.
    #[default]
    Max,
    /// Nearest-rank percentile (1..=100) of recent backups.
    Percentile(u8),
}

impl fmt::Display for EstimatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Max => write!(f, "max"),
            Self::Percentile(p) => write!(f, "p{p}"),
        }
    }
}

/// Where an estimate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateSource {
    History,
    Default,
}

/// Estimated size of the next backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeEstimate {
    pub bytes: u64,
    pub source: EstimateSource,
    /// Number of recent sizes that fed the estimate.
    pub samples: usize,
}

/// Turns recent sizes into a [`SizeEstimate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeEstimator {
    pub policy: EstimatePolicy,
    /// Used when there is no history; must be > 0.
    pub default_bytes: u64,
}

impl SizeEstimator {
    #[must_use]
    pub const fn new(policy: EstimatePolicy, default_bytes: u64) -> Self {
        Self {
            policy,
            default_bytes,
        }
    }

    #[must_use]
    pub fn estimate(&self, recent_sizes: &[u64]) -> SizeEstimate {
        if recent_sizes.is_empty() {
            return SizeEstimate {
                bytes: self.default_bytes.max(1),
                source: EstimateSource::Default,
                samples: 0,
            };
        }

        let bytes = match self.policy {
            EstimatePolicy::Max => recent_sizes.iter().copied().max().unwrap_or(0),
            EstimatePolicy::Percentile(p) => nearest_rank(recent_sizes, p),
        };
        SizeEstimate {
            bytes,
            source: EstimateSource::History,
            samples: recent_sizes.len(),
        }
    }
}

fn nearest_rank(values: &[u64], percentile: u8) -> u64 {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let p = usize::from(percentile.clamp(1, 100));
    let rank = (p * sorted.len()).div_ceil(100).max(1);
    sorted[rank - 1]
}

// ──────────────────── verdict ────────────────────

/// Why a backup was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    ProjectedUsageExceedsThreshold,
    CurrentUsageExceedsThreshold,
    InvalidConfiguration,
}

impl DenyReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProjectedUsageExceedsThreshold => "projected usage exceeds threshold",
            Self::CurrentUsageExceedsThreshold => "current usage already exceeds threshold",
            Self::InvalidConfiguration => "invalid configuration",
        }
    }

    /// Configuration problems are not storage problems.
    #[must_use]
    pub const fn is_configuration(self) -> bool {
        matches!(self, Self::InvalidConfiguration)
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Admit {
        projected_usage_bytes: u64,
        limit_bytes: u64,
        estimate: SizeEstimate,
    },
    Deny {
        reason: DenyReason,
        projected_usage_bytes: u64,
        limit_bytes: u64,
        estimate: SizeEstimate,
    },
}

impl Verdict {
    #[must_use]
    pub const fn is_admit(&self) -> bool {
        matches!(self, Self::Admit { .. })
    }

    #[must_use]
    pub const fn projected_usage_bytes(&self) -> u64 {
        match self {
            Self::Admit {
                projected_usage_bytes,
                ..
            }
            | Self::Deny {
                projected_usage_bytes,
                ..
            } => *projected_usage_bytes,
        }
    }

    #[must_use]
    pub const fn limit_bytes(&self) -> u64 {
        match self {
            Self::Admit { limit_bytes, .. } | Self::Deny { limit_bytes, .. } => *limit_bytes,
        }
    }

    #[must_use]
    pub const fn estimate(&self) -> &SizeEstimate {
        match self {
            Self::Admit { estimate, .. } | Self::Deny { estimate, .. } => estimate,
        }
    }

    #[must_use]
    pub const fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Self::Admit { .. } => None,
            Self::Deny { reason, .. } => Some(*reason),
        }
    }
}

/// Decide whether the next backup may run. Pure, deterministic and total.
#[must_use]
pub fn evaluate(
    snapshot: &UsageSnapshot,
    limits: &StorageLimits,
    estimator: &SizeEstimator,
) -> Verdict {
    let estimate = estimator.estimate(&snapshot.recent_backup_sizes);
    let current = snapshot.current_used_bytes;
    let projected = current.saturating_add(estimate.bytes);

    let Some(ceiling) = limits.ceiling_bytes() else {
        return Verdict::Deny {
            reason: DenyReason::InvalidConfiguration,
            projected_usage_bytes: projected,
            limit_bytes: 0,
            estimate,
        };
    };

    let deny = |reason| Verdict::Deny {
        reason,
        projected_usage_bytes: projected,
        limit_bytes: ceiling,
        estimate,
    };

    if current > ceiling {
        return deny(DenyReason::CurrentUsageExceedsThreshold);
    }
    if projected > ceiling {
        return deny(DenyReason::ProjectedUsageExceedsThreshold);
    }
    Verdict::Admit {
        projected_usage_bytes: projected,
        limit_bytes: ceiling,
        estimate,
    }
}
