//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use backup_storage_guard::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{GuardError, Result};
pub use crate::core::redact::Redactor;

// Platform
pub use crate::platform::pal::{Platform, VolumeStats, detect_platform};

// Guard
pub use crate::guard::executor::{BackupExecutor, FailureCause, ProducerInvocation, RunResult};
pub use crate::guard::inspector::{BackupArtifact, StorageInspector, UsageSnapshot};
pub use crate::guard::lock::VolumeLock;
pub use crate::guard::orchestrator::{GuardOrchestrator, GuardState, RunMode, RunOutcome};
pub use crate::guard::signals::CancellationSignal;
pub use crate::guard::threshold::{
    DenyReason, EstimatePolicy, SizeEstimate, SizeEstimator, StorageLimits, Verdict, evaluate,
};

// Alerts
pub use crate::alert::event::{AlertEvent, AlertSeverity};
pub use crate::alert::notifier::{AlertConfig, AlertNotifier, NotifyReceipt, TransportNotifier};

// Logging
pub use crate::logger::jsonl::{JsonlConfig, JsonlWriter};
