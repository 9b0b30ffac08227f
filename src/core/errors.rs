//! BSG-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, GuardError>;

/// Top-level error type for the backup storage guard.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("[BSG-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[BSG-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[BSG-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[BSG-2001] storage inspection failed for {path}: {details}")]
    Inspection { path: PathBuf, details: String },

    #[error("[BSG-2002] guard lock {path} is held by another run")]
    LockHeld { path: PathBuf },

    #[error("[BSG-3001] backup execution failed: {details}")]
    Execution { details: String },

    #[error("[BSG-4001] alert delivery failed after {attempts} attempt(s): {details}")]
    Notify { attempts: u32, details: String },

    #[error("[BSG-5001] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[BSG-5002] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },
}

impl GuardError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "BSG-1001",
            Self::MissingConfig { .. } => "BSG-1002",
            Self::ConfigParse { .. } => "BSG-1003",
            Self::Inspection { .. } => "BSG-2001",
            Self::LockHeld { .. } => "BSG-2002",
            Self::Execution { .. } => "BSG-3001",
            Self::Notify { .. } => "BSG-4001",
            Self::Io { .. } => "BSG-5001",
            Self::Serialization { .. } => "BSG-5002",
        }
    }

    /// Whether retrying on the scheduler's next cycle might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Inspection { .. }
                | Self::LockHeld { .. }
                | Self::Execution { .. }
                | Self::Notify { .. }
                | Self::Io { .. }
        )
    }

    /// Process exit code a guard run reports for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidConfig { .. } | Self::MissingConfig { .. } | Self::ConfigParse { .. } => {
                11
            }
            Self::Execution { .. } => 12,
            Self::Inspection { .. } => 13,
            Self::LockHeld { .. } => 14,
            Self::Notify { .. } => 15,
            Self::Io { .. } | Self::Serialization { .. } => 1,
        }
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for inspection failures.
    #[must_use]
    pub fn inspection(path: impl AsRef<Path>, details: impl Into<String>) -> Self {
        Self::Inspection {
            path: path.as_ref().to_path_buf(),
            details: details.into(),
        }
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for GuardError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
