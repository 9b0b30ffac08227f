//! Configuration system: TOML file + env var overrides + conservative defaults.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::alert::notifier::AlertConfig;
use crate::core::errors::{GuardError, Result};
use crate::core::paths::resolve_absolute_path;
use crate::core::redact::{REDACTED, Redactor, is_sensitive_env_name};
use crate::guard::threshold::{EstimatePolicy, StorageLimits};

/// Full guard configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub limits: StorageLimits,
    pub history: HistoryConfig,
    pub executor: ExecutorConfig,
    pub alerts: AlertConfig,
    pub paths: PathsConfig,
}

/// Where the "current usage" figure comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    /// Used bytes of the whole volume (budget includes the OS safety margin).
    Volume,
    /// Sum of completed artifacts in the history directory (dedicated budget).
    History,
}

/// Backup history location and size-estimation policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HistoryConfig {
    /// Directory the producer's artifacts live in.
    pub dir: PathBuf,
    /// Any path on the backup volume; defaults to `dir`.
    pub volume: Option<PathBuf>,
    /// Number of most recent artifacts feeding the estimate.
    pub window: usize,
    pub estimate: EstimatePolicy,
    /// Estimate used on the first run, when no history exists.
    pub default_estimate_bytes: u64,
    pub usage_source: UsageSource,
    pub artifact_prefix: String,
    pub artifact_suffix: String,
}

impl HistoryConfig {
    /// Path statted for volume capacity and usage.
    #[must_use]
    pub fn volume_path(&self) -> &Path {
        self.volume.as_deref().unwrap_or(&self.dir)
    }
}

/// How the backup producer is invoked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Program followed by its arguments. `{artifact}` is replaced by the staging path.
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Extra environment for the producer. Values of secret-named keys are redacted.
    pub env: BTreeMap<String, String>,
    pub timeout_secs: u64,
    /// Tail of producer output kept for failure diagnostics.
    pub diagnostics_max_bytes: usize,
    /// Literal strings that must never appear in alerts or logs.
    pub secrets: Vec<String>,
}

impl ExecutorConfig {
    /// A run needs a producer; `check` and `history` do not.
    pub fn ensure_runnable(&self) -> Result<()> {
        match self.command.first() {
            Some(program) if !program.trim().is_empty() => Ok(()),
            _ => Err(GuardError::InvalidConfig {
                details: "executor.command must name the backup producer".to_string(),
            }),
        }
    }
}

/// Filesystem paths used by bsg itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub lock_file: PathBuf,
    pub jsonl_log: PathBuf,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            dir: data_dir().join("backups"),
            volume: None,
            window: 5,
            estimate: EstimatePolicy::Max,
            default_estimate_bytes: 1_000_000_000,
            usage_source: UsageSource::Volume,
            artifact_prefix: "backup-".to_string(),
            artifact_suffix: ".tar.gz".to_string(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            timeout_secs: 60 * 60,
            diagnostics_max_bytes: 4096,
            secrets: Vec::new(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = home_dir();
        let data = data_dir();
        Self {
            config_file: home_dir.join(".config").join("bsg").join("config.toml"),
            lock_file: data.join("guard.lock"),
            jsonl_log: data.join("transitions.jsonl"),
        }
    }
}

fn home_dir() -> PathBuf {
    env::var_os("HOME").map_or_else(
        || {
            eprintln!("[BSG-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths");
            PathBuf::from("/tmp")
        },
        PathBuf::from,
    )
}

pub(crate) fn data_dir() -> PathBuf {
    home_dir().join(".local").join("share").join("bsg")
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| GuardError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(GuardError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.normalize_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Copy safe to print: secret-named producer environment values, literal
    /// secrets and the webhook URL are masked, other values are scrubbed.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let redactor = Redactor::from_executor(&self.executor);
        let mut shown = self.clone();
        for (name, value) in &mut shown.executor.env {
            *value = if is_sensitive_env_name(name) {
                REDACTED.to_string()
            } else {
                redactor.redact(value).into_owned()
            };
        }
        for secret in &mut shown.executor.secrets {
            *secret = REDACTED.to_string();
        }
        shown.executor.command = shown
            .executor
            .command
            .iter()
            .map(|arg| redactor.redact(arg).into_owned())
            .collect();
        if !shown.alerts.webhook.url.is_empty() {
            shown.alerts.webhook.url = REDACTED.to_string();
        }
        shown
    }

    /// Deterministic hash of the effective config for the audit log.
    ///
    /// FNV-1a over canonical JSON, stable across processes and toolchains.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut get = |name: &'static str| lookup(name).map(|raw| (name, raw));

        // limits
        if let Some((name, raw)) = get("BSG_LIMITS_TOTAL_BUDGET_BYTES") {
            self.limits.total_budget_bytes = parse_env(name, &raw)?;
        }
        if let Some((name, raw)) = get("BSG_LIMITS_SAFETY_MARGIN_BYTES") {
            self.limits.safety_margin_bytes = parse_env(name, &raw)?;
        }
        if let Some((name, raw)) = get("BSG_LIMITS_ABORT_FRACTION") {
            self.limits.abort_fraction = parse_env(name, &raw)?;
        }

        // history
        if let Some((_, raw)) = get("BSG_HISTORY_DIR") {
            self.history.dir = PathBuf::from(raw);
        }
        if let Some((_, raw)) = get("BSG_HISTORY_VOLUME") {
            self.history.volume = Some(PathBuf::from(raw));
        }
        if let Some((name, raw)) = get("BSG_HISTORY_WINDOW") {
            self.history.window = parse_env(name, &raw)?;
        }
        if let Some((name, raw)) = get("BSG_HISTORY_DEFAULT_ESTIMATE_BYTES") {
            self.history.default_estimate_bytes = parse_env(name, &raw)?;
        }

        // executor
        if let Some((name, raw)) = get("BSG_EXECUTOR_TIMEOUT_SECS") {
            self.executor.timeout_secs = parse_env(name, &raw)?;
        }

        // alerts
        if let Some((name, raw)) = get("BSG_ALERTS_MAX_ATTEMPTS") {
            self.alerts.max_attempts = parse_env(name, &raw)?;
        }
        if let Some((name, raw)) = get("BSG_ALERTS_BACKOFF_MS") {
            self.alerts.backoff_ms = parse_env(name, &raw)?;
        }
        if let Some((_, raw)) = get("BSG_ALERTS_SENDMAIL_RECIPIENT") {
            self.alerts.sendmail.recipient = raw;
        }
        if let Some((_, raw)) = get("BSG_ALERTS_WEBHOOK_URL") {
            self.alerts.webhook.url = raw;
        }

        // paths
        if let Some((_, raw)) = get("BSG_PATHS_LOCK_FILE") {
            self.paths.lock_file = PathBuf::from(raw);
        }
        if let Some((_, raw)) = get("BSG_PATHS_JSONL_LOG") {
            self.paths.jsonl_log = PathBuf::from(raw);
        }

        Ok(())
    }

    /// Make history and lock paths absolute so the lock is scoped to one location.
    fn normalize_paths(&mut self) {
        self.history.dir = resolve_absolute_path(&self.history.dir);
        if let Some(volume) = self.history.volume.as_mut() {
            *volume = resolve_absolute_path(volume);
        }
        self.paths.lock_file = resolve_absolute_path(&self.paths.lock_file);
        self.paths.jsonl_log = resolve_absolute_path(&self.paths.jsonl_log);
        self.alerts.file.path = resolve_absolute_path(&self.alerts.file.path);
        if let Some(dir) = self.executor.working_dir.as_mut() {
            *dir = resolve_absolute_path(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.safety_margin_bytes >= limits.total_budget_bytes {
            return Err(GuardError::InvalidConfig {
                details: format!(
                    "limits.safety_margin_bytes ({}) must be < limits.total_budget_bytes ({})",
                    limits.safety_margin_bytes, limits.total_budget_bytes
                ),
            });
        }
        if !(limits.abort_fraction.is_finite()
            && limits.abort_fraction > 0.0
            && limits.abort_fraction <= 1.0)
        {
            return Err(GuardError::InvalidConfig {
                details: format!(
                    "limits.abort_fraction must be in (0, 1], got {}",
                    limits.abort_fraction
                ),
            });
        }

        if self.history.window == 0 {
            return Err(GuardError::InvalidConfig {
                details: "history.window must be >= 1".to_string(),
            });
        }
        if let EstimatePolicy::Percentile(p) = self.history.estimate
            && !(1..=100).contains(&p)
        {
            return Err(GuardError::InvalidConfig {
                details: format!("history.estimate percentile must be in 1..=100, got {p}"),
            });
        }
        if self.history.default_estimate_bytes == 0 {
            return Err(GuardError::InvalidConfig {
                details: "history.default_estimate_bytes must be > 0".to_string(),
            });
        }
        if self.history.artifact_prefix.is_empty() || self.history.artifact_prefix.starts_with('.')
        {
            return Err(GuardError::InvalidConfig {
                details: "history.artifact_prefix must be non-empty and must not start with '.'"
                    .to_string(),
            });
        }
        if self.history.artifact_prefix.contains('/') || self.history.artifact_suffix.contains('/')
        {
            return Err(GuardError::InvalidConfig {
                details: "history.artifact_prefix/suffix must not contain '/'".to_string(),
            });
        }

        if self.executor.timeout_secs == 0 {
            return Err(GuardError::InvalidConfig {
                details: "executor.timeout_secs must be > 0".to_string(),
            });
        }

        self.alerts.validate()?;
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|error| GuardError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}
