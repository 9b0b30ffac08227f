//! Storage inspector: live volume usage plus the recent backup history.
//!
//! Every call to [`StorageInspector::capture`] hits the filesystem; nothing is
//! cached between calls. Unpromoted `.partial` staging artifacts and hidden
//! entries are never part of the history.

#![allow(missing_docs)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::config::{HistoryConfig, UsageSource};
use crate::core::errors::{GuardError, Result};
use crate::core::paths::is_artifact_name;
use crate::platform::pal::Platform;

/// A completed backup artifact found in the history directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

/// Storage state captured once at guard start; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub current_used_bytes: u64,
    pub volume_capacity_bytes: u64,
    /// Sizes of the most recent artifacts, newest first. Empty on the first run.
    pub recent_backup_sizes: Vec<u64>,
    /// The artifacts behind `recent_backup_sizes`, same order.
    pub recent_artifacts: Vec<BackupArtifact>,
    pub captured_at: DateTime<Utc>,
}

/// Reads the backup volume and history directory.
pub struct StorageInspector {
    platform: Arc<dyn Platform>,
    history_dir: PathBuf,
    volume_path: PathBuf,
    /// `history.volume` was set; it must exist as given.
    volume_explicit: bool,
    window: usize,
    usage_source: UsageSource,
    prefix: String,
    suffix: String,
}

impl StorageInspector {
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>, history: &HistoryConfig) -> Self {
        Self {
            platform,
            history_dir: history.dir.clone(),
            volume_path: history.volume_path().to_path_buf(),
            volume_explicit: history.volume.is_some(),
            window: history.window.max(1),
            usage_source: history.usage_source,
            prefix: history.artifact_prefix.clone(),
            suffix: history.artifact_suffix.clone(),
        }
    }

    #[must_use]
    pub fn history_dir(&self) -> &Path {
        &self.history_dir
    }

    /// Take a fresh snapshot of the volume and the last K backups.
    pub fn capture(&self) -> Result<UsageSnapshot> {
        let stats = self.platform.volume_stats(self.stat_path()?)?;
        let artifacts = self.list_artifacts()?;

        let current_used_bytes = match self.usage_source {
            UsageSource::Volume => stats.used_bytes(),
            UsageSource::History => artifacts
                .iter()
                .fold(0_u64, |acc, a| acc.saturating_add(a.size_bytes)),
        };

        let recent_artifacts: Vec<BackupArtifact> =
            artifacts.into_iter().take(self.window).collect();
        let recent_backup_sizes = recent_artifacts.iter().map(|a| a.size_bytes).collect();

        Ok(UsageSnapshot {
            current_used_bytes,
            volume_capacity_bytes: stats.total_bytes,
            recent_backup_sizes,
            recent_artifacts,
            captured_at: Utc::now(),
        })
    }

    /// The path whose filesystem is measured.
    ///
    /// A configured volume is statted as given and must exist. Without one the
    /// history directory stands in, and before the first backup it may not
    /// exist yet, so its nearest existing ancestor is used.
    fn stat_path(&self) -> Result<&Path> {
        if self.volume_explicit {
            return if self.volume_path.exists() {
                Ok(&self.volume_path)
            } else {
                Err(GuardError::inspection(
                    &self.volume_path,
                    "backup volume is not reachable",
                ))
            };
        }
        Ok(self
            .volume_path
            .ancestors()
            .find(|p| p.exists())
            .unwrap_or(&self.volume_path))
    }

    /// All completed artifacts, newest first (ties broken by name, descending).
    ///
    /// A history directory that does not exist yet is an empty history.
    pub fn list_artifacts(&self) -> Result<Vec<BackupArtifact>> {
        let entries = match fs::read_dir(&self.history_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(GuardError::inspection(
                    &self.history_dir,
                    format!("cannot list history: {e}"),
                ));
            }
        };

        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                GuardError::inspection(&self.history_dir, format!("cannot read entry: {e}"))
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !is_artifact_name(name, &self.prefix, &self.suffix) {
                continue;
            }

            let path = entry.path();
            let meta = entry
                .metadata()
                .map_err(|e| GuardError::inspection(&path, format!("cannot stat: {e}")))?;
            let size_bytes = if meta.is_file() {
                meta.len()
            } else if meta.is_dir() {
                tree_size(&path)?
            } else {
                continue;
            };
            let modified = meta
                .modified()
                .map_err(|e| GuardError::inspection(&path, format!("no mtime: {e}")))?;

            artifacts.push(BackupArtifact {
                path,
                size_bytes,
                modified: DateTime::<Utc>::from(modified),
            });
        }

        artifacts.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
        Ok(artifacts)
    }
}

/// Total size of regular files under `root`, without following symlinks.
pub(crate) fn tree_size(root: &Path) -> Result<u64> {
    let mut total = 0_u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(&dir)
            .map_err(|e| GuardError::inspection(&dir, format!("cannot list: {e}")))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| GuardError::inspection(&dir, format!("cannot read entry: {e}")))?;
            let meta = entry
                .metadata()
                .map_err(|e| GuardError::inspection(entry.path(), format!("cannot stat: {e}")))?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                total = total.saturating_add(meta.len());
            }
        }
    }
    Ok(total)
}
