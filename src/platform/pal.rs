//! PAL trait and the statvfs-backed implementation.

#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::errors::{GuardError, Result};

/// Filesystem statistics for the volume holding a path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeStats {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub available_bytes: u64,
    pub is_readonly: bool,
}

impl VolumeStats {
    /// Bytes in use, counting blocks reserved for root as free.
    #[must_use]
    pub const fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }
}

/// OS abstraction used by the storage inspector.
pub trait Platform: Send + Sync {
    /// Live statistics for the volume containing `path`. Never cached.
    fn volume_stats(&self, path: &Path) -> Result<VolumeStats>;
}

/// Unix implementation using `statvfs`.
#[derive(Debug, Default)]
pub struct UnixPlatform;

impl UnixPlatform {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
impl Platform for UnixPlatform {
    fn volume_stats(&self, path: &Path) -> Result<VolumeStats> {
        let stat = nix::sys::statvfs::statvfs(path)
            .map_err(|error| GuardError::inspection(path, error.to_string()))?;
        let fragment = stat.fragment_size();
        Ok(VolumeStats {
            total_bytes: stat.blocks().saturating_mul(fragment),
            free_bytes: stat.blocks_free().saturating_mul(fragment),
            available_bytes: stat.blocks_available().saturating_mul(fragment),
            is_readonly: stat.flags().contains(nix::sys::statvfs::FsFlags::ST_RDONLY),
        })
    }
}

#[cfg(not(unix))]
impl Platform for UnixPlatform {
    fn volume_stats(&self, path: &Path) -> Result<VolumeStats> {
        Err(GuardError::inspection(
            path,
            "volume statistics are only supported on unix",
        ))
    }
}

/// Platform implementation for the current OS.
#[must_use]
pub fn detect_platform() -> Arc<dyn Platform> {
    Arc::new(UnixPlatform::new())
}
