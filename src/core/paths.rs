//! Path helpers: absolute resolution and the artifact naming scheme.
//!
//! A completed artifact is `<prefix><UTC stamp><suffix>` inside the history
//! directory. While the producer is still writing it lives at a hidden sibling
//! `.<final name>.partial`, which the inspector never counts.

use std::env;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};

/// Suffix marking an artifact that has not been promoted yet.
pub const STAGING_SUFFIX: &str = ".partial";

/// Resolve a path to an absolute, normalized path.
///
/// A leading `~/` is expanded from `HOME`. Existing paths are canonicalized
/// (symlinks resolved). Missing paths are made absolute against the CWD and
/// `.`/`..` are folded syntactically.
pub fn resolve_absolute_path(path: &Path) -> PathBuf {
    let expanded = expand_home(path);
    let path = expanded.as_path();
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    };

    std::fs::canonicalize(&absolute).unwrap_or_else(|_| normalize_syntactic(&absolute))
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

fn normalize_syntactic(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::Normal(_) => {
                components.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
        }
    }
    components.into_iter().collect()
}

/// File name of the artifact produced at `stamp`.
#[must_use]
pub fn artifact_file_name(prefix: &str, suffix: &str, stamp: DateTime<Utc>) -> String {
    format!("{prefix}{}{suffix}", stamp.format("%Y%m%dT%H%M%SZ"))
}

/// Hidden staging location for a final artifact path.
#[must_use]
pub fn staging_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
    final_path.with_file_name(format!(".{name}{STAGING_SUFFIX}"))
}

/// Whether a directory entry name is an unpromoted staging artifact of this
/// guard, i.e. `.<prefix>…<suffix>.partial`.
#[must_use]
pub fn is_staging_name(name: &str, prefix: &str, suffix: &str) -> bool {
    name.strip_prefix('.')
        .and_then(|rest| rest.strip_suffix(STAGING_SUFFIX))
        .is_some_and(|inner| is_artifact_name(inner, prefix, suffix))
}

/// Whether a directory entry name is a completed artifact.
#[must_use]
pub fn is_artifact_name(name: &str, prefix: &str, suffix: &str) -> bool {
    !name.starts_with('.')
        && !name.ends_with(STAGING_SUFFIX)
        && name.len() >= prefix.len() + suffix.len()
        && name.starts_with(prefix)
        && name.ends_with(suffix)
}
