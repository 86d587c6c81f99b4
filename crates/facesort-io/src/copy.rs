//! Copying matched images into the destination folder.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CopyError {
    #[error("source has no file name: {0}")]
    NoFileName(String),
    #[error("cannot create destination {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("copy {from} -> {to} failed: {source}")]
    Copy {
        from: String,
        to: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown collision policy: {0} (expected rename, overwrite or skip)")]
    UnknownPolicy(String),
}

/// What to do when the destination already holds a file with the same name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Keep both: the new copy becomes `name (1).ext`, `name (2).ext`, ...
    #[default]
    Rename,
    Overwrite,
    Skip,
}

impl fmt::Display for CollisionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rename => "rename",
            Self::Overwrite => "overwrite",
            Self::Skip => "skip",
        })
    }
}

impl FromStr for CollisionPolicy {
    type Err = CopyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rename" => Ok(Self::Rename),
            "overwrite" => Ok(Self::Overwrite),
            "skip" => Ok(Self::Skip),
            other => Err(CopyError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Result of copying one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied(PathBuf),
    Skipped(PathBuf),
}

/// Create `dir` (and parents) if it does not exist yet.
pub fn ensure_dir(dir: &Path) -> Result<(), CopyError> {
    std::fs::create_dir_all(dir).map_err(|source| CopyError::CreateDir {
        path: dir.display().to_string(),
        source,
    })
}

/// Copy `source` into `dest_dir`, keeping its file name.
///
/// The destination folder must already exist.
pub fn copy_into(source: &Path, dest_dir: &Path, policy: CollisionPolicy) -> Result<CopyOutcome, CopyError> {
    let name = source
        .file_name()
        .ok_or_else(|| CopyError::NoFileName(source.display().to_string()))?;
    let mut target = dest_dir.join(name);

    if target.exists() {
        match policy {
            CollisionPolicy::Overwrite => {}
            CollisionPolicy::Skip => {
                tracing::debug!(target = %target.display(), "destination exists, skipping");
                return Ok(CopyOutcome::Skipped(target));
            }
            CollisionPolicy::Rename => target = free_name(dest_dir, source),
        }
    }

    std::fs::copy(source, &target).map_err(|e| CopyError::Copy {
        from: source.display().to_string(),
        to: target.display().to_string(),
        source: e,
    })?;

    Ok(CopyOutcome::Copied(target))
}

/// First `stem (n).ext` in `dir` that does not exist yet.
fn free_name(dir: &Path, source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = source.extension().map(|e| e.to_string_lossy().into_owned());

    (1u32..)
        .map(|n| match &ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| dir.join(source.file_name().unwrap_or_default()))
}
