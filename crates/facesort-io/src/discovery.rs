//! Image discovery within a folder.

use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// File extensions treated as images (compared case-insensitively).
pub const IMAGE_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "bmp", "gif", "tif", "tiff", "webp"];

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("folder not found: {0}")]
    NotFound(String),
    #[error("not a folder: {0}")]
    NotADirectory(String),
}

/// Whether the path carries one of [`IMAGE_EXTENSIONS`].
pub fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// List image files in `directory`, sorted by path.
///
/// Only the folder itself is scanned unless `recursive` is set.
/// Unreadable entries are skipped.
pub fn discover_images(directory: &Path, recursive: bool) -> Result<Vec<PathBuf>, DiscoveryError> {
    if !directory.exists() {
        return Err(DiscoveryError::NotFound(directory.display().to_string()));
    }
    if !directory.is_dir() {
        return Err(DiscoveryError::NotADirectory(directory.display().to_string()));
    }

    let mut walker = WalkDir::new(directory).follow_links(false);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut images: Vec<PathBuf> = walker
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_image(e.path()))
        .map(|e| e.into_path())
        .collect();

    images.sort();
    tracing::debug!(folder = %directory.display(), count = images.len(), recursive, "discovered images");

    Ok(images)
}
