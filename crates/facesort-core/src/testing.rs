//! Stand-ins for the ONNX-backed collaborators.

use crate::extractor::{EncodingExtractor, ExtractorError};
use crate::objects::{ObjectFilter, ObjectFilterError};
use crate::types::{BoundingBox, Detection, Dimensionality, Embedding, ExtractorParams};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Embedding whose leading values are `head`, zero elsewhere.
pub fn embedding(dim: Dimensionality, head: &[f32]) -> Embedding {
    let mut values = vec![0.0; dim.size()];
    values[..head.len()].copy_from_slice(head);
    Embedding::new(values)
}

pub fn face(embedding: Embedding, confidence: f32) -> Detection {
    Detection {
        embedding,
        location: BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 32.0,
            height: 32.0,
            confidence,
            landmarks: None,
        },
    }
}

/// Create empty files; only their names matter to the fakes.
pub fn touch(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
    names
        .iter()
        .map(|name| {
            let path = dir.join(name);
            std::fs::write(&path, name.as_bytes()).unwrap();
            path
        })
        .collect()
}

/// Returns canned detections keyed by file name; unknown files have no faces.
#[derive(Default)]
pub struct FakeExtractor {
    faces: HashMap<String, Vec<Detection>>,
    pub calls: Vec<PathBuf>,
    pub prepared: usize,
}

impl FakeExtractor {
    pub fn with(mut self, file_name: &str, faces: Vec<Detection>) -> Self {
        self.faces.insert(file_name.to_string(), faces);
        self
    }
}

impl EncodingExtractor for FakeExtractor {
    fn prepare(&mut self, _params: &ExtractorParams) -> Result<(), ExtractorError> {
        self.prepared += 1;
        Ok(())
    }

    fn extract(&mut self, image_path: &Path, _params: &ExtractorParams) -> Result<Vec<Detection>, ExtractorError> {
        self.calls.push(image_path.to_path_buf());
        let name = image_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        Ok(self.faces.get(&name).cloned().unwrap_or_default())
    }
}

/// Keeps the files whose names are listed, reporting progress per file.
pub struct FakeObjectFilter {
    pub keep: BTreeSet<String>,
    pub seen: Vec<PathBuf>,
}

impl FakeObjectFilter {
    pub fn keeping(names: &[&str]) -> Self {
        Self {
            keep: names.iter().map(|n| n.to_string()).collect(),
            seen: Vec::new(),
        }
    }
}

impl ObjectFilter for FakeObjectFilter {
    fn filter(
        &mut self,
        paths: &[PathBuf],
        _classes: &BTreeSet<String>,
        _confidence: f32,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Vec<PathBuf>, ObjectFilterError> {
        let mut kept = Vec::new();
        for (i, path) in paths.iter().enumerate() {
            self.seen.push(path.clone());
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            if self.keep.contains(&name) {
                kept.push(path.clone());
            }
            progress((i + 1) as f32 / paths.len() as f32);
        }
        Ok(kept)
    }
}
