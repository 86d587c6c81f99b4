//! Object-detection pre-filter.
//!
//! Narrows a candidate list down to images showing at least one object of a
//! requested class before any face work is done.

use facesort_io::{Frame, FrameError};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// PASCAL VOC classes in model output order. Index 0 is the background class.
pub const VOC_CLASSES: [&str; 21] = [
    "background",
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

const SSD_INPUT_SIZE: u32 = 300;
const SSD_MEAN: f32 = 127.5;
const SSD_SCALE: f32 = 0.007843;
/// Values per output row: image id, class id, score, x1, y1, x2, y2.
const SSD_ROW_LEN: usize = 7;

#[derive(Error, Debug)]
pub enum ObjectFilterError {
    #[error("object model not found: {0}")]
    ModelNotFound(String),
    #[error("unknown object class: {0}")]
    UnknownClass(String),
    #[error("object detection failed: {0}")]
    InferenceFailed(String),
    #[error(transparent)]
    Unreadable(#[from] FrameError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Whether `name` is a class the object model can report.
pub fn is_known_class(name: &str) -> bool {
    VOC_CLASSES[1..].contains(&name)
}

/// Keeps the images that show any of the requested classes.
pub trait ObjectFilter {
    /// Return the subset of `paths` (order preserved) with at least one
    /// detection of a class in `classes` scoring at least `confidence`.
    /// `progress` receives the completed fraction in [0, 1].
    fn filter(
        &mut self,
        paths: &[PathBuf],
        classes: &BTreeSet<String>,
        confidence: f32,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Vec<PathBuf>, ObjectFilterError>;
}

/// MobileNet-SSD (VOC) object detector.
pub struct SsdObjectFilter {
    session: Session,
}

impl SsdObjectFilter {
    pub fn load(model_path: &Path) -> Result<Self, ObjectFilterError> {
        if !model_path.exists() {
            return Err(ObjectFilterError::ModelNotFound(model_path.display().to_string()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        tracing::info!(path = %model_path.display(), "loaded object detection model");
        Ok(Self { session })
    }

    /// (class id, score) for every detection in the frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<(usize, f32)>, ObjectFilterError> {
        let input = preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ObjectFilterError::InferenceFailed(e.to_string()))?;
        Ok(parse_detections(raw))
    }
}

impl ObjectFilter for SsdObjectFilter {
    fn filter(
        &mut self,
        paths: &[PathBuf],
        classes: &BTreeSet<String>,
        confidence: f32,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Vec<PathBuf>, ObjectFilterError> {
        if let Some(unknown) = classes.iter().find(|c| !is_known_class(c)) {
            return Err(ObjectFilterError::UnknownClass(unknown.clone()));
        }
        let wanted: Vec<usize> = VOC_CLASSES
            .iter()
            .enumerate()
            .filter(|(_, name)| classes.contains(**name))
            .map(|(id, _)| id)
            .collect();

        let kept = screen(paths, &wanted, confidence, progress, |path| {
            let frame = Frame::load(path)?;
            self.detect(&frame)
        })?;
        tracing::info!(candidates = paths.len(), kept = kept.len(), "object filter done");
        Ok(kept)
    }
}

/// Keep the paths where `detect` reports a wanted class at or above
/// `confidence`. A failing image is logged and dropped; the batch only fails
/// when inference failed on every image that could be read.
fn screen(
    paths: &[PathBuf],
    wanted: &[usize],
    confidence: f32,
    progress: &mut dyn FnMut(f32),
    mut detect: impl FnMut(&Path) -> Result<Vec<(usize, f32)>, ObjectFilterError>,
) -> Result<Vec<PathBuf>, ObjectFilterError> {
    let mut kept = Vec::new();
    let mut inferred = 0usize;
    let mut last_failure = None;

    for (done, path) in paths.iter().enumerate() {
        match detect(path) {
            Ok(found) => {
                inferred += 1;
                if found.iter().any(|&(class, score)| score >= confidence && wanted.contains(&class)) {
                    kept.push(path.clone());
                }
            }
            Err(ObjectFilterError::Unreadable(e)) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable image dropped by object filter");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "object detection failed, image dropped");
                last_failure = Some(e);
            }
        }
        progress((done + 1) as f32 / paths.len() as f32);
    }

    match last_failure {
        Some(e) if inferred == 0 => Err(e),
        _ => Ok(kept),
    }
}

/// Resize to 300x300 and build a BGR NCHW tensor scaled as `(px - 127.5) · 0.007843`.
fn preprocess(frame: &Frame) -> Array4<f32> {
    let resized = frame.resize_bilinear(SSD_INPUT_SIZE, SSD_INPUT_SIZE);
    let size = SSD_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let [r, g, b] = resized.pixel(x as i32, y as i32);
            for (c, v) in [b, g, r].into_iter().enumerate() {
                tensor[[0, c, y, x]] = (v as f32 - SSD_MEAN) * SSD_SCALE;
            }
        }
    }
    tensor
}

/// Rows of `[image_id, class, score, x1, y1, x2, y2]`.
fn parse_detections(raw: &[f32]) -> Vec<(usize, f32)> {
    raw.chunks_exact(SSD_ROW_LEN)
        .filter(|row| row[1] >= 0.0)
        .map(|row| (row[1] as usize, row[2]))
        .collect()
}
