//! Image → face embeddings.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{Detection, DetectorKind, Dimensionality, ExtractorParams};
use facesort_io::Frame;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that make extraction impossible for every image, not just one.
#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Turns an image file into zero or more face detections.
///
/// Per-image problems (unreadable file, no faces, a failed inference on that
/// image) yield an empty list; `Err` is reserved for model-level failures.
pub trait EncodingExtractor {
    /// Load whatever `params` needs up front. Default: nothing to do.
    fn prepare(&mut self, _params: &ExtractorParams) -> Result<(), ExtractorError> {
        Ok(())
    }

    fn extract(&mut self, image_path: &Path, params: &ExtractorParams) -> Result<Vec<Detection>, ExtractorError>;
}

/// Locations of the ONNX models used by [`OnnxExtractor`].
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub fast_detector: PathBuf,
    pub accurate_detector: PathBuf,
    pub recognizer_128: PathBuf,
    pub recognizer_512: PathBuf,
}

impl ModelPaths {
    /// Standard file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            fast_detector: dir.join("det_500m.onnx"),
            accurate_detector: dir.join("det_10g.onnx"),
            recognizer_128: dir.join("facenet_128.onnx"),
            recognizer_512: dir.join("w600k_r50.onnx"),
        }
    }

    pub fn detector(&self, kind: DetectorKind) -> &Path {
        match kind {
            DetectorKind::Fast => &self.fast_detector,
            DetectorKind::Accurate => &self.accurate_detector,
        }
    }

    pub fn recognizer(&self, dimensionality: Dimensionality) -> &Path {
        match dimensionality {
            Dimensionality::D128 => &self.recognizer_128,
            Dimensionality::D512 => &self.recognizer_512,
        }
    }
}

/// SCRFD detection + recognizer embedding, models loaded on first use.
pub struct OnnxExtractor {
    paths: ModelPaths,
    detectors: HashMap<DetectorKind, FaceDetector>,
    recognizers: HashMap<Dimensionality, FaceRecognizer>,
}

impl OnnxExtractor {
    pub fn new(paths: ModelPaths) -> Self {
        Self {
            paths,
            detectors: HashMap::new(),
            recognizers: HashMap::new(),
        }
    }

    fn models(&mut self, params: &ExtractorParams) -> Result<(&mut FaceDetector, &mut FaceRecognizer), ExtractorError> {
        let detector = match self.detectors.entry(params.detector) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(FaceDetector::load(self.paths.detector(params.detector), params.detector)?),
        };
        let recognizer = match self.recognizers.entry(params.dimensionality) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(FaceRecognizer::load(
                self.paths.recognizer(params.dimensionality),
                params.dimensionality,
            )?),
        };
        Ok((detector, recognizer))
    }
}

impl EncodingExtractor for OnnxExtractor {
    fn prepare(&mut self, params: &ExtractorParams) -> Result<(), ExtractorError> {
        self.models(params).map(|_| ())
    }

    fn extract(&mut self, image_path: &Path, params: &ExtractorParams) -> Result<Vec<Detection>, ExtractorError> {
        let (detector, recognizer) = self.models(params)?;

        let frame = match Frame::load(image_path) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(path = %image_path.display(), error = %e, "unreadable image, treating as no faces");
                return Ok(Vec::new());
            }
        };

        let faces = match detector.detect(&frame, params.upsample) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(path = %image_path.display(), error = %e, "face detection failed");
                return Ok(Vec::new());
            }
        };

        let mut detections = Vec::with_capacity(faces.len());
        for face in faces {
            match recognizer.extract(&frame, &face, params.jitters) {
                Ok(embedding) => detections.push(Detection { embedding, location: face }),
                Err(e @ RecognizerError::WrongDimensionality { .. }) => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(path = %image_path.display(), error = %e, "embedding failed for one face");
                }
            }
        }

        tracing::debug!(
            path = %image_path.display(),
            faces = detections.len(),
            detector = %detector.kind(),
            dimensionality = %recognizer.dimensionality(),
            "extracted"
        );
        Ok(detections)
    }
}
