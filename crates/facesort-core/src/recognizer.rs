//! Face recognizer via ONNX Runtime.
//!
//! Extracts 128- or 512-dimensional face embeddings from aligned face crops.
//! The 512-d path uses the w600k_r50 ArcFace model; the 128-d path expects a
//! model with the same 112x112 RGB input and a 128-value output.

use crate::alignment::{self, Jitter, ALIGNED_SIZE};
use crate::types::{BoundingBox, Dimensionality, Embedding};
use facesort_io::Frame;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use thiserror::Error;

const RECOGNIZER_MEAN: f32 = 127.5;
const RECOGNIZER_STD: f32 = 127.5; // symmetric normalization, NOT 128.0
/// Fixed so that repeated runs over the same image give the same embedding.
const JITTER_SEED: u64 = 0x5EED_FACE;
const JITTER_MAX_SHIFT_PX: f32 = 2.0;
const JITTER_MAX_SCALE: f32 = 0.05;
const JITTER_MAX_ANGLE_DEG: f32 = 3.0;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (place the recognition model in the model dir)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks to align")]
    NoLandmarks,
    #[error("recognizer produced {actual}-dim embeddings, configured for {expected}")]
    WrongDimensionality { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Embedding model wrapper.
pub struct FaceRecognizer {
    session: Session,
    dimensionality: Dimensionality,
    model_version: String,
}

impl FaceRecognizer {
    /// Load a recognition model producing `dimensionality`-length embeddings.
    pub fn load(model_path: &Path, dimensionality: Dimensionality) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let model_version = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        tracing::info!(
            path = %model_path.display(),
            %dimensionality,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded recognition model"
        );

        Ok(Self {
            session,
            dimensionality,
            model_version,
        })
    }

    pub fn dimensionality(&self) -> Dimensionality {
        self.dimensionality
    }

    /// Extract an embedding for one detected face.
    ///
    /// With `jitters > 1` the face is re-aligned that many times under small
    /// deterministic perturbations and the embeddings are averaged.
    pub fn extract(&mut self, frame: &Frame, face: &BoundingBox, jitters: u32) -> Result<Embedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let expected = self.dimensionality.size();

        let mut sum = vec![0.0f32; expected];
        for jitter in jitter_plan(jitters) {
            let aligned = alignment::align_face(frame, landmarks, &jitter);
            let raw = self.run(&aligned)?;
            if raw.len() != expected {
                return Err(RecognizerError::WrongDimensionality {
                    expected,
                    actual: raw.len(),
                });
            }
            for (acc, v) in sum.iter_mut().zip(l2_normalize(raw)) {
                *acc += v;
            }
        }

        Ok(Embedding {
            values: l2_normalize(sum),
            model_version: Some(self.model_version.clone()),
        })
    }

    fn run(&mut self, aligned: &[u8]) -> Result<Vec<f32>, RecognizerError> {
        let input = preprocess(aligned);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        Ok(raw_data.to_vec())
    }
}

/// Perturbations used for `jitters` passes. Pass 0 is always the exact alignment.
pub fn jitter_plan(jitters: u32) -> Vec<Jitter> {
    let mut rng = StdRng::seed_from_u64(JITTER_SEED);
    (0..jitters.max(1))
        .map(|pass| {
            if pass == 0 {
                return Jitter::NONE;
            }
            Jitter {
                dx: rng.gen_range(-JITTER_MAX_SHIFT_PX..=JITTER_MAX_SHIFT_PX),
                dy: rng.gen_range(-JITTER_MAX_SHIFT_PX..=JITTER_MAX_SHIFT_PX),
                scale: 1.0 + rng.gen_range(-JITTER_MAX_SCALE..=JITTER_MAX_SCALE),
                angle_deg: rng.gen_range(-JITTER_MAX_ANGLE_DEG..=JITTER_MAX_ANGLE_DEG),
                mirror: pass % 2 == 1,
            }
        })
        .collect()
}

/// Scale to unit length; the zero vector is returned unchanged.
pub fn l2_normalize(values: Vec<f32>) -> Vec<f32> {
    let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.into_iter().map(|x| x / norm).collect()
    } else {
        values
    }
}

/// Preprocess a 112x112 packed RGB aligned crop into a NCHW float tensor.
fn preprocess(aligned_face: &[u8]) -> Array4<f32> {
    let size = ALIGNED_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for y in 0..size {
        for x in 0..size {
            let off = (y * size + x) * Frame::CHANNELS;
            for c in 0..3 {
                let pixel = aligned_face.get(off + c).copied().unwrap_or(0) as f32;
                tensor[[0, c, y, x]] = (pixel - RECOGNIZER_MEAN) / RECOGNIZER_STD;
            }
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = vec![128u8; ALIGNED_SIZE * ALIGNED_SIZE * 3];
        let tensor = preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, ALIGNED_SIZE, ALIGNED_SIZE]);
    }

    #[test]
    fn test_preprocess_keeps_channel_order() {
        let mut aligned = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE * 3];
        aligned[0] = 255; // R of pixel (0, 0)
        let tensor = preprocess(&aligned);
        assert!((tensor[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 0, 0]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 0]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_jitter_plan_is_deterministic() {
        let a = jitter_plan(5);
        let b = jitter_plan(5);
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        assert_eq!(a[0], Jitter::NONE);
        assert!(a[1].mirror && !a[2].mirror);
        for j in &a[1..] {
            assert!(j.dx.abs() <= JITTER_MAX_SHIFT_PX);
            assert!((j.scale - 1.0).abs() <= JITTER_MAX_SCALE + 1e-6);
        }
    }

    #[test]
    fn test_jitter_plan_minimum_one_pass() {
        assert_eq!(jitter_plan(0), vec![Jitter::NONE]);
        assert_eq!(jitter_plan(1), vec![Jitter::NONE]);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }
}
