//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides followed by NMS. The detector input
//! side grows with the upsample factor so small faces keep enough pixels after
//! letterboxing.

use crate::types::{BoundingBox, DetectorKind};
use facesort_io::Frame;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_BASE_INPUT_SIZE: usize = 640;
const SCRFD_MAX_INPUT_SIZE: usize = 2560;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download from insightface into the model dir)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// Square detector input side for an upsample factor: 640 · 2^(n-1), capped.
pub fn input_size_for(upsample: u32) -> usize {
    let mut size = SCRFD_BASE_INPUT_SIZE;
    for _ in 1..upsample.max(1) {
        if size >= SCRFD_MAX_INPUT_SIZE {
            break;
        }
        size *= 2;
    }
    size.min(SCRFD_MAX_INPUT_SIZE)
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    kind: DetectorKind,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    /// Discovered by name at load time; falls back to positional ordering.
    stride_indices: [StrideOutputIndices; 3],
}

impl FaceDetector {
    /// Load an SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, kind: DetectorKind) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = %model_path.display(),
            %kind,
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if num_outputs < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            kind,
            stride_indices,
        })
    }

    pub fn kind(&self) -> DetectorKind {
        self.kind
    }

    /// Detect faces in an RGB frame, returning bounding boxes sorted by confidence.
    pub fn detect(&mut self, frame: &Frame, upsample: u32) -> Result<Vec<BoundingBox>, DetectorError> {
        let size = input_size_for(upsample);
        if upsample.saturating_sub(1) > (SCRFD_MAX_INPUT_SIZE / SCRFD_BASE_INPUT_SIZE).ilog2() {
            tracing::warn!(upsample, size, "detector input capped");
        }
        let (input, letterbox) = preprocess(frame, size);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in SCRFD_STRIDES.iter().zip(&self.stride_indices) {
            let tensor = |idx: usize, what: &'static str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let tensors = StrideTensors {
                scores: tensor(score_idx, "scores")?,
                boxes: tensor(bbox_idx, "bboxes")?,
                landmarks: tensor(kps_idx, "kps")?,
            };
            candidates.extend(decode_stride(&tensors, stride, size, &letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        // Already confidence-ordered.
        let result = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::trace!(faces = result.len(), size, "detection done");
        Ok(result)
    }
}

/// Letterbox an RGB frame into a `size`×`size` NCHW float tensor.
fn preprocess(frame: &Frame, size: usize) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = (frame.width as usize, frame.height as usize);
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as usize).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, size);
    let pad_x = (size - new_w) as f32 / 2.0;
    let pad_y = (size - new_h) as f32 / 2.0;

    let letterbox = LetterboxInfo { scale, pad_x, pad_y };
    let resized = frame.resize_bilinear(new_w as u32, new_h as u32);

    let pad_x_start = pad_x.floor() as usize;
    let pad_y_start = pad_y.floor() as usize;

    // Padding normalizes to 0.0, so only the image region needs writing.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..new_h {
        for x in 0..new_w {
            let px = resized.pixel(x as i32, y as i32);
            for c in 0..3 {
                tensor[[0, c, y + pad_y_start, x + pad_x_start]] = (px[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }
    }

    (tensor, letterbox)
}

/// Map each stride to its (score, bbox, kps) output slots.
///
/// Exports named `score_8`, `bbox_16`, `kps_32`, ... are matched by name in
/// any order. Anything else falls back to the usual layout of three score,
/// three bbox and three landmark tensors.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let slot = |kind: &str, stride: usize| names.iter().position(|n| *n == format!("{kind}_{stride}"));
    let by_name = SCRFD_STRIDES.map(|stride| Some((slot("score", stride)?, slot("bbox", stride)?, slot("kps", stride)?)));

    match by_name {
        [Some(s8), Some(s16), Some(s32)] => [s8, s16, s32],
        _ => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional layout");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

impl LetterboxInfo {
    /// Letterboxed input coordinates back to frame coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Raw output slices of one stride level.
struct StrideTensors<'a> {
    scores: &'a [f32],
    boxes: &'a [f32],
    landmarks: &'a [f32],
}

/// Faces scoring above `threshold` at one stride, in frame coordinates.
///
/// Box offsets are distances (left, top, right, bottom) from the anchor
/// centre and landmark offsets are (x, y) pairs, all in units of `stride`.
fn decode_stride(
    tensors: &StrideTensors<'_>,
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<BoundingBox> {
    let cells_per_row = input_size / stride;
    let anchors = cells_per_row * cells_per_row * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    tensors
        .scores
        .iter()
        .take(anchors)
        .enumerate()
        .filter(|&(_, &score)| score > threshold)
        .filter_map(|(anchor, &score)| {
            let cell = anchor / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % cells_per_row) as f32 * step;
            let ay = (cell / cells_per_row) as f32 * step;

            let off = tensors.boxes.get(anchor * 4..anchor * 4 + 4)?;
            let (x1, y1) = letterbox.unmap(ax - off[0] * step, ay - off[1] * step);
            let (x2, y2) = letterbox.unmap(ax + off[2] * step, ay + off[3] * step);

            let landmarks = tensors.landmarks.get(anchor * 10..anchor * 10 + 10).map(|kps| {
                let mut points = [(0.0f32, 0.0f32); 5];
                for (point, pair) in points.iter_mut().zip(kps.chunks_exact(2)) {
                    *point = letterbox.unmap(ax + pair[0] * step, ay + pair[1] * step);
                }
                points
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression, highest confidence first.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection over union of two boxes; 0 when both are degenerate.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let overlap_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let overlap_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = overlap_w * overlap_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face_box(x: f32, y: f32, side: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: side,
            height: side,
            confidence,
            landmarks: None,
        }
    }

    fn identity_letterbox() -> LetterboxInfo {
        LetterboxInfo {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        }
    }

    #[test]
    fn test_iou() {
        let a = face_box(0.0, 0.0, 10.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &face_box(30.0, 30.0, 10.0, 1.0)), 0.0);
        // Shifted by half a side: 50 shared of 150 total.
        let half = BoundingBox { x: 5.0, ..a.clone() };
        assert!((iou(&a, &half) - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(iou(&face_box(0.0, 0.0, 0.0, 1.0), &face_box(0.0, 0.0, 0.0, 1.0)), 0.0);
    }

    #[test]
    fn test_nms_keeps_best_of_each_cluster() {
        let kept = nms(
            vec![
                face_box(4.0, 4.0, 100.0, 0.7),
                face_box(300.0, 0.0, 40.0, 0.6),
                face_box(0.0, 0.0, 100.0, 0.95),
            ],
            SCRFD_NMS_THRESHOLD,
        );
        let confidences: Vec<f32> = kept.iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, vec![0.95, 0.6]);
        assert!(nms(Vec::new(), SCRFD_NMS_THRESHOLD).is_empty());
    }

    #[test]
    fn test_decode_stride_single_anchor() {
        // 64 px input at stride 32: a 2x2 grid, 8 anchors. Only anchor 6 fires:
        // cell 3, i.e. column 1, row 1, centre (32, 32).
        let mut scores = vec![0.1; 8];
        scores[6] = 0.9;
        let mut boxes = vec![0.0; 8 * 4];
        boxes[24..28].copy_from_slice(&[0.5, 0.25, 0.5, 0.75]);
        let mut landmarks = vec![0.0; 8 * 10];
        landmarks[60..62].copy_from_slice(&[-0.25, 0.0]);
        let tensors = StrideTensors {
            scores: &scores,
            boxes: &boxes,
            landmarks: &landmarks,
        };

        let faces = decode_stride(&tensors, 32, 64, &identity_letterbox(), SCRFD_CONFIDENCE_THRESHOLD);
        assert_eq!(faces.len(), 1);
        let face = &faces[0];
        assert_eq!((face.x, face.y, face.width, face.height), (16.0, 24.0, 32.0, 32.0));
        let points = face.landmarks.expect("landmarks decoded");
        assert_eq!(points[0], (24.0, 32.0));
        assert_eq!(points[4], (32.0, 32.0));
    }

    #[test]
    fn test_decode_stride_maps_through_letterbox() {
        let scores = [0.8, 0.0];
        let boxes = [1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        let tensors = StrideTensors {
            scores: &scores,
            boxes: &boxes,
            landmarks: &[],
        };
        let letterbox = LetterboxInfo {
            scale: 2.0,
            pad_x: 0.0,
            pad_y: 8.0,
        };
        let faces = decode_stride(&tensors, 8, 8, &letterbox, 0.5);
        assert_eq!(faces.len(), 1);
        assert_eq!((faces[0].x, faces[0].y), (-4.0, -8.0));
        assert_eq!(faces[0].width, 8.0);
        assert!(faces[0].landmarks.is_none(), "short landmark tensor yields no landmarks");
    }

    #[test]
    fn test_discover_output_indices() {
        let to_names = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let shuffled = to_names(&[
            "kps_8", "bbox_8", "score_8", "kps_16", "bbox_16", "score_16", "kps_32", "bbox_32", "score_32",
        ]);
        assert_eq!(discover_output_indices(&shuffled), [(2, 1, 0), (5, 4, 3), (8, 7, 6)]);

        let numeric: Vec<String> = (0..9).map(|i: usize| format!("output{i}")).collect();
        assert_eq!(discover_output_indices(&numeric), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);

        let partial = to_names(&["score_8", "bbox_8", "kps_8", "score_16", "bbox_16", "kps_16", "a", "b", "c"]);
        assert_eq!(
            discover_output_indices(&partial),
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
            "a missing stride falls back to positions"
        );
    }

    #[test]
    fn test_input_size_for_upsample() {
        assert_eq!(input_size_for(0), 640);
        assert_eq!(input_size_for(1), 640);
        assert_eq!(input_size_for(2), 1280);
        assert_eq!(input_size_for(3), 2560);
        assert_eq!(input_size_for(200), 2560, "large factors must be capped");
    }

    #[test]
    fn test_preprocess_letterbox_padding() {
        // 320x160 frame into 640: scale 2, 640x320 image, 160 px of padding top and bottom.
        let frame = Frame::from_rgb(vec![255u8; 320 * 160 * 3], 320, 160).unwrap();
        let (tensor, lb) = preprocess(&frame, 640);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 160.0);
        assert_eq!(lb.unmap(100.0, 260.0), (50.0, 50.0));

        // Padding normalizes to zero, image pixels to (255 - 127.5) / 128.
        assert_eq!(tensor[[0, 0, 10, 10]], 0.0);
        let expected = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 2, 320, 320]] - expected).abs() < 1e-6);
    }
}
