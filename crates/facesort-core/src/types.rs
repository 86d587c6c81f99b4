use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Label identifying the subject being searched for.
pub const SUBJECT_LABEL: &str = "search_face";

/// Label given to negative samples in two-class corpora.
pub const BACKGROUND_LABEL: &str = "background";

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (128 or 512 values, L2-normalised).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

/// Euclidean distance between two equal-length vectors.
pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// Dot product of two equal-length vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// One face found in an image: its embedding and where it was.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub embedding: Embedding,
    pub location: BoundingBox,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("unknown algorithm: {0} (expected centroid, knn or svm)")]
    Algorithm(String),
    #[error("unknown detector: {0} (expected fast or accurate)")]
    Detector(String),
    #[error("unsupported dimensionality: {0} (expected 128 or 512)")]
    Dimensionality(String),
}

/// Embedding length. A configuration choice shared by a whole dataset/model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub enum Dimensionality {
    #[default]
    D128,
    D512,
}

impl Dimensionality {
    pub fn size(self) -> usize {
        match self {
            Self::D128 => 128,
            Self::D512 => 512,
        }
    }
}

impl TryFrom<usize> for Dimensionality {
    type Error = ParseError;

    fn try_from(n: usize) -> Result<Self, Self::Error> {
        match n {
            128 => Ok(Self::D128),
            512 => Ok(Self::D512),
            other => Err(ParseError::Dimensionality(other.to_string())),
        }
    }
}

impl From<Dimensionality> for usize {
    fn from(d: Dimensionality) -> usize {
        d.size()
    }
}

impl fmt::Display for Dimensionality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}D", self.size())
    }
}

impl FromStr for Dimensionality {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_end_matches(['d', 'D']);
        digits
            .parse::<usize>()
            .map_err(|_| ParseError::Dimensionality(s.to_string()))
            .and_then(Self::try_from)
    }
}

/// Face detector choice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    /// Light model, CPU friendly.
    #[default]
    Fast,
    /// Heavier model with better recall on small or angled faces.
    Accurate,
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fast => "fast",
            Self::Accurate => "accurate",
        })
    }
}

impl FromStr for DetectorKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" | "hog" => Ok(Self::Fast),
            "accurate" | "cnn" => Ok(Self::Accurate),
            other => Err(ParseError::Detector(other.to_string())),
        }
    }
}

/// Everything that determines how an image is turned into embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractorParams {
    pub detector: DetectorKind,
    pub dimensionality: Dimensionality,
    /// Re-encodings averaged per face (1 = no jitter).
    pub jitters: u32,
    /// Detector upscaling passes (1 = native input size).
    pub upsample: u32,
}

impl ExtractorParams {
    pub const JITTERS_RANGE: std::ops::RangeInclusive<u32> = 1..=200;
    pub const UPSAMPLE_RANGE: std::ops::RangeInclusive<u32> = 1..=200;
}

impl Default for ExtractorParams {
    fn default() -> Self {
        Self {
            detector: DetectorKind::Fast,
            dimensionality: Dimensionality::D128,
            jitters: 3,
            upsample: 1,
        }
    }
}

/// Which corpus file a classifier trains from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorpusFamily {
    /// Shared by the centroid and k-NN classifiers.
    Distance,
    /// Used by the SVM classifier.
    Margin,
}

impl fmt::Display for CorpusFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Distance => "distance",
            Self::Margin => "margin",
        })
    }
}

/// Classification algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Centroid,
    Knn,
    Svm,
}

impl Algorithm {
    pub const ALL: [Algorithm; 3] = [Algorithm::Centroid, Algorithm::Knn, Algorithm::Svm];

    /// Threshold used when the caller does not supply one.
    pub fn default_threshold(self) -> f32 {
        match self {
            Self::Centroid => 1.2,
            Self::Knn => 1.0,
            Self::Svm => 0.005,
        }
    }

    /// Accepted threshold values. Distances and margins live on different scales.
    pub fn threshold_range(self) -> std::ops::RangeInclusive<f32> {
        match self {
            Self::Centroid | Self::Knn => 0.5..=2.0,
            Self::Svm => 0.00005..=2.0,
        }
    }

    pub fn corpus_family(self) -> CorpusFamily {
        match self {
            Self::Centroid | Self::Knn => CorpusFamily::Distance,
            Self::Svm => CorpusFamily::Margin,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Centroid => "centroid",
            Self::Knn => "knn",
            Self::Svm => "svm",
        })
    }
}

impl FromStr for Algorithm {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "centroid" | "euclidean" => Ok(Self::Centroid),
            "knn" | "k-nn" => Ok(Self::Knn),
            "svm" => Ok(Self::Svm),
            other => Err(ParseError::Algorithm(other.to_string())),
        }
    }
}
