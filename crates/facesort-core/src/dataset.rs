//! Labeled training data: parallel encoding/label arrays with explicit metadata.

use crate::types::{Dimensionality, Embedding, ExtractorParams, SUBJECT_LABEL};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// On-disk format revision of [`TrainingDataset`].
pub const DATASET_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DatasetError {
    #[error("encoding has {actual} values, dataset is {expected}-dimensional")]
    WrongLength { expected: usize, actual: usize },
    #[error("row {row} has {actual} values, dataset is {expected}-dimensional")]
    RaggedRow { row: usize, expected: usize, actual: usize },
    #[error("{encodings} encodings but {labels} labels")]
    LengthMismatch { encodings: usize, labels: usize },
    #[error("unsupported dataset format version {0}")]
    UnsupportedVersion(u32),
}

/// How labels are assigned while building a corpus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelPolicy {
    /// Every encoding is the subject.
    #[default]
    OneClass,
    /// Subject from the reference folder, background from a negatives folder.
    TwoClass,
}

/// An encoding with its class label.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledEncoding {
    pub embedding: Embedding,
    pub label: String,
}

/// Ordered training corpus stored as parallel arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingDataset {
    version: u32,
    dimensionality: Dimensionality,
    label_policy: LabelPolicy,
    params: ExtractorParams,
    created_at: DateTime<Utc>,
    encodings: Vec<Vec<f32>>,
    labels: Vec<String>,
}

impl TrainingDataset {
    pub fn new(params: ExtractorParams, label_policy: LabelPolicy) -> Self {
        Self {
            version: DATASET_FORMAT_VERSION,
            dimensionality: params.dimensionality,
            label_policy,
            params,
            created_at: Utc::now(),
            encodings: Vec::new(),
            labels: Vec::new(),
        }
    }

    /// Append one sample. The encoding length must match the dataset dimensionality.
    pub fn push(&mut self, sample: LabeledEncoding) -> Result<(), DatasetError> {
        let expected = self.dimensionality.size();
        if sample.embedding.dim() != expected {
            return Err(DatasetError::WrongLength {
                expected,
                actual: sample.embedding.dim(),
            });
        }
        self.encodings.push(sample.embedding.values);
        self.labels.push(sample.label);
        Ok(())
    }

    pub fn dimensionality(&self) -> Dimensionality {
        self.dimensionality
    }

    pub fn label_policy(&self) -> LabelPolicy {
        self.label_policy
    }

    pub fn params(&self) -> &ExtractorParams {
        &self.params
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.encodings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encodings.is_empty()
    }

    pub fn encodings(&self) -> &[Vec<f32>] {
        &self.encodings
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// (encoding, label) pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&[f32], &str)> {
        self.encodings
            .iter()
            .map(Vec::as_slice)
            .zip(self.labels.iter().map(String::as_str))
    }

    /// Number of samples carrying the subject label.
    pub fn subject_count(&self) -> usize {
        self.labels.iter().filter(|l| l.as_str() == SUBJECT_LABEL).count()
    }

    /// Check the stored invariants. Run after deserializing.
    pub fn validate(&self) -> Result<(), DatasetError> {
        if self.version != DATASET_FORMAT_VERSION {
            return Err(DatasetError::UnsupportedVersion(self.version));
        }
        if self.encodings.len() != self.labels.len() {
            return Err(DatasetError::LengthMismatch {
                encodings: self.encodings.len(),
                labels: self.labels.len(),
            });
        }
        let expected = self.dimensionality.size();
        if let Some((row, enc)) = self.encodings.iter().enumerate().find(|(_, e)| e.len() != expected) {
            return Err(DatasetError::RaggedRow {
                row,
                expected,
                actual: enc.len(),
            });
        }
        Ok(())
    }

    /// SHA-256 over dimensionality, rows and labels (hex). Changes whenever
    /// the corpus content changes; metadata such as timestamps is excluded.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update((self.dimensionality.size() as u64).to_le_bytes());
        for (enc, label) in self.iter() {
            for v in enc {
                hasher.update(v.to_le_bytes());
            }
            hasher.update((label.len() as u64).to_le_bytes());
            hasher.update(label.as_bytes());
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BACKGROUND_LABEL;

    fn sample(values: Vec<f32>, label: &str) -> LabeledEncoding {
        LabeledEncoding {
            embedding: Embedding::new(values),
            label: label.to_string(),
        }
    }

    fn dataset_128() -> TrainingDataset {
        TrainingDataset::new(ExtractorParams::default(), LabelPolicy::OneClass)
    }

    #[test]
    fn test_push_enforces_dimensionality() {
        let mut ds = dataset_128();
        ds.push(sample(vec![0.0; 128], SUBJECT_LABEL)).unwrap();
        let err = ds.push(sample(vec![0.0; 512], SUBJECT_LABEL)).unwrap_err();
        assert_eq!(err, DatasetError::WrongLength { expected: 128, actual: 512 });
        assert_eq!(ds.len(), 1);
        assert_eq!(ds.labels().len(), ds.encodings().len());
    }

    #[test]
    fn test_subject_count() {
        let mut ds = TrainingDataset::new(ExtractorParams::default(), LabelPolicy::TwoClass);
        ds.push(sample(vec![0.0; 128], SUBJECT_LABEL)).unwrap();
        ds.push(sample(vec![1.0; 128], BACKGROUND_LABEL)).unwrap();
        ds.push(sample(vec![0.5; 128], SUBJECT_LABEL)).unwrap();
        assert_eq!(ds.subject_count(), 2);
        let labels: Vec<_> = ds.iter().map(|(_, l)| l).collect();
        assert_eq!(labels, vec![SUBJECT_LABEL, BACKGROUND_LABEL, SUBJECT_LABEL]);
    }

    #[test]
    fn test_validate_detects_ragged_rows() {
        let mut ds = dataset_128();
        ds.push(sample(vec![0.0; 128], SUBJECT_LABEL)).unwrap();
        ds.encodings.push(vec![0.0; 3]);
        ds.labels.push(SUBJECT_LABEL.into());
        assert_eq!(
            ds.validate().unwrap_err(),
            DatasetError::RaggedRow { row: 1, expected: 128, actual: 3 }
        );

        ds.encodings.pop();
        assert!(matches!(ds.validate().unwrap_err(), DatasetError::LengthMismatch { .. }));
    }

    #[test]
    fn test_digest_tracks_content_only() {
        let mut a = dataset_128();
        a.push(sample(vec![0.25; 128], SUBJECT_LABEL)).unwrap();
        let mut b = a.clone();
        b.created_at = Utc::now() + chrono::Duration::days(1);
        assert_eq!(a.digest(), b.digest(), "timestamps must not affect the digest");

        b.push(sample(vec![0.5; 128], SUBJECT_LABEL)).unwrap();
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }

    #[test]
    fn test_serde_roundtrip_keeps_metadata() {
        let mut ds = dataset_128();
        ds.push(sample(vec![0.1; 128], SUBJECT_LABEL)).unwrap();
        let json = serde_json::to_string(&ds).unwrap();
        assert!(json.contains("\"dimensionality\":128"));
        let back: TrainingDataset = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ds);
        back.validate().unwrap();
    }
}
