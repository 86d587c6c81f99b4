//! Persistence of training datasets and trained models at fixed locations.

use crate::classifier::{ModelShape, TrainedModel};
use crate::dataset::TrainingDataset;
use crate::types::{Algorithm, CorpusFamily, Dimensionality};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// What kind of file a store operation concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Dataset(CorpusFamily),
    Model(Algorithm),
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dataset(family) => write!(f, "{family} training data"),
            Self::Model(algorithm) => write!(f, "{algorithm} model"),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{artifact} has not been generated yet ({path})")]
    NotGenerated { artifact: Artifact, path: PathBuf },
    #[error("{artifact} at {path} is corrupt: {reason}")]
    Corrupt {
        artifact: Artifact,
        path: PathBuf,
        reason: String,
    },
    #[error("training data is {stored} but {configured} is configured; they are incompatible")]
    DimensionalityMismatch {
        stored: Dimensionality,
        configured: Dimensionality,
    },
    #[error("I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialize {artifact}: {source}")]
    Serialize {
        artifact: Artifact,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn is_not_generated(&self) -> bool {
        matches!(self, Self::NotGenerated { .. })
    }
}

/// Outcome of comparing a stored dataset against the configured dimensionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    Mismatch {
        stored: Dimensionality,
        configured: Dimensionality,
    },
}

impl Compatibility {
    pub fn into_result(self) -> Result<(), StoreError> {
        match self {
            Self::Compatible => Ok(()),
            Self::Mismatch { stored, configured } => Err(StoreError::DimensionalityMismatch { stored, configured }),
        }
    }
}

/// Directory holding one dataset file per corpus family and one model file
/// per algorithm.
#[derive(Debug, Clone)]
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset_path(&self, family: CorpusFamily) -> PathBuf {
        self.root.join(format!("training_data_{family}.json"))
    }

    pub fn model_path(&self, algorithm: Algorithm) -> PathBuf {
        self.root.join(format!("model_{algorithm}.json"))
    }

    pub fn dataset_exists(&self, family: CorpusFamily) -> bool {
        self.dataset_path(family).is_file()
    }

    pub fn model_exists(&self, algorithm: Algorithm) -> bool {
        self.model_path(algorithm).is_file()
    }

    pub fn save_dataset(&self, family: CorpusFamily, dataset: &TrainingDataset) -> Result<PathBuf, StoreError> {
        let path = self.dataset_path(family);
        self.write_json(Artifact::Dataset(family), &path, dataset)?;
        tracing::info!(
            path = %path.display(),
            samples = dataset.len(),
            dimensionality = %dataset.dimensionality(),
            "saved training data"
        );
        Ok(path)
    }

    pub fn load_dataset(&self, family: CorpusFamily) -> Result<TrainingDataset, StoreError> {
        let artifact = Artifact::Dataset(family);
        let path = self.dataset_path(family);
        let dataset: TrainingDataset = self.read_json(artifact, &path)?;
        dataset.validate().map_err(|e| StoreError::Corrupt {
            artifact,
            path,
            reason: e.to_string(),
        })?;
        Ok(dataset)
    }

    /// Delete a dataset. Models trained from it become stale.
    pub fn remove_dataset(&self, family: CorpusFamily) -> Result<(), StoreError> {
        let path = self.dataset_path(family);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotGenerated {
                artifact: Artifact::Dataset(family),
                path,
            }),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    pub fn save_model<M: Serialize>(&self, model: &TrainedModel<M>) -> Result<PathBuf, StoreError> {
        let algorithm = model.meta.algorithm;
        let path = self.model_path(algorithm);
        self.write_json(Artifact::Model(algorithm), &path, model)?;
        tracing::info!(path = %path.display(), %algorithm, samples = model.meta.samples, "saved model");
        Ok(path)
    }

    /// Load a model, refusing files whose vectors disagree with the
    /// dimensionality they record.
    pub fn load_model<M: DeserializeOwned + ModelShape>(&self, algorithm: Algorithm) -> Result<TrainedModel<M>, StoreError> {
        let artifact = Artifact::Model(algorithm);
        let path = self.model_path(algorithm);
        let model: TrainedModel<M> = self.read_json(artifact, &path)?;
        if model.meta.algorithm != algorithm {
            return Err(StoreError::Corrupt {
                artifact,
                path,
                reason: format!("file holds a {} model", model.meta.algorithm),
            });
        }
        if let Some(reason) = model.model.shape_error(model.meta.dimensionality.size()) {
            return Err(StoreError::Corrupt { artifact, path, reason });
        }
        Ok(model)
    }

    /// Compare the dataset's recorded dimensionality with the configured one.
    pub fn check_compatibility(dataset: &TrainingDataset, configured: Dimensionality) -> Compatibility {
        let stored = dataset.dimensionality();
        if stored == configured {
            Compatibility::Compatible
        } else {
            Compatibility::Mismatch { stored, configured }
        }
    }

    /// Serialize to a sibling temp file, then rename over the target so a
    /// failed write never leaves a truncated file behind.
    fn write_json<T: Serialize + ?Sized>(&self, artifact: Artifact, path: &Path, value: &T) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })?;

        let bytes = serde_json::to_vec(value).map_err(|source| StoreError::Serialize { artifact, source })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn read_json<T: DeserializeOwned>(&self, artifact: Artifact, path: &Path) -> Result<T, StoreError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotGenerated {
                    artifact,
                    path: path.to_path_buf(),
                })
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            artifact,
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{CentroidModel, ModelMeta};
    use crate::dataset::{LabelPolicy, LabeledEncoding};
    use crate::types::{Embedding, ExtractorParams, SUBJECT_LABEL};
    use tempfile::tempdir;

    /// A bare vector stands in for model parameters of one row.
    impl ModelShape for Vec<f32> {
        fn shape_error(&self, dimensionality: usize) -> Option<String> {
            (self.len() != dimensionality).then(|| format!("{} values", self.len()))
        }
    }

    fn dataset(dim: Dimensionality, rows: usize) -> TrainingDataset {
        let params = ExtractorParams {
            dimensionality: dim,
            ..ExtractorParams::default()
        };
        let mut ds = TrainingDataset::new(params, LabelPolicy::OneClass);
        for i in 0..rows {
            ds.push(LabeledEncoding {
                embedding: Embedding::new(vec![i as f32; dim.size()]),
                label: SUBJECT_LABEL.into(),
            })
            .unwrap();
        }
        ds
    }

    #[test]
    fn test_missing_files_are_not_generated() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let err = store.load_dataset(CorpusFamily::Distance).unwrap_err();
        assert!(err.is_not_generated(), "got {err}");
        let err = store.load_model::<Vec<f32>>(Algorithm::Knn).unwrap_err();
        assert!(err.is_not_generated(), "got {err}");
    }

    #[test]
    fn test_garbage_is_corrupt_not_missing() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        std::fs::write(store.dataset_path(CorpusFamily::Distance), b"not json").unwrap();
        let err = store.load_dataset(CorpusFamily::Distance).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }), "got {err}");
    }

    #[test]
    fn test_dataset_roundtrip_creates_root() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("nested/store"));
        let ds = dataset(Dimensionality::D128, 3);
        let path = store.save_dataset(CorpusFamily::Margin, &ds).unwrap();
        assert!(path.ends_with("training_data_margin.json"));
        assert!(store.dataset_exists(CorpusFamily::Margin));
        assert!(!store.dataset_exists(CorpusFamily::Distance));

        let back = store.load_dataset(CorpusFamily::Margin).unwrap();
        assert_eq!(back, ds);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_check_compatibility_names_both_sides() {
        let ds = dataset(Dimensionality::D512, 1);
        assert_eq!(
            ModelStore::check_compatibility(&ds, Dimensionality::D512),
            Compatibility::Compatible
        );
        let result = ModelStore::check_compatibility(&ds, Dimensionality::D128);
        assert_eq!(
            result,
            Compatibility::Mismatch {
                stored: Dimensionality::D512,
                configured: Dimensionality::D128
            }
        );
        let msg = result.into_result().unwrap_err().to_string();
        assert!(msg.contains("512D") && msg.contains("128D"), "message: {msg}");
    }

    #[test]
    fn test_model_file_for_wrong_algorithm_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let model = TrainedModel {
            meta: ModelMeta::new(Algorithm::Svm, &dataset(Dimensionality::D128, 1), ExtractorParams::default()),
            model: vec![1.0f32; 128],
        };
        assert!(!store.model_exists(Algorithm::Svm));
        store.save_model(&model).unwrap();
        assert!(store.model_exists(Algorithm::Svm));
        assert!(!store.model_exists(Algorithm::Centroid));
        std::fs::copy(store.model_path(Algorithm::Svm), store.model_path(Algorithm::Knn)).unwrap();

        let back: TrainedModel<Vec<f32>> = store.load_model(Algorithm::Svm).unwrap();
        assert_eq!(back.model, vec![1.0; 128]);
        let err = store.load_model::<Vec<f32>>(Algorithm::Knn).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_short_model_rows_are_corrupt() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let meta = ModelMeta::new(Algorithm::Centroid, &dataset(Dimensionality::D128, 2), ExtractorParams::default());
        let model = TrainedModel {
            meta,
            model: CentroidModel {
                references: vec![vec![0.0; 128], vec![0.0; 64]],
            },
        };
        store.save_model(&model).unwrap();

        let err = store.load_model::<CentroidModel>(Algorithm::Centroid).unwrap_err();
        match err {
            StoreError::Corrupt { reason, .. } => assert!(reason.contains("reference 1 has 64 values"), "{reason}"),
            other => panic!("expected corrupt, got {other}"),
        }
    }

    #[test]
    fn test_remove_dataset() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        store.save_dataset(CorpusFamily::Distance, &dataset(Dimensionality::D128, 1)).unwrap();
        store.remove_dataset(CorpusFamily::Distance).unwrap();
        assert!(store.remove_dataset(CorpusFamily::Distance).unwrap_err().is_not_generated());
    }
}
