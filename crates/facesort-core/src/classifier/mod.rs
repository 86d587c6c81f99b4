//! Interchangeable classifiers over face embeddings.
//!
//! Each strategy owns its trained parameters and its threshold semantics:
//! the centroid and k-NN strategies compare Euclidean distances, the SVM
//! strategy compares signed margins.

pub mod centroid;
pub mod knn;
pub mod svm;

pub use centroid::{CentroidClassifier, CentroidModel};
pub use knn::{KnnClassifier, KnnModel};
pub use svm::{SvmClassifier, SvmModel, SvmOptions};

use crate::dataset::{DatasetError, TrainingDataset};
use crate::store::{ModelStore, StoreError};
use crate::types::{Algorithm, BoundingBox, Detection, Dimensionality, ExtractorParams, SUBJECT_LABEL};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("{0} model is not trained")]
    Untrained(Algorithm),
    #[error("{algorithm} model is stale: {reason}; retrain it")]
    Stale { algorithm: Algorithm, reason: StaleReason },
    #[error("training data is empty")]
    EmptyDataset,
    #[error("training data has no 'search_face' samples")]
    NoSubjectSamples,
    #[error("detection has {actual} values, model expects {expected}")]
    WrongDimensionality { expected: usize, actual: usize },
    #[error("invalid training data: {0}")]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a trained model can no longer be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// The training data was regenerated after the model was trained.
    DatasetChanged,
    DimensionalityChanged {
        model: Dimensionality,
        configured: Dimensionality,
    },
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DatasetChanged => f.write_str("training data changed since training"),
            Self::DimensionalityChanged { model, configured } => {
                write!(f, "model is {model} but {configured} is configured")
            }
        }
    }
}

/// Lifecycle of a strategy's model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Untrained,
    Trained,
    Stale(StaleReason),
}

/// Bookkeeping stored next to every trained model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub algorithm: Algorithm,
    pub dimensionality: Dimensionality,
    /// [`TrainingDataset::digest`] of the data the model was fit on.
    pub dataset_digest: String,
    pub samples: usize,
    pub params: ExtractorParams,
    pub trained_at: DateTime<Utc>,
}

impl ModelMeta {
    pub fn new(algorithm: Algorithm, dataset: &TrainingDataset, params: ExtractorParams) -> Self {
        Self {
            algorithm,
            dimensionality: dataset.dimensionality(),
            dataset_digest: dataset.digest(),
            samples: dataset.len(),
            params,
            trained_at: Utc::now(),
        }
    }
}

/// A model file: metadata plus algorithm-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel<M> {
    pub meta: ModelMeta,
    pub model: M,
}

/// Parameters persisted in a model file, checked against the recorded
/// dimensionality when the file is loaded.
pub trait ModelShape {
    /// The first inconsistency for inputs of `dimensionality` values, if any.
    fn shape_error(&self, dimensionality: usize) -> Option<String>;
}

/// Describes the first row that is not `expected` values long.
pub(crate) fn ragged_row(what: &str, rows: &[Vec<f32>], expected: usize) -> Option<String> {
    let (i, row) = rows.iter().enumerate().find(|(_, r)| r.len() != expected)?;
    Some(format!("{what} {i} has {} values, expected {expected}", row.len()))
}

/// One accepted neighbor returned by the k-NN strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub label: String,
    /// Face in the queried image this neighbor was found for.
    pub location: BoundingBox,
    pub distance: f32,
}

/// Per-image verdict. Its shape depends on the strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Centroid: smallest distance over all faces and references.
    Distance { matched: bool, min_distance: Option<f32> },
    /// k-NN: every neighbor within the threshold, per face.
    Neighbors(Vec<Neighbor>),
    /// SVM: largest signed margin over all faces.
    Margin { matched: bool, best_margin: Option<f32> },
}

impl Decision {
    /// Whether the image should be kept. For k-NN, any accepted neighbor
    /// carrying the subject label counts as a match.
    pub fn is_match(&self) -> bool {
        match self {
            Self::Distance { matched, .. } | Self::Margin { matched, .. } => *matched,
            Self::Neighbors(neighbors) => neighbors.iter().any(|n| n.label == SUBJECT_LABEL),
        }
    }
}

/// Common interface of the classification algorithms.
pub trait ClassifierStrategy: Send {
    fn algorithm(&self) -> Algorithm;

    /// Record the extraction settings the model is trained and used with.
    fn set_params(&mut self, params: ExtractorParams);

    fn params(&self) -> ExtractorParams;

    fn state(&self) -> ModelState;

    /// Fit on `dataset`, replacing any previous model.
    fn train(&mut self, dataset: &TrainingDataset) -> Result<(), ClassifierError>;

    /// Classify the faces of one image. Zero detections is a non-match.
    fn predict(&self, detections: &[Detection], threshold: f32) -> Result<Decision, ClassifierError>;

    /// Mark the model stale if it no longer matches the stored training data
    /// or the configured dimensionality.
    fn reconcile(&mut self, dataset_digest: &str, configured: Dimensionality) -> ModelState;

    fn save(&self, store: &ModelStore) -> Result<PathBuf, ClassifierError>;

    fn load(&mut self, store: &ModelStore) -> Result<(), ClassifierError>;
}

/// Tunables for strategies that have them.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClassifierOptions {
    /// Neighbors consulted by k-NN; `None` derives it from the corpus size.
    pub knn_k: Option<usize>,
    pub svm: SvmOptions,
}

/// Build the strategy for `algorithm`.
pub fn for_algorithm(algorithm: Algorithm, options: &ClassifierOptions) -> Box<dyn ClassifierStrategy> {
    match algorithm {
        Algorithm::Centroid => Box::new(CentroidClassifier::new()),
        Algorithm::Knn => Box::new(KnnClassifier::new(options.knn_k)),
        Algorithm::Svm => Box::new(SvmClassifier::new(options.svm)),
    }
}

/// State, parameters and persistence shared by every strategy.
#[derive(Debug, Clone)]
pub(crate) struct ModelSlot<M> {
    algorithm: Algorithm,
    params: ExtractorParams,
    trained: Option<TrainedModel<M>>,
    stale: Option<StaleReason>,
}

impl<M: Serialize + DeserializeOwned + ModelShape> ModelSlot<M> {
    pub(crate) fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            params: ExtractorParams::default(),
            trained: None,
            stale: None,
        }
    }

    pub(crate) fn params(&self) -> ExtractorParams {
        self.params
    }

    pub(crate) fn set_params(&mut self, params: ExtractorParams) {
        self.params = params;
    }

    pub(crate) fn state(&self) -> ModelState {
        match (&self.trained, self.stale) {
            (None, _) => ModelState::Untrained,
            (Some(_), Some(reason)) => ModelState::Stale(reason),
            (Some(_), None) => ModelState::Trained,
        }
    }

    pub(crate) fn install(&mut self, dataset: &TrainingDataset, model: M) {
        let meta = ModelMeta::new(self.algorithm, dataset, self.params);
        tracing::info!(
            algorithm = %self.algorithm,
            samples = meta.samples,
            dimensionality = %meta.dimensionality,
            "model trained"
        );
        self.trained = Some(TrainedModel { meta, model });
        self.stale = None;
    }

    /// The model, if it may be used for prediction.
    pub(crate) fn ready(&self) -> Result<&TrainedModel<M>, ClassifierError> {
        match (&self.trained, self.stale) {
            (None, _) => Err(ClassifierError::Untrained(self.algorithm)),
            (Some(_), Some(reason)) => Err(ClassifierError::Stale {
                algorithm: self.algorithm,
                reason,
            }),
            (Some(trained), None) => Ok(trained),
        }
    }

    /// Check every detection against the model dimensionality.
    pub(crate) fn check_detections(trained: &TrainedModel<M>, detections: &[Detection]) -> Result<(), ClassifierError> {
        let expected = trained.meta.dimensionality.size();
        match detections.iter().find(|d| d.embedding.dim() != expected) {
            Some(d) => Err(ClassifierError::WrongDimensionality {
                expected,
                actual: d.embedding.dim(),
            }),
            None => Ok(()),
        }
    }

    pub(crate) fn reconcile(&mut self, dataset_digest: &str, configured: Dimensionality) -> ModelState {
        if let Some(trained) = &self.trained {
            let reason = if trained.meta.dimensionality != configured {
                Some(StaleReason::DimensionalityChanged {
                    model: trained.meta.dimensionality,
                    configured,
                })
            } else if trained.meta.dataset_digest != dataset_digest {
                Some(StaleReason::DatasetChanged)
            } else {
                None
            };
            if let Some(reason) = reason {
                tracing::warn!(algorithm = %self.algorithm, %reason, "model is stale");
            }
            self.stale = reason;
        }
        self.state()
    }

    pub(crate) fn save(&self, store: &ModelStore) -> Result<PathBuf, ClassifierError> {
        let trained = self.trained.as_ref().ok_or(ClassifierError::Untrained(self.algorithm))?;
        Ok(store.save_model(trained)?)
    }

    pub(crate) fn load(&mut self, store: &ModelStore) -> Result<(), ClassifierError> {
        let trained: TrainedModel<M> = store.load_model(self.algorithm)?;
        self.params = trained.meta.params;
        self.trained = Some(trained);
        self.stale = None;
        Ok(())
    }
}

/// Validate a dataset before fitting any strategy on it.
pub(crate) fn check_trainable(dataset: &TrainingDataset) -> Result<(), ClassifierError> {
    dataset.validate()?;
    if dataset.is_empty() {
        return Err(ClassifierError::EmptyDataset);
    }
    if dataset.subject_count() == 0 {
        return Err(ClassifierError::NoSubjectSamples);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::dataset::{LabelPolicy, LabeledEncoding, TrainingDataset};
    use crate::types::{BoundingBox, Detection, Dimensionality, Embedding, ExtractorParams};

    pub fn params(dim: Dimensionality) -> ExtractorParams {
        ExtractorParams {
            dimensionality: dim,
            ..ExtractorParams::default()
        }
    }

    /// 128-d vector with the given leading values, zero elsewhere.
    pub fn vec128(head: &[f32]) -> Vec<f32> {
        let mut v = vec![0.0; 128];
        v[..head.len()].copy_from_slice(head);
        v
    }

    pub fn dataset(rows: &[(Vec<f32>, &str)]) -> TrainingDataset {
        let policy = if rows.iter().all(|(_, l)| *l == crate::types::SUBJECT_LABEL) {
            LabelPolicy::OneClass
        } else {
            LabelPolicy::TwoClass
        };
        let mut ds = TrainingDataset::new(params(Dimensionality::D128), policy);
        for (values, label) in rows {
            ds.push(LabeledEncoding {
                embedding: Embedding::new(values.clone()),
                label: label.to_string(),
            })
            .unwrap();
        }
        ds
    }

    pub fn detection(values: Vec<f32>, x: f32) -> Detection {
        Detection {
            embedding: Embedding::new(values),
            location: BoundingBox {
                x,
                y: 0.0,
                width: 10.0,
                height: 10.0,
                confidence: 0.9,
                landmarks: None,
            },
        }
    }
}
