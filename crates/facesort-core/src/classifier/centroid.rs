//! Nearest-reference matching by Euclidean distance.

use super::{check_trainable, ragged_row, ClassifierError, ClassifierStrategy, Decision, ModelShape, ModelSlot, ModelState};
use crate::dataset::TrainingDataset;
use crate::store::ModelStore;
use crate::types::{euclidean, Algorithm, Detection, Dimensionality, ExtractorParams, SUBJECT_LABEL};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Subject encodings kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentroidModel {
    pub references: Vec<Vec<f32>>,
}

impl ModelShape for CentroidModel {
    fn shape_error(&self, dimensionality: usize) -> Option<String> {
        if self.references.is_empty() {
            return Some("no reference encodings".into());
        }
        ragged_row("reference", &self.references, dimensionality)
    }
}

#[derive(Debug, Clone)]
pub struct CentroidClassifier {
    slot: ModelSlot<CentroidModel>,
}

impl CentroidClassifier {
    pub fn new() -> Self {
        Self {
            slot: ModelSlot::new(Algorithm::Centroid),
        }
    }
}

impl Default for CentroidClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassifierStrategy for CentroidClassifier {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Centroid
    }

    fn set_params(&mut self, params: ExtractorParams) {
        self.slot.set_params(params);
    }

    fn params(&self) -> ExtractorParams {
        self.slot.params()
    }

    fn state(&self) -> ModelState {
        self.slot.state()
    }

    fn train(&mut self, dataset: &TrainingDataset) -> Result<(), ClassifierError> {
        check_trainable(dataset)?;
        let references = dataset
            .iter()
            .filter(|(_, label)| *label == SUBJECT_LABEL)
            .map(|(enc, _)| enc.to_vec())
            .collect();
        self.slot.install(dataset, CentroidModel { references });
        Ok(())
    }

    fn predict(&self, detections: &[Detection], threshold: f32) -> Result<Decision, ClassifierError> {
        let trained = self.slot.ready()?;
        ModelSlot::check_detections(trained, detections)?;

        let min_distance = detections
            .iter()
            .flat_map(|d| {
                trained
                    .model
                    .references
                    .iter()
                    .map(move |r| euclidean(&d.embedding.values, r))
            })
            .min_by(f32::total_cmp);

        Ok(Decision::Distance {
            matched: min_distance.is_some_and(|d| d <= threshold),
            min_distance,
        })
    }

    fn reconcile(&mut self, dataset_digest: &str, configured: Dimensionality) -> ModelState {
        self.slot.reconcile(dataset_digest, configured)
    }

    fn save(&self, store: &ModelStore) -> Result<PathBuf, ClassifierError> {
        self.slot.save(store)
    }

    fn load(&mut self, store: &ModelStore) -> Result<(), ClassifierError> {
        self.slot.load(store)
    }
}
