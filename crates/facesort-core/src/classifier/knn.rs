//! k-nearest-neighbors over the labeled corpus.

use super::{
    check_trainable, ragged_row, ClassifierError, ClassifierStrategy, Decision, ModelShape, ModelSlot, ModelState, Neighbor,
};
use crate::dataset::TrainingDataset;
use crate::store::ModelStore;
use crate::types::{euclidean, Algorithm, Detection, Dimensionality, ExtractorParams};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnnModel {
    pub k: usize,
    pub encodings: Vec<Vec<f32>>,
    pub labels: Vec<String>,
}

impl KnnModel {
    /// The `k` training rows closest to `query`, ascending by distance.
    /// Equal distances keep training order.
    fn nearest(&self, query: &[f32]) -> Vec<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = self
            .encodings
            .iter()
            .enumerate()
            .map(|(i, enc)| (i, euclidean(query, enc)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored.truncate(self.k);
        scored
    }
}

impl ModelShape for KnnModel {
    fn shape_error(&self, dimensionality: usize) -> Option<String> {
        if self.labels.len() != self.encodings.len() {
            return Some(format!("{} encodings but {} labels", self.encodings.len(), self.labels.len()));
        }
        if self.k == 0 || self.k > self.encodings.len() {
            return Some(format!("k = {} with {} encodings", self.k, self.encodings.len()));
        }
        ragged_row("encoding", &self.encodings, dimensionality)
    }
}

/// Default neighbor count: `round(sqrt(n))`, at least 1.
pub fn default_k(samples: usize) -> usize {
    ((samples as f64).sqrt().round() as usize).max(1)
}

#[derive(Debug, Clone)]
pub struct KnnClassifier {
    slot: ModelSlot<KnnModel>,
    k: Option<usize>,
}

impl KnnClassifier {
    /// `k = None` derives the neighbor count from the corpus size at training.
    pub fn new(k: Option<usize>) -> Self {
        Self {
            slot: ModelSlot::new(Algorithm::Knn),
            k,
        }
    }
}

impl ClassifierStrategy for KnnClassifier {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Knn
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
        let n = dataset.len();
        let k = self.k.unwrap_or_else(|| default_k(n)).clamp(1, n);
        tracing::debug!(k, samples = n, "knn neighbor count");
        self.slot.install(
            dataset,
            KnnModel {
                k,
                encodings: dataset.encodings().to_vec(),
                labels: dataset.labels().to_vec(),
            },
        );
        Ok(())
    }

    fn predict(&self, detections: &[Detection], threshold: f32) -> Result<Decision, ClassifierError> {
        let trained = self.slot.ready()?;
        ModelSlot::check_detections(trained, detections)?;
        let model = &trained.model;

        let neighbors = detections
            .iter()
            .flat_map(|d| {
                model
                    .nearest(&d.embedding.values)
                    .into_iter()
                    .filter(|&(_, distance)| distance <= threshold)
                    .map(|(i, distance)| Neighbor {
                        label: model.labels[i].clone(),
                        location: d.location.clone(),
                        distance,
                    })
            })
            .collect();
        Ok(Decision::Neighbors(neighbors))
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

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::types::{BACKGROUND_LABEL, SUBJECT_LABEL};

    #[test]
    fn test_default_k() {
        assert_eq!(default_k(0), 1);
        assert_eq!(default_k(1), 1);
        assert_eq!(default_k(9), 3);
        assert_eq!(default_k(12), 3);
        assert_eq!(default_k(13), 4);
    }

    #[test]
    fn test_k_clamped_to_corpus_size() {
        let mut clf = KnnClassifier::new(Some(50));
        clf.train(&dataset(&[(vec128(&[1.0]), SUBJECT_LABEL), (vec128(&[2.0]), SUBJECT_LABEL)]))
            .unwrap();
        assert_eq!(clf.slot.ready().unwrap().model.k, 2);
    }

    #[test]
    fn test_neighbors_exact_and_ordered() {
        // Training rows at distances 0.5, 0.2, 0.9, 0.2 from the query.
        let mut clf = KnnClassifier::new(Some(3));
        clf.train(&dataset(&[
            (vec128(&[0.5]), SUBJECT_LABEL),
            (vec128(&[0.2]), BACKGROUND_LABEL),
            (vec128(&[0.9]), SUBJECT_LABEL),
            (vec128(&[0.0, 0.2]), SUBJECT_LABEL),
        ]))
        .unwrap();

        let query = [detection(vec128(&[]), 7.0)];
        let Decision::Neighbors(neighbors) = clf.predict(&query, 1.0).unwrap() else {
            panic!("knn must return neighbors");
        };
        let got: Vec<(&str, f32)> = neighbors.iter().map(|n| (n.label.as_str(), n.distance)).collect();
        assert_eq!(
            got,
            vec![(BACKGROUND_LABEL, 0.2), (SUBJECT_LABEL, 0.2), (SUBJECT_LABEL, 0.5)],
            "k nearest ascending, ties in training order"
        );
        assert!(neighbors.iter().all(|n| n.location.x == 7.0));
    }

    #[test]
    fn test_threshold_drops_far_neighbors() {
        let mut clf = KnnClassifier::new(Some(2));
        clf.train(&dataset(&[(vec128(&[0.5]), SUBJECT_LABEL), (vec128(&[0.1]), BACKGROUND_LABEL)]))
            .unwrap();

        let query = [detection(vec128(&[]), 0.0)];
        let decision = clf.predict(&query, 0.3).unwrap();
        let Decision::Neighbors(neighbors) = &decision else {
            panic!("knn must return neighbors");
        };
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].label, BACKGROUND_LABEL);
        assert!(!decision.is_match(), "only a background neighbor survived");

        assert!(clf.predict(&query, 0.5).unwrap().is_match(), "boundary distance is accepted");
    }

    #[test]
    fn test_neighbors_concatenate_in_detection_order() {
        let mut clf = KnnClassifier::new(Some(1));
        clf.train(&dataset(&[(vec128(&[1.0]), SUBJECT_LABEL), (vec128(&[0.0, 1.0]), BACKGROUND_LABEL)]))
            .unwrap();

        let query = [
            detection(vec128(&[0.0, 1.0]), 1.0),
            detection(vec128(&[1.0]), 2.0),
        ];
        let Decision::Neighbors(neighbors) = clf.predict(&query, 1.0).unwrap() else {
            panic!("knn must return neighbors");
        };
        let got: Vec<(&str, f32)> = neighbors.iter().map(|n| (n.label.as_str(), n.location.x)).collect();
        assert_eq!(got, vec![(BACKGROUND_LABEL, 1.0), (SUBJECT_LABEL, 2.0)]);
    }
}
