//! Linear support-vector classification.
//!
//! A corpus with negatives gets a binary soft-margin SVM trained by dual
//! coordinate descent. A subject-only corpus gets a ν one-class SVM solved
//! with pairwise SMO. Both reduce to a hyperplane `w·x + b`; the decision
//! value is the signed margin.

use super::{check_trainable, ClassifierError, ClassifierStrategy, Decision, ModelShape, ModelSlot, ModelState};
use crate::dataset::TrainingDataset;
use crate::store::ModelStore;
use crate::types::{dot, Algorithm, Detection, Dimensionality, ExtractorParams, SUBJECT_LABEL};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const SHUFFLE_SEED: u64 = 0x5_7A11;
const TAU: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SvmOptions {
    /// Soft-margin penalty for the binary case.
    pub c: f64,
    /// Upper bound on the fraction of outliers in the one-class case.
    pub nu: f64,
    /// Stopping tolerance on the largest KKT violation.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for SvmOptions {
    fn default() -> Self {
        Self {
            c: 1.0,
            nu: 0.1,
            tolerance: 1e-4,
            max_iterations: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SvmKind {
    Binary,
    OneClass,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SvmModel {
    pub kind: SvmKind,
    pub weights: Vec<f32>,
    /// `b` for the binary machine, `-ρ` for the one-class machine.
    pub bias: f32,
}

impl SvmModel {
    pub fn decision_value(&self, x: &[f32]) -> f32 {
        dot(&self.weights, x) + self.bias
    }
}

impl ModelShape for SvmModel {
    fn shape_error(&self, dimensionality: usize) -> Option<String> {
        let n = self.weights.len();
        (n != dimensionality).then(|| format!("weights have {n} values, expected {dimensionality}"))
    }
}

#[derive(Debug, Clone)]
pub struct SvmClassifier {
    slot: ModelSlot<SvmModel>,
    options: SvmOptions,
}

impl SvmClassifier {
    pub fn new(options: SvmOptions) -> Self {
        Self {
            slot: ModelSlot::new(Algorithm::Svm),
            options,
        }
    }
}

impl ClassifierStrategy for SvmClassifier {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Svm
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
        let rows: Vec<Vec<f64>> = dataset
            .encodings()
            .iter()
            .map(|r| r.iter().map(|&v| f64::from(v)).collect())
            .collect();

        let model = if dataset.subject_count() == dataset.len() {
            train_one_class(&rows, &self.options)
        } else {
            let y: Vec<f64> = dataset
                .labels()
                .iter()
                .map(|l| if l == SUBJECT_LABEL { 1.0 } else { -1.0 })
                .collect();
            train_binary(&rows, &y, &self.options)
        };
        tracing::debug!(kind = ?model.kind, bias = model.bias, "svm fitted");
        self.slot.install(dataset, model);
        Ok(())
    }

    fn predict(&self, detections: &[Detection], threshold: f32) -> Result<Decision, ClassifierError> {
        let trained = self.slot.ready()?;
        ModelSlot::check_detections(trained, detections)?;

        let best_margin = detections
            .iter()
            .map(|d| trained.model.decision_value(&d.embedding.values))
            .max_by(f32::total_cmp);

        Ok(Decision::Margin {
            matched: best_margin.is_some_and(|m| m >= threshold),
            best_margin,
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

fn dot64(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn axpy(w: &mut [f64], scale: f64, x: &[f64]) {
    for (wi, xi) in w.iter_mut().zip(x) {
        *wi += scale * xi;
    }
}

/// L1-loss linear SVM, dual coordinate descent. The bias is learned as the
/// weight of a constant feature appended to every row.
fn train_binary(rows: &[Vec<f64>], y: &[f64], options: &SvmOptions) -> SvmModel {
    let dim = rows.first().map_or(0, Vec::len);
    let x: Vec<Vec<f64>> = rows
        .iter()
        .map(|r| r.iter().copied().chain(std::iter::once(1.0)).collect())
        .collect();
    let diag: Vec<f64> = x.iter().map(|xi| dot64(xi, xi)).collect();
    let c = options.c;

    let mut alpha = vec![0.0; x.len()];
    let mut w = vec![0.0; dim + 1];
    let mut order: Vec<usize> = (0..x.len()).collect();
    let mut rng = StdRng::seed_from_u64(SHUFFLE_SEED);

    let mut iterations = 0;
    while iterations < options.max_iterations {
        iterations += 1;
        order.shuffle(&mut rng);
        let mut max_pg = f64::NEG_INFINITY;
        let mut min_pg = f64::INFINITY;

        for &i in &order {
            let g = y[i] * dot64(&w, &x[i]) - 1.0;
            let pg = if alpha[i] <= 0.0 {
                g.min(0.0)
            } else if alpha[i] >= c {
                g.max(0.0)
            } else {
                g
            };
            max_pg = max_pg.max(pg);
            min_pg = min_pg.min(pg);

            if pg.abs() > TAU {
                let old = alpha[i];
                alpha[i] = (old - g / diag[i]).clamp(0.0, c);
                axpy(&mut w, (alpha[i] - old) * y[i], &x[i]);
            }
        }

        if max_pg - min_pg < options.tolerance {
            break;
        }
    }
    tracing::debug!(iterations, samples = x.len(), "binary svm converged");

    SvmModel {
        kind: SvmKind::Binary,
        weights: w[..dim].iter().map(|&v| v as f32).collect(),
        bias: w[dim] as f32,
    }
}

/// Schölkopf one-class SVM with a linear kernel, scaled so that
/// `0 ≤ αᵢ ≤ 1` and `Σαᵢ = ν·l`. Decision value is `w·x − ρ`.
fn train_one_class(rows: &[Vec<f64>], options: &SvmOptions) -> SvmModel {
    let l = rows.len();
    let dim = rows.first().map_or(0, Vec::len);
    let budget = options.nu * l as f64;

    let mut alpha = vec![0.0; l];
    let whole = (budget.floor() as usize).min(l);
    alpha[..whole].iter_mut().for_each(|a| *a = 1.0);
    if whole < l {
        alpha[whole] = budget - whole as f64;
    }

    let mut w = vec![0.0; dim];
    for (a, x) in alpha.iter().zip(rows) {
        axpy(&mut w, *a, x);
    }
    let mut grad: Vec<f64> = rows.iter().map(|x| dot64(&w, x)).collect();

    let mut iterations = 0;
    while iterations < options.max_iterations {
        // Maximal violating pair: raise alpha[i], lower alpha[j].
        let up = (0..l).filter(|&t| alpha[t] < 1.0).min_by(|&a, &b| grad[a].total_cmp(&grad[b]));
        let down = (0..l).filter(|&t| alpha[t] > 0.0).max_by(|&a, &b| grad[a].total_cmp(&grad[b]));
        let (Some(i), Some(j)) = (up, down) else { break };
        if grad[j] - grad[i] < options.tolerance {
            break;
        }
        iterations += 1;

        let diff: Vec<f64> = rows[i].iter().zip(&rows[j]).map(|(a, b)| a - b).collect();
        let curvature = dot64(&diff, &diff).max(TAU);
        let step = ((grad[j] - grad[i]) / curvature).min(1.0 - alpha[i]).min(alpha[j]);

        alpha[i] += step;
        alpha[j] -= step;
        axpy(&mut w, step, &diff);
        for (g, x) in grad.iter_mut().zip(rows) {
            *g += step * dot64(&diff, x);
        }
    }

    let rho = one_class_rho(&alpha, &grad);
    tracing::debug!(iterations, samples = l, rho, "one-class svm converged");

    SvmModel {
        kind: SvmKind::OneClass,
        weights: w.iter().map(|&v| v as f32).collect(),
        bias: -rho as f32,
    }
}

/// Offset from the free support vectors, or the midpoint of the feasible
/// interval when every multiplier sits at a bound.
fn one_class_rho(alpha: &[f64], grad: &[f64]) -> f64 {
    let mut free_sum = 0.0;
    let mut free = 0usize;
    let mut upper = f64::INFINITY;
    let mut lower = f64::NEG_INFINITY;
    for (&a, &g) in alpha.iter().zip(grad) {
        if a >= 1.0 {
            lower = lower.max(g);
        } else if a <= 0.0 {
            upper = upper.min(g);
        } else {
            free_sum += g;
            free += 1;
        }
    }
    if free > 0 {
        free_sum / free as f64
    } else {
        (upper + lower) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::types::BACKGROUND_LABEL;

    fn on_circle(angle: f32) -> Vec<f32> {
        vec128(&[angle.cos(), angle.sin()])
    }

    #[test]
    fn test_binary_separates_classes() {
        let mut clf = SvmClassifier::new(SvmOptions::default());
        clf.train(&dataset(&[
            (vec128(&[1.0]), SUBJECT_LABEL),
            (vec128(&[0.9, 0.1]), SUBJECT_LABEL),
            (vec128(&[-1.0]), BACKGROUND_LABEL),
            (vec128(&[-0.9, -0.1]), BACKGROUND_LABEL),
        ]))
        .unwrap();

        let subject = clf.predict(&[detection(vec128(&[0.95]), 0.0)], 0.005).unwrap();
        let Decision::Margin { matched, best_margin: Some(m) } = subject else {
            panic!("svm must report a margin, got {subject:?}");
        };
        assert!(matched && m > 0.5, "subject margin {m}");

        let background = clf.predict(&[detection(vec128(&[-0.95]), 0.0)], 0.005).unwrap();
        assert!(!background.is_match());
        assert_eq!(clf.slot.ready().unwrap().model.kind, SvmKind::Binary);
    }

    #[test]
    fn test_best_margin_over_faces() {
        let mut clf = SvmClassifier::new(SvmOptions::default());
        clf.train(&dataset(&[(vec128(&[1.0]), SUBJECT_LABEL), (vec128(&[-1.0]), BACKGROUND_LABEL)]))
            .unwrap();
        let query = [detection(vec128(&[-1.0]), 0.0), detection(vec128(&[1.0]), 1.0)];
        assert!(clf.predict(&query, 0.005).unwrap().is_match(), "one subject face is enough");
    }

    #[test]
    fn test_one_class_accepts_inliers_only() {
        let rows: Vec<(Vec<f32>, &str)> = [-0.3f32, -0.2, -0.1, 0.0, 0.1, 0.2, 0.3, -0.3, 0.3, 0.0]
            .iter()
            .map(|&a| (on_circle(a), SUBJECT_LABEL))
            .collect();
        let mut clf = SvmClassifier::new(SvmOptions::default());
        clf.train(&dataset(&rows)).unwrap();
        assert_eq!(clf.slot.ready().unwrap().model.kind, SvmKind::OneClass);

        let center = clf.predict(&[detection(on_circle(0.0), 0.0)], 0.005).unwrap();
        assert!(center.is_match(), "center of the subject cluster: {center:?}");
        let far = clf.predict(&[detection(on_circle(1.2), 0.0)], 0.005).unwrap();
        assert!(!far.is_match(), "far from the cluster: {far:?}");
    }

    #[test]
    fn test_one_class_multipliers_respect_budget() {
        let rows: Vec<Vec<f64>> = (0..7).map(|i| vec![1.0, i as f64 * 0.1]).collect();
        let options = SvmOptions::default();
        let model = train_one_class(&rows, &options);
        // Σα = ν·l, so w carries that much mass along the shared first axis.
        let expected = options.nu * rows.len() as f64;
        assert!((f64::from(model.weights[0]) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_training_is_deterministic() {
        let ds = dataset(&[
            (vec128(&[1.0, 0.2]), SUBJECT_LABEL),
            (vec128(&[0.8, -0.1]), SUBJECT_LABEL),
            (vec128(&[-0.7, 0.3]), BACKGROUND_LABEL),
        ]);
        let mut a = SvmClassifier::new(SvmOptions::default());
        let mut b = SvmClassifier::new(SvmOptions::default());
        a.train(&ds).unwrap();
        b.train(&ds).unwrap();
        assert_eq!(a.slot.ready().unwrap().model, b.slot.ready().unwrap().model);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut clf = SvmClassifier::new(SvmOptions::default());
        clf.train(&dataset(&[(vec128(&[1.0]), SUBJECT_LABEL), (vec128(&[-1.0]), BACKGROUND_LABEL)]))
            .unwrap();
        let query = [detection(vec128(&[0.5]), 0.0)];
        let Decision::Margin { best_margin: Some(m), .. } = clf.predict(&query, 0.005).unwrap() else {
            panic!("expected a margin");
        };
        assert!(clf.predict(&query, m).unwrap().is_match());
    }
}
