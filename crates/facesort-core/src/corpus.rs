//! Building labeled training corpora from folders of reference images.

use crate::dataset::{DatasetError, LabelPolicy, LabeledEncoding, TrainingDataset};
use crate::extractor::{EncodingExtractor, ExtractorError};
use crate::progress::{CancelFlag, Phase, PhaseProgress, ProgressSink};
use crate::store::{ModelStore, StoreError};
use crate::types::{CorpusFamily, Detection, ExtractorParams, BACKGROUND_LABEL, SUBJECT_LABEL};
use facesort_io::{discover_images, DiscoveryError};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CorpusError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("two-class training data needs a negatives folder")]
    NegativesRequired,
    #[error("no faces found: {scanned} images scanned, {skipped} without a usable face")]
    Empty { scanned: usize, skipped: usize },
    #[error(transparent)]
    Extractor(#[from] ExtractorError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cancelled")]
    Cancelled,
}

/// Which faces of a multi-face reference image become samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MultiFacePolicy {
    /// Only the highest-confidence face.
    #[default]
    FirstOnly,
    KeepAll,
}

/// Summary of one corpus build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorpusReport {
    pub scanned: usize,
    /// Images that produced no detection.
    pub skipped: usize,
    pub subject_samples: usize,
    pub background_samples: usize,
}

pub struct TrainingCorpusBuilder<E> {
    extractor: E,
    multi_face: MultiFacePolicy,
    recursive: bool,
    cancel: CancelFlag,
}

impl<E: EncodingExtractor> TrainingCorpusBuilder<E> {
    pub fn new(extractor: E) -> Self {
        Self {
            extractor,
            multi_face: MultiFacePolicy::default(),
            recursive: false,
            cancel: CancelFlag::default(),
        }
    }

    pub fn multi_face(mut self, policy: MultiFacePolicy) -> Self {
        self.multi_face = policy;
        self
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn into_extractor(self) -> E {
        self.extractor
    }

    /// Encode every image of `reference` (and `negatives` for two-class
    /// corpora) into a dataset.
    pub fn build(
        &mut self,
        reference: &Path,
        negatives: Option<&Path>,
        label_policy: LabelPolicy,
        params: &ExtractorParams,
        progress: &mut dyn ProgressSink,
    ) -> Result<(TrainingDataset, CorpusReport), CorpusError> {
        let mut sources: Vec<(PathBuf, &str)> = discover_images(reference, self.recursive)?
            .into_iter()
            .map(|p| (p, SUBJECT_LABEL))
            .collect();

        match (label_policy, negatives) {
            (LabelPolicy::TwoClass, None) => return Err(CorpusError::NegativesRequired),
            (LabelPolicy::TwoClass, Some(dir)) => {
                sources.extend(
                    discover_images(dir, self.recursive)?
                        .into_iter()
                        .map(|p| (p, BACKGROUND_LABEL)),
                );
            }
            (LabelPolicy::OneClass, Some(dir)) => {
                tracing::warn!(negatives = %dir.display(), "one-class training data ignores the negatives folder");
            }
            (LabelPolicy::OneClass, None) => {}
        }

        self.extractor.prepare(params)?;
        tracing::info!(
            reference = %reference.display(),
            images = sources.len(),
            policy = ?label_policy,
            "building training data"
        );

        let mut dataset = TrainingDataset::new(*params, label_policy);
        let mut report = CorpusReport {
            scanned: sources.len(),
            ..CorpusReport::default()
        };
        let mut phase = PhaseProgress::start(progress, Phase::Encoding, sources.len());

        for (path, label) in &sources {
            if self.cancel.is_cancelled() {
                return Err(CorpusError::Cancelled);
            }

            let detections = self.extractor.extract(path, params)?;
            if detections.is_empty() {
                tracing::debug!(path = %path.display(), "no face, skipping");
                report.skipped += 1;
            } else {
                for detection in self.select(detections) {
                    dataset.push(LabeledEncoding {
                        embedding: detection.embedding,
                        label: label.to_string(),
                    })?;
                    if *label == SUBJECT_LABEL {
                        report.subject_samples += 1;
                    } else {
                        report.background_samples += 1;
                    }
                }
            }
            phase.advance();
        }
        phase.finish();

        if dataset.is_empty() {
            return Err(CorpusError::Empty {
                scanned: report.scanned,
                skipped: report.skipped,
            });
        }
        Ok((dataset, report))
    }

    /// [`build`](Self::build), then persist the dataset for `family`. Nothing
    /// is written unless the build succeeds.
    #[allow(clippy::too_many_arguments)]
    pub fn build_and_save(
        &mut self,
        reference: &Path,
        negatives: Option<&Path>,
        label_policy: LabelPolicy,
        params: &ExtractorParams,
        progress: &mut dyn ProgressSink,
        store: &ModelStore,
        family: CorpusFamily,
    ) -> Result<CorpusReport, CorpusError> {
        let (dataset, report) = self.build(reference, negatives, label_policy, params, progress)?;
        store.save_dataset(family, &dataset)?;
        Ok(report)
    }

    fn select(&self, mut detections: Vec<Detection>) -> Vec<Detection> {
        match self.multi_face {
            MultiFacePolicy::KeepAll => detections,
            MultiFacePolicy::FirstOnly => {
                detections.sort_by(|a, b| b.location.confidence.total_cmp(&a.location.confidence));
                detections.truncate(1);
                detections
            }
        }
    }
}
