//! End-to-end sort: preflight checks, optional object filter, per-image
//! classification, copy to the destination.

use crate::classifier::{ClassifierError, ClassifierStrategy, ModelState, StaleReason};
use crate::extractor::{EncodingExtractor, ExtractorError};
use crate::objects::{is_known_class, ObjectFilter, ObjectFilterError};
use crate::progress::{CancelFlag, Phase, PhaseProgress, ProgressSink};
use crate::store::{ModelStore, StoreError};
use crate::types::{Algorithm, CorpusFamily, DetectorKind, Dimensionality, ExtractorParams};
use facesort_io::{copy_into, ensure_dir, CollisionPolicy, CopyError, CopyOutcome};
use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Accepted object-filter confidence values.
pub const FILTER_CONFIDENCE_RANGE: RangeInclusive<f32> = 0.001..=1.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} = {value} is out of range ({min}..={max})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("unknown object class '{0}'")]
    UnknownClass(String),
}

#[derive(Error, Debug)]
pub enum SortError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("configuration incomplete: {0}")]
    ConfigurationIncomplete(String),
    #[error("no {family} training data at {path}; generate training data first")]
    CorpusMissing { family: CorpusFamily, path: PathBuf },
    #[error("no {algorithm} model at {path}; train the classifier first")]
    ModelMissing { algorithm: Algorithm, path: PathBuf },
    #[error("training data is {stored} but {configured} is configured; regenerate the training data or change the setting")]
    DimensionalityMismatch {
        stored: Dimensionality,
        configured: Dimensionality,
    },
    #[error("{algorithm} model is stale ({reason}); train it again")]
    Stale { algorithm: Algorithm, reason: StaleReason },
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Classifier(ClassifierError),
    #[error(transparent)]
    Extractor(#[from] ExtractorError),
    #[error(transparent)]
    ObjectFilter(#[from] ObjectFilterError),
    #[error(transparent)]
    Copy(#[from] CopyError),
    #[error("cancelled")]
    Cancelled,
}

impl From<StoreError> for SortError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DimensionalityMismatch { stored, configured } => Self::DimensionalityMismatch { stored, configured },
            other => Self::Store(other),
        }
    }
}

impl From<ClassifierError> for SortError {
    fn from(e: ClassifierError) -> Self {
        match e {
            ClassifierError::Stale { algorithm, reason } => Self::Stale { algorithm, reason },
            ClassifierError::Store(store) => store.into(),
            other => Self::Classifier(other),
        }
    }
}

/// Immutable settings for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct SortConfiguration {
    pub algorithm: Algorithm,
    pub threshold: f32,
    pub detector: DetectorKind,
    pub dimensionality: Dimensionality,
    pub jitters: u32,
    pub upsample: u32,
    /// Object classes an image must show; empty disables the filter.
    pub filter_classes: BTreeSet<String>,
    pub filter_confidence: f32,
    /// With sorting off, the filtered list is the result.
    pub sort_enabled: bool,
}

impl Default for SortConfiguration {
    fn default() -> Self {
        let params = ExtractorParams::default();
        Self {
            algorithm: Algorithm::default(),
            threshold: Algorithm::default().default_threshold(),
            detector: params.detector,
            dimensionality: params.dimensionality,
            jitters: params.jitters,
            upsample: params.upsample,
            filter_classes: BTreeSet::new(),
            filter_confidence: 0.4,
            sort_enabled: true,
        }
    }
}

impl SortConfiguration {
    pub fn extractor_params(&self) -> ExtractorParams {
        ExtractorParams {
            detector: self.detector,
            dimensionality: self.dimensionality,
            jitters: self.jitters,
            upsample: self.upsample,
        }
    }

    pub fn filter_enabled(&self) -> bool {
        !self.filter_classes.is_empty()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("threshold", self.threshold, self.algorithm.threshold_range())?;
        check_range("jitters", self.jitters, ExtractorParams::JITTERS_RANGE)?;
        check_range("upsample", self.upsample, ExtractorParams::UPSAMPLE_RANGE)?;
        check_range("filter confidence", self.filter_confidence, FILTER_CONFIDENCE_RANGE)?;
        if let Some(unknown) = self.filter_classes.iter().find(|c| !is_known_class(c)) {
            return Err(ConfigError::UnknownClass(unknown.clone()));
        }
        Ok(())
    }
}

fn check_range<T>(field: &'static str, value: T, range: RangeInclusive<T>) -> Result<(), ConfigError>
where
    T: PartialOrd + Copy + Into<f64>,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value: value.into(),
            min: (*range.start()).into(),
            max: (*range.end()).into(),
        })
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortResult {
    /// Matched source images, in sorted order.
    pub matched: Vec<PathBuf>,
    pub candidates: usize,
    pub filtered_out: usize,
    /// Classified images in which no face was found.
    pub no_face: usize,
    /// Destination paths actually written.
    pub copied: Vec<PathBuf>,
    /// Matches not copied because the destination already had the name.
    pub skipped: usize,
}

pub struct SortingPipeline<E> {
    extractor: E,
    store: ModelStore,
    destination: PathBuf,
    collision: CollisionPolicy,
    cancel: CancelFlag,
}

impl<E: EncodingExtractor> SortingPipeline<E> {
    pub fn new(extractor: E, store: ModelStore, destination: impl Into<PathBuf>) -> Self {
        Self {
            extractor,
            store,
            destination: destination.into(),
            collision: CollisionPolicy::default(),
            cancel: CancelFlag::default(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_collision_policy(mut self, policy: CollisionPolicy) -> Self {
        self.collision = policy;
        self
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    pub fn run(
        &mut self,
        image_paths: &[PathBuf],
        config: &SortConfiguration,
        classifier: &mut dyn ClassifierStrategy,
        filter: Option<&mut dyn ObjectFilter>,
        progress: &mut dyn ProgressSink,
    ) -> Result<SortResult, SortError> {
        self.preflight(config, classifier, filter.is_some())?;

        let mut candidates = image_paths.to_vec();
        candidates.sort();
        let mut result = SortResult {
            candidates: candidates.len(),
            ..SortResult::default()
        };
        tracing::info!(
            candidates = candidates.len(),
            algorithm = %config.algorithm,
            threshold = config.threshold,
            sort = config.sort_enabled,
            filter = ?config.filter_classes,
            "sort started"
        );

        if let (true, Some(filter)) = (config.filter_enabled(), filter) {
            candidates = self.filter_phase(&candidates, config, filter, progress)?;
            result.filtered_out = result.candidates - candidates.len();
        }

        result.matched = if config.sort_enabled {
            self.classify_phase(&candidates, config, classifier, progress, &mut result.no_face)?
        } else {
            candidates
        };

        self.copy_phase(&mut result, progress)?;
        tracing::info!(
            matched = result.matched.len(),
            copied = result.copied.len(),
            no_face = result.no_face,
            destination = %self.destination.display(),
            "sort finished"
        );
        Ok(result)
    }

    /// Every check that can fail before anything is read or written.
    fn preflight(
        &mut self,
        config: &SortConfiguration,
        classifier: &mut dyn ClassifierStrategy,
        has_filter: bool,
    ) -> Result<(), SortError> {
        config.validate()?;
        if config.filter_enabled() && !has_filter {
            return Err(SortError::ConfigurationIncomplete("object filter classes set but no object model".into()));
        }
        if !config.sort_enabled {
            return Ok(());
        }
        if classifier.algorithm() != config.algorithm {
            return Err(SortError::ConfigurationIncomplete(format!(
                "{} classifier supplied for {} configuration",
                classifier.algorithm(),
                config.algorithm
            )));
        }

        let family = config.algorithm.corpus_family();
        let dataset = self.store.load_dataset(family).map_err(|e| match e {
            StoreError::NotGenerated { path, .. } => SortError::CorpusMissing { family, path },
            other => other.into(),
        })?;
        ModelStore::check_compatibility(&dataset, config.dimensionality).into_result()?;

        classifier.load(&self.store).map_err(|e| match e {
            ClassifierError::Store(StoreError::NotGenerated { path, .. }) => SortError::ModelMissing {
                algorithm: config.algorithm,
                path,
            },
            other => other.into(),
        })?;
        if let ModelState::Stale(reason) = classifier.reconcile(&dataset.digest(), config.dimensionality) {
            return Err(SortError::Stale {
                algorithm: config.algorithm,
                reason,
            });
        }

        self.extractor.prepare(&config.extractor_params())?;
        Ok(())
    }

    fn filter_phase(
        &mut self,
        candidates: &[PathBuf],
        config: &SortConfiguration,
        filter: &mut dyn ObjectFilter,
        progress: &mut dyn ProgressSink,
    ) -> Result<Vec<PathBuf>, SortError> {
        let mut phase = PhaseProgress::start(progress, Phase::Filtering, candidates.len());
        if candidates.is_empty() {
            phase.finish();
            return Ok(Vec::new());
        }
        if self.cancel.is_cancelled() {
            return Err(SortError::Cancelled);
        }

        let kept = filter.filter(
            candidates,
            &config.filter_classes,
            config.filter_confidence,
            &mut |fraction: f32| phase.fraction(fraction),
        )?;
        phase.finish();
        Ok(kept)
    }

    fn classify_phase(
        &mut self,
        candidates: &[PathBuf],
        config: &SortConfiguration,
        classifier: &dyn ClassifierStrategy,
        progress: &mut dyn ProgressSink,
        no_face: &mut usize,
    ) -> Result<Vec<PathBuf>, SortError> {
        let params = config.extractor_params();
        let mut phase = PhaseProgress::start(progress, Phase::Sorting, candidates.len());
        let mut matched = Vec::new();

        for path in candidates {
            if self.cancel.is_cancelled() {
                return Err(SortError::Cancelled);
            }
            let detections = self.extractor.extract(path, &params)?;
            if detections.is_empty() {
                *no_face += 1;
            }
            let decision = classifier.predict(&detections, config.threshold)?;
            tracing::debug!(path = %path.display(), faces = detections.len(), ?decision, "classified");
            if decision.is_match() {
                matched.push(path.clone());
            }
            phase.advance();
        }
        phase.finish();
        Ok(matched)
    }

    fn copy_phase(&mut self, result: &mut SortResult, progress: &mut dyn ProgressSink) -> Result<(), SortError> {
        ensure_dir(&self.destination)?;
        let mut phase = PhaseProgress::start(progress, Phase::Copying, result.matched.len());
        for source in &result.matched {
            if self.cancel.is_cancelled() {
                return Err(SortError::Cancelled);
            }
            match copy_into(source, &self.destination, self.collision)? {
                CopyOutcome::Copied(target) => result.copied.push(target),
                CopyOutcome::Skipped(_) => result.skipped += 1,
            }
            phase.advance();
        }
        phase.finish();
        Ok(())
    }
}
