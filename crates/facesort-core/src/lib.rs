//! facesort-core — Face matching engine.
//!
//! SCRFD detection and ArcFace-family embeddings via ONNX Runtime, labeled
//! training corpora, three interchangeable classifiers and the sorting
//! pipeline that ties them to a folder of candidate images.

pub mod alignment;
pub mod classifier;
pub mod corpus;
pub mod dataset;
pub mod detector;
pub mod extractor;
pub mod objects;
pub mod pipeline;
pub mod progress;
pub mod recognizer;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use classifier::{for_algorithm, ClassifierError, ClassifierOptions, ClassifierStrategy, Decision, ModelState};
pub use corpus::{CorpusError, CorpusReport, MultiFacePolicy, TrainingCorpusBuilder};
pub use dataset::{LabelPolicy, TrainingDataset};
pub use extractor::{EncodingExtractor, ExtractorError, ModelPaths, OnnxExtractor};
pub use objects::{ObjectFilter, ObjectFilterError, SsdObjectFilter, VOC_CLASSES};
pub use pipeline::{ConfigError, SortConfiguration, SortError, SortResult, SortingPipeline};
pub use progress::{CancelFlag, NoProgress, Phase, ProgressSink};
pub use store::{ModelStore, StoreError};
pub use types::{Algorithm, BoundingBox, CorpusFamily, Detection, DetectorKind, Dimensionality, Embedding, ExtractorParams};
