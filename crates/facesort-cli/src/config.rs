use anyhow::{bail, Context, Result};
use facesort_core::{Algorithm, DetectorKind, Dimensionality, ExtractorParams, ModelPaths, ModelStore};
use facesort_io::CollisionPolicy;
use serde::Deserialize;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// File name of the MobileNet-SSD object model inside the model dir.
const OBJECT_MODEL_FILE: &str = "MobileNetSSD_deploy.onnx";

/// CLI configuration: `FACESORT_*` environment variables, then an optional
/// TOML file, then command-line flags (applied by the caller).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Directory holding training data and trained models.
    pub data_dir: PathBuf,
    pub algorithm: Algorithm,
    /// Distance threshold for centroid matching; `None` uses the default.
    pub centroid_threshold: Option<f32>,
    /// Distance threshold for k-NN matching; `None` uses the default.
    pub knn_threshold: Option<f32>,
    /// Margin threshold for the SVM. Never derived from the distance thresholds.
    pub svm_threshold: Option<f32>,
    pub detector: DetectorKind,
    pub dimensionality: Dimensionality,
    pub jitters: u32,
    pub upsample: u32,
    pub filter_confidence: f32,
    /// Neighbors consulted by k-NN; `None` derives it from the corpus size.
    pub knn_k: Option<usize>,
    pub on_collision: CollisionPolicy,
}

/// Keys accepted in the TOML file. All optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    algorithm: Option<Algorithm>,
    centroid_threshold: Option<f32>,
    knn_threshold: Option<f32>,
    svm_threshold: Option<f32>,
    detector: Option<DetectorKind>,
    dimensionality: Option<Dimensionality>,
    jitters: Option<u32>,
    upsample: Option<u32>,
    filter_confidence: Option<f32>,
    knn_k: Option<usize>,
    on_collision: Option<CollisionPolicy>,
}

impl Config {
    /// Environment defaults, overridden by `file` when given.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Some(path) = file {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
            config.apply_toml(&text).with_context(|| format!("parsing config {}", path.display()))?;
            tracing::debug!(path = %path.display(), "applied config file");
        }
        Ok(config)
    }

    /// Load configuration from `FACESORT_*` environment variables with defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if get("FACESORT_THRESHOLD").is_some() {
            bail!(
                "FACESORT_THRESHOLD is ambiguous; set FACESORT_CENTROID_THRESHOLD, \
                 FACESORT_KNN_THRESHOLD or FACESORT_SVM_THRESHOLD"
            );
        }
        let data_dir = get("FACESORT_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            get("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
                    PathBuf::from(home).join(".local/share")
                })
                .join("facesort")
        });
        let model_dir = get("FACESORT_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("models"));
        let extractor = ExtractorParams::default();

        Ok(Self {
            model_dir,
            data_dir,
            algorithm: parse_var(&get, "FACESORT_ALGORITHM")?.unwrap_or_default(),
            centroid_threshold: parse_var(&get, "FACESORT_CENTROID_THRESHOLD")?,
            knn_threshold: parse_var(&get, "FACESORT_KNN_THRESHOLD")?,
            svm_threshold: parse_var(&get, "FACESORT_SVM_THRESHOLD")?,
            detector: parse_var(&get, "FACESORT_DETECTOR")?.unwrap_or(extractor.detector),
            dimensionality: parse_var(&get, "FACESORT_DIMENSIONALITY")?.unwrap_or(extractor.dimensionality),
            jitters: parse_var(&get, "FACESORT_JITTERS")?.unwrap_or(extractor.jitters),
            upsample: parse_var(&get, "FACESORT_UPSAMPLE")?.unwrap_or(extractor.upsample),
            filter_confidence: parse_var(&get, "FACESORT_FILTER_CONFIDENCE")?.unwrap_or(0.4),
            knn_k: parse_var(&get, "FACESORT_KNN_K")?,
            on_collision: parse_var(&get, "FACESORT_ON_COLLISION")?.unwrap_or_default(),
        })
    }

    fn apply_toml(&mut self, text: &str) -> Result<()> {
        let file: FileConfig = toml::from_str(text)?;
        self.model_dir = file.model_dir.unwrap_or_else(|| self.model_dir.clone());
        self.data_dir = file.data_dir.unwrap_or_else(|| self.data_dir.clone());
        self.algorithm = file.algorithm.unwrap_or(self.algorithm);
        self.centroid_threshold = file.centroid_threshold.or(self.centroid_threshold);
        self.knn_threshold = file.knn_threshold.or(self.knn_threshold);
        self.svm_threshold = file.svm_threshold.or(self.svm_threshold);
        self.detector = file.detector.unwrap_or(self.detector);
        self.dimensionality = file.dimensionality.unwrap_or(self.dimensionality);
        self.jitters = file.jitters.unwrap_or(self.jitters);
        self.upsample = file.upsample.unwrap_or(self.upsample);
        self.filter_confidence = file.filter_confidence.unwrap_or(self.filter_confidence);
        self.knn_k = file.knn_k.or(self.knn_k);
        self.on_collision = file.on_collision.unwrap_or(self.on_collision);
        Ok(())
    }

    pub fn store(&self) -> ModelStore {
        ModelStore::new(&self.data_dir)
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir)
    }

    /// The threshold configured for `algorithm`, or its own default.
    pub fn threshold_for(&self, algorithm: Algorithm) -> f32 {
        let configured = match algorithm {
            Algorithm::Centroid => self.centroid_threshold,
            Algorithm::Knn => self.knn_threshold,
            Algorithm::Svm => self.svm_threshold,
        };
        configured.unwrap_or_else(|| algorithm.default_threshold())
    }

    pub fn object_model_path(&self) -> PathBuf {
        self.model_dir.join(OBJECT_MODEL_FILE)
    }

    pub fn extractor_params(&self) -> ExtractorParams {
        ExtractorParams {
            detector: self.detector,
            dimensionality: self.dimensionality,
            jitters: self.jitters,
            upsample: self.upsample,
        }
    }
}

/// Parse `key` if set. A set but malformed value is an error, not a silent default.
fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{key}={raw}: {e}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("HOME", "/home/u")])).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/home/u/.local/share/facesort"));
        assert_eq!(config.model_dir, PathBuf::from("/home/u/.local/share/facesort/models"));
        assert_eq!(config.algorithm, Algorithm::Centroid);
        assert_eq!(config.threshold_for(Algorithm::Centroid), 1.2);
        assert_eq!(config.threshold_for(Algorithm::Knn), 1.0);
        assert_eq!(config.threshold_for(Algorithm::Svm), 0.005);
        assert_eq!(config.jitters, 3);
        assert_eq!(config.upsample, 1);
        assert_eq!(config.filter_confidence, 0.4);
        assert_eq!(config.on_collision, CollisionPolicy::Rename);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("XDG_DATA_HOME", "/xdg"),
            ("FACESORT_MODEL_DIR", "/opt/models"),
            ("FACESORT_ALGORITHM", "svm"),
            ("FACESORT_SVM_THRESHOLD", "0.01"),
            ("FACESORT_DETECTOR", "cnn"),
            ("FACESORT_DIMENSIONALITY", "512"),
            ("FACESORT_KNN_K", "5"),
            ("FACESORT_ON_COLLISION", "skip"),
        ]))
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/xdg/facesort"));
        assert_eq!(config.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(config.algorithm, Algorithm::Svm);
        assert_eq!(config.threshold_for(Algorithm::Svm), 0.01);
        assert_eq!(config.threshold_for(Algorithm::Centroid), 1.2);
        assert_eq!(config.detector, DetectorKind::Accurate);
        assert_eq!(config.dimensionality, Dimensionality::D512);
        assert_eq!(config.knn_k, Some(5));
        assert_eq!(config.on_collision, CollisionPolicy::Skip);
        let models = config.model_paths();
        assert_eq!(models.detector(DetectorKind::Accurate), Path::new("/opt/models/det_10g.onnx"));
        assert_eq!(models.recognizer(Dimensionality::D512), Path::new("/opt/models/w600k_r50.onnx"));
        assert_eq!(config.object_model_path(), PathBuf::from("/opt/models/MobileNetSSD_deploy.onnx"));
    }

    #[test]
    fn test_malformed_env_is_an_error() {
        let err = Config::from_lookup(lookup(&[("FACESORT_JITTERS", "lots")])).unwrap_err();
        assert!(err.to_string().contains("FACESORT_JITTERS"), "error: {err}");
        assert!(Config::from_lookup(lookup(&[("FACESORT_DIMENSIONALITY", "256")])).is_err());
    }

    #[test]
    fn test_toml_file_overrides_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facesort.toml");
        std::fs::write(
            &path,
            "algorithm = \"knn\"\nknn_threshold = 0.9\ndimensionality = 512\nknn_k = 7\non_collision = \"overwrite\"\n",
        )
        .unwrap();

        let mut config = Config::from_lookup(lookup(&[("FACESORT_ALGORITHM", "svm")])).unwrap();
        config.apply_toml(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config.algorithm, Algorithm::Knn);
        assert_eq!(config.threshold_for(Algorithm::Knn), 0.9);
        assert_eq!(config.dimensionality, Dimensionality::D512);
        assert_eq!(config.knn_k, Some(7));
        assert_eq!(config.on_collision, CollisionPolicy::Overwrite);
        assert_eq!(config.jitters, 3, "keys absent from the file keep their value");
    }

    #[test]
    fn test_unknown_toml_key_rejected() {
        let mut config = Config::from_lookup(lookup(&[])).unwrap();
        assert!(config.apply_toml("threshhold = 1.0\n").is_err());
        assert!(config.apply_toml("threshold = 1.2\n").is_err(), "a shared threshold key is refused");
    }

    #[test]
    fn test_distance_threshold_never_reaches_svm() {
        let mut config = Config::from_lookup(lookup(&[("FACESORT_KNN_THRESHOLD", "0.8")])).unwrap();
        config.apply_toml("algorithm = \"centroid\"\ncentroid_threshold = 1.2\n").unwrap();
        assert_eq!(config.threshold_for(Algorithm::Centroid), 1.2);
        assert_eq!(config.threshold_for(Algorithm::Knn), 0.8);

        // Switching to the SVM falls back to its own margin default.
        config.algorithm = Algorithm::Svm;
        assert_eq!(config.threshold_for(config.algorithm), Algorithm::Svm.default_threshold());

        config.apply_toml("svm_threshold = 0.02\n").unwrap();
        assert_eq!(config.threshold_for(Algorithm::Svm), 0.02);
        assert_eq!(config.threshold_for(Algorithm::Centroid), 1.2);
    }

    #[test]
    fn test_shared_threshold_env_is_an_error() {
        let err = Config::from_lookup(lookup(&[("FACESORT_THRESHOLD", "1.2")])).unwrap_err();
        assert!(err.to_string().contains("FACESORT_SVM_THRESHOLD"), "error: {err}");
    }
}
