use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facesort_core::classifier::{ModelState, SvmOptions};
use facesort_core::{
    for_algorithm, Algorithm, CancelFlag, ClassifierOptions, ClassifierStrategy, CorpusFamily, DetectorKind,
    Dimensionality, ExtractorParams, LabelPolicy, MultiFacePolicy, ObjectFilter, OnnxExtractor, Phase, ProgressSink,
    SortConfiguration, SortingPipeline, SsdObjectFilter, StoreError, TrainingCorpusBuilder,
};
use facesort_io::{discover_images, CollisionPolicy};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "facesort", version, about = "Sort photos by whether they show a known face")]
struct Cli {
    /// TOML file overriding FACESORT_* environment defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Extraction settings shared by `generate` and `sort`.
#[derive(clap::Args, Debug)]
struct ExtractorArgs {
    /// Face detector: fast or accurate
    #[arg(long)]
    detector: Option<DetectorKind>,
    /// Embedding size: 128 or 512
    #[arg(long)]
    dimensions: Option<Dimensionality>,
    /// Re-encodings averaged per face (1-200)
    #[arg(long)]
    jitters: Option<u32>,
    /// Detector upscaling passes (1-200)
    #[arg(long)]
    upsample: Option<u32>,
}

impl ExtractorArgs {
    fn apply(&self, config: &mut Config) {
        config.detector = self.detector.unwrap_or(config.detector);
        config.dimensionality = self.dimensions.unwrap_or(config.dimensionality);
        config.jitters = self.jitters.unwrap_or(config.jitters);
        config.upsample = self.upsample.unwrap_or(config.upsample);
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Encode reference images into training data
    Generate {
        /// Folder of images showing the subject
        #[arg(long)]
        reference: PathBuf,
        /// Folder of images of other people (two-class training data)
        #[arg(long)]
        negatives: Option<PathBuf>,
        /// Algorithm the training data is for (centroid, knn, svm)
        #[arg(long)]
        algorithm: Option<Algorithm>,
        /// Use every face of a multi-face image, not just the most confident
        #[arg(long)]
        keep_all_faces: bool,
        /// Descend into subfolders
        #[arg(long)]
        recursive: bool,
        #[command(flatten)]
        extractor: ExtractorArgs,
    },
    /// Train a classifier on the generated training data
    Train {
        #[arg(long)]
        algorithm: Option<Algorithm>,
    },
    /// Copy images showing the subject into a destination folder
    Sort {
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        dest: PathBuf,
        #[arg(long)]
        algorithm: Option<Algorithm>,
        /// Match threshold (distance for centroid/knn, margin for svm)
        #[arg(long)]
        threshold: Option<f32>,
        #[command(flatten)]
        extractor: ExtractorArgs,
        /// Only keep images showing this object class (repeatable)
        #[arg(long = "filter", value_name = "CLASS")]
        filter: Vec<String>,
        #[arg(long)]
        filter_confidence: Option<f32>,
        /// Skip face matching; keep every image that passes the object filter
        #[arg(long)]
        filter_only: bool,
        /// rename, overwrite or skip
        #[arg(long)]
        on_collision: Option<CollisionPolicy>,
        #[arg(long)]
        recursive: bool,
    },
    /// Show training data and model state for every algorithm
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    let cancel = CancelFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current image");
            on_signal.cancel();
        }
    });

    match cli.command {
        Commands::Generate {
            reference,
            negatives,
            algorithm,
            keep_all_faces,
            recursive,
            extractor,
        } => {
            extractor.apply(&mut config);
            let algorithm = algorithm.unwrap_or(config.algorithm);
            let family = algorithm.corpus_family();
            let policy = if negatives.is_some() {
                LabelPolicy::TwoClass
            } else {
                LabelPolicy::OneClass
            };
            let multi_face = if keep_all_faces {
                MultiFacePolicy::KeepAll
            } else {
                MultiFacePolicy::FirstOnly
            };
            let params = config.extractor_params();
            if !ExtractorParams::JITTERS_RANGE.contains(&params.jitters) {
                bail!("jitters must be within {:?}", ExtractorParams::JITTERS_RANGE);
            }
            if !ExtractorParams::UPSAMPLE_RANGE.contains(&params.upsample) {
                bail!("upsample must be within {:?}", ExtractorParams::UPSAMPLE_RANGE);
            }
            let store = config.store();
            let mut builder = TrainingCorpusBuilder::new(OnnxExtractor::new(config.model_paths()))
                .multi_face(multi_face)
                .recursive(recursive)
                .with_cancel(cancel);

            let report = tokio::task::spawn_blocking(move || {
                builder.build_and_save(
                    &reference,
                    negatives.as_deref(),
                    policy,
                    &params,
                    &mut LogProgress::default(),
                    &store,
                    family,
                )
            })
            .await??;

            println!(
                "{family} training data: {} subject, {} background samples from {} images ({} without a face)",
                report.subject_samples, report.background_samples, report.scanned, report.skipped
            );
        }
        Commands::Train { algorithm } => {
            let algorithm = algorithm.unwrap_or(config.algorithm);
            let store = config.store();
            let mut classifier = classifier_for(algorithm, &config);

            let path = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
                let dataset = match store.load_dataset(algorithm.corpus_family()) {
                    Ok(ds) => ds,
                    Err(e) if e.is_not_generated() => bail!("{e}; generate training data first"),
                    Err(e) => return Err(e.into()),
                };
                classifier.set_params(*dataset.params());
                classifier.train(&dataset)?;
                Ok(classifier.save(&store)?)
            })
            .await??;

            println!("trained {algorithm} model: {}", path.display());
        }
        Commands::Sort {
            source,
            dest,
            algorithm,
            threshold,
            extractor,
            filter,
            filter_confidence,
            filter_only,
            on_collision,
            recursive,
        } => {
            extractor.apply(&mut config);
            let algorithm = algorithm.unwrap_or(config.algorithm);
            let sort_config = SortConfiguration {
                algorithm,
                threshold: threshold.unwrap_or_else(|| config.threshold_for(algorithm)),
                detector: config.detector,
                dimensionality: config.dimensionality,
                jitters: config.jitters,
                upsample: config.upsample,
                filter_classes: filter.into_iter().map(|c| c.to_ascii_lowercase()).collect::<BTreeSet<_>>(),
                filter_confidence: filter_confidence.unwrap_or(config.filter_confidence),
                sort_enabled: !filter_only,
            };
            sort_config.validate().context("invalid sort settings")?;

            let images = discover_images(&source, recursive)?;
            let mut object_filter = if sort_config.filter_enabled() {
                Some(SsdObjectFilter::load(&config.object_model_path())?)
            } else {
                None
            };
            let mut classifier = classifier_for(algorithm, &config);
            let mut pipeline = SortingPipeline::new(OnnxExtractor::new(config.model_paths()), config.store(), dest)
                .with_cancel(cancel)
                .with_collision_policy(on_collision.unwrap_or(config.on_collision));

            let result = tokio::task::spawn_blocking(move || {
                pipeline.run(
                    &images,
                    &sort_config,
                    classifier.as_mut(),
                    object_filter.as_mut().map(|f| f as &mut dyn ObjectFilter),
                    &mut LogProgress::default(),
                )
            })
            .await??;

            for path in &result.matched {
                println!("{}", path.display());
            }
            eprintln!(
                "{} of {} images matched ({} filtered out, {} without a face); {} copied, {} skipped",
                result.matched.len(),
                result.candidates,
                result.filtered_out,
                result.no_face,
                result.copied.len(),
                result.skipped
            );
        }
        Commands::Status => status(&config)?,
    }

    Ok(())
}

fn classifier_for(algorithm: Algorithm, config: &Config) -> Box<dyn ClassifierStrategy> {
    let options = ClassifierOptions {
        knn_k: config.knn_k,
        svm: SvmOptions::default(),
    };
    for_algorithm(algorithm, &options)
}

fn status(config: &Config) -> Result<()> {
    let store = config.store();
    println!("data dir:  {}", store.root().display());
    println!("model dir: {}", config.model_dir.display());

    for family in [CorpusFamily::Distance, CorpusFamily::Margin] {
        match store.load_dataset(family) {
            Ok(ds) => println!(
                "{family} training data: {} samples ({} subject), {}, created {}",
                ds.len(),
                ds.subject_count(),
                ds.dimensionality(),
                ds.created_at().format("%Y-%m-%d %H:%M")
            ),
            Err(e) if e.is_not_generated() => println!("{family} training data: not generated"),
            Err(e) => println!("{family} training data: {e}"),
        }
    }

    for algorithm in Algorithm::ALL {
        if !store.model_exists(algorithm) {
            println!("{algorithm} model: not trained");
            continue;
        }
        let mut classifier = classifier_for(algorithm, config);
        let line = match classifier.load(&store) {
            Err(e) => e.to_string(),
            Ok(()) => match store.load_dataset(algorithm.corpus_family()) {
                Ok(ds) => match classifier.reconcile(&ds.digest(), config.dimensionality) {
                    ModelState::Stale(reason) => format!("stale: {reason}"),
                    _ => "ready".to_string(),
                },
                Err(StoreError::NotGenerated { .. }) => "trained, but its training data is gone".to_string(),
                Err(e) => e.to_string(),
            },
        };
        println!("{algorithm} model: {line}");
    }
    Ok(())
}

/// Logs each phase at 10 % steps and on completion.
#[derive(Default)]
struct LogProgress {
    last: Option<(Phase, u32)>,
}

impl ProgressSink for LogProgress {
    fn report(&mut self, phase: Phase, percent: f32) {
        let step = (percent / 10.0).floor() as u32;
        let changed = match self.last {
            Some((p, s)) => p != phase || s != step,
            None => true,
        };
        if changed {
            tracing::info!(%phase, percent = percent.round() as u32, "progress");
            self.last = Some((phase, step));
        }
    }
}
