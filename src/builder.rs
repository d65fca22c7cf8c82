//! End-to-end engine build: corpus collection, optional preprocessing, filtering, data
//! preparation and decoder training as one resumable [`Schedule`].

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::config::PipelineConfig;
use crate::corpus::BilingualCorpus;
use crate::engine::{with_suffix, CorpusProcessor, TrainerBackend};
use crate::error::{NmtError, Result};
use crate::filter::CorpusFilter;
use crate::lang::LanguagePair;
use crate::metrics::{FilterStats, PackStats};
use crate::pipeline::{RunOptions, RunReport, Schedule, StepContext, StepOptions, Workspace};
use crate::prepare::DatasetPreparer;
use crate::training::{DecoderTrainer, ModelFiles};

/// Names of the build steps, usable as resume points.
pub mod steps {
    /// Discovers the training corpora.
    pub const COLLECT: &str = "Collecting corpora";
    /// Runs the external corpus processor, when configured.
    pub const PREPROCESS: &str = "Preprocessing corpora";
    /// Length/ratio filtering.
    pub const FILTER: &str = "Filtering corpora";
    /// Subword model, vocabularies and packed datasets.
    pub const PREPARE: &str = "Preparing training data";
    /// Decoder training and model promotion.
    pub const TRAIN: &str = "Neural decoder training";
}

const PREPROCESSED_DIR: &str = "preprocessed";
const FILTERED_DIR: &str = "filtered";
const TRAINING_DATA_DIR: &str = "training_data";
const PROCESSED_VALID_DIR: &str = "processed_valid";
const MODEL_TRAINING_DIR: &str = "model_training";

/// State threaded through the build steps. Each field is filled by one step and read by later
/// ones.
#[derive(Debug, Default)]
pub struct BuildContext {
    /// Incremented after every step.
    pub revision: usize,
    /// Raw training corpora.
    pub bilingual_corpora: Vec<BilingualCorpus>,
    /// Raw validation corpora.
    pub validation_corpora: Vec<BilingualCorpus>,
    /// Output of the external processor, when one ran.
    pub processed_corpora: Option<Vec<BilingualCorpus>>,
    /// Output of the filter.
    pub filtered_corpora: Vec<BilingualCorpus>,
    /// Per-corpus filter tallies; empty when filtering was skipped.
    pub filter_stats: Vec<FilterStats>,
    /// Directory holding the subword model, vocabularies and packed datasets.
    pub training_data_path: Option<PathBuf>,
    /// Train and validation packing tallies; `None` when preparation was skipped.
    pub pack_stats: Option<(PackStats, PackStats)>,
    /// Promoted model files.
    pub model_files: Option<ModelFiles>,
}

impl StepContext for BuildContext {
    fn bump_revision(&mut self) {
        self.revision += 1;
    }
}

/// Directory layout of a built engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLayout {
    root: PathBuf,
    pair: LanguagePair,
}

impl EngineLayout {
    /// Layout rooted at `root` for `pair`.
    pub fn new(root: impl Into<PathBuf>, pair: LanguagePair) -> Self {
        Self {
            root: root.into(),
            pair,
        }
    }

    /// Engine root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/models/decoder`.
    #[must_use]
    pub fn decoder_dir(&self) -> PathBuf {
        self.root.join("models").join("decoder")
    }

    /// `<root>/models/decoder/model.<src>__<trg>`.
    #[must_use]
    pub fn model_path(&self) -> PathBuf {
        self.decoder_dir().join(self.pair.model_name())
    }

    /// Temporary workspace root, `<root>/temp`.
    #[must_use]
    pub fn temp_root(&self) -> PathBuf {
        self.root.join("temp")
    }
}

/// What a successful build returns.
#[derive(Debug)]
pub struct EngineArtifacts {
    /// Promoted model files and registry.
    pub model: ModelFiles,
    /// Step timings.
    pub report: RunReport,
    /// Filter tallies; empty when filtering was skipped.
    pub filter_stats: Vec<FilterStats>,
    /// Packing tallies; `None` when preparation was skipped.
    pub pack_stats: Option<(PackStats, PackStats)>,
}

/// Configures and runs an engine build.
pub struct EngineBuilder<B> {
    pair: LanguagePair,
    roots: Vec<PathBuf>,
    layout: EngineLayout,
    config: PipelineConfig,
    backend: B,
    validation_corpora: Option<PathBuf>,
    checkpoint: Option<PathBuf>,
    metadata: Option<PathBuf>,
    processor: Option<Box<dyn CorpusProcessor>>,
}

impl<B: TrainerBackend> EngineBuilder<B> {
    /// Builder reading corpora from `roots` and writing the engine under `engine_root`.
    pub fn new<P: AsRef<Path>>(
        pair: LanguagePair,
        roots: &[P],
        engine_root: impl Into<PathBuf>,
        backend: B,
    ) -> Self {
        Self {
            layout: EngineLayout::new(engine_root, pair.clone()),
            pair,
            roots: roots.iter().map(|root| root.as_ref().to_path_buf()).collect(),
            config: PipelineConfig::default(),
            backend,
            validation_corpora: None,
            checkpoint: None,
            metadata: None,
            processor: None,
        }
    }

    /// Replaces the pipeline configuration.
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Folder holding the validation corpora.
    #[must_use]
    pub fn validation_corpora(mut self, folder: impl Into<PathBuf>) -> Self {
        self.validation_corpora = Some(folder.into());
        self
    }

    /// Checkpoint to start training from. Its `.bpe` sibling must exist and is reused as
    /// subword model, so the new vocabularies match the checkpoint's embeddings.
    #[must_use]
    pub fn checkpoint(mut self, checkpoint: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(checkpoint.into());
        self
    }

    /// Metadata file for engines created from scratch.
    #[must_use]
    pub fn metadata(mut self, metadata: impl Into<PathBuf>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// External processor run over training and validation corpora before filtering.
    #[must_use]
    pub fn preprocessor(mut self, processor: Box<dyn CorpusProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Engine directory layout.
    #[must_use]
    pub fn layout(&self) -> &EngineLayout {
        &self.layout
    }

    /// Runs the build. The workspace is removed only after every step succeeded, so failed
    /// builds can be inspected and resumed.
    pub fn build(self, opts: &RunOptions<'_>) -> Result<EngineArtifacts> {
        self.config.validate()?;
        let Self {
            pair,
            roots,
            layout,
            config,
            backend,
            validation_corpora,
            checkpoint,
            metadata,
            processor,
        } = self;
        info!("building {pair} engine in {}", layout.root().display());

        let reuse_subword_model = match checkpoint.as_deref() {
            Some(checkpoint) => {
                let model = with_suffix(checkpoint, "bpe");
                if !model.is_file() {
                    return Err(NmtError::InvalidConfig(format!(
                        "checkpoint {} has no subword model at {}",
                        checkpoint.display(),
                        model.display()
                    )));
                }
                Some(model)
            }
            None => None,
        };
        let workspace = Workspace::new(layout.temp_root(), config.keep_temp)?;
        let filter = CorpusFilter::new(config.filter.clone(), pair.clone())?;
        let preparer = DatasetPreparer::new(
            config.subword.clone(),
            config.packing.clone(),
            pair.clone(),
        )?;
        let mut trainer = DecoderTrainer::new(backend, layout.model_path(), pair.clone());

        let mut base = Schedule::new().then(
            steps::COLLECT,
            |ctx: &mut BuildContext, _opts: &StepOptions<'_>| -> Result<()> {
                ctx.bilingual_corpora = BilingualCorpus::collect(&roots, &pair)?;
                ctx.validation_corpora = match &validation_corpora {
                    Some(folder) => BilingualCorpus::list_parallel(folder, &pair)?,
                    None => {
                        warn!("no validation corpora configured");
                        Vec::new()
                    }
                };
                info!(
                    "collected {} training and {} validation corpora",
                    ctx.bilingual_corpora.len(),
                    ctx.validation_corpora.len()
                );
                Ok(())
            },
        );
        if let Some(processor) = processor.as_deref() {
            let (workspace, pair) = (&workspace, &pair);
            base = base.then(
                steps::PREPROCESS,
                move |ctx: &mut BuildContext, opts: &StepOptions<'_>| -> Result<()> {
                    let dest = workspace.temp_dir(PREPROCESSED_DIR)?;
                    let processed = if opts.skip {
                        BilingualCorpus::list_parallel(&dest, pair)?
                    } else {
                        processor.process(&ctx.bilingual_corpora, &dest, opts.log)?
                    };
                    ctx.processed_corpora = Some(processed);
                    Ok(())
                },
            );
        }

        let domain = Schedule::new()
            .then(
                steps::FILTER,
                |ctx: &mut BuildContext, opts: &StepOptions<'_>| -> Result<()> {
                    let dest = workspace.temp_dir(FILTERED_DIR)?;
                    if opts.skip {
                        ctx.filtered_corpora = BilingualCorpus::list_parallel(&dest, &pair)?;
                        return Ok(());
                    }
                    let input = ctx
                        .processed_corpora
                        .as_ref()
                        .unwrap_or(&ctx.bilingual_corpora);
                    let filtered = filter.filter(input, &dest)?;
                    let (corpora, stats) = filtered
                        .into_iter()
                        .map(|entry| (entry.corpus, entry.stats))
                        .unzip();
                    ctx.filtered_corpora = corpora;
                    ctx.filter_stats = stats;
                    Ok(())
                },
            )
            .then(
                steps::PREPARE,
                |ctx: &mut BuildContext, opts: &StepOptions<'_>| -> Result<()> {
                    let output = workspace.temp_dir(TRAINING_DATA_DIR)?;
                    ctx.training_data_path = Some(output.clone());
                    if opts.skip {
                        return Ok(());
                    }

                    let processed_valid = output.join(PROCESSED_VALID_DIR);
                    let validation = match processor.as_deref() {
                        Some(processor) if !ctx.validation_corpora.is_empty() => {
                            fs::create_dir_all(&processed_valid)
                                .map_err(|err| NmtError::io_at(err, &processed_valid))?;
                            processor.process(&ctx.validation_corpora, &processed_valid, opts.log)?
                        }
                        _ => ctx.validation_corpora.clone(),
                    };
                    let prepared = preparer.build(
                        &ctx.filtered_corpora,
                        &validation,
                        &output,
                        reuse_subword_model.as_deref(),
                    )?;
                    ctx.pack_stats = Some((prepared.train.1, prepared.valid.1));

                    if opts.delete_on_exit && processed_valid.exists() {
                        fs::remove_dir_all(&processed_valid)
                            .map_err(|err| NmtError::io_at(err, &processed_valid))?;
                    }
                    Ok(())
                },
            )
            .then(
                steps::TRAIN,
                |ctx: &mut BuildContext, opts: &StepOptions<'_>| -> Result<()> {
                    let working_dir = workspace.temp_dir(MODEL_TRAINING_DIR)?;
                    if opts.skip {
                        return Ok(());
                    }
                    let data = ctx.training_data_path.as_deref().ok_or_else(|| {
                        NmtError::Internal("training data path not set before training".into())
                    })?;
                    let files = trainer.train(
                        data,
                        &working_dir,
                        checkpoint.as_deref(),
                        metadata.as_deref(),
                    )?;
                    ctx.model_files = Some(files);

                    if opts.delete_on_exit {
                        fs::remove_dir_all(&working_dir)
                            .map_err(|err| NmtError::io_at(err, &working_dir))?;
                    }
                    Ok(())
                },
            );

        let mut schedule = base.chain(domain);
        let mut ctx = BuildContext::default();
        let report = schedule.run(&mut ctx, opts)?;
        drop(schedule);

        let model = ctx
            .model_files
            .ok_or_else(|| NmtError::Internal("training step produced no model".into()))?;
        workspace.close()?;
        info!(
            "engine {pair} built in {:.2}s",
            report.total.as_secs_f64()
        );
        Ok(EngineArtifacts {
            model,
            report,
            filter_stats: ctx.filter_stats,
            pack_stats: ctx.pack_stats,
        })
    }
}
