//! Resumable training driver and model promotion.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::info;

use crate::dataset::PackedDataset;
use crate::engine::{with_suffix, EngineMetadata, TrainerBackend, TrainingData};
use crate::error::{NmtError, Result};
use crate::lang::LanguagePair;
use crate::prepare::{TRAIN_DATASET_DIR, VALID_DATASET_DIR};
use crate::state::{CheckpointEntry, CheckpointLog, TrainingState, STATE_FILE};
use crate::vocab::{VocabularyPair, VOCAB_FILE};

/// Registry file listing the models of a model directory.
pub const MODEL_REGISTRY_FILE: &str = "model.conf";

/// How the engine handed to the backend was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOrigin {
    /// Restored from the most recent checkpoint of a previous, interrupted run.
    Resumed {
        /// Step of the restored checkpoint.
        step: u64,
    },
    /// Restored from an explicitly supplied checkpoint.
    FreshFromCheckpoint(PathBuf),
    /// Built from the vocabularies and optional metadata.
    FreshFromScratch,
}

impl fmt::Display for EngineOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resumed { step } => write!(f, "resumed from step {step}"),
            Self::FreshFromCheckpoint(path) => write!(f, "loaded from {}", path.display()),
            Self::FreshFromScratch => f.write_str("created from scratch"),
        }
    }
}

/// Result of a completed training run.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// How training started.
    pub origin: EngineOrigin,
    /// Checkpoint that was promoted.
    pub checkpoint: CheckpointEntry,
    /// Promoted files, `<model path>.<ext>`.
    pub files: Vec<PathBuf>,
    /// Registry file that references the model.
    pub registry: PathBuf,
}

/// Drives a [`TrainerBackend`] and promotes its last checkpoint to `model_path`.
#[derive(Debug)]
pub struct DecoderTrainer<B> {
    backend: B,
    model_path: PathBuf,
    pair: LanguagePair,
}

impl<B: TrainerBackend> DecoderTrainer<B> {
    /// Creates a trainer writing the final model to `model_path` (a path prefix).
    pub fn new(backend: B, model_path: impl Into<PathBuf>, pair: LanguagePair) -> Self {
        Self {
            backend,
            model_path: model_path.into(),
            pair,
        }
    }

    /// Trains on the prepared data in `dataset_dir`, resuming from `working_dir/state.json`
    /// when it records a checkpoint.
    pub fn train(
        &mut self,
        dataset_dir: &Path,
        working_dir: &Path,
        checkpoint_path: Option<&Path>,
        metadata_path: Option<&Path>,
    ) -> Result<ModelFiles> {
        info!("training started for data {}", dataset_dir.display());
        fs::create_dir_all(working_dir).map_err(|err| NmtError::io_at(err, working_dir))?;
        let state = TrainingState::load_from_file(working_dir.join(STATE_FILE))?;

        let start = Instant::now();
        let data = TrainingData {
            train: PackedDataset::open(dataset_dir.join(TRAIN_DATASET_DIR))?,
            valid: PackedDataset::open(dataset_dir.join(VALID_DATASET_DIR))?,
            vocab: VocabularyPair::load_from_file(dataset_dir.join(VOCAB_FILE))?,
        };
        info!(
            "loaded {} training and {} validation pairs in {:.2?}; vocabulary size source = {}, target = {}",
            data.train.len(),
            data.valid.len(),
            start.elapsed(),
            data.vocab.source.len(),
            data.vocab.target.len()
        );

        let resume_from = state.as_ref().and_then(TrainingState::latest).cloned();
        let (origin, mut engine) = match (resume_from, checkpoint_path) {
            (Some(latest), _) => {
                let engine = self.backend.load_from_checkpoint(&latest.file)?;
                (EngineOrigin::Resumed { step: latest.step }, engine)
            }
            (None, Some(checkpoint)) => {
                let engine = self.backend.load_from_checkpoint(checkpoint)?;
                (EngineOrigin::FreshFromCheckpoint(checkpoint.to_path_buf()), engine)
            }
            (None, None) => {
                let metadata = match metadata_path {
                    Some(path) => {
                        info!("reading engine metadata from {}", path.display());
                        Some(EngineMetadata::load_from_file(path)?)
                    }
                    None => None,
                };
                let engine = self.backend.new_instance(&data.vocab, metadata)?;
                (EngineOrigin::FreshFromScratch, engine)
            }
        };
        info!("engine {origin}");

        let mut log = CheckpointLog::new(state.unwrap_or_default(), working_dir);
        let start = Instant::now();
        self.backend.train(&mut engine, &data, &mut log)?;
        info!("train model END {:.2}s", start.elapsed().as_secs_f64());

        let state = log.into_state();
        let checkpoint = state.latest().cloned().ok_or_else(|| {
            NmtError::TrainingIncomplete(
                "training interrupted before the first checkpoint was saved".into(),
            )
        })?;
        info!("copying checkpoint at {}", checkpoint.file.display());
        let files = self.promote(&checkpoint.file)?;
        let registry = self.register()?;

        Ok(ModelFiles {
            origin,
            checkpoint,
            files,
            registry,
        })
    }

    fn model_dir(&self) -> PathBuf {
        self.model_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    fn model_file_name(&self) -> Result<String> {
        self.model_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                NmtError::InvalidConfig(format!(
                    "model path {} has no file name",
                    self.model_path.display()
                ))
            })
    }

    /// Copies every `<checkpoint>.*` file to `<model path>.<ext>`. A checkpoint without any
    /// such file is an error, so nothing gets registered for a model that was never stored.
    fn promote(&self, checkpoint: &Path) -> Result<Vec<PathBuf>> {
        let checkpoint_dir = checkpoint
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let prefix = checkpoint
            .file_name()
            .map(|name| format!("{}.", name.to_string_lossy()))
            .ok_or_else(|| {
                NmtError::Internal(format!("checkpoint {} has no file name", checkpoint.display()))
            })?;

        let mut sources = Vec::new();
        let entries =
            fs::read_dir(checkpoint_dir).map_err(|err| NmtError::io_at(err, checkpoint_dir))?;
        for entry in entries {
            let entry = entry.map_err(|err| NmtError::io_at(err, checkpoint_dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && entry.path().is_file() {
                sources.push(entry.path());
            }
        }
        sources.retain(|source| source.extension().is_some());
        sources.sort();
        if sources.is_empty() {
            return Err(NmtError::ExternalTool(format!(
                "checkpoint {} has no files to promote",
                checkpoint.display()
            )));
        }

        let model_dir = self.model_dir();
        if !model_dir.as_os_str().is_empty() {
            fs::create_dir_all(&model_dir).map_err(|err| NmtError::io_at(err, &model_dir))?;
        }
        let mut files = Vec::with_capacity(sources.len());
        for source in sources {
            let Some(ext) = source.extension().map(|ext| ext.to_string_lossy().into_owned())
            else {
                continue;
            };
            let target = with_suffix(&self.model_path, &ext);
            fs::copy(&source, &target).map_err(|err| NmtError::io_at(err, &target))?;
            info!("stored {}", target.display());
            files.push(target);
        }
        Ok(files)
    }

    /// Appends `model.<src>__<trg> = <file name>` to the registry unless already present.
    fn register(&self) -> Result<PathBuf> {
        let registry = self.model_dir().join(MODEL_REGISTRY_FILE);
        let line = format!("{} = {}", self.pair.model_name(), self.model_file_name()?);

        let existing = match fs::read_to_string(&registry) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(NmtError::io_at(err, &registry)),
        };
        if existing.lines().any(|current| current.trim() == line) {
            return Ok(registry);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&registry)
            .map_err(|err| NmtError::io_at(err, &registry))?;
        let separator = if existing.is_empty() || existing.ends_with('\n') {
            ""
        } else {
            "\n"
        };
        writeln!(file, "{separator}{line}").map_err(|err| NmtError::io_at(err, &registry))?;
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::PackedDatasetBuilder;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeBackend {
        checkpoints: u64,
        record_only: bool,
        loaded: Vec<PathBuf>,
        metadata: Option<EngineMetadata>,
    }

    impl TrainerBackend for FakeBackend {
        type Engine = u64;

        fn load_from_checkpoint(&mut self, checkpoint: &Path) -> Result<u64> {
            self.loaded.push(checkpoint.to_path_buf());
            Ok(1)
        }

        fn new_instance(
            &mut self,
            _vocab: &VocabularyPair,
            metadata: Option<EngineMetadata>,
        ) -> Result<u64> {
            self.metadata = metadata;
            Ok(0)
        }

        fn train(
            &mut self,
            _engine: &mut u64,
            _data: &TrainingData,
            checkpoints: &mut CheckpointLog,
        ) -> Result<()> {
            for _ in 0..self.checkpoints {
                let step = checkpoints.state().step + 100;
                let prefix = checkpoints.checkpoint_prefix(step);
                if !self.record_only {
                    fs::write(with_suffix(&prefix, "dat"), step.to_string())
                        .map_err(|err| NmtError::io_at(err, &prefix))?;
                }
                checkpoints.record(step, prefix)?;
            }
            Ok(())
        }
    }

    fn prepared_dir(root: &Path) -> PathBuf {
        let dir = root.join("data");
        for split in [TRAIN_DATASET_DIR, VALID_DATASET_DIR] {
            let mut builder = PackedDatasetBuilder::create(dir.join(split), 1024).expect("create");
            builder.add(&[4], &[2, 3]).expect("add");
            builder.finish().expect("finish");
        }
        VocabularyPair::default()
            .save_to_file(dir.join(VOCAB_FILE))
            .expect("vocab");
        dir
    }

    #[test]
    fn training_without_checkpoints_is_incomplete() {
        let root = tempdir().expect("tempdir");
        let data = prepared_dir(root.path());
        let model = root.path().join("models").join("model.en__it");
        let mut trainer =
            DecoderTrainer::new(FakeBackend::default(), &model, LanguagePair::new("en", "it"));
        let err = trainer
            .train(&data, &root.path().join("work"), None, None)
            .expect_err("no checkpoint");
        assert!(matches!(err, NmtError::TrainingIncomplete(_)));
        assert!(!root.path().join("models").join(MODEL_REGISTRY_FILE).exists());
    }

    #[test]
    fn last_checkpoint_is_promoted_and_registered_once() {
        let root = tempdir().expect("tempdir");
        let data = prepared_dir(root.path());
        let work = root.path().join("work");
        let model = root.path().join("models").join("model.en__it");
        let backend = FakeBackend {
            checkpoints: 2,
            ..FakeBackend::default()
        };
        let mut trainer = DecoderTrainer::new(backend, &model, LanguagePair::new("en", "it"));
        let files = trainer.train(&data, &work, None, None).expect("train");

        assert_eq!(files.origin, EngineOrigin::FreshFromScratch);
        assert_eq!(files.checkpoint.step, 200);
        let promoted = with_suffix(&model, "dat");
        assert_eq!(files.files, vec![promoted.clone()]);
        assert_eq!(fs::read_to_string(promoted).expect("read"), "200");

        // A second run resumes from the recorded state and does not duplicate the registry line.
        let files = trainer.train(&data, &work, None, None).expect("resume");
        assert_eq!(files.origin, EngineOrigin::Resumed { step: 200 });
        assert_eq!(files.checkpoint.step, 400);
        let registry = fs::read_to_string(files.registry).expect("registry");
        assert_eq!(registry, "model.en__it = model.en__it\n");
    }

    #[test]
    fn checkpoint_without_files_is_not_registered() {
        let root = tempdir().expect("tempdir");
        let data = prepared_dir(root.path());
        let model = root.path().join("models").join("model.en__it");
        let backend = FakeBackend {
            checkpoints: 1,
            record_only: true,
            ..FakeBackend::default()
        };
        let mut trainer = DecoderTrainer::new(backend, &model, LanguagePair::new("en", "it"));
        let err = trainer
            .train(&data, &root.path().join("work"), None, None)
            .expect_err("nothing to promote");
        assert!(matches!(err, NmtError::ExternalTool(_)));
        assert!(!root.path().join("models").join(MODEL_REGISTRY_FILE).exists());
    }

    #[test]
    fn explicit_checkpoint_seeds_a_fresh_run() {
        let root = tempdir().expect("tempdir");
        let data = prepared_dir(root.path());
        let pretrained = root.path().join("pretrained").join("model.en__it");
        let backend = FakeBackend {
            checkpoints: 1,
            ..FakeBackend::default()
        };
        let mut trainer = DecoderTrainer::new(
            backend,
            root.path().join("models").join("model.en__it"),
            LanguagePair::new("en", "it"),
        );
        let files = trainer
            .train(&data, &root.path().join("work"), Some(&pretrained), None)
            .expect("train");

        assert_eq!(files.origin, EngineOrigin::FreshFromCheckpoint(pretrained.clone()));
        assert_eq!(trainer.backend.loaded, vec![pretrained]);
        assert!(trainer.backend.metadata.is_none());
    }

    #[test]
    fn recorded_state_wins_over_explicit_checkpoint() {
        let root = tempdir().expect("tempdir");
        let data = prepared_dir(root.path());
        let work = root.path().join("work");
        let backend = FakeBackend {
            checkpoints: 1,
            ..FakeBackend::default()
        };
        let mut trainer = DecoderTrainer::new(
            backend,
            root.path().join("models").join("model.en__it"),
            LanguagePair::new("en", "it"),
        );
        trainer.train(&data, &work, None, None).expect("first run");

        let pretrained = root.path().join("pretrained").join("model.en__it");
        let files = trainer
            .train(&data, &work, Some(&pretrained), None)
            .expect("resume");
        assert_eq!(files.origin, EngineOrigin::Resumed { step: 100 });
        assert_eq!(trainer.backend.loaded, vec![work.join("checkpoint_100")]);
    }

    #[test]
    fn metadata_file_reaches_a_scratch_engine() {
        let root = tempdir().expect("tempdir");
        let data = prepared_dir(root.path());
        let metadata = EngineMetadata {
            tuning_max_learning_rate: Some(0.4),
            tuning_max_epochs: Some(3),
            ..EngineMetadata::default()
        };
        let metadata_path = root.path().join("model.meta");
        metadata.save_to_file(&metadata_path).expect("metadata");
        let backend = FakeBackend {
            checkpoints: 1,
            ..FakeBackend::default()
        };
        let mut trainer = DecoderTrainer::new(
            backend,
            root.path().join("models").join("model.en__it"),
            LanguagePair::new("en", "it"),
        );
        let files = trainer
            .train(&data, &root.path().join("work"), None, Some(&metadata_path))
            .expect("train");

        assert_eq!(files.origin, EngineOrigin::FreshFromScratch);
        assert_eq!(trainer.backend.metadata, Some(metadata));
        assert!(trainer.backend.loaded.is_empty());
    }
}
