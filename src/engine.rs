//! Collaborator seams around the neural engine: trainer backend, tuning decoder, scorer,
//! external corpus processors, and the engine metadata record.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::corpus::BilingualCorpus;
use crate::dataset::PackedDataset;
use crate::error::{NmtError, Result};
use crate::persist::write_json_atomic;
use crate::state::CheckpointLog;
use crate::vocab::VocabularyPair;

/// Key/value metadata stored next to a model. Unknown keys are preserved on rewrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineMetadata {
    /// Learning rate selected by the tuner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuning_max_learning_rate: Option<f64>,
    /// Adaptation epochs the tuned learning rate was selected with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuning_max_epochs: Option<usize>,
    /// Every other key.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EngineMetadata {
    /// Reads a metadata file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| NmtError::io_at(err, path))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Writes the metadata atomically.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json_atomic(path, self)
    }
}

/// Datasets and vocabularies loaded from a prepared training directory.
#[derive(Debug, Clone)]
pub struct TrainingData {
    /// Packed training split.
    pub train: PackedDataset,
    /// Packed validation split.
    pub valid: PackedDataset,
    /// Source and target vocabularies.
    pub vocab: VocabularyPair,
}

/// Opaque model trainer.
///
/// Implementations report every checkpoint they write through the [`CheckpointLog`] so that an
/// interrupted run can resume from it.
pub trait TrainerBackend {
    /// In-memory engine handle.
    type Engine;

    /// Restores an engine from a checkpoint path prefix.
    fn load_from_checkpoint(&mut self, checkpoint: &Path) -> Result<Self::Engine>;

    /// Creates a fresh engine for the given vocabularies.
    fn new_instance(
        &mut self,
        vocab: &VocabularyPair,
        metadata: Option<EngineMetadata>,
    ) -> Result<Self::Engine>;

    /// Trains `engine`, recording checkpoints in `checkpoints`.
    fn train(
        &mut self,
        engine: &mut Self::Engine,
        data: &TrainingData,
        checkpoints: &mut CheckpointLog,
    ) -> Result<()>;
}

/// Translation-memory style hint used for on-the-fly adaptation.
#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    /// Source sentence of the hint.
    pub source: String,
    /// Reference translation of the hint.
    pub target: String,
    /// Match score in `[0, 1]`.
    pub score: f64,
}

/// Adaptation settings applied while translating with suggestions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adaptation {
    /// Adaptation epochs per sentence.
    pub epochs: usize,
    /// Upper bound of the adaptation learning rate.
    pub learning_rate: f64,
}

/// Decoder able to adapt to suggestions before translating.
pub trait TuningDecoder {
    /// Translates `source`, adapting on `suggestions` first when any are given.
    fn translate(
        &mut self,
        source: &str,
        suggestions: &[Suggestion],
        adaptation: &Adaptation,
    ) -> Result<String>;
}

/// Scores a hypothesis file against a reference file; higher is better.
pub trait Scorer {
    /// Returns the raw score of `hypothesis`.
    fn score(&self, hypothesis: &Path, reference: &Path) -> Result<f64>;
}

/// External corpus transformation (tokenization, cleaning) run before filtering.
pub trait CorpusProcessor {
    /// Processes `corpora` into `dest`, optionally logging to `log`, and returns the outputs.
    fn process(
        &self,
        corpora: &[BilingualCorpus],
        dest: &Path,
        log: Option<&Path>,
    ) -> Result<Vec<BilingualCorpus>>;
}

/// [`Scorer`] running an external program: the reference path is passed as the last argument,
/// the hypothesis is piped to stdin and stdout must hold a single float.
#[derive(Debug, Clone)]
pub struct CommandScorer {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandScorer {
    /// Scorer running `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Adds an argument placed before the reference path.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl Scorer for CommandScorer {
    fn score(&self, hypothesis: &Path, reference: &Path) -> Result<f64> {
        let stdin = File::open(hypothesis).map_err(|err| NmtError::io_at(err, hypothesis))?;
        debug!(
            "scoring {} with {}",
            hypothesis.display(),
            self.program.display()
        );
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(reference)
            .stdin(Stdio::from(stdin))
            .stderr(Stdio::piped())
            .output()
            .map_err(|err| {
                NmtError::ExternalTool(format!(
                    "unable to run {}: {err}",
                    self.program.display()
                ))
            })?;
        if !output.status.success() {
            return Err(NmtError::ExternalTool(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout.trim().parse::<f64>().map_err(|err| {
            NmtError::ExternalTool(format!(
                "{} printed {:?}, expected a number: {err}",
                self.program.display(),
                stdout.trim()
            ))
        })
    }
}

/// Appends `.ext` to a path prefix without replacing an existing extension.
pub(crate) fn with_suffix(prefix: &Path, ext: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}
