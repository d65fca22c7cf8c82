//! Subword model, vocabularies and packed datasets for one training run.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::info;

use crate::config::{PackingConfig, SubwordConfig};
use crate::corpus::BilingualCorpus;
use crate::dataset::{PackedDataset, PackedDatasetBuilder};
use crate::error::{NmtError, Result};
use crate::lang::LanguagePair;
use crate::metrics::{sample_rss_kb, PackStats};
use crate::subword::{SubwordLearner, SubwordModel};
use crate::vocab::{Vocabulary, VocabularyPair, VOCAB_FILE};

/// File name of the subword model inside the output directory.
pub const SUBWORD_MODEL_FILE: &str = "subword.bpe";
/// Directory of the packed training split.
pub const TRAIN_DATASET_DIR: &str = "train_dataset";
/// Directory of the packed validation split.
pub const VALID_DATASET_DIR: &str = "valid_dataset";

const PROGRESS_INTERVAL: usize = 100_000;

/// Everything produced by [`DatasetPreparer::build`].
#[derive(Debug, Clone)]
pub struct PreparedData {
    /// Shared source/target subword model.
    pub subword_model: SubwordModel,
    /// Where the subword model was written.
    pub subword_model_path: PathBuf,
    /// Source and target vocabularies.
    pub vocab: VocabularyPair,
    /// Packed training split and its tally.
    pub train: (PackedDataset, PackStats),
    /// Packed validation split and its tally.
    pub valid: (PackedDataset, PackStats),
}

/// Builds the subword model, the vocabularies and both packed splits.
#[derive(Debug, Clone)]
pub struct DatasetPreparer {
    subword: SubwordConfig,
    packing: PackingConfig,
    pair: LanguagePair,
}

impl DatasetPreparer {
    /// Creates a preparer, validating both configurations.
    pub fn new(subword: SubwordConfig, packing: PackingConfig, pair: LanguagePair) -> Result<Self> {
        subword.validate()?;
        packing.validate()?;
        Ok(Self {
            subword,
            packing,
            pair,
        })
    }

    /// Runs the whole preparation into `output_dir`.
    ///
    /// With `reuse_subword_model` the model is loaded from that file instead of being learned
    /// from `train`.
    pub fn build<P: AsRef<Path>>(
        &self,
        train: &[BilingualCorpus],
        valid: &[BilingualCorpus],
        output_dir: P,
        reuse_subword_model: Option<&Path>,
    ) -> Result<PreparedData> {
        let output_dir = output_dir.as_ref();
        fs::create_dir_all(output_dir).map_err(|err| NmtError::io_at(err, output_dir))?;

        let subword_model_path = output_dir.join(SUBWORD_MODEL_FILE);
        let subword_model = match reuse_subword_model {
            Some(path) => {
                info!("reusing subword model {}", path.display());
                let model = SubwordModel::load_from_file(path)?;
                if path != subword_model_path {
                    fs::copy(path, &subword_model_path)
                        .map_err(|err| NmtError::io_at(err, &subword_model_path))?;
                }
                model
            }
            None => {
                let model = self.learn_subword_model(train)?;
                model.save_to_file(&subword_model_path)?;
                model
            }
        };

        let vocab = build_vocabulary(&subword_model);
        vocab.save_to_file(output_dir.join(VOCAB_FILE))?;
        info!(
            "vocabulary sizes: {} source, {} target",
            vocab.source.len(),
            vocab.target.len()
        );

        let train_split = self.pack(
            &subword_model,
            &vocab,
            train,
            &output_dir.join(TRAIN_DATASET_DIR),
        )?;
        let valid_split = self.pack(
            &subword_model,
            &vocab,
            valid,
            &output_dir.join(VALID_DATASET_DIR),
        )?;

        Ok(PreparedData {
            subword_model,
            subword_model_path,
            vocab,
            train: train_split,
            valid: valid_split,
        })
    }

    fn learn_subword_model(&self, train: &[BilingualCorpus]) -> Result<SubwordModel> {
        let start = Instant::now();
        let mut learner = SubwordLearner::new(self.subword.clone())?;
        for corpus in train {
            for entry in corpus.reader(self.pair.langs())? {
                let (source, target) = entry?;
                learner.add_pair(&source, &target);
            }
        }
        info!(
            "counted words over {} lines from {} corpora",
            learner.lines(),
            train.len()
        );
        let model = learner.finish()?;
        info!(
            "subword model: {} merges, {} source terms, {} target terms in {:.2?}",
            model.merges().len(),
            model.source_terms().len(),
            model.target_terms().len(),
            start.elapsed()
        );
        Ok(model)
    }

    fn pack(
        &self,
        model: &SubwordModel,
        vocab: &VocabularyPair,
        corpora: &[BilingualCorpus],
        dir: &Path,
    ) -> Result<(PackedDataset, PackStats)> {
        let mut builder = PackedDatasetBuilder::create(dir, self.packing.ram_limit_bytes())?;
        let mut encoder = model.encoder();
        let mut stats = PackStats::default();

        for corpus in corpora {
            for entry in corpus.reader(self.pair.langs())? {
                let (source, target) = entry?;
                let source_pieces = encoder.encode_line(&source);
                let target_pieces = encoder.encode_line(&target);
                if source_pieces.is_empty() || target_pieces.is_empty() {
                    stats.ignored += 1;
                } else {
                    let source_ids = vocab.source.convert_to_ids(&source_pieces, false);
                    let target_ids = vocab.target.convert_to_ids(&target_pieces, true);
                    builder.add(&source_ids, &target_ids)?;
                    stats.added += 1;
                }

                if stats.processed() % PROGRESS_INTERVAL == 0 {
                    info!(
                        "{}: processed {} pairs ({} added, {} ignored)",
                        dir.display(),
                        stats.processed(),
                        stats.added,
                        stats.ignored
                    );
                }
            }
        }

        let dataset = builder.finish()?;
        info!(
            "packed {}: {} added, {} ignored{}",
            dir.display(),
            stats.added,
            stats.ignored,
            sample_rss_kb()
                .map(|kb| format!(" (rss {:.1} MiB)", kb as f64 / 1024.0))
                .unwrap_or_default()
        );
        Ok((dataset, stats))
    }
}

/// Reserved tokens followed by each side's terms in model order.
#[must_use]
pub fn build_vocabulary(model: &SubwordModel) -> VocabularyPair {
    let mut source = Vocabulary::with_reserved();
    for term in model.source_terms() {
        source.add(term);
    }
    let mut target = Vocabulary::with_reserved();
    for term in model.target_terms() {
        target.add(term);
    }
    VocabularyPair { source, target }
}
