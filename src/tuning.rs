//! Learning-rate grid search scored by an external metric.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use log::info;
use serde::{Deserialize, Serialize};

use crate::config::TuningConfig;
use crate::engine::{Adaptation, EngineMetadata, Scorer, Suggestion, TuningDecoder};
use crate::error::{NmtError, Result};

/// Reference file written once per tuning run.
pub const REFERENCE_FILE: &str = "reference.out";

/// Score obtained by one grid point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TuningTrial {
    /// 1-based trial index.
    pub trial: usize,
    /// Learning rate used for adaptation.
    pub learning_rate: f64,
    /// Scorer output scaled by 100.
    pub score: f64,
}

/// Result of [`Tuner::tune`].
#[derive(Debug, Clone, PartialEq)]
pub struct TuningOutcome {
    /// Winning learning rate, committed to the metadata file.
    pub best_learning_rate: f64,
    /// Winning score on the scorer's original scale.
    pub best_score: f64,
    /// Every trial in order.
    pub trials: Vec<TuningTrial>,
}

/// Picks the highest-scoring trial; ties go to the earliest one.
#[must_use]
pub fn select_best(trials: &[TuningTrial]) -> Option<&TuningTrial> {
    trials.iter().fold(None, |best, trial| match best {
        Some(current) if current.score >= trial.score => Some(current),
        _ => Some(trial),
    })
}

fn round5(value: f64) -> f64 {
    (value * 100_000.0).round() / 100_000.0
}

/// Runs translation trials over a learning-rate grid and keeps the best one.
#[derive(Debug)]
pub struct Tuner<D, S> {
    decoder: D,
    scorer: S,
}

impl<D: TuningDecoder, S: Scorer> Tuner<D, S> {
    /// Creates a tuner from its two collaborators.
    pub fn new(decoder: D, scorer: S) -> Self {
        Self { decoder, scorer }
    }

    /// Tries `round(1 / lr_step)` learning rates over `pairs` and writes the winner into the
    /// metadata file at `metadata_path`.
    pub fn tune(
        &mut self,
        pairs: &[(String, String)],
        working_dir: &Path,
        cfg: &TuningConfig,
        metadata_path: &Path,
    ) -> Result<TuningOutcome> {
        cfg.validate()?;
        fs::create_dir_all(working_dir).map_err(|err| NmtError::io_at(err, working_dir))?;

        let reference = working_dir.join(REFERENCE_FILE);
        write_lines(&reference, pairs.iter().map(|(_, target)| target.as_str()))?;

        let runs = cfg.trials();
        let mut trials = Vec::with_capacity(runs);
        for trial in 1..=runs {
            let learning_rate = round5(trial as f64 * cfg.lr_step);
            let start = Instant::now();
            info!("tuning run {trial}/{runs}... START");
            let output = working_dir.join(format!("run{trial}.out"));
            let adaptation = Adaptation {
                epochs: cfg.max_epochs,
                learning_rate,
            };
            let score = self.run_trial(pairs, &adaptation, &output, &reference)?;
            info!(
                "tuning run {trial}/{runs} END {:.2}s",
                start.elapsed().as_secs_f64()
            );
            info!("run {trial} completed: lr={learning_rate}, score={score}");
            trials.push(TuningTrial {
                trial,
                learning_rate,
                score,
            });
        }

        let best = *select_best(&trials)
            .ok_or_else(|| NmtError::Internal("tuning produced no trials".into()))?;
        info!(
            "updating engine with learning rate {} (score={})",
            best.learning_rate, best.score
        );
        let mut metadata = EngineMetadata::load_from_file(metadata_path)?;
        metadata.tuning_max_learning_rate = Some(best.learning_rate);
        metadata.tuning_max_epochs = Some(cfg.max_epochs);
        metadata.save_to_file(metadata_path)?;

        Ok(TuningOutcome {
            best_learning_rate: best.learning_rate,
            best_score: best.score / 100.0,
            trials,
        })
    }

    fn run_trial(
        &mut self,
        pairs: &[(String, String)],
        adaptation: &Adaptation,
        output: &Path,
        reference: &Path,
    ) -> Result<f64> {
        let mut translations = Vec::with_capacity(pairs.len());
        for (source, target) in pairs {
            let suggestions = if adaptation.learning_rate == 0.0 {
                Vec::new()
            } else {
                vec![Suggestion {
                    source: source.clone(),
                    target: target.clone(),
                    score: 1.0,
                }]
            };
            translations.push(self.decoder.translate(source, &suggestions, adaptation)?);
        }
        write_lines(output, translations.iter().map(String::as_str))?;
        Ok(self.scorer.score(output, reference)? * 100.0)
    }
}

fn write_lines<'a, I>(path: &Path, lines: I) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    let file = File::create(path).map_err(|err| NmtError::io_at(err, path))?;
    let mut writer = BufWriter::new(file);
    for line in lines {
        writeln!(writer, "{line}").map_err(|err| NmtError::io_at(err, path))?;
    }
    writer.flush().map_err(|err| NmtError::io_at(err, path))
}
