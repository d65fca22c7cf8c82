//! Resumable training pipeline for neural machine translation engines.
//!
//! The crate turns raw bilingual corpora into a trained, tuned translation engine. Translation
//! numerics are delegated to collaborators implementing [`TrainerBackend`] and
//! [`TuningDecoder`]; the crate owns the pipeline around them: parallel corpus filtering, a
//! shared subword model and vocabularies, bounded-memory dataset packing, resumable training
//! with checkpoint promotion, and a scored learning-rate search.
//!
//! ```no_run
//! use nmtbuild::{CorpusFilter, FilterConfig, LanguagePair, BilingualCorpus};
//!
//! # fn main() -> nmtbuild::Result<()> {
//! let pair = LanguagePair::new("en", "it");
//! let corpora = BilingualCorpus::list_parallel("/data/corpora", &pair)?;
//! let cfg = FilterConfig::builder().max_tokens(50).build()?;
//! let filtered = CorpusFilter::new(cfg, pair)?.filter(&corpora, "/data/filtered")?;
//! for entry in filtered {
//!     println!("{}: {} kept", entry.corpus.name(), entry.stats.kept);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The CLI is enabled by default through the `cli` feature. Library users can disable default
//! features to avoid the CLI dependencies: `nmtbuild = { version = "...", default-features =
//! false }`.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    clippy::all,
    rust_2018_idioms,
    future_incompatible,
    unused_lifetimes,
    unreachable_pub
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::doc_markdown,
    clippy::multiple_crate_versions
)]

pub mod builder;
pub mod config;
pub mod corpus;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod filter;
pub mod lang;
pub mod metrics;
pub mod persist;
pub mod pipeline;
pub mod prepare;
pub mod serialization;
pub mod special_tokens;
pub mod state;
pub mod subword;
pub mod training;
pub mod tuning;
pub mod vocab;

pub use builder::{BuildContext, EngineArtifacts, EngineBuilder, EngineLayout};
pub use config::{FilterConfig, PackingConfig, PipelineConfig, SubwordConfig, TuningConfig};
pub use corpus::BilingualCorpus;
pub use dataset::{PackedDataset, PackedDatasetBuilder};
pub use engine::{
    Adaptation, CommandScorer, CorpusProcessor, EngineMetadata, Scorer, Suggestion,
    TrainerBackend, TrainingData, TuningDecoder,
};
pub use error::{NmtError, Result};
pub use filter::{CorpusFilter, FilteredCorpus};
pub use lang::LanguagePair;
pub use metrics::{FilterStats, PackStats, StepTiming};
pub use pipeline::{RunOptions, RunReport, Schedule, StepContext, StepOptions, Workspace};
pub use prepare::{DatasetPreparer, PreparedData};
pub use state::{CheckpointLog, TrainingState};
pub use subword::{SubwordLearner, SubwordModel};
pub use training::{DecoderTrainer, EngineOrigin, ModelFiles};
pub use tuning::{select_best, Tuner, TuningOutcome, TuningTrial};
pub use vocab::{TokenId, Vocabulary, VocabularyPair};
