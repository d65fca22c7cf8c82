use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use nmtbuild::dataset::PackedDataset;
use nmtbuild::prepare::{SUBWORD_MODEL_FILE, TRAIN_DATASET_DIR, VALID_DATASET_DIR};
use nmtbuild::state::{TrainingState, STATE_FILE};
use nmtbuild::vocab::VOCAB_FILE;
use nmtbuild::{
    BilingualCorpus, CorpusFilter, DatasetPreparer, LanguagePair, PipelineConfig, SubwordModel,
    VocabularyPair,
};
use rayon::ThreadPoolBuilder;
use serde_json::json;

#[derive(Parser, Debug)]
#[command(author, version, about = "Neural MT engine build toolkit", long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Decrease verbosity (-q, -qq)
    #[arg(short = 'q', long, global = true, action = ArgAction::Count)]
    quiet: u8,

    /// JSON pipeline configuration; command-line flags take precedence
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drop sentence pairs violating the length and ratio policy
    Filter(FilterArgs),
    /// Learn the subword model and vocabularies, then pack the datasets
    Prepare(PrepareArgs),
    /// Summarise a prepared training data directory
    Info(InfoArgs),
    /// Show the checkpoint history of a training working directory
    State(StateArgs),
}

#[derive(Args, Debug)]
struct LanguageArgs {
    /// Source language tag
    #[arg(short = 's', long = "source", value_name = "LANG")]
    source: String,

    /// Target language tag
    #[arg(short = 't', long = "target", value_name = "LANG")]
    target: String,
}

impl LanguageArgs {
    fn pair(&self) -> LanguagePair {
        LanguagePair::new(self.source.clone(), self.target.clone())
    }
}

#[derive(Args, Debug)]
struct FilterArgs {
    /// Files or directories holding parallel corpora
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    #[command(flatten)]
    langs: LanguageArgs,

    /// Destination folder for the filtered corpora
    #[arg(short, long, value_name = "DIR")]
    output: PathBuf,

    /// Minimum tokens per side
    #[arg(long, value_name = "COUNT")]
    min_tokens: Option<usize>,

    /// Maximum tokens per side
    #[arg(long, value_name = "COUNT")]
    max_tokens: Option<usize>,

    /// Maximum length ratio between the two sides
    #[arg(long, value_name = "RATIO")]
    max_ratio: Option<f64>,

    /// Emit a JSON summary
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct PrepareArgs {
    /// Files or directories holding training corpora
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    #[command(flatten)]
    langs: LanguageArgs,

    /// Folder holding validation corpora
    #[arg(long, value_name = "DIR")]
    valid: Option<PathBuf>,

    /// Output directory
    #[arg(short, long, value_name = "DIR")]
    output: PathBuf,

    /// Number of merge operations
    #[arg(long, value_name = "COUNT")]
    symbols: Option<usize>,

    /// Maximum subword terms per side
    #[arg(long, value_name = "SIZE")]
    max_vocab_size: Option<usize>,

    /// Minimum pair frequency for merges
    #[arg(long, value_name = "COUNT")]
    min_frequency: Option<usize>,

    /// In-memory packing ceiling in megabytes
    #[arg(long, value_name = "MB")]
    ram_limit_mb: Option<usize>,

    /// Reuse an existing subword model instead of learning one
    #[arg(long, value_name = "PATH")]
    reuse_subword_model: Option<PathBuf>,

    /// Also export the subword model as a Hugging Face tokenizer.json
    #[arg(long, value_name = "PATH")]
    huggingface: Option<PathBuf>,

    /// Disable the progress spinner and merge logging
    #[arg(long)]
    no_progress: bool,

    /// Limit Rayon worker threads
    #[arg(long, value_name = "N")]
    threads: Option<usize>,
}

#[derive(Args, Debug)]
struct InfoArgs {
    /// Prepared training data directory
    path: PathBuf,

    /// Emit machine-readable JSON summary
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct StateArgs {
    /// Training working directory (or a state.json file)
    path: PathBuf,

    /// Emit machine-readable JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Filter(args) => run_filter(args, config),
        Commands::Prepare(args) => run_prepare(args, config),
        Commands::Info(args) => run_info(args),
        Commands::State(args) => run_state(args),
    }
}

fn init_logging(verbose: u8, quiet: u8) {
    use log::LevelFilter;

    let level = if quiet > 0 {
        match quiet {
            1 => LevelFilter::Warn,
            _ => LevelFilter::Error,
        }
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();
    builder.filter_level(level);
    let _ = builder.try_init();
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("failed to load configuration {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

fn run_filter(args: FilterArgs, mut config: PipelineConfig) -> Result<()> {
    if let Some(value) = args.min_tokens {
        config.filter.min_tokens = value;
    }
    if let Some(value) = args.max_tokens {
        config.filter.max_tokens = value;
    }
    if let Some(value) = args.max_ratio {
        config.filter.max_ratio = value;
    }

    let pair = args.langs.pair();
    let corpora = BilingualCorpus::collect(&args.inputs, &pair)
        .with_context(|| "failed to discover input corpora")?;
    let filter = CorpusFilter::new(config.filter, pair)?;
    let start = Instant::now();
    let results = filter
        .filter(&corpora, &args.output)
        .with_context(|| format!("failed to filter into {}", args.output.display()))?;

    let kept: usize = results.iter().map(|entry| entry.stats.kept).sum();
    let dropped: usize = results.iter().map(|entry| entry.stats.dropped).sum();
    if args.json {
        let summary = json!({
            "output": args.output.display().to_string(),
            "kept": kept,
            "dropped": dropped,
            "corpora": results
                .iter()
                .map(|entry| json!({
                    "name": entry.corpus.name(),
                    "kept": entry.stats.kept,
                    "dropped": entry.stats.dropped,
                }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for entry in &results {
            println!(
                "{:<24} kept {:>9} dropped {:>9}",
                entry.corpus.name(),
                entry.stats.kept,
                entry.stats.dropped
            );
        }
        println!(
            "Filtered {} corpora in {:.2}s: kept {kept}, dropped {dropped}",
            results.len(),
            start.elapsed().as_secs_f64()
        );
    }
    Ok(())
}

fn spinner(message: &'static str) -> Option<ProgressBar> {
    let style = ProgressStyle::with_template("{spinner} {msg} {elapsed}")
        .ok()?
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
    let pb = ProgressBar::new_spinner();
    pb.set_style(style);
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(80));
    Some(pb)
}

fn run_prepare(args: PrepareArgs, mut config: PipelineConfig) -> Result<()> {
    if let Some(threads) = args.threads {
        ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("unable to configure Rayon thread pool")?;
    }
    if let Some(value) = args.symbols {
        config.subword.symbols = value;
    }
    if let Some(value) = args.max_vocab_size {
        config.subword.max_vocabulary_size = Some(value);
    }
    if let Some(value) = args.min_frequency {
        config.subword.min_frequency = value;
    }
    if let Some(value) = args.ram_limit_mb {
        config.packing.ram_limit_mb = value;
    }
    if args.no_progress {
        config.subword.show_progress = false;
    }

    let pair = args.langs.pair();
    let train = BilingualCorpus::collect(&args.inputs, &pair)
        .with_context(|| "failed to discover training corpora")?;
    let valid = match &args.valid {
        Some(folder) => BilingualCorpus::list_parallel(folder, &pair)
            .with_context(|| format!("failed to list {}", folder.display()))?,
        None => Vec::new(),
    };
    info!(
        "preparing {pair} data from {} training and {} validation corpora",
        train.len(),
        valid.len()
    );

    let preparer = DatasetPreparer::new(config.subword, config.packing, pair)?;
    let progress = if args.no_progress {
        None
    } else {
        spinner("preparing training data...")
    };
    let start = Instant::now();
    let prepared = preparer.build(
        &train,
        &valid,
        &args.output,
        args.reuse_subword_model.as_deref(),
    )?;
    if let Some(pb) = progress {
        pb.finish_with_message("preparation complete");
    }

    if let Some(path) = &args.huggingface {
        prepared
            .subword_model
            .save_huggingface(path)
            .with_context(|| format!("failed to export {}", path.display()))?;
        info!("wrote Hugging Face tokenizer to {}", path.display());
    }

    println!(
        "Prepared {} in {:.2}s",
        args.output.display(),
        start.elapsed().as_secs_f64()
    );
    println!(
        "Merges       : {}",
        prepared.subword_model.merges().len()
    );
    println!(
        "Vocabulary   : {} source, {} target",
        prepared.vocab.source.len(),
        prepared.vocab.target.len()
    );
    println!(
        "Train pairs  : {} added, {} ignored",
        prepared.train.1.added, prepared.train.1.ignored
    );
    println!(
        "Valid pairs  : {} added, {} ignored",
        prepared.valid.1.added, prepared.valid.1.ignored
    );
    Ok(())
}

fn run_info(args: InfoArgs) -> Result<()> {
    let model = SubwordModel::load_from_file(args.path.join(SUBWORD_MODEL_FILE))
        .with_context(|| format!("failed to read subword model in {}", args.path.display()))?;
    let vocab = VocabularyPair::load_from_file(args.path.join(VOCAB_FILE))
        .with_context(|| format!("failed to read vocabularies in {}", args.path.display()))?;
    let train = PackedDataset::open(args.path.join(TRAIN_DATASET_DIR))
        .context("failed to open training dataset")?;
    let valid = PackedDataset::open(args.path.join(VALID_DATASET_DIR))
        .context("failed to open validation dataset")?;

    let summary = json!({
        "path": args.path.display().to_string(),
        "merges": model.merges().len(),
        "source_vocab_size": vocab.source.len(),
        "target_vocab_size": vocab.target.len(),
        "train_pairs": train.len(),
        "train_tokens": train.manifest().tokens,
        "valid_pairs": valid.len(),
        "valid_tokens": valid.manifest().tokens,
    });

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Merges        : {}", model.merges().len());
        println!("Source vocab  : {}", vocab.source.len());
        println!("Target vocab  : {}", vocab.target.len());
        println!(
            "Train pairs   : {} ({} tokens)",
            train.len(),
            train.manifest().tokens
        );
        println!(
            "Valid pairs   : {} ({} tokens)",
            valid.len(),
            valid.manifest().tokens
        );
    }
    Ok(())
}

fn run_state(args: StateArgs) -> Result<()> {
    let path = if args.path.is_dir() {
        args.path.join(STATE_FILE)
    } else {
        args.path.clone()
    };
    let state = TrainingState::load_from_file(&path)?
        .ok_or_else(|| anyhow!("no readable training state at {}", path.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }
    println!("Step         : {}", state.step);
    match state.latest() {
        Some(latest) => println!(
            "Latest       : step {} at {}",
            latest.step,
            latest.file.display()
        ),
        None => println!("Latest       : (none)"),
    }
    println!("Checkpoints  : {}", state.history().len());
    Ok(())
}
