#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::error::Error;
use std::fs::{self, File};
use std::io::{self, BufWriter, IsTerminal};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Mutex, Once};
use std::time::Instant;

use mammorisk::calibrate::artifact::CalibratorSet;
use mammorisk::config::ExperimentConfig;
use mammorisk::data::cohort::Cohort;
use mammorisk::logging::init_logging;
use mammorisk::predict::{Prediction, RiskPredictor, write_predictions};
use mammorisk::snapshot::EncoderSnapshot;
use mammorisk::train::observer::{EpochSummary, TrainingObserver, TrainingStage};
use mammorisk::train::orchestrator::{
    ENCODER_SNAPSHOT_FILE, MODEL_SNAPSHOT_FILE, Protocol, ProtocolState,
};
use mammorisk::types::Split;

type CliResult = Result<(), Box<dyn Error>>;

static RAYON_INIT: Once = Once::new();

#[derive(Parser)]
#[command(name = "mammorisk", version, about = "Multi-year breast cancer risk from screening mammograms")]
struct Cli {
    /// Experiment configuration (TOML). Built-in defaults are used when omitted.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace). Falls back to LOG_LEVEL.
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Write log output to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum SplitArg {
    Train,
    Dev,
    Test,
}

impl From<SplitArg> for Split {
    fn from(value: SplitArg) -> Self {
        match value {
            SplitArg::Train => Split::Train,
            SplitArg::Dev => Split::Dev,
            SplitArg::Test => Split::Test,
        }
    }
}

#[derive(Args)]
struct TrainingArgs {
    /// Dataset CSV with one row per view
    #[arg(value_name = "DATASET_CSV")]
    dataset: PathBuf,

    /// Directory receiving the snapshots
    #[arg(long, value_name = "DIR", default_value = ".")]
    out_dir: PathBuf,
}

#[derive(Args)]
struct ModelArgs {
    /// Dataset CSV with one row per view
    #[arg(value_name = "DATASET_CSV")]
    dataset: PathBuf,

    /// Full model snapshot produced by `train` or `run`
    #[arg(long, value_name = "PATH")]
    model: PathBuf,

    /// Dataset partition to score
    #[arg(long, value_enum)]
    split: SplitArg,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage 1: pretrain the per-view image encoder
    #[command(about = "Pretrain the image encoder (outputs: encoder.toml)")]
    Pretrain {
        #[command(flatten)]
        training: TrainingArgs,

        /// Start from this encoder snapshot instead of random weights
        #[arg(long, value_name = "PATH")]
        init_encoder: Option<PathBuf>,
    },

    /// Stage 2: adversarial training on a frozen encoder
    #[command(about = "Train the full model on a frozen encoder (outputs: model.toml)")]
    Train {
        #[command(flatten)]
        training: TrainingArgs,

        /// Encoder snapshot produced by `pretrain`
        #[arg(long, value_name = "PATH")]
        encoder: PathBuf,
    },

    /// Both stages back to back
    #[command(about = "Run the full two-stage protocol (outputs: encoder.toml, model.toml)")]
    Run {
        #[command(flatten)]
        training: TrainingArgs,

        /// Start stage 1 from this encoder snapshot instead of random weights
        #[arg(long, value_name = "PATH")]
        init_encoder: Option<PathBuf>,
    },

    /// Fit per-horizon isotonic calibrators on a held-out split
    #[command(name = "fit-calibrator", about = "Fit calibrators (outputs: calibrator.toml)")]
    FitCalibrator {
        #[command(flatten)]
        model: ModelArgs,

        /// Output calibrator file
        #[arg(long, value_name = "PATH", default_value = "calibrator.toml")]
        out: PathBuf,
    },

    /// Predict risk curves for every exam of a split
    #[command(about = "Predict risk curves (outputs: predictions.tsv)")]
    Predict {
        #[command(flatten)]
        model: ModelArgs,

        /// Calibrator produced by `fit-calibrator`
        #[arg(long, value_name = "PATH")]
        calibrator: Option<PathBuf>,

        /// Output TSV; `-` writes to stdout
        #[arg(long, value_name = "PATH", default_value = "predictions.tsv")]
        out: PathBuf,
    },

    /// Report per-horizon AUC and C-index on a split
    #[command(about = "Evaluate discrimination on a split")]
    Evaluate {
        #[command(flatten)]
        model: ModelArgs,

        /// Calibrator produced by `fit-calibrator`
        #[arg(long, value_name = "PATH")]
        calibrator: Option<PathBuf>,
    },
}

/// Renders training progress as one bar per stage.
struct ProgressObserver {
    bar: Mutex<Option<ProgressBar>>,
}

impl ProgressObserver {
    fn new() -> Self {
        Self { bar: Mutex::new(None) }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(bar) = guard.as_ref() {
                f(bar);
            }
        }
    }
}

impl TrainingObserver for ProgressObserver {
    fn on_stage_start(&self, stage: TrainingStage, candidates: usize, epochs: usize) {
        let draw_target = if io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(10)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some((candidates * epochs) as u64), draw_target);
        if let Ok(style) =
            ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} epochs {msg}")
        {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        bar.set_message(stage.to_string());
        if let Ok(mut guard) = self.bar.lock() {
            *guard = Some(bar);
        }
    }

    fn on_epoch_end(&self, summary: &EpochSummary) {
        self.with_bar(|bar| {
            bar.inc(1);
            let c_index = summary
                .dev_c_index
                .map_or_else(|| "n/a".to_string(), |c| format!("{c:.4}"));
            bar.set_message(format!(
                "{}: candidate {} loss {:.4} dev C {c_index}",
                summary.stage, summary.candidate, summary.train_loss
            ));
        });
    }

    fn on_stage_finish(&self, stage: TrainingStage, best: Option<f64>) {
        self.with_bar(|bar| {
            bar.finish_with_message(format!("{stage} done, best dev C-index {best:?}"));
        });
    }
}

fn load_config(path: Option<&Path>) -> Result<ExperimentConfig, Box<dyn Error>> {
    let config = match path {
        Some(path) => ExperimentConfig::load(path)?,
        None => ExperimentConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn init_thread_pool(config: &ExperimentConfig) -> CliResult {
    let mut outcome = Ok(());
    RAYON_INIT.call_once(|| {
        if let Some(threads) = config.worker_threads() {
            outcome = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build_global()
                .map_err(|e| e.to_string());
        }
    });
    outcome.map_err(|e| format!("failed to configure the worker thread pool: {e}").into())
}

fn load_cohort(dataset: &Path, config: &ExperimentConfig) -> Result<Cohort, Box<dyn Error>> {
    let cohort = Cohort::load(dataset, &config.risk_factors)?;
    println!(
        "Loaded {} exams from {} ({} rejected).",
        cohort.len(),
        dataset.display(),
        cohort.rejected().len()
    );
    Ok(cohort)
}

fn load_predictor(model: &Path, calibrator: Option<&Path>) -> Result<RiskPredictor, Box<dyn Error>> {
    let predictor = RiskPredictor::load(model)?;
    Ok(match calibrator {
        Some(path) => predictor.with_calibrator(CalibratorSet::load(path)?)?,
        None => predictor,
    })
}

fn run_training(config: &ExperimentConfig, training: &TrainingArgs, start: ProtocolState, init_encoder: Option<&Path>) -> CliResult {
    let cohort = load_cohort(&training.dataset, config)?;
    fs::create_dir_all(&training.out_dir)?;
    let observer = ProgressObserver::new();
    let mut protocol = Protocol::new(config, &cohort, &observer).with_snapshot_dir(&training.out_dir);
    if let Some(path) = init_encoder {
        protocol = protocol.with_initial_encoder(EncoderSnapshot::load(path)?);
    }

    let started = Instant::now();
    let snapshot = protocol.run_from(start)?;
    println!(
        "Model '{}' saved to {} after {:.1?} (dev C-index {:?}).",
        snapshot.model_version,
        training.out_dir.join(MODEL_SNAPSHOT_FILE).display(),
        started.elapsed(),
        snapshot.dev_c_index
    );
    Ok(())
}

fn run_pretrain(config: &ExperimentConfig, training: &TrainingArgs, init_encoder: Option<&Path>) -> CliResult {
    let cohort = load_cohort(&training.dataset, config)?;
    fs::create_dir_all(&training.out_dir)?;
    let observer = ProgressObserver::new();
    let mut protocol = Protocol::new(config, &cohort, &observer).with_snapshot_dir(&training.out_dir);
    if let Some(path) = init_encoder {
        protocol = protocol.with_initial_encoder(EncoderSnapshot::load(path)?);
    }
    let started = Instant::now();
    protocol.advance(ProtocolState::Stage1Pretrain)?;
    println!(
        "Encoder saved to {} after {:.1?}.",
        training.out_dir.join(ENCODER_SNAPSHOT_FILE).display(),
        started.elapsed()
    );
    Ok(())
}

fn run_fit_calibrator(config: &ExperimentConfig, model: &ModelArgs, out: &Path) -> CliResult {
    let cohort = load_cohort(&model.dataset, config)?;
    let predictor = load_predictor(&model.model, None)?;
    let calibrator = predictor.fit_calibrator(&cohort, model.split.into())?;
    calibrator.save(out)?;
    println!(
        "Calibrator for model '{}' ({} horizons) saved to {}.",
        calibrator.model_version,
        calibrator.num_horizons(),
        out.display()
    );
    Ok(())
}

fn run_predict(config: &ExperimentConfig, model: &ModelArgs, calibrator: Option<&Path>, out: &Path) -> CliResult {
    let cohort = load_cohort(&model.dataset, config)?;
    let predictor = load_predictor(&model.model, calibrator)?;
    let predictions: Vec<Prediction> = predictor
        .predict_split(&cohort, model.split.into())?
        .into_iter()
        .map(|(_, prediction)| prediction)
        .collect();
    if out == Path::new("-") {
        write_predictions(io::stdout().lock(), &predictions, predictor.horizons())?;
    } else {
        write_predictions(BufWriter::new(File::create(out)?), &predictions, predictor.horizons())?;
        println!("Wrote {} predictions to {}.", predictions.len(), out.display());
    }
    Ok(())
}

fn run_evaluate(config: &ExperimentConfig, model: &ModelArgs, calibrator: Option<&Path>) -> CliResult {
    let cohort = load_cohort(&model.dataset, config)?;
    let predictor = load_predictor(&model.model, calibrator)?;
    let report = predictor.evaluate(&cohort, model.split.into(), &config.evaluation)?;
    println!("{report}");
    Ok(())
}

fn run(cli: Cli) -> CliResult {
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };
    let config = load_config(cli.config.as_deref())?;
    init_thread_pool(&config)?;

    match command {
        Commands::Pretrain { training, init_encoder } => run_pretrain(&config, &training, init_encoder.as_deref()),
        Commands::Train { training, encoder } => {
            let encoder = EncoderSnapshot::load(&encoder)?;
            run_training(&config, &training, ProtocolState::Stage2Adversarial { encoder }, None)
        }
        Commands::Run { training, init_encoder } => {
            run_training(&config, &training, ProtocolState::Stage1Pretrain, init_encoder.as_deref())
        }
        Commands::FitCalibrator { model, out } => run_fit_calibrator(&config, &model, &out),
        Commands::Predict { model, calibrator, out } => run_predict(&config, &model, calibrator.as_deref(), &out),
        Commands::Evaluate { model, calibrator } => run_evaluate(&config, &model, calibrator.as_deref()),
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.log_level.as_deref(), cli.log_file.as_deref()) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
