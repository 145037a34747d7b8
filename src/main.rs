//! SDIM Rejection Eval CLI
//!
//! Calibrate per-class rejection thresholds and evaluate them against
//! adversarial attacks and common corruptions.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sdim_rejection_eval::{
    AttackConfig, CancellationToken, ClassifierKind, Device, EvalError, EvalSession, Problem,
    RunConfig,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Exit status after a Ctrl-C interrupt
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "sdim-rejection-eval")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML run configuration; command-line flags override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Text, global = true)]
    format: Format,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Print per-class thresholds calibrated on the clean training split
    Thresholds {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Attack the test split and measure how many successful attacks are rejected
    Adversarial {
        #[command(flatten)]
        overrides: Overrides,

        /// Attack method: fgsm | deepfool | random_noise
        #[arg(long)]
        attack: Option<AttackConfig>,

        /// Stop after this many test batches
        #[arg(long)]
        max_batches: Option<usize>,
    },

    /// Evaluate rejection on every corruption and severity
    Corruption {
        #[command(flatten)]
        overrides: Overrides,

        /// Directory of corruption files sharing labels.json
        #[arg(long)]
        corruption_dir: Option<PathBuf>,

        /// Stop after this many corruption types
        #[arg(long)]
        max_corruption_types: Option<usize>,
    },
}

/// Flags shared by every subcommand
#[derive(Args)]
struct Overrides {
    /// Dataset: cifar10 | svhn
    #[arg(long)]
    problem: Option<Problem>,

    /// Classifier backbone: linear | mlp
    #[arg(long)]
    classifier: Option<ClassifierKind>,

    /// Threshold percentile for the corruption pipeline
    #[arg(long)]
    percentile: Option<f64>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Device: cpu | cuda
    #[arg(long)]
    device: Option<Device>,

    #[arg(long)]
    seed: Option<u64>,

    /// Directory holding SDIM checkpoints
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Directory holding the clean train/test splits
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, config: &mut RunConfig) {
        if let Some(problem) = self.problem {
            config.problem = problem;
            config.n_classes = problem.n_classes();
        }
        if let Some(classifier) = self.classifier {
            config.classifier = classifier;
        }
        if let Some(p) = self.percentile {
            config.percentile = p;
        }
        if let Some(b) = self.batch_size {
            config.batch_size = b;
        }
        if let Some(device) = self.device {
            config.device = device;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(dir) = self.log_dir {
            config.log_dir = dir;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
    }
}

/// What a Ctrl-C press should do given the token's current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    /// First press: finish the current batch, then stop
    Graceful,
    /// Repeated press while a batch is still running
    Force,
}

fn on_interrupt(cancel: &CancellationToken) -> Interrupt {
    if cancel.is_cancelled() {
        Interrupt::Force
    } else {
        cancel.cancel();
        Interrupt::Graceful
    }
}

/// Trip the token on Ctrl-C; evaluations stop at the next batch boundary.
/// A second Ctrl-C exits immediately.
fn install_interrupt_handler(cancel: CancellationToken) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                tracing::warn!("Ctrl-C handler unavailable: {e}");
                return;
            }
        };
        while runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
            match on_interrupt(&cancel) {
                Interrupt::Graceful => {
                    tracing::warn!(
                        "Interrupt received, finishing the current batch (Ctrl-C again to quit)"
                    );
                }
                Interrupt::Force => {
                    eprintln!("Evaluation aborted");
                    std::process::exit(EXIT_INTERRUPTED);
                }
            }
        }
    });
}

fn load_config(path: Option<&PathBuf>) -> Result<RunConfig> {
    match path {
        Some(p) => RunConfig::load(p)
            .with_context(|| format!("Failed to load configuration {}", p.display())),
        None => Ok(RunConfig::default()),
    }
}

fn run(cli: Cli, cancel: CancellationToken) -> Result<String> {
    let mut config = load_config(cli.config.as_ref())?;
    let format = cli.format;

    match cli.command {
        Commands::Thresholds { overrides } => {
            overrides.apply(&mut config);
            tracing::info!(problem = %config.problem, "Calibrating thresholds");
            let report = EvalSession::open(config, cancel)?.thresholds()?;
            Ok(match format {
                Format::Text => report.to_text(),
                Format::Json => report.to_json()?,
            })
        }
        Commands::Adversarial {
            overrides,
            attack,
            max_batches,
        } => {
            overrides.apply(&mut config);
            if let Some(attack) = attack {
                config.attack = attack;
            }
            if max_batches.is_some() {
                config.max_batches = max_batches;
            }
            tracing::info!(
                attack = config.attack.name(),
                max_batches = ?config.max_batches,
                "Starting adversarial evaluation"
            );
            let report = EvalSession::open(config, cancel)?.adversarial()?;
            Ok(match format {
                Format::Text => report.to_text(),
                Format::Json => report.to_json()?,
            })
        }
        Commands::Corruption {
            overrides,
            corruption_dir,
            max_corruption_types,
        } => {
            overrides.apply(&mut config);
            if let Some(dir) = corruption_dir {
                config.corruption_dir = dir;
            }
            if max_corruption_types.is_some() {
                config.max_corruption_types = max_corruption_types;
            }
            tracing::info!(
                corruption_dir = %config.corruption_dir.display(),
                "Starting corruption evaluation"
            );
            let report = EvalSession::open(config, cancel)?.corruption()?;
            Ok(match format {
                Format::Text => report.to_text(),
                Format::Json => report.to_json()?,
            })
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    install_interrupt_handler(cancel.clone());

    match run(cli, cancel) {
        Ok(output) => println!("{output}"),
        Err(e) => {
            if matches!(e.downcast_ref::<EvalError>(), Some(EvalError::Cancelled)) {
                eprintln!("Evaluation interrupted");
                std::process::exit(EXIT_INTERRUPTED);
            }
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}
