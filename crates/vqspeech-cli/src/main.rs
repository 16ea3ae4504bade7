//! vqspeech CLI - train and evaluate VQ-VAE speech experiments

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vqspeech_core::experiment::{load_experiments, RunSummary};
use vqspeech_core::{
    Configuration, Experiment, ExperimentRunner, FeaturesDirectoryFactory, StatusLogger,
    TracingLogger,
};

/// vqspeech - VQ-VAE representation learning for speech features
///
/// Examples:
///   vqspeech train --name baseline
///   vqspeech evaluate --name baseline
///   vqspeech run --experiments experiments.yaml --evaluate
#[derive(Parser)]
#[command(
    name = "vqspeech",
    about = "Train and evaluate VQ-VAE models on speech features",
    version = env!("CARGO_PKG_VERSION"),
    arg_required_else_help = true,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding experiment configurations and checkpoints
    #[arg(long, global = true, value_name = "PATH", env = "VQSPEECH_EXPERIMENTS_PATH")]
    experiments_path: Option<PathBuf>,

    /// Directory receiving plots and reports
    #[arg(long, global = true, value_name = "PATH", env = "VQSPEECH_RESULTS_PATH")]
    results_path: Option<PathBuf>,

    /// Global configuration file (defaults to the built-in configuration)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "vqspeech_core=debug"
    #[arg(long, global = true, env = "RUST_LOG")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train one experiment, resuming from its checkpoint when present
    Train {
        /// Experiment name
        #[arg(short, long)]
        name: String,

        /// YAML file with configuration overrides for a new experiment
        #[arg(long, value_name = "FILE")]
        experiment_config: Option<PathBuf>,
    },

    /// Evaluate one experiment on its validation split
    Evaluate {
        /// Experiment name
        #[arg(short, long)]
        name: String,

        /// YAML file with configuration overrides for a new experiment
        #[arg(long, value_name = "FILE")]
        experiment_config: Option<PathBuf>,

        /// Also plot the codebook projection
        #[arg(long)]
        embedding_plot: bool,
    },

    /// Train every experiment listed in a YAML file, in order
    Run {
        /// Mapping of experiment names to configuration overrides
        #[arg(short, long, value_name = "FILE")]
        experiments: PathBuf,

        /// Evaluate each experiment after training
        #[arg(long)]
        evaluate: bool,
    },
}

struct Paths {
    experiments: PathBuf,
    results: PathBuf,
}

impl Paths {
    fn resolve(cli: &Cli) -> Self {
        let root = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vqspeech");
        Self {
            experiments: cli
                .experiments_path
                .clone()
                .unwrap_or_else(|| root.join("experiments")),
            results: cli
                .results_path
                .clone()
                .unwrap_or_else(|| root.join("results")),
        }
    }
}

fn init_tracing(filter: Option<&str>) {
    let filter = filter
        .map(tracing_subscriber::EnvFilter::new)
        .unwrap_or_else(|| "vqspeech=info,vqspeech_core=info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_global(path: Option<&Path>) -> anyhow::Result<Configuration> {
    match path {
        Some(path) => Configuration::load(path)
            .with_context(|| format!("loading configuration {}", path.display())),
        None => Ok(Configuration::defaults()?),
    }
}

fn load_overrides(path: Option<&Path>) -> anyhow::Result<Configuration> {
    match path {
        Some(path) => Configuration::load(path)
            .with_context(|| format!("loading experiment configuration {}", path.display())),
        None => Ok(Configuration::new()),
    }
}

fn open_experiment(
    name: &str,
    paths: &Paths,
    global: &Configuration,
    experiment_config: Option<&Path>,
) -> anyhow::Result<Experiment> {
    let overrides = load_overrides(experiment_config)?;
    let logger: Arc<dyn StatusLogger> = Arc::new(TracingLogger::new(name));
    let experiment = Experiment::new(
        name,
        &paths.experiments,
        &paths.results,
        global,
        &overrides,
        Arc::new(FeaturesDirectoryFactory),
        logger,
    )
    .with_context(|| format!("preparing experiment '{name}'"))?;
    Ok(experiment)
}

fn print_summary(summary: &RunSummary) {
    match summary.history.last() {
        Some(last) => println!(
            "{}: {} updates, loss {:.5}, reconstruction error {:.5}, perplexity {:.2}",
            summary.name, last.step, last.loss, last.reconstruction_error, last.perplexity
        ),
        None => println!("{}: no updates recorded", summary.name),
    }
    if let Some(report) = &summary.report {
        println!(
            "  validation: reconstruction error {:.5}, perplexity {:.2} ({})",
            report.reconstruction_error,
            report.perplexity,
            report.plot_path.display()
        );
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let paths = Paths::resolve(&cli);
    let global = load_global(cli.config.as_deref())?;
    info!(
        "Experiments at {}, results at {}",
        paths.experiments.display(),
        paths.results.display()
    );

    match &cli.command {
        Commands::Train {
            name,
            experiment_config,
        } => {
            let mut experiment =
                open_experiment(name, &paths, &global, experiment_config.as_deref())?;
            let history = experiment.train()?;
            print_summary(&RunSummary {
                name: name.clone(),
                history,
                report: None,
            });
        }
        Commands::Evaluate {
            name,
            experiment_config,
            embedding_plot,
        } => {
            let mut experiment =
                open_experiment(name, &paths, &global, experiment_config.as_deref())?;
            let report = experiment.evaluate()?;
            println!(
                "{name}: reconstruction error {:.5}, perplexity {:.2} ({})",
                report.reconstruction_error,
                report.perplexity,
                report.plot_path.display()
            );
            if *embedding_plot {
                let path = experiment.save_embedding_plot()?;
                println!("Codebook projection written to {}", path.display());
            }
        }
        Commands::Run {
            experiments,
            evaluate,
        } => {
            let entries = load_experiments(experiments)
                .with_context(|| format!("reading {}", experiments.display()))?;
            if entries.is_empty() {
                println!("No experiments listed in {}", experiments.display());
                return Ok(());
            }
            let runner = ExperimentRunner::new(
                &paths.experiments,
                &paths.results,
                global,
                Arc::new(FeaturesDirectoryFactory),
            )
            .with_evaluation(*evaluate);
            for summary in runner.run(&entries)? {
                print_summary(&summary);
            }
        }
    }

    Ok(())
}
