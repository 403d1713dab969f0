//! Command-line companion for poisoning experiments: derives poisoned configs
//! and summarizes the impact of a run against its baseline.

use clap::{Parser, Subcommand};
use gossip_poison::{
    derive_poisoned_config,
    evaluation::{self, AttackImpact},
    AttackType, NodeId, PoisonConfig, PoisonError,
};
use std::{collections::BTreeSet, fs, path::PathBuf, process::ExitCode};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "poison-eval", about = "Prepare and evaluate model-poisoning experiments")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare a poisoned run with its baseline.
    Summarize {
        /// Directory holding the baseline `<node_id>_results.csv` files.
        #[arg(long)]
        baseline_dir: PathBuf,

        /// Directory holding the poisoned run's results and metrics.
        #[arg(long)]
        poisoned_dir: PathBuf,

        #[arg(long, default_value = "zero")]
        attack_type: AttackType,

        /// Node ids left out of accuracy statistics, usually the adversaries.
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<NodeId>,

        /// Poisoned run's node config; the adversaries it names are excluded as well.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Write a copy of a base config whose sharing section runs the poisoning wrapper.
    MakeConfig {
        #[arg(long)]
        base_config: PathBuf,

        #[arg(long)]
        output_config: PathBuf,

        #[arg(long, default_value = "zero")]
        attack_type: AttackType,

        #[arg(long, default_value_t = 1.0)]
        poison_strength: f64,

        #[arg(long, default_value_t = 1.0)]
        poison_probability: f64,

        /// Node ids to target; all peers when omitted.
        #[arg(long, num_args = 0..)]
        node_ids: Vec<NodeId>,

        /// Disable periodic metrics persistence.
        #[arg(long)]
        no_log_metrics: bool,
    },
}

/// Explicit exclusions plus the adversaries declared in `config`.
fn exclusion_set(explicit: Vec<NodeId>, config: Option<&PoisonConfig>) -> BTreeSet<NodeId> {
    let mut exclude: BTreeSet<NodeId> = explicit.into_iter().collect();
    if let Some(config) = config {
        exclude.extend(config.declared_adversaries());
    }
    exclude
}

fn summarize(
    baseline_dir: PathBuf,
    poisoned_dir: PathBuf,
    attack_type: AttackType,
    exclude: Vec<NodeId>,
    config: Option<PathBuf>,
) -> Result<(), PoisonError> {
    let config = config.map(PoisonConfig::from_file).transpose()?;
    let baseline = evaluation::load_results(&baseline_dir)?;
    let poisoned = evaluation::load_results(&poisoned_dir)?;
    let metrics = evaluation::load_poison_metrics(&poisoned_dir)?;
    info!(
        baseline_rows = baseline.len(),
        poisoned_rows = poisoned.len(),
        metrics_files = metrics.len(),
        "results loaded"
    );

    let exclude = exclusion_set(exclude, config.as_ref());
    if !exclude.is_empty() {
        info!(excluded = ?exclude, "leaving nodes out of accuracy statistics");
    }
    print!(
        "{}",
        AttackImpact::compare(attack_type.as_str(), &baseline, &poisoned, &exclude)
    );

    if metrics.is_empty() {
        println!("No poisoning metrics found");
    }
    for (uid, m) in &metrics {
        match m.poison_rate {
            Some(rate) => println!(
                "node {uid}: {}/{} messages poisoned over {} rounds (rate {rate:.3})",
                m.poisoned_messages, m.total_messages, m.rounds_poisoned
            ),
            None => println!("node {uid}: no messages recorded"),
        }
    }
    Ok(())
}

fn make_config(
    base_config: PathBuf,
    output_config: PathBuf,
    settings: PoisonConfig,
) -> Result<(), PoisonError> {
    // Catch bad values before writing anything out.
    settings.validate(usize::MAX)?;
    let base = fs::read_to_string(&base_config)?;
    let derived = derive_poisoned_config(&base, &settings)?;
    fs::write(&output_config, derived)?;
    println!("Created poisoned config at {}", output_config.display());
    println!("Attack type: {}", settings.attack_type);
    println!("Poison strength: {}", settings.poison_strength);
    println!("Poison probability: {}", settings.poison_probability);
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Summarize {
            baseline_dir,
            poisoned_dir,
            attack_type,
            exclude,
            config,
        } => summarize(baseline_dir, poisoned_dir, attack_type, exclude, config),
        Command::MakeConfig {
            base_config,
            output_config,
            attack_type,
            poison_strength,
            poison_probability,
            node_ids,
            no_log_metrics,
        } => {
            let mut settings = PoisonConfig::new(attack_type);
            settings.poison_strength = poison_strength;
            settings.poison_probability = poison_probability;
            settings.targeted_nodes = node_ids;
            settings.log_poisoning_metrics = !no_log_metrics;
            make_config(base_config, output_config, settings)
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "poison-eval failed");
            ExitCode::FAILURE
        }
    }
}
