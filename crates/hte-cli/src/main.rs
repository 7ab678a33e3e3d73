//! hte CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hte_core::RoleSchema;
use hte_inference::synthetic::{EffectShape, TreatmentAssignment};
use hte_inference::{AnalysisConfig, SyntheticConfig, build_matrices, fit_effect, generate_panel};
use std::path::PathBuf;

mod panel_io;
mod report;
mod run;

#[derive(Parser)]
#[command(name = "hte")]
#[command(about = "hte - heterogeneous treatment effects on clustered panels")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Full pipeline from a YAML/JSON run config
    Run {
        /// Run config (`.yaml`, `.yml` or `.json`)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Cross-fit, grow the forest and print the ATE as JSON
    Estimate {
        /// Input panel (CSV)
        #[arg(short, long)]
        input: PathBuf,

        /// Cluster key column
        #[arg(long, default_value = "cluster")]
        cluster_column: String,

        /// Period column
        #[arg(long, default_value = "period")]
        period_column: String,

        /// Outcome column
        #[arg(long)]
        outcome: String,

        /// Binary treatment column
        #[arg(long)]
        treatment: String,

        /// Confounder columns (comma-separated)
        #[arg(long, value_delimiter = ',')]
        confounders: Vec<String>,

        /// Moderator columns (comma-separated)
        #[arg(long, value_delimiter = ',')]
        moderators: Vec<String>,

        /// Trees in the forest
        #[arg(long, default_value = "2000")]
        n_trees: usize,

        /// Seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Threads (0 = auto).
        #[arg(long, default_value = "0")]
        threads: usize,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write a synthetic panel CSV with a known effect
    GenerateData {
        /// Clusters
        #[arg(long, default_value = "10")]
        n_clusters: usize,

        /// Periods per cluster
        #[arg(long, default_value = "200")]
        n_periods: usize,

        /// Effect at zero moderators
        #[arg(long, default_value = "2.0")]
        effect: f64,

        /// Effect slope on `x0` (0 = constant effect)
        #[arg(long, default_value = "0.0")]
        effect_slope: f64,

        /// Assign treatment by coin flip with this probability instead of `pm25 > 15`
        #[arg(long)]
        bernoulli: Option<f64>,

        /// Seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Output CSV
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run { config } => run::cmd_run(&config),
        Commands::Estimate {
            input,
            cluster_column,
            period_column,
            outcome,
            treatment,
            confounders,
            moderators,
            n_trees,
            seed,
            threads,
            output,
        } => {
            let roles = RoleSchema { outcome, treatment, confounders, moderators };
            let mut config = AnalysisConfig { seed, threads, ..Default::default() };
            config.forest.n_trees = n_trees;
            cmd_estimate(&input, &cluster_column, &period_column, &roles, &config, output.as_ref())
        }
        Commands::GenerateData { n_clusters, n_periods, effect, effect_slope, bernoulli, seed, output } => {
            let effect = if effect_slope == 0.0 {
                EffectShape::Constant { value: effect }
            } else {
                EffectShape::Linear { intercept: effect, slopes: vec![effect_slope] }
            };
            let treatment = match bernoulli {
                Some(prob) => TreatmentAssignment::Bernoulli { prob },
                None => TreatmentAssignment::Exposure { limit: 15.0 },
            };
            let cfg = SyntheticConfig { n_clusters, n_periods, effect, treatment, seed, ..Default::default() };
            cmd_generate_data(&cfg, &output)
        }
    }
}

fn cmd_estimate(
    input: &PathBuf,
    cluster_column: &str,
    period_column: &str,
    roles: &RoleSchema,
    config: &AnalysisConfig,
    output: Option<&PathBuf>,
) -> Result<()> {
    config.validate()?;
    let panel = panel_io::read_panel(input, cluster_column, period_column)?;
    let matrices = build_matrices(&panel, roles, config.min_rows)
        .with_context(|| format!("failed to build matrices for '{}'", roles.outcome))?;
    let fitted = hte_inference::pipeline::with_thread_pool(config.threads, || {
        fit_effect(&matrices, config, &config.forest, config.seed)
    })?;
    tracing::info!(ate = fitted.ate.ate, se = fitted.ate.se, "estimate complete");

    let value = serde_json::json!({
        "outcome": roles.outcome,
        "treatment": roles.treatment,
        "n_obs": matrices.n_rows(),
        "n_clusters": matrices.cluster_names.len(),
        "dropped_columns": matrices.schema.dropped(),
        "ate": fitted.ate,
    });
    write_json(output, value)
}

fn cmd_generate_data(config: &SyntheticConfig, output: &PathBuf) -> Result<()> {
    let data = generate_panel(config)?;
    panel_io::write_panel(output, &data.panel)?;
    tracing::info!(rows = data.panel.n_rows(), true_ate = data.true_ate, path = %output.display(), "synthetic panel written");
    Ok(())
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
