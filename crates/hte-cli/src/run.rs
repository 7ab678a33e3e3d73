//! `hte run` orchestration.

use anyhow::{Context, Result};
use hte_core::RoleSchema;
use hte_inference::{AnalysisConfig, Consumers, analyze_outcomes, run_analysis};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::panel_io::read_panel;
use crate::report::{write_batch, write_analysis, write_json};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Panel CSV.
    pub panel: PathBuf,
    /// Output directory for this run.
    pub out_dir: PathBuf,

    /// Allow writing into a non-empty `out_dir` (overwrites known filenames).
    #[serde(default)]
    pub overwrite: bool,

    /// Cluster key column.
    #[serde(default = "default_cluster_column")]
    pub cluster_column: String,
    /// Period column (integers or sortable strings).
    #[serde(default = "default_period_column")]
    pub period_column: String,

    /// Roles for the primary outcome.
    pub roles: RoleSchema,

    /// Further outcome columns estimated under the same roles.
    #[serde(default)]
    pub extra_outcomes: Vec<String>,

    /// Skip the policy engine.
    #[serde(default)]
    pub skip_policy: bool,
    /// Skip the sensitivity suite.
    #[serde(default)]
    pub skip_sensitivity: bool,

    /// Estimation settings.
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

fn default_cluster_column() -> String {
    "cluster".to_string()
}

fn default_period_column() -> String {
    "period".to_string()
}

pub fn read_run_config(path: &Path) -> Result<RunConfig> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read config {}", path.display()))?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("").to_ascii_lowercase();
    let cfg: RunConfig = if ext == "json" {
        serde_json::from_slice(&bytes)?
    } else {
        // Default: YAML (serde_yaml_ng).
        serde_yaml_ng::from_slice(&bytes)?
    };
    Ok(cfg)
}

fn resolve(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() { p.to_path_buf() } else { base.join(p) }
}

fn ensure_out_dir(dir: &Path, overwrite: bool) -> Result<()> {
    if dir.exists() {
        if !dir.is_dir() {
            anyhow::bail!("out_dir exists but is not a directory: {}", dir.display());
        }
        if !overwrite && dir.read_dir()?.next().is_some() {
            anyhow::bail!("out_dir must be empty (or set overwrite: true): {}", dir.display());
        }
    } else {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
struct RunSummary {
    hte_version: &'static str,
    config: RunConfig,
    n_rows: usize,
    elapsed_s: f64,
    artifacts: Vec<PathBuf>,
}

pub fn cmd_run(config_path: &Path) -> Result<()> {
    let t0 = Instant::now();
    let mut cfg = read_run_config(config_path)?;
    let base = config_path.parent().unwrap_or(Path::new("."));
    cfg.panel = resolve(base, &cfg.panel);
    cfg.out_dir = resolve(base, &cfg.out_dir);
    cfg.analysis.validate()?;
    ensure_out_dir(&cfg.out_dir, cfg.overwrite)?;

    let panel = read_panel(&cfg.panel, &cfg.cluster_column, &cfg.period_column)?;
    let artifacts_dir = cfg.out_dir.join("artifacts");

    tracing::info!(outcome = %cfg.roles.outcome, "stage: primary analysis");
    let consumers = Consumers { policy: !cfg.skip_policy, sensitivity: !cfg.skip_sensitivity };
    let report = run_analysis(&panel, &cfg.roles, &cfg.analysis, consumers)
        .with_context(|| format!("analysis of '{}' failed", cfg.roles.outcome))?;
    let mut artifacts = write_analysis(&artifacts_dir, &report)?.files;

    if !cfg.extra_outcomes.is_empty() {
        tracing::info!(outcomes = cfg.extra_outcomes.len(), "stage: outcome batch");
        let batch = analyze_outcomes(&panel, &cfg.roles, &cfg.extra_outcomes, &cfg.analysis)?;
        artifacts.extend(write_batch(&artifacts_dir, &batch)?.files);
    }

    let summary = RunSummary {
        hte_version: env!("CARGO_PKG_VERSION"),
        n_rows: panel.n_rows(),
        elapsed_s: t0.elapsed().as_secs_f64(),
        artifacts,
        config: cfg.clone(),
    };
    write_json(&cfg.out_dir.join("run_summary.json"), &summary)?;
    tracing::info!(elapsed_s = summary.elapsed_s, out_dir = %cfg.out_dir.display(), "run complete");
    Ok(())
}
