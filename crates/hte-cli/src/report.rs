//! JSON and CSV artifacts for a finished run.

use anyhow::{Context, Result};
use hte_inference::{AnalysisReport, BatchReport, EffectReport, SensitivityResult};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Pretty JSON to `path`.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let s = serde_json::to_string_pretty(value)?;
    std::fs::write(path, s).with_context(|| format!("failed to write {}", path.display()))
}

/// Flat records to CSV via their serde field names.
fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path).with_context(|| format!("failed to create {}", path.display()))?;
    for r in rows {
        wtr.serialize(r)?;
    }
    wtr.flush()?;
    Ok(())
}

fn fmt(v: f64) -> String {
    if v.is_finite() { format!("{:.6}", v) } else { String::new() }
}

fn write_cate(path: &Path, effects: &EffectReport) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    let mut header = vec!["panel_row".to_string(), "cluster".to_string()];
    header.extend(effects.cate.moderator_names.iter().cloned());
    header.extend(["cate", "se", "cate_ci_lower", "cate_ci_upper"].map(String::from));
    wtr.write_record(&header)?;
    for r in &effects.cate.rows {
        let mut row = vec![r.panel_row.to_string(), r.cluster.clone()];
        row.extend(r.moderators.iter().map(|v| fmt(*v)));
        row.extend([r.cate, r.se, r.cate_ci_lower, r.cate_ci_upper].map(fmt));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

fn write_clan(path: &Path, effects: &EffectReport) -> Result<()> {
    let Ok(clan) = &effects.clan else {
        return Ok(());
    };
    let mut wtr = csv::Writer::from_path(path)?;
    let mut header = vec!["quartile".to_string(), "n_obs".to_string(), "mean_cate".to_string()];
    header.extend(clan.moderator_names.iter().map(|m| format!("mean_{m}")));
    wtr.write_record(&header)?;
    for r in &clan.rows {
        let mut row = vec![r.label.clone(), r.n_obs.to_string(), fmt(r.mean_cate)];
        row.extend(r.moderator_means.iter().map(|v| fmt(*v)));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

fn write_shapley(values_path: &Path, ranking_path: &Path, effects: &EffectReport) -> Result<()> {
    let Some(attr) = &effects.attribution else {
        return Ok(());
    };
    let mut wtr = csv::Writer::from_path(values_path)?;
    let mut header = vec!["panel_row".to_string(), "cluster".to_string(), "cate".to_string(), "base_value".to_string()];
    header.extend(attr.moderator_names.iter().map(|m| format!("phi_{m}")));
    wtr.write_record(&header)?;
    for r in &attr.rows {
        let cate_row = &effects.cate.rows[r.row];
        let mut row = vec![cate_row.panel_row.to_string(), cate_row.cluster.clone(), fmt(r.prediction), fmt(r.base_value)];
        row.extend(r.values.iter().map(|v| fmt(*v)));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;

    let mut wtr = csv::Writer::from_path(ranking_path)?;
    wtr.write_record(["moderator", "mean_abs_phi"])?;
    for (name, v) in &attr.importance {
        wtr.write_record([name.as_str(), fmt(*v).as_str()])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Files written by [`write_analysis`].
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactIndex {
    /// Every file, in write order.
    pub files: Vec<PathBuf>,
}

/// Write the effect, policy and sensitivity artifacts of one run.
pub fn write_analysis(dir: &Path, report: &AnalysisReport) -> Result<ArtifactIndex> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let mut files = Vec::new();
    let mut out = |name: &str| {
        let p = dir.join(name);
        files.push(p.clone());
        p
    };

    let effects = &report.effects;
    write_json(&out("effects.json"), effects)?;
    write_cate(&out("cate.csv"), effects)?;
    if let Ok(blp) = &effects.blp {
        let mut rows = vec![blp.intercept.clone()];
        rows.extend(blp.rows.iter().cloned());
        write_rows(&out("blp.csv"), &rows)?;
    }
    if effects.clan.is_ok() {
        write_clan(&out("clan.csv"), effects)?;
    }
    if effects.attribution.is_some() {
        write_shapley(&out("shapley_values.csv"), &out("shapley_importance.csv"), effects)?;
    }
    if let Some(dml) = &effects.linear_dml {
        write_rows(&out("linear_dml_interactions.csv"), &dml.interactions)?;
    }

    if let Some(policy) = &report.policy {
        write_json(&out("policy.json"), policy)?;
        write_rows(&out("policy_by_cluster.csv"), &policy.by_cluster)?;
        write_rows(&out("policy_by_vulnerability.csv"), &policy.by_vulnerability)?;
        if !policy.scenarios.is_empty() {
            write_rows(&out("policy_scenarios.csv"), &policy.scenarios)?;
        }
    }

    if let Some(sens) = &report.sensitivity {
        write_json(&out("sensitivity.json"), sens)?;
        for result in &sens.results {
            match result {
                SensitivityResult::ThresholdSweep(s) => write_rows(&out("threshold_sweep.csv"), &s.rows)?,
                SensitivityResult::Jackknife(j) => write_rows(&out("jackknife.csv"), &j.rows)?,
                _ => {}
            }
        }
    }
    tracing::info!(dir = %dir.display(), files = files.len(), "artifacts written");
    Ok(ArtifactIndex { files })
}

/// Write the multi-outcome summary and one effects file per outcome.
pub fn write_batch(dir: &Path, batch: &BatchReport) -> Result<ArtifactIndex> {
    let outcomes_dir = dir.join("outcomes");
    std::fs::create_dir_all(&outcomes_dir)
        .with_context(|| format!("failed to create {}", outcomes_dir.display()))?;
    let mut files = Vec::new();
    let summary = dir.join("outcomes_summary.csv");
    write_rows(&summary, &batch.summary)?;
    files.push(summary);
    for r in &batch.reports {
        let p = outcomes_dir.join(format!("{}.json", r.outcome));
        write_json(&p, r)?;
        files.push(p);
    }
    if !batch.skipped.is_empty() {
        let p = dir.join("outcomes_skipped.csv");
        write_rows(&p, &batch.skipped)?;
        files.push(p);
    }
    Ok(ArtifactIndex { files })
}
