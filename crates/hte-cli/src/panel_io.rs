//! CSV panel input and output.
//!
//! Empty cells and `NA`/`NaN`/`null` read as missing. Columns that hold any
//! other non-numeric value are not analysable and are left out of the panel.
//! Period cells may be integers or sortable strings such as ISO dates; strings
//! are replaced by their rank among the distinct values.

use anyhow::{Context, Result};
use hte_core::Panel;
use std::collections::BTreeMap;
use std::path::Path;

fn parse_cell(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("na") || s.eq_ignore_ascii_case("nan") || s.eq_ignore_ascii_case("null") {
        return Some(f64::NAN);
    }
    s.parse::<f64>().ok()
}

fn period_ordinals(raw: &[String]) -> Vec<i64> {
    if let Ok(ints) = raw.iter().map(|s| s.trim().parse::<i64>()).collect::<std::result::Result<Vec<_>, _>>() {
        return ints;
    }
    let ranks: BTreeMap<&str, i64> = {
        let mut distinct: Vec<&str> = raw.iter().map(|s| s.trim()).collect();
        distinct.sort_unstable();
        distinct.dedup();
        distinct.into_iter().enumerate().map(|(i, s)| (s, i as i64)).collect()
    };
    raw.iter().map(|s| ranks[s.trim()]).collect()
}

/// Read a panel from `path` with `cluster_column` and `period_column` as keys.
pub fn read_panel(path: &Path, cluster_column: &str, period_column: &str) -> Result<Panel> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("failed to open panel {}", path.display()))?;
    let headers: Vec<String> =
        rdr.headers().context("failed to read CSV headers")?.iter().map(|h| h.trim().to_string()).collect();

    let position = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .with_context(|| format!("column '{}' not found in {}", name, path.display()))
    };
    let cluster_idx = position(cluster_column)?;
    let period_idx = position(period_column)?;

    let mut clusters = Vec::new();
    let mut periods = Vec::new();
    let mut columns: Vec<Option<Vec<f64>>> = vec![Some(Vec::new()); headers.len()];
    for (line, record) in rdr.records().enumerate() {
        let record = record.with_context(|| format!("failed to read CSV row {}", line + 2))?;
        clusters.push(record.get(cluster_idx).unwrap_or("").trim().to_string());
        periods.push(record.get(period_idx).unwrap_or("").to_string());
        for (j, slot) in columns.iter_mut().enumerate() {
            if j == cluster_idx || j == period_idx {
                continue;
            }
            if let Some(values) = slot {
                match parse_cell(record.get(j).unwrap_or("")) {
                    Some(v) => values.push(v),
                    None => *slot = None,
                }
            }
        }
    }
    if clusters.is_empty() {
        anyhow::bail!("panel {} contains no data rows", path.display());
    }

    let mut panel = Panel::new(clusters, period_ordinals(&periods))?;
    for (j, values) in columns.into_iter().enumerate() {
        if j == cluster_idx || j == period_idx {
            continue;
        }
        match values {
            Some(v) => panel.insert_column(headers[j].as_str(), v)?,
            None => tracing::debug!(column = %headers[j], "non-numeric column ignored"),
        }
    }
    tracing::info!(rows = panel.n_rows(), clusters = panel.cluster_values().len(), "panel loaded");
    Ok(panel)
}

/// Write `panel` as CSV with `cluster` and `period` leading columns.
pub fn write_panel(path: &Path, panel: &Panel) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path).with_context(|| format!("failed to create {}", path.display()))?;
    let names: Vec<&str> = panel.column_names().collect();
    let mut header = vec!["cluster", "period"];
    header.extend(names.iter().copied());
    wtr.write_record(&header)?;

    let cols: Vec<&[f64]> = names.iter().filter_map(|n| panel.column(n)).collect();
    for i in 0..panel.n_rows() {
        let mut row = Vec::with_capacity(cols.len() + 2);
        row.push(panel.clusters()[i].clone());
        row.push(panel.periods()[i].to_string());
        for c in &cols {
            row.push(if c[i].is_nan() { String::new() } else { format!("{}", c[i]) });
        }
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("hte_panel_io_{}_{}", std::process::id(), name))
    }

    #[test]
    fn reads_missing_and_date_periods() {
        let path = tmp("dates.csv");
        std::fs::write(
            &path,
            "city,date,y,t,label\nA,2020-01-02,1.5,1,x\nA,2020-01-01,NA,0,y\nB,2020-01-01,,1,z\n",
        )
        .unwrap();
        let panel = read_panel(&path, "city", "date").unwrap();
        assert_eq!(panel.n_rows(), 3);
        assert_eq!(panel.periods(), &[1, 0, 0]);
        assert!(!panel.has_column("label"));
        let y = panel.column("y").unwrap();
        assert_eq!(y[0], 1.5);
        assert!(y[1].is_nan() && y[2].is_nan());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn write_then_read_keeps_values() {
        let path = tmp("roundtrip.csv");
        let panel = Panel::new(vec!["A".into(), "B".into()], vec![3, 4])
            .unwrap()
            .with_column("y", vec![0.25, f64::NAN])
            .unwrap();
        write_panel(&path, &panel).unwrap();
        let back = read_panel(&path, "cluster", "period").unwrap();
        assert_eq!(back.periods(), &[3, 4]);
        assert_eq!(back.column("y").unwrap()[0], 0.25);
        assert!(back.column("y").unwrap()[1].is_nan());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_key_column_is_an_error() {
        let path = tmp("nokey.csv");
        std::fs::write(&path, "a,b\n1,2\n").unwrap();
        assert!(read_panel(&path, "city", "b").is_err());
        std::fs::remove_file(&path).ok();
    }
}
