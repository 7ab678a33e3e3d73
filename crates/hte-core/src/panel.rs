//! Columnar analysis panel and role-schema negotiation.
//!
//! A [`Panel`] is the finished unit-period table handed over by the ETL layer:
//! named numeric columns (missing values are `NaN`), one cluster key per row
//! (city) and one period ordinal per row. A [`RoleSchema`] declares which
//! columns play which role; [`RoleSchema::negotiate`] checks it against a panel
//! once and yields the [`ActiveSchema`] consumed by every later stage.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Ordered unit-period rows with named numeric columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Panel {
    clusters: Vec<String>,
    periods: Vec<i64>,
    columns: BTreeMap<String, Vec<f64>>,
}

impl Panel {
    /// Create a panel skeleton from per-row cluster keys and period ordinals.
    pub fn new(clusters: Vec<String>, periods: Vec<i64>) -> Result<Self> {
        if clusters.len() != periods.len() {
            return Err(Error::Validation(format!(
                "clusters length ({}) != periods length ({})",
                clusters.len(),
                periods.len()
            )));
        }
        Ok(Self { clusters, periods, columns: BTreeMap::new() })
    }

    /// Builder-style [`Panel::insert_column`].
    pub fn with_column(mut self, name: impl Into<String>, values: Vec<f64>) -> Result<Self> {
        self.insert_column(name, values)?;
        Ok(self)
    }

    /// Add or replace a numeric column.
    pub fn insert_column(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        if values.len() != self.n_rows() {
            return Err(Error::Validation(format!(
                "column '{}' has {} values, panel has {} rows",
                name,
                values.len(),
                self.n_rows()
            )));
        }
        self.columns.insert(name, values);
        Ok(())
    }

    /// Number of rows.
    pub fn n_rows(&self) -> usize {
        self.clusters.len()
    }

    /// Whether the panel has no rows.
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Column by name.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(|v| v.as_slice())
    }

    /// Whether a column exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Column names in sorted order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|k| k.as_str())
    }

    /// Per-row cluster keys.
    pub fn clusters(&self) -> &[String] {
        &self.clusters
    }

    /// Per-row period ordinals.
    pub fn periods(&self) -> &[i64] {
        &self.periods
    }

    /// Distinct cluster keys, sorted.
    pub fn cluster_values(&self) -> Vec<String> {
        let set: BTreeSet<&String> = self.clusters.iter().collect();
        set.into_iter().cloned().collect()
    }

    /// Keep the rows for which `keep(row)` holds, preserving order.
    pub fn filter_rows(&self, keep: impl Fn(usize) -> bool) -> Panel {
        let rows: Vec<usize> = (0..self.n_rows()).filter(|&i| keep(i)).collect();
        self.take_rows(&rows)
    }

    /// New panel made of the given rows.
    pub fn take_rows(&self, rows: &[usize]) -> Panel {
        let clusters = rows.iter().map(|&i| self.clusters[i].clone()).collect();
        let periods = rows.iter().map(|&i| self.periods[i]).collect();
        let columns = self
            .columns
            .iter()
            .map(|(k, v)| (k.clone(), rows.iter().map(|&i| v[i]).collect()))
            .collect();
        Panel { clusters, periods, columns }
    }

    /// Panel without the rows of one cluster.
    pub fn exclude_cluster(&self, cluster: &str) -> Panel {
        self.filter_rows(|i| self.clusters[i] != cluster)
    }

    /// Value of `name` observed `lead` periods later within the same cluster.
    ///
    /// Rows are ordered by period inside each cluster; the last `lead` rows of
    /// a cluster have no future value and get `NaN`. The result is aligned with
    /// the panel's own row order.
    pub fn lead_within_cluster(&self, name: &str, lead: usize) -> Result<Vec<f64>> {
        let values = self.column(name).ok_or_else(|| Error::MissingColumn(name.to_string()))?;

        let mut by_cluster: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, c) in self.clusters.iter().enumerate() {
            by_cluster.entry(c.as_str()).or_default().push(i);
        }

        let mut out = vec![f64::NAN; self.n_rows()];
        for rows in by_cluster.values_mut() {
            rows.sort_by_key(|&i| (self.periods[i], i));
            for (pos, &i) in rows.iter().enumerate() {
                if let Some(&j) = rows.get(pos + lead) {
                    out[i] = values[j];
                }
            }
        }
        Ok(out)
    }

    /// Binary indicator `value > threshold`; missing values stay missing.
    pub fn exceedance_indicator(&self, name: &str, threshold: f64) -> Result<Vec<f64>> {
        let values = self.column(name).ok_or_else(|| Error::MissingColumn(name.to_string()))?;
        Ok(values
            .iter()
            .map(|&v| if v.is_nan() { f64::NAN } else if v > threshold { 1.0 } else { 0.0 })
            .collect())
    }
}

/// Declared column roles for one estimation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleSchema {
    /// Outcome column `Y`.
    pub outcome: String,
    /// Binary treatment column `T`.
    pub treatment: String,
    /// Confounder columns `W`.
    #[serde(default)]
    pub confounders: Vec<String>,
    /// Effect-moderator columns `X`.
    #[serde(default)]
    pub moderators: Vec<String>,
}

impl RoleSchema {
    /// Same roles with a different outcome column.
    pub fn with_outcome(&self, outcome: impl Into<String>) -> Self {
        Self { outcome: outcome.into(), ..self.clone() }
    }

    /// Same roles with a different treatment column.
    pub fn with_treatment(&self, treatment: impl Into<String>) -> Self {
        Self { treatment: treatment.into(), ..self.clone() }
    }

    /// Same roles with the moderator list cleared.
    pub fn without_moderators(&self) -> Self {
        Self { moderators: Vec::new(), ..self.clone() }
    }

    /// Check the schema against `panel` and fix the active column lists.
    ///
    /// Outcome and treatment are required. Confounders and moderators absent
    /// from the panel are dropped from the active schema; duplicates keep their
    /// first position.
    pub fn negotiate(&self, panel: &Panel) -> Result<ActiveSchema> {
        for required in [&self.outcome, &self.treatment] {
            if !panel.has_column(required) {
                return Err(Error::MissingColumn(required.clone()));
            }
        }

        let mut dropped = Vec::new();
        let mut keep = |names: &[String]| -> Vec<String> {
            let mut seen = BTreeSet::new();
            let mut out = Vec::with_capacity(names.len());
            for n in names {
                if !seen.insert(n.as_str()) {
                    continue;
                }
                if panel.has_column(n) {
                    out.push(n.clone());
                } else {
                    dropped.push(n.clone());
                }
            }
            out
        };
        let confounders = keep(&self.confounders);
        let moderators = keep(&self.moderators);

        if !dropped.is_empty() {
            log::info!("schema: {} declared columns absent from panel: {:?}", dropped.len(), dropped);
        }

        Ok(ActiveSchema {
            outcome: self.outcome.clone(),
            treatment: self.treatment.clone(),
            confounders,
            moderators,
            dropped,
        })
    }
}

/// Role schema after negotiation against a concrete panel.
///
/// Only constructed by [`RoleSchema::negotiate`]; every listed column is
/// guaranteed to exist in the panel it was negotiated against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSchema {
    outcome: String,
    treatment: String,
    confounders: Vec<String>,
    moderators: Vec<String>,
    dropped: Vec<String>,
}

impl ActiveSchema {
    /// Outcome column.
    pub fn outcome(&self) -> &str {
        &self.outcome
    }

    /// Treatment column.
    pub fn treatment(&self) -> &str {
        &self.treatment
    }

    /// Active confounder columns, in declaration order.
    pub fn confounders(&self) -> &[String] {
        &self.confounders
    }

    /// Active moderator columns, in declaration order.
    pub fn moderators(&self) -> &[String] {
        &self.moderators
    }

    /// Declared columns that were not present.
    pub fn dropped(&self) -> &[String] {
        &self.dropped
    }

    /// Every column subject to the completeness filter.
    pub fn required_columns(&self) -> impl Iterator<Item = &str> {
        [self.outcome.as_str(), self.treatment.as_str()]
            .into_iter()
            .chain(self.confounders.iter().map(|s| s.as_str()))
            .chain(self.moderators.iter().map(|s| s.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_city_panel() -> Panel {
        let clusters = ["B", "A", "A", "B", "A", "B"].iter().map(|s| s.to_string()).collect();
        let periods = vec![2, 3, 1, 1, 2, 3];
        Panel::new(clusters, periods)
            .unwrap()
            .with_column("pm25", vec![20.0, 30.0, 10.0, 5.0, f64::NAN, 40.0])
            .unwrap()
            .with_column("admissions", vec![1.0; 6])
            .unwrap()
            .with_column("exceed", vec![1.0, 1.0, 0.0, 0.0, 0.0, 1.0])
            .unwrap()
    }

    #[test]
    fn lead_is_computed_within_cluster_by_period() {
        let p = two_city_panel();
        let lead = p.lead_within_cluster("pm25", 1).unwrap();
        // A: periods 1,2,3 -> rows 2,4,1 ; B: periods 1,2,3 -> rows 3,0,5
        assert!(lead[2].is_nan(), "missing future value propagates");
        assert_eq!(lead[4], 30.0);
        assert!(lead[1].is_nan());
        assert_eq!(lead[3], 20.0);
        assert_eq!(lead[0], 40.0);
        assert!(lead[5].is_nan());
    }

    #[test]
    fn exceedance_keeps_missing() {
        let p = two_city_panel();
        let ind = p.exceedance_indicator("pm25", 15.0).unwrap();
        assert_eq!(ind[0], 1.0);
        assert_eq!(ind[2], 0.0);
        assert!(ind[4].is_nan());
    }

    #[test]
    fn negotiation_drops_absent_optional_columns() {
        let p = two_city_panel();
        let roles = RoleSchema {
            outcome: "admissions".into(),
            treatment: "exceed".into(),
            confounders: vec!["pm25".into(), "temperature".into(), "pm25".into()],
            moderators: vec!["density".into()],
        };
        let active = roles.negotiate(&p).unwrap();
        assert_eq!(active.confounders(), &["pm25".to_string()]);
        assert!(active.moderators().is_empty());
        assert_eq!(active.dropped(), &["temperature".to_string(), "density".to_string()]);
        assert_eq!(active.required_columns().count(), 3);
    }

    #[test]
    fn negotiation_fails_on_missing_outcome() {
        let p = two_city_panel();
        let roles = RoleSchema {
            outcome: "deaths".into(),
            treatment: "exceed".into(),
            confounders: vec![],
            moderators: vec![],
        };
        assert!(matches!(roles.negotiate(&p), Err(Error::MissingColumn(c)) if c == "deaths"));
    }

    #[test]
    fn exclude_cluster_and_cluster_values() {
        let p = two_city_panel();
        assert_eq!(p.cluster_values(), vec!["A".to_string(), "B".to_string()]);
        let only_b = p.exclude_cluster("A");
        assert_eq!(only_b.n_rows(), 3);
        assert!(only_b.clusters().iter().all(|c| c == "B"));
        assert_eq!(only_b.column("pm25").unwrap(), &[20.0, 5.0, 40.0]);
    }

    #[test]
    fn column_length_is_checked() {
        let p = two_city_panel();
        assert!(p.with_column("bad", vec![1.0]).is_err());
    }
}
