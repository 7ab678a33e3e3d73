//! End-to-end runs of the staged pipeline on synthetic panels.

use hte_inference::sensitivity::threshold_sweep;
use hte_inference::synthetic::{EXPOSURE, EffectShape};
use hte_inference::{
    AnalysisConfig, Consumers, NuisanceConfig, SensitivityResult, SyntheticConfig, generate_panel, run_analysis,
};

fn small_panel(seed: u64) -> hte_inference::SyntheticPanel {
    generate_panel(&SyntheticConfig {
        n_clusters: 4,
        n_periods: 150,
        effect: EffectShape::Linear { intercept: 2.0, slopes: vec![1.0] },
        seed,
        ..Default::default()
    })
    .unwrap()
}

fn fast_config(threads: usize) -> AnalysisConfig {
    let mut c = AnalysisConfig::default();
    c.threads = threads;
    c.nuisance = NuisanceConfig::linear();
    c.forest.n_trees = 100;
    c.bootstrap.n_bootstrap = 200;
    c.sensitivity.quick_trees = 60;
    c.sensitivity.jackknife_trees = 60;
    c.attribution.max_rows = 100;
    c.attribution.n_permutations = 4;
    c
}

#[test]
fn identical_inputs_give_identical_reports() {
    let data = small_panel(3);
    let a = run_analysis(&data.panel, &data.roles, &fast_config(1), Consumers::default()).unwrap();
    let b = run_analysis(&data.panel, &data.roles, &fast_config(4), Consumers::default()).unwrap();
    assert_eq!(a.effects.ate.ate.to_bits(), b.effects.ate.ate.to_bits());
    assert_eq!(a.effects.ate.se.to_bits(), b.effects.ate.se.to_bits());
    let ja = serde_json::to_string(&a).unwrap();
    let jb = serde_json::to_string(&b).unwrap();
    assert_eq!(ja, jb);
}

#[test]
fn full_run_produces_every_artifact() {
    let data = small_panel(5);
    let report = run_analysis(&data.panel, &data.roles, &fast_config(0), Consumers::default()).unwrap();

    let effects = &report.effects;
    assert_eq!(effects.n_obs, 600);
    assert_eq!(effects.n_clusters, 4);
    assert_eq!(effects.cate.rows.len(), 600);
    assert!(effects.aipw_ate.is_some());
    let dml = effects.linear_dml.as_ref().unwrap();
    assert_eq!(dml.interactions.len(), 2);
    let blp = effects.blp.as_ref().unwrap();
    assert_eq!(blp.rows.len(), 2);
    assert!(effects.clan.is_ok());
    assert_eq!(effects.variable_importance.len(), 2);
    assert_eq!(effects.crossfit.len(), 5);
    let attribution = effects.attribution.as_ref().unwrap();
    assert_eq!(attribution.rows.len() + attribution.n_unexplained, 100);
    assert_eq!(attribution.importance.len(), 2);
    assert!(attribution.rows.iter().all(|r| r.values.len() == 2));

    let policy = report.policy.as_ref().unwrap();
    assert_eq!(policy.by_cluster.len(), 4);
    assert_eq!(policy.scenarios.len(), 4);
    assert!(policy.cost.is_some());
    let boot = policy.bootstrap.as_ref().unwrap();
    assert!(boot.ci_lower <= boot.ci_upper);

    let sens = report.sensitivity.as_ref().unwrap();
    let checks: Vec<&str> = sens
        .results
        .iter()
        .map(|r| match r {
            SensitivityResult::Placebo(_) => "placebo",
            SensitivityResult::ThresholdSweep(_) => "threshold_sweep",
            SensitivityResult::Jackknife(_) => "jackknife",
            SensitivityResult::OmittedVariableBound(_) => "omitted_variable_bound",
        })
        .collect();
    assert_eq!(checks, vec!["placebo", "threshold_sweep", "jackknife", "omitted_variable_bound"]);
    assert!(sens.skipped.is_empty(), "{:?}", sens.skipped);
}

#[test]
fn consumers_can_be_disabled() {
    let data = small_panel(9);
    let report =
        run_analysis(&data.panel, &data.roles, &fast_config(0), Consumers { policy: false, sensitivity: false }).unwrap();
    assert!(report.policy.is_none());
    assert!(report.sensitivity.is_none());
}

#[test]
fn treated_share_falls_as_threshold_rises() {
    let data = small_panel(11);
    let sweep = threshold_sweep(&data.panel, &data.roles, EXPOSURE, &fast_config(0)).unwrap();
    assert_eq!(sweep.rows.len(), 4);
    for pair in sweep.rows.windows(2) {
        assert!(pair[1].treat_pct <= pair[0].treat_pct);
    }
    // Exposure ~ N(20, 10): almost nothing exceeds 50.
    let last = sweep.rows.last().unwrap();
    assert!(last.skipped.is_some());
    assert!(last.ate.is_nan());
    assert!(sweep.rows[0].ate.is_finite());
}
