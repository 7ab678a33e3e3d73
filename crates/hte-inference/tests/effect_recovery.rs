//! Recovery of a known constant effect across independent synthetic draws.
//!
//! Each draw has n = 2000 rows (10 clusters × 200 days), a constant effect of
//! 2.0, unit Gaussian noise and confounders that shift the outcome but are
//! independent of treatment.

use hte_inference::sensitivity::placebo_test;
use hte_inference::synthetic::{EXPOSURE, EffectShape, TreatmentAssignment};
use hte_inference::{AnalysisConfig, NuisanceConfig, SyntheticConfig, build_matrices, fit_effect, generate_panel};

const DRAWS: u64 = 20;
const TRUE_EFFECT: f64 = 2.0;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn panel_config(seed: u64, treatment: TreatmentAssignment) -> SyntheticConfig {
    SyntheticConfig {
        n_clusters: 10,
        n_periods: 200,
        treatment,
        effect: EffectShape::Constant { value: TRUE_EFFECT },
        noise_sd: 1.0,
        cluster_sd: 0.0,
        seed,
        ..Default::default()
    }
}

fn analysis_config(seed: u64) -> AnalysisConfig {
    let mut c = AnalysisConfig::default();
    c.seed = seed;
    c.nuisance = NuisanceConfig::linear();
    c.forest.n_trees = 400;
    c.sensitivity.quick_trees = 300;
    c
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn ate_interval_covers_constant_effect() {
    let mut covered = 0;
    for draw in 0..DRAWS {
        let data = generate_panel(&panel_config(1000 + draw, TreatmentAssignment::Bernoulli { prob: 0.5 })).unwrap();
        let config = analysis_config(draw);
        let matrices = build_matrices(&data.panel, &data.roles, config.min_rows).unwrap();
        assert_eq!(matrices.n_rows(), 2000);

        let ate = fit_effect(&matrices, &config, &config.forest, config.seed).unwrap().ate;
        assert!(
            (ate.ate - TRUE_EFFECT).abs() < 0.5,
            "draw {draw}: ATE {} too far from {TRUE_EFFECT}",
            ate.ate
        );
        assert!(ate.ci_lower <= ate.ate && ate.ate <= ate.ci_upper);
        if ate.ci_lower <= TRUE_EFFECT && TRUE_EFFECT <= ate.ci_upper {
            covered += 1;
        }
    }
    assert!(covered >= 18, "95% CI covered the true effect in only {covered}/{DRAWS} draws");
}

#[test]
fn placebo_lead_is_null() {
    let mut passed = 0;
    for draw in 0..DRAWS {
        let data = generate_panel(&panel_config(2000 + draw, TreatmentAssignment::Exposure { limit: 15.0 })).unwrap();
        let config = analysis_config(draw);
        let r = placebo_test(&data.panel, &data.roles, EXPOSURE, 15.0, &config).unwrap();
        assert_eq!(r.lead, 7);
        // The last `lead` days of each cluster have no future exposure.
        assert_eq!(r.n_obs, 2000 - 10 * 7);
        if r.pvalue > 0.05 {
            assert!(r.passed);
            passed += 1;
        }
    }
    assert!(passed >= 18, "placebo p > 0.05 in only {passed}/{DRAWS} draws");
}
