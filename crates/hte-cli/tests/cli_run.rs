use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_hte"))
}

fn tmp_path(filename: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let mut p = std::env::temp_dir();
    p.push(format!("hte_cli_run_{}_{}_{}", std::process::id(), nanos, filename));
    p
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

fn generate(n_clusters: &str, n_periods: &str) -> PathBuf {
    let data = tmp_path("panel.csv");
    let out = run(&[
        "generate-data",
        "--n-clusters",
        n_clusters,
        "--n-periods",
        n_periods,
        "--seed",
        "7",
        "-o",
        data.to_string_lossy().as_ref(),
    ]);
    assert!(out.status.success(), "generate-data failed, stderr={}", String::from_utf8_lossy(&out.stderr));
    data
}

#[test]
fn estimate_prints_ate_json() {
    let data = generate("4", "150");
    let out = run(&[
        "--log-level",
        "warn",
        "estimate",
        "-i",
        data.to_string_lossy().as_ref(),
        "--outcome",
        "outcome",
        "--treatment",
        "treated",
        "--confounders",
        "w0,w1,not_in_panel",
        "--moderators",
        "x0,x1",
        "--n-trees",
        "100",
    ]);
    assert!(out.status.success(), "estimate failed, stderr={}", String::from_utf8_lossy(&out.stderr));

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("stdout should be valid JSON");
    assert_eq!(v.get("n_obs").and_then(|x| x.as_u64()), Some(600));
    assert_eq!(v["dropped_columns"], serde_json::json!(["not_in_panel"]));
    let ate = &v["ate"];
    let lo = ate["ci_lower"].as_f64().unwrap();
    let hi = ate["ci_upper"].as_f64().unwrap();
    let est = ate["ate"].as_f64().unwrap();
    assert!(lo <= est && est <= hi);
    assert!((est - 2.0).abs() < 1.0, "ATE {est} far from 2.0");
}

#[test]
fn missing_treatment_column_exits_nonzero() {
    let data = generate("2", "100");
    let out = run(&[
        "estimate",
        "-i",
        data.to_string_lossy().as_ref(),
        "--outcome",
        "outcome",
        "--treatment",
        "no_such_column",
    ]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("no_such_column"));
}

#[test]
fn run_writes_artifacts() {
    let data = generate("4", "150");
    let out_dir = tmp_path("out");
    let cfg = tmp_path("run.yaml");
    std::fs::write(
        &cfg,
        format!(
            r#"panel: {panel}
out_dir: {out}
roles:
  outcome: outcome
  treatment: treated
  confounders: [w0, w1]
  moderators: [x0, x1]
extra_outcomes: [outcome, total_cost]
analysis:
  seed: 3
  forest:
    n_trees: 60
  bootstrap:
    n_bootstrap: 100
  sensitivity:
    quick_trees: 40
    jackknife_trees: 40
  attribution:
    max_rows: 80
    n_permutations: 4
"#,
            panel = data.display(),
            out = out_dir.display()
        ),
    )
    .unwrap();

    let out = run(&["run", "--config", cfg.to_string_lossy().as_ref()]);
    assert!(out.status.success(), "run failed, stderr={}", String::from_utf8_lossy(&out.stderr));

    let artifacts = out_dir.join("artifacts");
    for name in [
        "effects.json",
        "cate.csv",
        "blp.csv",
        "clan.csv",
        "shapley_values.csv",
        "shapley_importance.csv",
        "policy.json",
        "policy_by_cluster.csv",
        "policy_scenarios.csv",
        "sensitivity.json",
        "threshold_sweep.csv",
        "jackknife.csv",
        "outcomes_summary.csv",
    ] {
        assert!(artifacts.join(name).is_file(), "missing artifact {name}");
    }

    let summary: serde_json::Value =
        serde_json::from_slice(&std::fs::read(out_dir.join("run_summary.json")).unwrap()).unwrap();
    assert_eq!(summary["n_rows"].as_u64(), Some(600));

    let sens: serde_json::Value =
        serde_json::from_slice(&std::fs::read(artifacts.join("sensitivity.json")).unwrap()).unwrap();
    let checks: Vec<&str> =
        sens["results"].as_array().unwrap().iter().filter_map(|r| r["check"].as_str()).collect();
    assert!(checks.contains(&"placebo"));
    assert!(checks.contains(&"omitted_variable_bound"));

    let shapley = std::fs::read_to_string(artifacts.join("shapley_values.csv")).unwrap();
    assert_eq!(
        shapley.lines().next().unwrap(),
        "panel_row,cluster,cate,base_value,phi_x0,phi_x1"
    );
    let ranking = std::fs::read_to_string(artifacts.join("shapley_importance.csv")).unwrap();
    assert_eq!(ranking.lines().count(), 3);

    let summary_csv = std::fs::read_to_string(artifacts.join("outcomes_summary.csv")).unwrap();
    assert_eq!(summary_csv.lines().count(), 3);
}
