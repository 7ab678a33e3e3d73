use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use hte_inference::synthetic::EffectShape;
use hte_inference::{CausalForest, ForestConfig, SyntheticConfig, build_matrices, cross_fit, generate_panel};
use hte_inference::{CrossFitConfig, NuisanceConfig};
use std::hint::black_box;

fn residualized(n_periods: usize) -> (hte_inference::EstimationMatrices, Vec<f64>, Vec<f64>) {
    let data = generate_panel(&SyntheticConfig {
        n_clusters: 10,
        n_periods,
        n_moderators: 4,
        effect: EffectShape::Linear { intercept: 1.0, slopes: vec![0.5, -0.5] },
        ..Default::default()
    })
    .unwrap();
    let m = build_matrices(&data.panel, &data.roles, 100).unwrap();
    let cf = cross_fit(&m.nuisance_features(true), &m.y, &m.t, &NuisanceConfig::default(), &CrossFitConfig::default(), 1)
        .unwrap();
    (m, cf.y_residual, cf.t_residual)
}

fn bench_forest_fit_n_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("forest/fit/n_scaling");
    group.sample_size(10);
    let config = ForestConfig { n_trees: 200, ..Default::default() };
    for n_periods in [100usize, 500, 2_000] {
        let (m, y_res, t_res) = residualized(n_periods);
        group.bench_with_input(BenchmarkId::from_parameter(m.n_rows()), &m, |b, m| {
            b.iter(|| {
                let forest = CausalForest::fit(black_box(&m.x), &y_res, &t_res, &m.t, &config, 7).unwrap();
                black_box(forest.n_trees());
            });
        });
    }
    group.finish();
}

fn bench_forest_predict_oob(c: &mut Criterion) {
    let (m, y_res, t_res) = residualized(500);
    let forest = CausalForest::fit(&m.x, &y_res, &t_res, &m.t, &ForestConfig { n_trees: 500, ..Default::default() }, 7)
        .unwrap();
    c.bench_function("forest/predict_oob/n=5000", |b| {
        b.iter(|| black_box(forest.predict_oob()));
    });
}

criterion_group!(benches, bench_forest_fit_n_scaling, bench_forest_predict_oob);
criterion_main!(benches);
