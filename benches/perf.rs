use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use xmins::appearance::{MatchContext, PeriodKey, PlayerHistory};
use xmins::config::PipelineConfig;
use xmins::fake_league::{self, LeagueSpec};
use xmins::features::FeatureDeriver;
use xmins::pipeline::{ModelBundle, PredictionRequest};
use xmins::training;

fn league() -> Vec<PlayerHistory> {
    fake_league::generate(&LeagueSpec::default())
}

fn requests(league: &[PlayerHistory]) -> Vec<PredictionRequest> {
    league
        .iter()
        .map(|p| PredictionRequest {
            target: PeriodKey::new("2024-25", 30),
            profile: p.profile.clone(),
            history: p.appearances.clone(),
            context: MatchContext::default(),
        })
        .collect()
}

fn bundle(league: &[PlayerHistory]) -> ModelBundle {
    let (bundle, _) = training::train(league, &PipelineConfig::default()).expect("demo league trains");
    bundle
}

fn bench_feature_derivation(c: &mut Criterion) {
    let cfg = PipelineConfig::default();
    let schema = cfg.schema();
    let league = league();
    let player = &league[0];
    let target = PeriodKey::new("2024-25", 30);
    let deriver = FeatureDeriver::new(&cfg.features);
    c.bench_function("feature_derivation", |b| {
        b.iter(|| {
            let derived = deriver.derive_from_history(
                &schema,
                black_box(&player.appearances),
                &player.profile,
                &MatchContext::default(),
                &target,
            );
            black_box(derived.vector.len());
        })
    });
}

fn bench_single_predict(c: &mut Criterion) {
    let league = league();
    let bundle = bundle(&league);
    let reqs = requests(&league);
    c.bench_function("single_predict", |b| {
        b.iter(|| {
            let result = bundle.predict(black_box(&reqs[0])).unwrap();
            black_box(result.xmins);
        })
    });
}

fn bench_batch_predict(c: &mut Criterion) {
    let league = league();
    let bundle = bundle(&league);
    let reqs = requests(&league);
    c.bench_function("batch_predict_32", |b| {
        b.iter(|| {
            let results = bundle.batch_predict(black_box(&reqs));
            black_box(results.len());
        })
    });
}

fn bench_sample_build(c: &mut Criterion) {
    let cfg = PipelineConfig::default();
    let schema = cfg.schema();
    let league = league();
    let mut group = c.benchmark_group("training");
    group.sample_size(20);
    group.bench_function("build_samples", |b| {
        b.iter(|| {
            let samples = training::build_samples(black_box(&league), &cfg, &schema);
            black_box(samples.len());
        })
    });
    group.finish();
}

criterion_group!(
    perf,
    bench_feature_derivation,
    bench_single_predict,
    bench_batch_predict,
    bench_sample_build
);
criterion_main!(perf);
