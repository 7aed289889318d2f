use criterion::{criterion_group, criterion_main, Criterion};
use knn_crossval::{
    cross_validate, generate_labeled_points, CrossValidationConfig, Dataset, DistanceMetric,
    ExecutionMode,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn bench_knn(c: &mut Criterion) {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let records = generate_labeled_points(5, 400, 11, 2.0, &mut rng).expect("synthetic data");
    let dataset = Dataset::from_records(records).expect("dataset");
    let config = CrossValidationConfig {
        folds: 10,
        neighbors: 5,
        metric: DistanceMetric::Euclidean,
        mode: ExecutionMode::Sequential,
    };
    c.bench_function("knn_sequential_2k_11d", |b| {
        b.iter(|| {
            let _run = cross_validate(&dataset, &config).expect("sequential bench run");
        });
    });

    let parallel_config = CrossValidationConfig {
        mode: ExecutionMode::Parallel,
        ..config.clone()
    };
    c.bench_function("knn_parallel_2k_11d", |b| {
        b.iter(|| {
            let _run = cross_validate(&dataset, &parallel_config).expect("parallel bench run");
        });
    });

    let manhattan_config = CrossValidationConfig {
        metric: DistanceMetric::Manhattan,
        ..parallel_config.clone()
    };
    c.bench_function("knn_parallel_manhattan_2k_11d", |b| {
        b.iter(|| {
            let _run = cross_validate(&dataset, &manhattan_config).expect("manhattan bench run");
        });
    });
}

criterion_group!(benches, bench_knn);
criterion_main!(benches);
