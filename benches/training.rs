use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nasdiff::config::Config;
use nasdiff::data::{AugMaskAlgo, DataScaler, NasBench201Dataset};
use nasdiff::models::GraphLinearScore;
use nasdiff::sde::build_sde;
use nasdiff::training::{get_step_fn, optimization_manager, TrainingState};
use nasdiff::utils::RandomSource;

fn bench_score_train_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("score_train_step");
    group.sample_size(20);

    let dataset = NasBench201Dataset::enumerate();
    let scaler = DataScaler::new(true);

    for batch_size in [32usize, 128, 256].iter() {
        let mut config = Config::scorenet();
        config.training.batch_size = *batch_size;
        let (sde, _) = build_sde(&config).unwrap();
        let step_fn = get_step_fn(sde, true, optimization_manager(&config), false, true, false).unwrap();

        let indices: Vec<usize> = (0..*batch_size).collect();
        let batch = dataset
            .collate(&indices)
            .unwrap()
            .prepare(AugMaskAlgo::Floyd, &scaler);

        let mut rng = RandomSource::new(42);
        let model = GraphLinearScore::new(config.data.n_vocab, config.model.hidden_dim, 0.05, &mut rng);
        let mut state = TrainingState::new(model, &config, true).unwrap();

        group.bench_with_input(BenchmarkId::new("train", batch_size), batch_size, |b, _| {
            b.iter(|| black_box(step_fn.train(&mut state, &batch, &mut rng).unwrap()));
        });
    }

    group.finish();
}

fn bench_enumerate(c: &mut Criterion) {
    c.bench_function("enumerate_search_space", |b| {
        b.iter(|| black_box(NasBench201Dataset::enumerate().len()));
    });
}

criterion_group!(benches, bench_score_train_step, bench_enumerate);
criterion_main!(benches);
