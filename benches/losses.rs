//! Benchmarks for the self-supervised losses.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tandem::{
    AutogradEngine, ConfigBuilder, Loss, LossFactory, LossKind, Shape, Tensor, Variable,
};

const HIDDEN_DIM: usize = 64;

fn embeddings(batch_size: usize, phase: f32) -> Tensor<2> {
    let data = (0..batch_size * HIDDEN_DIM)
        .map(|i| (i as f32 * 0.37 + phase).sin())
        .collect();
    Tensor::from_vec(data, Shape::new([batch_size, HIDDEN_DIM])).unwrap()
}

fn build(kind: LossKind, batch_size: usize, cap: Option<usize>) -> Box<dyn Loss> {
    let config = ConfigBuilder::new()
        .loss(kind)
        .batch_size(batch_size)
        .hidden_dim(HIDDEN_DIM)
        .contrastive(|c| c.n_negative = cap)
        .runtime(|r| r.seed = Some(0))
        .build()
        .unwrap();
    LossFactory::from_config(&config).unwrap()
}

fn bench_forward(c: &mut Criterion) {
    for kind in LossKind::ALL {
        let mut group = c.benchmark_group(format!("{}_forward", kind));

        for size in [16, 64, 128].iter() {
            let loss = build(kind, *size, None);
            let x = Variable::from_tensor(embeddings(*size, 0.0));
            let y = Variable::from_tensor(embeddings(*size, 0.5));

            group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
                b.iter(|| loss.forward(black_box(&x), black_box(&y)).unwrap());
            });
        }

        group.finish();
    }
}

fn bench_simclr_subsampled(c: &mut Criterion) {
    let mut group = c.benchmark_group("simclr_subsampled");

    for cap in [8, 32, 126].iter() {
        let loss = build(LossKind::SimClr, 64, Some(*cap));
        let x = Variable::from_tensor(embeddings(64, 0.0));
        let y = Variable::from_tensor(embeddings(64, 0.5));

        group.bench_with_input(BenchmarkId::from_parameter(cap), cap, |b, _| {
            b.iter(|| loss.forward(black_box(&x), black_box(&y)).unwrap());
        });
    }

    group.finish();
}

fn bench_forward_backward(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward_backward");

    for kind in LossKind::ALL {
        let loss = build(kind, 64, None);
        let x = embeddings(64, 0.0);
        let y = embeddings(64, 0.5);

        group.bench_function(kind.as_str(), |b| {
            b.iter(|| {
                let engine = AutogradEngine::new();
                let x = engine.variable(x.clone(), true);
                let y = engine.variable(y.clone(), true);
                let value = loss.forward(&x, &y).unwrap();
                engine.backward(&value).unwrap();
                engine.gradients(&x)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_forward, bench_simclr_subsampled, bench_forward_backward);
criterion_main!(benches);
