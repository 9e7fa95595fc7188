use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mj_rnndbn::model::{layer1_objective, layer2_objective};
use mj_rnndbn::rbm::sample_bernoulli;
use mj_rnndbn::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn minibatch(steps: usize, width: usize) -> Matrix {
    let mut rng = StdRng::seed_from_u64(1);
    let mut v = Matrix::replicate(0.05, steps, width);
    sample_bernoulli(&mut v, &mut rng);
    v
}

pub fn rnndbn_benchmark(c: &mut Criterion) {
    let model = RnnDbn::new(ModelConfiguration::default()).unwrap();
    let v = minibatch(100, model.n_visible());
    let mut rng = StdRng::seed_from_u64(2);

    c.bench_function("layer 1 CD-15 cost and gradient, 100 steps", |b| {
        b.iter(|| {
            layer1_objective(
                black_box(model.params()),
                model.config(),
                black_box(&v),
                &mut rng,
            )
            .unwrap()
        })
    });

    c.bench_function("layer 2 CD-15 cost and gradient, 100 steps", |b| {
        b.iter(|| {
            layer2_objective(
                black_box(model.params()),
                model.config(),
                black_box(&v),
                &mut rng,
            )
            .unwrap()
        })
    });

    let mut model = model;
    let mut group = c.benchmark_group("generation");
    group.sample_size(10);
    group.bench_function("generate 200 steps", |b| {
        b.iter(|| black_box(model.generate().unwrap()))
    });
    group.finish();
}

criterion_group!(benches, rnndbn_benchmark);
criterion_main!(benches);
