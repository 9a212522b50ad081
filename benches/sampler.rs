use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tickgate::sim::{SimClock, SyntheticOp};
use tickgate::{
    Accumulator, ContextSwitchTick, Operation, Sampler, SamplerConfig, SharedTick, Tsc,
};

fn bench_sampler(c: &mut Criterion) {
    let mut group = c.benchmark_group("sampler");
    group.sample_size(20);

    group.bench_function("null_op_tsc", |b| {
        b.iter(|| {
            // Sampler overhead floor on the real counter; small runs keep benches short.
            let sampler = Sampler::new(Tsc, ContextSwitchTick, SamplerConfig::new().samples(1_000));
            let report = sampler.run("null", || 0);
            black_box(report.accepted)
        });
    });

    group.bench_function("synthetic_rare_ticks", |b| {
        b.iter(|| {
            let clock = SimClock::new();
            let tick = SharedTick::new();
            let mut op = SyntheticOp::new(clock.clone(), tick.clone(), 500).flip_probability(0.001);
            let sampler = Sampler::new(&clock, &tick, SamplerConfig::new().samples(10_000).baseline(500));
            let report = sampler.run("synthetic", || op.invoke());
            black_box(report.rejected.tick_changed)
        });
    });

    group.finish();
}

fn bench_accumulator(c: &mut Criterion) {
    c.bench_function("accumulator_record", |b| {
        b.iter(|| {
            let mut acc = Accumulator::new(638);
            for i in 0..10_000u64 {
                acc.record(black_box(600 + i % 80));
            }
            black_box(acc.finalize().map(|s| s.variance).unwrap_or(0.0))
        });
    });
}

criterion_group!(benches, bench_sampler, bench_accumulator);
criterion_main!(benches);
