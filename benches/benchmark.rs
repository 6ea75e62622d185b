use criterion::{criterion_group, criterion_main, Criterion};

use flowdsp::prelude::*;
use flowdsp::stage::{FirSpec, Statistic};

fn signal(n: usize) -> Vec<f64> {
    (0..n).map(|i| (i as f64 * 0.01).sin()).collect()
}

fn fir_bench(c: &mut Criterion) {
    let coefs = flowdsp::fir::lowpass::<f64>(1000.0, 44100.0, 63, WindowType::Hamming).unwrap();
    let mut filter = FirFilter::new(coefs).unwrap();
    let input = signal(4096);
    let mut out = vec![0.0; 4096];
    c.bench_function("fir-64-tap-4096", |b| {
        b.iter(|| filter.filter_slice(&input, &mut out))
    });
}

fn biquad_bench(c: &mut Criterion) {
    let coefs = flowdsp::iir::butterworth_lowpass::<f64>(1000.0, 44100.0).unwrap();
    let mut filter = IirFilter::new(coefs).unwrap();
    let input = signal(4096);
    let mut out = vec![0.0; 4096];
    c.bench_function("biquad-4096", |b| {
        b.iter(|| filter.filter_slice(&input, &mut out))
    });
}

fn rfft_bench(c: &mut Criterion) {
    let mut engine = FftEngine::<f64>::new();
    let input = signal(2048);
    c.bench_function("rfft-2048", |b| b.iter(|| engine.rfft(&input).unwrap()));
}

fn pipeline_bench(c: &mut Criterion) {
    let mut pipeline = Pipeline::<f64>::new();
    pipeline
        .add_stage(StageConfig::Fir {
            spec: FirSpec::Lowpass {
                cutoff: 2000.0,
                order: 32,
                window: WindowType::Hamming,
            },
        })
        .unwrap()
        .add_stage(StageConfig::MovingStat {
            statistic: Statistic::Rms,
            window: WindowSpec::Count(128),
        })
        .unwrap();
    let input = signal(8192);
    c.bench_function("pipeline-fir-rms-8192", |b| {
        b.iter(|| pipeline.process(&input, None, 1).unwrap())
    });
}

criterion_group!(benches, fir_bench, biquad_bench, rfft_bench, pipeline_bench);
criterion_main!(benches);
