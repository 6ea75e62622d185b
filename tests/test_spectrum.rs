//! Transform-family properties: reconstruction, Parseval, moving-FFT
//! equivalence.

use flowdsp::prelude::*;
use flowdsp::stft::TransformKind;
use funutd::Rnd;
use num_complex::Complex;

fn random_signal(rnd: &mut Rnd, n: usize) -> Vec<f64> {
    (0..n).map(|_| rnd.f64() * 2.0 - 1.0).collect()
}

#[test]
fn test_fft_ifft_reconstruction_all_sizes() {
    let mut rnd = Rnd::from_u64(1);
    let mut engine = FftEngine::<f64>::new();
    for n in [2usize, 3, 5, 16, 27, 60, 100, 128, 343, 512, 1000, 4096] {
        let signal: Vec<Complex<f64>> = (0..n)
            .map(|_| Complex::new(rnd.f64() * 2.0 - 1.0, rnd.f64() * 2.0 - 1.0))
            .collect();
        let spectrum = engine.fft(&signal).unwrap();
        let restored = engine.ifft(&spectrum).unwrap();
        for (x, y) in signal.iter().zip(&restored) {
            assert!((x - y).norm() < 1.0e-5, "size {n}");
        }
    }
}

#[test]
fn test_rfft_irfft_reconstruction_all_sizes() {
    let mut rnd = Rnd::from_u64(2);
    let mut engine = FftEngine::<f64>::new();
    for n in [2usize, 4, 9, 30, 64, 121, 500, 1024, 8192] {
        let signal = random_signal(&mut rnd, n);
        let spectrum = engine.rfft(&signal).unwrap();
        assert_eq!(spectrum.len(), n / 2 + 1);
        let restored = engine.irfft(&spectrum, n).unwrap();
        for (x, y) in signal.iter().zip(&restored) {
            assert!((x - y).abs() < 1.0e-5, "size {n}");
        }
    }
}

#[test]
fn test_parseval_random_signals() {
    let mut rnd = Rnd::from_u64(3);
    let mut engine = FftEngine::<f64>::new();
    for n in [64usize, 256, 777, 2048] {
        let signal = random_signal(&mut rnd, n);
        let time_energy: f64 = signal.iter().map(|x| x * x).sum();
        let buffer: Vec<Complex<f64>> =
            signal.iter().map(|&x| Complex::new(x, 0.0)).collect();
        let spectrum = engine.fft(&buffer).unwrap();
        let freq_energy: f64 =
            spectrum.iter().map(|c| c.norm_sqr()).sum::<f64>() / n as f64;
        assert!(
            (time_energy - freq_energy).abs() / time_energy < 1.0e-4,
            "size {n}"
        );
    }
}

#[test]
fn test_moving_fft_equals_stft_kernel() {
    // A moving-mode FFT stage is bit-for-bit the windowed STFT kernel with
    // the same size, hop and Hann window.
    let mut rnd = Rnd::from_u64(4);
    let input = random_signal(&mut rnd, 700);
    let (size, hop) = (64, 16);

    let mut pipeline = Pipeline::<f64>::new();
    pipeline
        .add_stage(StageConfig::Fft {
            mode: flowdsp::stage::FftMode::Moving,
            size,
            hop: Some(hop),
            transform: TransformKind::Real,
            output: SpectrumOutput::Magnitude,
            window: None,
        })
        .unwrap();
    let stage_out = pipeline.process(&input, None, 1).unwrap();

    let mut stft = MovingFft::<f64>::new(
        size,
        hop,
        WindowType::Hann,
        TransformKind::Real,
        SpectrumOutput::Magnitude,
    )
    .unwrap();
    let mut kernel_out = Vec::new();
    stft.process(&input, |frame| kernel_out.extend_from_slice(frame))
        .unwrap();

    assert_eq!(stage_out.len(), kernel_out.len());
    for (a, b) in stage_out.iter().zip(&kernel_out) {
        assert!((a - b).abs() < 1.0e-6);
    }
}

#[test]
fn test_spectrum_output_modes_are_consistent() {
    let mut rnd = Rnd::from_u64(5);
    let input = random_signal(&mut rnd, 128);
    let run = |output| {
        let mut stft = MovingFft::<f64>::new(
            128,
            128,
            WindowType::Rectangular,
            TransformKind::Real,
            output,
        )
        .unwrap();
        let mut frames = Vec::new();
        stft.process(&input, |frame| frames.push(frame.to_vec()))
            .unwrap();
        frames.remove(0)
    };
    let magnitude = run(SpectrumOutput::Magnitude);
    let power = run(SpectrumOutput::Power);
    let complex = run(SpectrumOutput::Complex);
    assert_eq!(magnitude.len(), 65);
    assert_eq!(power.len(), 65);
    assert_eq!(complex.len(), 130);
    for k in 0..65 {
        assert!((magnitude[k] * magnitude[k] - power[k]).abs() < 1.0e-6);
        let re = complex[2 * k];
        let im = complex[2 * k + 1];
        assert!(((re * re + im * im) - power[k]).abs() < 1.0e-6);
    }
}

#[test]
fn test_dct_round_trip_and_energy() {
    let mut rnd = Rnd::from_u64(6);
    let dct = Dct::<f64>::new(64).unwrap();
    let input = random_signal(&mut rnd, 64);
    let transformed = dct.forward(&input).unwrap();
    let restored = dct.inverse(&transformed).unwrap();
    for (x, y) in input.iter().zip(&restored) {
        assert!((x - y).abs() < 1.0e-9);
    }
    let time: f64 = input.iter().map(|x| x * x).sum();
    let freq: f64 = transformed.iter().map(|x| x * x).sum();
    assert!((time - freq).abs() / time < 1.0e-9);
}

#[test]
fn test_batch_pool_agrees_with_engine() {
    let mut rnd = Rnd::from_u64(7);
    let pool = FftBatchProcessor::<f64>::new(FftBatchConfig::default());
    let mut engine = FftEngine::<f64>::new();
    let inputs: Vec<Vec<f64>> = (0..12).map(|_| random_signal(&mut rnd, 512)).collect();
    let jobs: Vec<FftJob<f64>> = inputs
        .iter()
        .map(|input| FftJob::ForwardReal {
            input: input.clone(),
        })
        .collect();
    let results = pool.run_batch(jobs);
    for (input, result) in inputs.iter().zip(results) {
        let expected = engine.rfft(input).unwrap();
        match result.unwrap() {
            flowdsp::batch::FftJobResult::Complex(bins) => {
                for (a, b) in bins.iter().zip(&expected) {
                    assert!((a - b).norm() < 1.0e-9);
                }
            }
            _ => panic!("expected complex bins"),
        }
    }
    // Resubmitting an identical batch is served from the cache.
    let repeat: Vec<FftJob<f64>> = inputs
        .iter()
        .map(|input| FftJob::ForwardReal {
            input: input.clone(),
        })
        .collect();
    pool.run_batch(repeat);
    assert!(pool.stats().hits >= 12);
}
