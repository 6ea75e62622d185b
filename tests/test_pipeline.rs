//! End-to-end pipeline scenarios.

#![allow(clippy::excessive_precision)]

use flowdsp::prelude::*;
use flowdsp::stage::{FftMode, FirSpec, IirSpec, Statistic};
use flowdsp::stft::TransformKind;

fn tau() -> f64 {
    core::f64::consts::TAU
}

#[test]
fn test_fir_lowpass_valid_convolution() {
    // Kernel [0.5, 0.5], batch mode, single channel.
    let mut p = Pipeline::<f64>::new();
    p.add_stage(StageConfig::Convolution {
        kernel: vec![0.5, 0.5],
        mode: ConvolutionMode::Batch,
    })
    .unwrap();
    let out = p.process(&[2.0, 4.0, 6.0, 8.0, 10.0], None, 1).unwrap();
    assert_eq!(out, vec![3.0, 5.0, 7.0, 9.0]);
}

#[test]
fn test_fir_moving_mode_ramp() {
    let mut p = Pipeline::<f64>::new();
    p.add_stage(StageConfig::Convolution {
        kernel: vec![0.5, 0.5],
        mode: ConvolutionMode::Moving,
    })
    .unwrap();
    let out = p.process(&[2.0, 4.0, 6.0, 8.0, 10.0], None, 1).unwrap();
    assert_eq!(out.len(), 5);
    assert_eq!(out[0], 0.0);
    assert_eq!(out[1], 3.0);
    assert_eq!(&out[2..], &[5.0, 7.0, 9.0]);
}

#[test]
fn test_nine_channel_fan() {
    let channels = 9;
    let per_channel = [2.0f64, 4.0, 6.0, 8.0, 10.0];
    let mut input = Vec::new();
    for &v in &per_channel {
        for _ in 0..channels {
            input.push(v);
        }
    }
    let mut p = Pipeline::<f64>::new();
    p.add_stage(StageConfig::Convolution {
        kernel: vec![0.5, 0.5],
        mode: ConvolutionMode::Batch,
    })
    .unwrap();
    let out = p.process(&input, None, channels).unwrap();
    assert_eq!(out.len(), 36);
    let expected = [3.0, 5.0, 7.0, 9.0];
    for (t, frame) in out.chunks_exact(channels).enumerate() {
        for &v in frame {
            assert_eq!(v, expected[t]);
        }
    }
}

#[test]
fn test_rfft_peak_detection() {
    // A 1024-sample 440 Hz sine at 44100 Hz peaks at bin
    // round(440 * 1024 / 44100) = 10 with magnitude well above 400.
    let sample_rate = 44100.0;
    let signal: Vec<f64> = (0..1024)
        .map(|i| (tau() * 440.0 * i as f64 / sample_rate).sin())
        .collect();
    let mut p = Pipeline::<f64>::with_config(PipelineConfig { sample_rate });
    p.add_stage(StageConfig::Fft {
        mode: FftMode::Batch,
        size: 1024,
        hop: None,
        transform: TransformKind::Real,
        output: SpectrumOutput::Magnitude,
        window: None,
    })
    .unwrap();
    let out = p.process(&signal, None, 1).unwrap();
    assert_eq!(out.len(), 513);
    let peak = out
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
        .unwrap()
        .0;
    assert_eq!(peak, 10);
    assert!(out[peak] >= 400.0);
    let frequencies = bin_frequencies(1024, sample_rate);
    assert!((frequencies[peak] - 440.0).abs() < sample_rate / 1024.0);
}

#[test]
fn test_split_process_with_save_load() {
    // 65536 samples of a 50 Hz sine at 10 kHz through FIR + RMS, processed
    // whole vs split in halves with a save/load between them.
    let sample_rate = 10_000.0;
    let signal: Vec<f64> = (0..65_536)
        .map(|i| (tau() * 50.0 * i as f64 / sample_rate).sin())
        .collect();
    let build = || {
        let mut p = Pipeline::<f64>::with_config(PipelineConfig { sample_rate });
        p.add_stage(StageConfig::Fir {
            spec: FirSpec::Lowpass {
                cutoff: 500.0,
                order: 32,
                window: WindowType::Hamming,
            },
        })
        .unwrap();
        p.add_stage(StageConfig::MovingStat {
            statistic: Statistic::Rms,
            window: WindowSpec::Count(128),
        })
        .unwrap();
        p
    };

    let mut whole = build();
    let reference = whole.process(&signal, None, 1).unwrap();

    let mut first = build();
    let mut out = first.process(&signal[..32_768], None, 1).unwrap();
    let blob = first.save_state().unwrap();

    let mut second = build();
    second.load_state(&blob).unwrap();
    out.extend(second.process(&signal[32_768..], None, 1).unwrap());

    assert_eq!(reference.len(), out.len());
    for (i, (a, b)) in reference.iter().zip(&out).enumerate() {
        assert!((a - b).abs() <= 1.0e-6, "sample {i}: {a} vs {b}");
    }
}

#[test]
fn test_corrupted_state_rollback() {
    let build = || {
        let mut p = Pipeline::<f64>::new();
        p.add_stage(StageConfig::Iir {
            spec: IirSpec::ButterworthLowpass { cutoff: 1200.0 },
        })
        .unwrap();
        p.add_stage(StageConfig::MovingStat {
            statistic: Statistic::Mean,
            window: WindowSpec::Count(8),
        })
        .unwrap();
        p
    };
    let warmup: Vec<f64> = (0..200).map(|i| (i as f64 * 0.05).sin()).collect();

    let mut p = build();
    p.process(&warmup, None, 1).unwrap();
    let mut reference = build();
    reference.process(&warmup, None, 1).unwrap();

    let mut blob = p.save_state().unwrap();
    blob[0] = 0x00;
    assert!(p.load_state(&blob).is_err());

    // 100 samples after the failed load match a pipeline never touched by it.
    let probe: Vec<f64> = (0..100).map(|i| (i as f64 * 0.21).cos()).collect();
    assert_eq!(
        p.process(&probe, None, 1).unwrap(),
        reference.process(&probe, None, 1).unwrap()
    );
}

#[test]
fn test_disposal_lifecycle() {
    let mut p = Pipeline::<f64>::new();
    p.add_stage(StageConfig::MovingStat {
        statistic: Statistic::Mean,
        window: WindowSpec::Count(4),
    })
    .unwrap();
    p.process(&[1.0, 2.0], None, 1).unwrap();

    p.dispose().unwrap();
    p.dispose().unwrap();
    p.dispose().unwrap();
    assert!(matches!(
        p.process(&[1.0], None, 1),
        Err(DspError::PipelineDisposed)
    ));
    assert!(matches!(p.save_state(), Err(DspError::PipelineDisposed)));
    assert!(matches!(p.clear_state(), Err(DspError::PipelineDisposed)));
}

#[test]
fn test_filter_bank_multiplies_channels() {
    let definitions = flowdsp::filterbank::design_bank::<f64>(
        BankScale::Mel,
        4,
        100.0,
        4000.0,
        16_000.0,
    )
    .unwrap();
    let mut p = Pipeline::<f64>::with_config(PipelineConfig {
        sample_rate: 16_000.0,
    });
    p.add_stage(StageConfig::FilterBank { definitions }).unwrap();
    let input: Vec<f64> = (0..64).map(|i| (i as f64 * 0.3).sin()).collect();
    // 32 stereo frames in, 32 frames of 2 * 4 channels out.
    let out = p.process(&input, None, 2).unwrap();
    assert_eq!(out.len(), 32 * 8);
}

#[test]
fn test_stage_fan_out_then_stats() {
    // STFT magnitudes flowing into a moving mean over each bin channel.
    let mut p = Pipeline::<f64>::new();
    p.add_stage(StageConfig::Fft {
        mode: FftMode::Moving,
        size: 32,
        hop: Some(16),
        transform: TransformKind::Real,
        output: SpectrumOutput::Magnitude,
        window: None,
    })
    .unwrap();
    p.add_stage(StageConfig::MovingStat {
        statistic: Statistic::Mean,
        window: WindowSpec::Count(4),
    })
    .unwrap();
    let input: Vec<f64> = (0..160).map(|i| (i as f64 * 0.17).sin()).collect();
    let out = p.process(&input, None, 1).unwrap();
    // Frames at samples 32, 48, ..., 160: 9 frames of 17 bins.
    assert_eq!(out.len(), 9 * 17);
    assert!(p.latency() >= 31);
}

#[test]
fn test_time_aware_window_expires() {
    let mut p = Pipeline::<f64>::new();
    p.add_stage(StageConfig::MovingStat {
        statistic: Statistic::Mean,
        window: WindowSpec::Duration {
            ms: 100.0,
            capacity: 64,
        },
    })
    .unwrap();
    let samples = [1.0f64, 2.0, 3.0];
    let times = [0.0, 50.0, 400.0];
    let out = p.process(&samples, Some(&times), 1).unwrap();
    // By t=400 both earlier samples have aged out of the 100 ms window.
    assert_eq!(out[2], 3.0);
}
