//! The uniform stage contract and typed stage configurations.
//!
//! A stage is a named, stateful unit consuming and producing interleaved
//! frames through an object-safe interface, so a pipeline can hold a
//! heterogeneous ordered list of them. Configuration is parsed into typed
//! records here at the boundary; the kernels never see dynamic parameter
//! maps.

use crate::codec::{StateReader, StateWriter};
use crate::convolve::{ConvolutionMode, Convolver, OverlapSave, FFT_CROSSOVER};
use crate::error::{DspError, Result};
use crate::filterbank::FilterBank;
use crate::fir::{self, FirCoefs, FirFilter};
use crate::iir::{self, IirCoefs, IirFilter};
use crate::matrix::MatrixTransform;
use crate::peaks::PeakDetector;
use crate::policy::{
    AnyPolicy, CmaPolicy, CounterPolicy, EmaPolicy, MavPolicy, MeanPolicy, PeakPolicy, RmsPolicy,
    SumPolicy, VariancePolicy, ZScorePolicy,
};
use crate::sliding::{SlidingFilter, WindowSpec};
use crate::stft::{MovingFft, SpectrumOutput, TransformKind};
use crate::window::WindowType;
use crate::Float;

/// Stage type tags. The numeric values are part of the persisted state
/// format and must not be reassigned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StageKind {
    MovingAverage = 1,
    MovingRms = 2,
    MovingVariance = 3,
    MovingMav = 4,
    MovingZScore = 5,
    MovingEma = 6,
    MovingCma = 7,
    MovingSum = 8,
    MovingCounter = 9,
    MovingPeak = 10,
    Fir = 20,
    Iir = 21,
    FilterBank = 22,
    Fft = 30,
    Convolution = 31,
    PeakDetector = 40,
    Lms = 41,
    Rls = 42,
    Matrix = 43,
}

impl StageKind {
    pub fn name(self) -> &'static str {
        match self {
            StageKind::MovingAverage => "movingAverage",
            StageKind::MovingRms => "movingRms",
            StageKind::MovingVariance => "movingVariance",
            StageKind::MovingMav => "movingMav",
            StageKind::MovingZScore => "movingZScore",
            StageKind::MovingEma => "movingEma",
            StageKind::MovingCma => "movingCma",
            StageKind::MovingSum => "movingSum",
            StageKind::MovingCounter => "movingCounter",
            StageKind::MovingPeak => "movingPeak",
            StageKind::Fir => "fir",
            StageKind::Iir => "iir",
            StageKind::FilterBank => "filterBank",
            StageKind::Fft => "fft",
            StageKind::Convolution => "convolution",
            StageKind::PeakDetector => "peakDetector",
            StageKind::Lms => "lms",
            StageKind::Rls => "rls",
            StageKind::Matrix => "matrix",
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => StageKind::MovingAverage,
            2 => StageKind::MovingRms,
            3 => StageKind::MovingVariance,
            4 => StageKind::MovingMav,
            5 => StageKind::MovingZScore,
            6 => StageKind::MovingEma,
            7 => StageKind::MovingCma,
            8 => StageKind::MovingSum,
            9 => StageKind::MovingCounter,
            10 => StageKind::MovingPeak,
            20 => StageKind::Fir,
            21 => StageKind::Iir,
            22 => StageKind::FilterBank,
            30 => StageKind::Fft,
            31 => StageKind::Convolution,
            40 => StageKind::PeakDetector,
            41 => StageKind::Lms,
            42 => StageKind::Rls,
            43 => StageKind::Matrix,
            _ => {
                return Err(DspError::StateCorrupted(format!(
                    "unknown stage tag {tag}"
                )))
            }
        })
    }
}

/// A stateful processing unit with a fixed channel contract after `init`.
pub trait Stage<F: Float>: Send {
    /// The stage's type tag.
    fn kind(&self) -> StageKind;

    /// Version of this stage's persisted state payload.
    fn version(&self) -> u16 {
        1
    }

    /// Reserve state for the given channel count and sample rate.
    /// Idempotent for unchanged parameters; changed parameters reallocate
    /// and reset.
    fn init(&mut self, channels: usize, sample_rate: f64) -> Result<()>;

    /// Whether `init` has run.
    fn is_initialized(&self) -> bool {
        self.input_channels() != 0
    }

    /// Input channel count; zero before `init`.
    fn input_channels(&self) -> usize;

    /// Output channel count; zero before `init`.
    fn output_channels(&self) -> usize;

    /// Output delay in frames.
    fn latency(&self) -> usize {
        0
    }

    /// Consume interleaved frames, appending interleaved output frames.
    /// `timestamps` holds one wall-clock millisecond value per input frame
    /// when present; stages that are not time-aware ignore it.
    fn process(
        &mut self,
        input: &[F],
        timestamps: Option<&[f64]>,
        out: &mut Vec<F>,
    ) -> Result<()>;

    /// Zero all streaming state.
    fn reset(&mut self);

    /// Write the state payload (channel count and streaming state).
    fn save_state(&self, w: &mut StateWriter);

    /// Restore a payload written by `save_state`. An uninitialized stage
    /// initializes itself from the payload's channel count and the given
    /// sample rate; an initialized stage rejects a mismatched layout.
    fn load_state(&mut self, r: &mut StateReader<'_>, sample_rate: f64) -> Result<()>;
}

// ============ Configuration records ============

/// Which sliding statistic a moving-window stage computes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Statistic {
    Mean,
    Rms,
    Variance,
    /// Mean absolute value.
    Mav,
    ZScore,
    /// Exponential moving average with the given smoothing factor.
    Ema { alpha: f64 },
    /// Cumulative moving average.
    Cma,
    Sum,
    Counter,
    /// Sliding maximum.
    Peak,
}

impl Statistic {
    fn kind(self) -> StageKind {
        match self {
            Statistic::Mean => StageKind::MovingAverage,
            Statistic::Rms => StageKind::MovingRms,
            Statistic::Variance => StageKind::MovingVariance,
            Statistic::Mav => StageKind::MovingMav,
            Statistic::ZScore => StageKind::MovingZScore,
            Statistic::Ema { .. } => StageKind::MovingEma,
            Statistic::Cma => StageKind::MovingCma,
            Statistic::Sum => StageKind::MovingSum,
            Statistic::Counter => StageKind::MovingCounter,
            Statistic::Peak => StageKind::MovingPeak,
        }
    }

    fn policy(self) -> Result<AnyPolicy> {
        Ok(match self {
            Statistic::Mean => AnyPolicy::Mean(MeanPolicy::default()),
            Statistic::Rms => AnyPolicy::Rms(RmsPolicy::default()),
            Statistic::Variance => AnyPolicy::Variance(VariancePolicy::default()),
            Statistic::Mav => AnyPolicy::Mav(MavPolicy::default()),
            Statistic::ZScore => AnyPolicy::ZScore(ZScorePolicy::default()),
            Statistic::Ema { alpha } => AnyPolicy::Ema(EmaPolicy::new(alpha)?),
            Statistic::Cma => AnyPolicy::Cma(CmaPolicy::default()),
            Statistic::Sum => AnyPolicy::Sum(SumPolicy::default()),
            Statistic::Counter => AnyPolicy::Counter(CounterPolicy::default()),
            Statistic::Peak => AnyPolicy::Peak(PeakPolicy::default()),
        })
    }
}

/// FIR stage coefficients: literal taps or a windowed-sinc design resolved
/// against the pipeline sample rate at `init`.
#[derive(Clone, Debug)]
pub enum FirSpec<F: Float> {
    Taps(Vec<F>),
    Lowpass {
        cutoff: f64,
        order: usize,
        window: WindowType,
    },
    Highpass {
        cutoff: f64,
        order: usize,
        window: WindowType,
    },
    Bandpass {
        low: f64,
        high: f64,
        order: usize,
        window: WindowType,
    },
    Bandstop {
        low: f64,
        high: f64,
        order: usize,
        window: WindowType,
    },
}

impl<F: Float> FirSpec<F> {
    fn resolve(&self, sample_rate: f64) -> Result<FirCoefs<F>> {
        match self {
            FirSpec::Taps(taps) => FirCoefs::new(taps.clone()),
            FirSpec::Lowpass {
                cutoff,
                order,
                window,
            } => fir::lowpass(*cutoff, sample_rate, *order, *window),
            FirSpec::Highpass {
                cutoff,
                order,
                window,
            } => fir::highpass(*cutoff, sample_rate, *order, *window),
            FirSpec::Bandpass {
                low,
                high,
                order,
                window,
            } => fir::bandpass(*low, *high, sample_rate, *order, *window),
            FirSpec::Bandstop {
                low,
                high,
                order,
                window,
            } => fir::bandstop(*low, *high, sample_rate, *order, *window),
        }
    }
}

/// IIR stage coefficients: literal transfer function or a designer resolved
/// against the pipeline sample rate at `init`.
#[derive(Clone, Debug)]
pub enum IirSpec<F: Float> {
    /// Numerator and denominator, `a[0]` leading.
    Transfer { b: Vec<F>, a: Vec<F> },
    FirstOrderLowpass { cutoff: f64 },
    FirstOrderHighpass { cutoff: f64 },
    ButterworthLowpass { cutoff: f64 },
    ButterworthHighpass { cutoff: f64 },
    ButterworthBandpass { low: f64, high: f64 },
    ChebyshevLowpass { cutoff: f64, ripple_db: f64 },
    ChebyshevHighpass { cutoff: f64, ripple_db: f64 },
    ChebyshevBandpass { low: f64, high: f64, ripple_db: f64 },
    PeakingEq { frequency: f64, gain_db: f64, q: f64 },
    LowShelf { frequency: f64, gain_db: f64, q: f64 },
    HighShelf { frequency: f64, gain_db: f64, q: f64 },
    Resonator { center: f64, bandwidth: f64 },
    DcBlocker { cutoff: f64 },
}

impl<F: Float> IirSpec<F> {
    fn resolve(&self, sample_rate: f64) -> Result<IirCoefs<F>> {
        match self {
            IirSpec::Transfer { b, a } => IirCoefs::from_transfer(b.clone(), a.clone()),
            IirSpec::FirstOrderLowpass { cutoff } => {
                iir::first_order_lowpass(*cutoff, sample_rate)
            }
            IirSpec::FirstOrderHighpass { cutoff } => {
                iir::first_order_highpass(*cutoff, sample_rate)
            }
            IirSpec::ButterworthLowpass { cutoff } => {
                iir::butterworth_lowpass(*cutoff, sample_rate)
            }
            IirSpec::ButterworthHighpass { cutoff } => {
                iir::butterworth_highpass(*cutoff, sample_rate)
            }
            IirSpec::ButterworthBandpass { low, high } => {
                iir::butterworth_bandpass(*low, *high, sample_rate)
            }
            IirSpec::ChebyshevLowpass { cutoff, ripple_db } => {
                iir::chebyshev_lowpass(*cutoff, sample_rate, *ripple_db)
            }
            IirSpec::ChebyshevHighpass { cutoff, ripple_db } => {
                iir::chebyshev_highpass(*cutoff, sample_rate, *ripple_db)
            }
            IirSpec::ChebyshevBandpass {
                low,
                high,
                ripple_db,
            } => iir::chebyshev_bandpass(*low, *high, sample_rate, *ripple_db),
            IirSpec::PeakingEq {
                frequency,
                gain_db,
                q,
            } => iir::peaking_eq(*frequency, *gain_db, *q, sample_rate),
            IirSpec::LowShelf {
                frequency,
                gain_db,
                q,
            } => iir::low_shelf(*frequency, *gain_db, *q, sample_rate),
            IirSpec::HighShelf {
                frequency,
                gain_db,
                q,
            } => iir::high_shelf(*frequency, *gain_db, *q, sample_rate),
            IirSpec::Resonator { center, bandwidth } => {
                iir::resonator(*center, *bandwidth, sample_rate)
            }
            IirSpec::DcBlocker { cutoff } => iir::dc_blocker(*cutoff, sample_rate),
        }
    }
}

/// Whether an FFT stage transforms fixed blocks or slides with a hop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FftMode {
    /// Non-overlapping blocks with a rectangular window.
    Batch,
    /// Hopping analysis window.
    Moving,
}

/// Typed stage configuration. One record per stage type; discrete choices
/// are enums so unknown parameters cannot exist past this boundary.
#[derive(Clone, Debug)]
pub enum StageConfig<F: Float> {
    /// Policy-driven sliding statistic over each channel.
    MovingStat {
        statistic: Statistic,
        window: WindowSpec,
    },
    Fir {
        spec: FirSpec<F>,
    },
    Iir {
        spec: IirSpec<F>,
    },
    Fft {
        mode: FftMode,
        size: usize,
        /// Defaults to `size` in batch mode and `size / 2` in moving mode.
        hop: Option<usize>,
        transform: TransformKind,
        output: SpectrumOutput,
        /// Defaults to rectangular in batch mode and Hann in moving mode.
        window: Option<WindowType>,
    },
    Convolution {
        kernel: Vec<F>,
        mode: ConvolutionMode,
    },
    FilterBank {
        definitions: Vec<IirCoefs<F>>,
    },
    PeakDetector {
        window: usize,
        threshold: F,
        min_distance: usize,
    },
    /// LMS/NLMS over channel pairs `(signal, desired)`.
    Lms {
        taps: usize,
        mu: f64,
        leak: f64,
        normalized: bool,
    },
    /// RLS over channel pairs `(signal, desired)`.
    Rls {
        taps: usize,
        lambda: f64,
        delta: f64,
    },
    /// Trained matrix transform `y = M (x - mean)`.
    Matrix {
        transform: MatrixTransform<F>,
    },
}

impl<F: Float + 'static> StageConfig<F> {
    /// Validate the record and build the stage.
    pub fn build(self) -> Result<Box<dyn Stage<F>>> {
        Ok(match self {
            StageConfig::MovingStat { statistic, window } => {
                // Validate the pair now so bad parameters fail at add time.
                SlidingFilter::<F, AnyPolicy>::new(window, statistic.policy()?)?;
                Box::new(MovingStatStage::new(statistic, window))
            }
            StageConfig::Fir { spec } => {
                if let FirSpec::Taps(taps) = &spec {
                    FirCoefs::new(taps.clone())?;
                }
                Box::new(FirStage::new(spec))
            }
            StageConfig::Iir { spec } => {
                if let IirSpec::Transfer { b, a } = &spec {
                    IirCoefs::from_transfer(b.clone(), a.clone())?;
                }
                Box::new(IirStage::new(spec))
            }
            StageConfig::Fft {
                mode,
                size,
                hop,
                transform,
                output,
                window,
            } => {
                let (hop, window) = match mode {
                    FftMode::Batch => (
                        hop.unwrap_or(size),
                        window.unwrap_or(WindowType::Rectangular),
                    ),
                    FftMode::Moving => (
                        hop.unwrap_or_else(|| (size / 2).max(1)),
                        window.unwrap_or(WindowType::Hann),
                    ),
                };
                // Validate the parameters with a throwaway instance.
                MovingFft::<F>::new(size, hop, window, transform, output)?;
                Box::new(FftStage::new(size, hop, window, transform, output))
            }
            StageConfig::Convolution { kernel, mode } => {
                Convolver::new(kernel.clone(), mode)?;
                Box::new(ConvolutionStage::new(kernel, mode))
            }
            StageConfig::FilterBank { definitions } => {
                let bank = FilterBank::new(definitions.clone())?;
                Box::new(FilterBankStage {
                    definitions,
                    bank,
                    channels: 0,
                })
            }
            StageConfig::PeakDetector {
                window,
                threshold,
                min_distance,
            } => {
                PeakDetector::new(window, threshold, min_distance)?;
                Box::new(PeakStage::new(window, threshold, min_distance))
            }
            StageConfig::Lms {
                taps,
                mu,
                leak,
                normalized,
            } => {
                crate::adaptive::LmsFilter::<F>::new(taps, mu, leak, normalized)?;
                Box::new(LmsStage::new(taps, mu, leak, normalized))
            }
            StageConfig::Rls {
                taps,
                lambda,
                delta,
            } => {
                crate::adaptive::RlsFilter::<F>::new(taps, lambda, delta)?;
                Box::new(RlsStage::new(taps, lambda, delta))
            }
            StageConfig::Matrix { transform } => Box::new(MatrixStage::new(transform)),
        })
    }
}

// ============ Shared helpers ============

fn check_shape<F>(input: &[F], channels: usize) -> Result<usize> {
    if channels == 0 {
        return Err(DspError::invalid("stage not initialized"));
    }
    if input.len() % channels != 0 {
        return Err(DspError::ShapeMismatch(format!(
            "input length {} not a multiple of {} channels",
            input.len(),
            channels
        )));
    }
    Ok(input.len() / channels)
}

fn read_channels(r: &mut StateReader<'_>) -> Result<usize> {
    Ok(r.read_u16()? as usize)
}

/// Interleave equal-length per-channel buffers.
fn interleave<F: Float>(per_channel: &[Vec<F>], out: &mut Vec<F>) -> Result<()> {
    let frames = per_channel[0].len();
    for channel in per_channel {
        if channel.len() != frames {
            return Err(DspError::Numerical(
                "channels fell out of step".into(),
            ));
        }
    }
    for t in 0..frames {
        for channel in per_channel {
            out.push(channel[t]);
        }
    }
    Ok(())
}

// ============ Moving statistic stage ============

struct MovingStatStage<F: Float> {
    statistic: Statistic,
    window: WindowSpec,
    filters: Vec<SlidingFilter<F, AnyPolicy>>,
    channels: usize,
}

impl<F: Float> MovingStatStage<F> {
    fn new(statistic: Statistic, window: WindowSpec) -> Self {
        Self {
            statistic,
            window,
            filters: Vec::new(),
            channels: 0,
        }
    }
}

impl<F: Float> Stage<F> for MovingStatStage<F> {
    fn kind(&self) -> StageKind {
        self.statistic.kind()
    }

    fn init(&mut self, channels: usize, _sample_rate: f64) -> Result<()> {
        if channels == 0 {
            return Err(DspError::invalid("channel count must be nonzero"));
        }
        if self.channels == channels {
            return Ok(());
        }
        let mut filters = Vec::with_capacity(channels);
        for _ in 0..channels {
            filters.push(SlidingFilter::new(self.window, self.statistic.policy()?)?);
        }
        self.filters = filters;
        self.channels = channels;
        Ok(())
    }

    fn input_channels(&self) -> usize {
        self.channels
    }

    fn output_channels(&self) -> usize {
        self.channels
    }

    fn process(
        &mut self,
        input: &[F],
        timestamps: Option<&[f64]>,
        out: &mut Vec<F>,
    ) -> Result<()> {
        check_shape(input, self.channels)?;
        for (t, frame) in input.chunks_exact(self.channels).enumerate() {
            let time = timestamps.map(|ts| ts[t]);
            for (c, &x) in frame.iter().enumerate() {
                out.push(self.filters[c].add(x, time));
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        for filter in &mut self.filters {
            filter.reset();
        }
    }

    fn save_state(&self, w: &mut StateWriter) {
        w.write_u16(self.channels as u16);
        for filter in &self.filters {
            let mut state = Vec::with_capacity(filter.state_len());
            filter.save(&mut state);
            w.write_f64_slice(&state);
        }
    }

    fn load_state(&mut self, r: &mut StateReader<'_>, sample_rate: f64) -> Result<()> {
        let channels = read_channels(r)?;
        if self.channels == 0 && channels != 0 {
            self.init(channels, sample_rate)?;
        } else if self.channels != channels {
            return Err(DspError::StateMismatch(format!(
                "{} stage has {} channels, payload has {channels}",
                self.kind().name(),
                self.channels
            )));
        }
        let mut restored = self.filters.clone();
        for filter in &mut restored {
            let state = r.read_f64_slice()?;
            filter.load(&state)?;
        }
        self.filters = restored;
        Ok(())
    }
}

// ============ FIR stage ============

enum FirBackend<F: Float> {
    Direct(Vec<FirFilter<F>>),
    Fft(Vec<OverlapSave<F>>),
}

struct FirStage<F: Float> {
    spec: FirSpec<F>,
    backend: Option<FirBackend<F>>,
    channels: usize,
    sample_rate: f64,
    latency: usize,
}

impl<F: Float> FirStage<F> {
    fn new(spec: FirSpec<F>) -> Self {
        Self {
            spec,
            backend: None,
            channels: 0,
            sample_rate: 0.0,
            latency: 0,
        }
    }
}

impl<F: Float> Stage<F> for FirStage<F> {
    fn kind(&self) -> StageKind {
        StageKind::Fir
    }

    fn init(&mut self, channels: usize, sample_rate: f64) -> Result<()> {
        if channels == 0 {
            return Err(DspError::invalid("channel count must be nonzero"));
        }
        if self.channels == channels && self.sample_rate == sample_rate {
            return Ok(());
        }
        let coefs = self.spec.resolve(sample_rate)?;
        // Long filters run through block FFTs.
        let backend = if coefs.len() > FFT_CROSSOVER {
            let mut engines = Vec::with_capacity(channels);
            for _ in 0..channels {
                engines.push(OverlapSave::new(coefs.taps(), false)?);
            }
            self.latency = engines[0].latency();
            FirBackend::Fft(engines)
        } else {
            let mut filters = Vec::with_capacity(channels);
            for _ in 0..channels {
                filters.push(FirFilter::new(coefs.clone())?);
            }
            self.latency = 0;
            FirBackend::Direct(filters)
        };
        self.backend = Some(backend);
        self.channels = channels;
        self.sample_rate = sample_rate;
        Ok(())
    }

    fn input_channels(&self) -> usize {
        self.channels
    }

    fn output_channels(&self) -> usize {
        self.channels
    }

    fn latency(&self) -> usize {
        self.latency
    }

    fn process(
        &mut self,
        input: &[F],
        _timestamps: Option<&[f64]>,
        out: &mut Vec<F>,
    ) -> Result<()> {
        let frames = check_shape(input, self.channels)?;
        match self.backend.as_mut() {
            Some(FirBackend::Direct(filters)) => {
                for frame in input.chunks_exact(self.channels) {
                    for (c, &x) in frame.iter().enumerate() {
                        out.push(filters[c].filter(x));
                    }
                }
                Ok(())
            }
            Some(FirBackend::Fft(engines)) => {
                let mut per_channel: Vec<Vec<F>> = vec![Vec::new(); self.channels];
                for c in 0..self.channels {
                    let deinterleaved: Vec<F> =
                        (0..frames).map(|t| input[t * self.channels + c]).collect();
                    engines[c].process(&deinterleaved, &mut per_channel[c])?;
                }
                interleave(&per_channel, out)
            }
            None => Err(DspError::invalid("stage not initialized")),
        }
    }

    fn reset(&mut self) {
        match self.backend.as_mut() {
            Some(FirBackend::Direct(filters)) => {
                for filter in filters {
                    filter.reset();
                }
            }
            Some(FirBackend::Fft(engines)) => {
                for engine in engines {
                    engine.reset();
                }
            }
            None => {}
        }
    }

    fn save_state(&self, w: &mut StateWriter) {
        w.write_u16(self.channels as u16);
        w.write_f64(self.sample_rate);
        match &self.backend {
            Some(FirBackend::Direct(filters)) => {
                for filter in filters {
                    let mut state = Vec::with_capacity(filter.state_len());
                    filter.save(&mut state);
                    w.write_f64_slice(&state);
                }
            }
            Some(FirBackend::Fft(engines)) => {
                for engine in engines {
                    let mut state = Vec::with_capacity(engine.state_len());
                    engine.save(&mut state);
                    w.write_f64_slice(&state);
                }
            }
            None => {}
        }
    }

    fn load_state(&mut self, r: &mut StateReader<'_>, sample_rate: f64) -> Result<()> {
        let channels = read_channels(r)?;
        let saved_rate = r.read_f64()?;
        if self.channels == 0 && channels != 0 {
            let rate = if saved_rate > 0.0 { saved_rate } else { sample_rate };
            self.init(channels, rate)?;
        } else if self.channels != channels {
            return Err(DspError::StateMismatch(format!(
                "fir stage has {} channels, payload has {channels}",
                self.channels
            )));
        }
        if self.channels == 0 {
            // Payload from a never-initialized stage carries no filter state.
            return Ok(());
        }
        match self.backend.as_mut() {
            Some(FirBackend::Direct(filters)) => {
                let mut restored = filters.clone();
                for filter in &mut restored {
                    let state = r.read_f64_slice()?;
                    filter.load(&state)?;
                }
                *filters = restored;
                Ok(())
            }
            Some(FirBackend::Fft(engines)) => {
                for engine in engines.iter_mut() {
                    let state = r.read_f64_slice()?;
                    engine.load(&state)?;
                }
                Ok(())
            }
            None => Err(DspError::invalid("stage not initialized")),
        }
    }
}

// ============ IIR stage ============

struct IirStage<F: Float> {
    spec: IirSpec<F>,
    filters: Vec<IirFilter<F>>,
    channels: usize,
    sample_rate: f64,
}

impl<F: Float> IirStage<F> {
    fn new(spec: IirSpec<F>) -> Self {
        Self {
            spec,
            filters: Vec::new(),
            channels: 0,
            sample_rate: 0.0,
        }
    }
}

impl<F: Float> Stage<F> for IirStage<F> {
    fn kind(&self) -> StageKind {
        StageKind::Iir
    }

    fn init(&mut self, channels: usize, sample_rate: f64) -> Result<()> {
        if channels == 0 {
            return Err(DspError::invalid("channel count must be nonzero"));
        }
        if self.channels == channels && self.sample_rate == sample_rate {
            return Ok(());
        }
        let coefs = self.spec.resolve(sample_rate)?;
        let mut filters = Vec::with_capacity(channels);
        for _ in 0..channels {
            filters.push(IirFilter::new(coefs.clone())?);
        }
        self.filters = filters;
        self.channels = channels;
        self.sample_rate = sample_rate;
        Ok(())
    }

    fn input_channels(&self) -> usize {
        self.channels
    }

    fn output_channels(&self) -> usize {
        self.channels
    }

    fn process(
        &mut self,
        input: &[F],
        _timestamps: Option<&[f64]>,
        out: &mut Vec<F>,
    ) -> Result<()> {
        check_shape(input, self.channels)?;
        for frame in input.chunks_exact(self.channels) {
            for (c, &x) in frame.iter().enumerate() {
                out.push(self.filters[c].filter(x));
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        for filter in &mut self.filters {
            filter.reset();
        }
    }

    fn save_state(&self, w: &mut StateWriter) {
        w.write_u16(self.channels as u16);
        w.write_f64(self.sample_rate);
        for filter in &self.filters {
            let mut state = Vec::with_capacity(filter.state_len());
            filter.save(&mut state);
            w.write_f64_slice(&state);
        }
    }

    fn load_state(&mut self, r: &mut StateReader<'_>, sample_rate: f64) -> Result<()> {
        let channels = read_channels(r)?;
        let saved_rate = r.read_f64()?;
        if self.channels == 0 && channels != 0 {
            let rate = if saved_rate > 0.0 { saved_rate } else { sample_rate };
            self.init(channels, rate)?;
        } else if self.channels != channels {
            return Err(DspError::StateMismatch(format!(
                "iir stage has {} channels, payload has {channels}",
                self.channels
            )));
        }
        let mut restored = self.filters.clone();
        for filter in &mut restored {
            let state = r.read_f64_slice()?;
            filter.load(&state)?;
        }
        self.filters = restored;
        Ok(())
    }
}

// ============ FFT stage ============

struct FftStage<F: Float> {
    size: usize,
    hop: usize,
    window: WindowType,
    transform: TransformKind,
    output: SpectrumOutput,
    ffts: Vec<MovingFft<F>>,
    /// Per-channel frame assembly buffers.
    scratch: Vec<Vec<F>>,
    channels: usize,
}

impl<F: Float> FftStage<F> {
    fn new(
        size: usize,
        hop: usize,
        window: WindowType,
        transform: TransformKind,
        output: SpectrumOutput,
    ) -> Self {
        Self {
            size,
            hop,
            window,
            transform,
            output,
            ffts: Vec::new(),
            scratch: Vec::new(),
            channels: 0,
        }
    }
}

impl<F: Float> Stage<F> for FftStage<F> {
    fn kind(&self) -> StageKind {
        StageKind::Fft
    }

    fn init(&mut self, channels: usize, _sample_rate: f64) -> Result<()> {
        if channels == 0 {
            return Err(DspError::invalid("channel count must be nonzero"));
        }
        if self.channels == channels {
            return Ok(());
        }
        let mut ffts = Vec::with_capacity(channels);
        for _ in 0..channels {
            ffts.push(MovingFft::new(
                self.size,
                self.hop,
                self.window,
                self.transform,
                self.output,
            )?);
        }
        self.ffts = ffts;
        self.scratch = vec![Vec::new(); channels];
        self.channels = channels;
        Ok(())
    }

    fn input_channels(&self) -> usize {
        self.channels
    }

    /// Spectral bins fan out as additional channels per input channel.
    fn output_channels(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.channels * self.ffts[0].frame_len()
    }

    fn latency(&self) -> usize {
        self.size - 1
    }

    fn process(
        &mut self,
        input: &[F],
        _timestamps: Option<&[f64]>,
        out: &mut Vec<F>,
    ) -> Result<()> {
        let frames = check_shape(input, self.channels)?;
        let channels = self.channels;
        let ffts = &mut self.ffts;
        let scratch = &mut self.scratch;
        for t in 0..frames {
            let mut emitted = false;
            for c in 0..channels {
                let slot = &mut scratch[c];
                ffts[c].process(&input[t * channels + c..t * channels + c + 1], |frame| {
                    slot.clear();
                    slot.extend_from_slice(frame);
                    emitted = true;
                })?;
            }
            // Every channel shares the hop cadence, so emission is all-or-none
            // within a frame.
            if emitted {
                for slot in scratch.iter() {
                    out.extend_from_slice(slot);
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        for fft in &mut self.ffts {
            fft.reset();
        }
    }

    fn save_state(&self, w: &mut StateWriter) {
        w.write_u16(self.channels as u16);
        for fft in &self.ffts {
            let mut state = Vec::with_capacity(fft.state_len());
            fft.save(&mut state);
            w.write_f64_slice(&state);
        }
    }

    fn load_state(&mut self, r: &mut StateReader<'_>, sample_rate: f64) -> Result<()> {
        let channels = read_channels(r)?;
        if self.channels == 0 && channels != 0 {
            self.init(channels, sample_rate)?;
        } else if self.channels != channels {
            return Err(DspError::StateMismatch(format!(
                "fft stage has {} channels, payload has {channels}",
                self.channels
            )));
        }
        for fft in self.ffts.iter_mut() {
            let state = r.read_f64_slice()?;
            fft.load(&state)?;
        }
        Ok(())
    }
}

// ============ Convolution stage ============

struct ConvolutionStage<F: Float> {
    kernel: Vec<F>,
    mode: ConvolutionMode,
    convolvers: Vec<Convolver<F>>,
    channels: usize,
}

impl<F: Float> ConvolutionStage<F> {
    fn new(kernel: Vec<F>, mode: ConvolutionMode) -> Self {
        Self {
            kernel,
            mode,
            convolvers: Vec::new(),
            channels: 0,
        }
    }
}

impl<F: Float> Stage<F> for ConvolutionStage<F> {
    fn kind(&self) -> StageKind {
        StageKind::Convolution
    }

    fn init(&mut self, channels: usize, _sample_rate: f64) -> Result<()> {
        if channels == 0 {
            return Err(DspError::invalid("channel count must be nonzero"));
        }
        if self.channels == channels {
            return Ok(());
        }
        let mut convolvers = Vec::with_capacity(channels);
        for _ in 0..channels {
            convolvers.push(Convolver::new(self.kernel.clone(), self.mode)?);
        }
        self.convolvers = convolvers;
        self.channels = channels;
        Ok(())
    }

    fn input_channels(&self) -> usize {
        self.channels
    }

    fn output_channels(&self) -> usize {
        self.channels
    }

    fn latency(&self) -> usize {
        self.convolvers.first().map_or(0, |c| c.latency())
    }

    fn process(
        &mut self,
        input: &[F],
        _timestamps: Option<&[f64]>,
        out: &mut Vec<F>,
    ) -> Result<()> {
        let frames = check_shape(input, self.channels)?;
        let mut per_channel: Vec<Vec<F>> = vec![Vec::new(); self.channels];
        for c in 0..self.channels {
            let deinterleaved: Vec<F> =
                (0..frames).map(|t| input[t * self.channels + c]).collect();
            self.convolvers[c].process(&deinterleaved, &mut per_channel[c])?;
        }
        interleave(&per_channel, out)
    }

    fn reset(&mut self) {
        for convolver in &mut self.convolvers {
            convolver.reset();
        }
    }

    fn save_state(&self, w: &mut StateWriter) {
        w.write_u16(self.channels as u16);
        for convolver in &self.convolvers {
            let mut state = Vec::with_capacity(convolver.state_len());
            convolver.save(&mut state);
            w.write_f64_slice(&state);
        }
    }

    fn load_state(&mut self, r: &mut StateReader<'_>, sample_rate: f64) -> Result<()> {
        let channels = read_channels(r)?;
        if self.channels == 0 && channels != 0 {
            self.init(channels, sample_rate)?;
        } else if self.channels != channels {
            return Err(DspError::StateMismatch(format!(
                "convolution stage has {} channels, payload has {channels}",
                self.channels
            )));
        }
        for convolver in self.convolvers.iter_mut() {
            let state = r.read_f64_slice()?;
            convolver.load(&state)?;
        }
        Ok(())
    }
}

// ============ Filter bank stage ============

struct FilterBankStage<F: Float> {
    definitions: Vec<IirCoefs<F>>,
    bank: FilterBank<F>,
    channels: usize,
}

impl<F: Float> Stage<F> for FilterBankStage<F> {
    fn kind(&self) -> StageKind {
        StageKind::FilterBank
    }

    fn init(&mut self, channels: usize, _sample_rate: f64) -> Result<()> {
        self.bank.init(channels)?;
        self.channels = channels;
        Ok(())
    }

    fn input_channels(&self) -> usize {
        self.channels
    }

    fn output_channels(&self) -> usize {
        self.channels * self.definitions.len()
    }

    fn process(
        &mut self,
        input: &[F],
        _timestamps: Option<&[f64]>,
        out: &mut Vec<F>,
    ) -> Result<()> {
        check_shape(input, self.channels)?;
        self.bank.process(input, out)
    }

    fn reset(&mut self) {
        self.bank.reset();
    }

    fn save_state(&self, w: &mut StateWriter) {
        w.write_u16(self.channels as u16);
        let mut state = Vec::with_capacity(self.bank.state_len());
        self.bank.save(&mut state);
        w.write_f64_slice(&state);
    }

    fn load_state(&mut self, r: &mut StateReader<'_>, sample_rate: f64) -> Result<()> {
        let channels = read_channels(r)?;
        if self.channels == 0 && channels != 0 {
            self.init(channels, sample_rate)?;
        } else if self.channels != channels {
            return Err(DspError::StateMismatch(format!(
                "filterBank stage has {} channels, payload has {channels}",
                self.channels
            )));
        }
        let state = r.read_f64_slice()?;
        self.bank.load(&state)
    }
}

// ============ Peak detector stage ============

struct PeakStage<F: Float> {
    window: usize,
    threshold: F,
    min_distance: usize,
    detectors: Vec<PeakDetector<F>>,
    channels: usize,
}

impl<F: Float> PeakStage<F> {
    fn new(window: usize, threshold: F, min_distance: usize) -> Self {
        Self {
            window,
            threshold,
            min_distance,
            detectors: Vec::new(),
            channels: 0,
        }
    }
}

impl<F: Float> Stage<F> for PeakStage<F> {
    fn kind(&self) -> StageKind {
        StageKind::PeakDetector
    }

    fn init(&mut self, channels: usize, _sample_rate: f64) -> Result<()> {
        if channels == 0 {
            return Err(DspError::invalid("channel count must be nonzero"));
        }
        if self.channels == channels {
            return Ok(());
        }
        let mut detectors = Vec::with_capacity(channels);
        for _ in 0..channels {
            detectors.push(PeakDetector::new(
                self.window,
                self.threshold,
                self.min_distance,
            )?);
        }
        self.detectors = detectors;
        self.channels = channels;
        Ok(())
    }

    fn input_channels(&self) -> usize {
        self.channels
    }

    fn output_channels(&self) -> usize {
        self.channels
    }

    fn latency(&self) -> usize {
        self.window / 2
    }

    fn process(
        &mut self,
        input: &[F],
        _timestamps: Option<&[f64]>,
        out: &mut Vec<F>,
    ) -> Result<()> {
        check_shape(input, self.channels)?;
        for frame in input.chunks_exact(self.channels) {
            for (c, &x) in frame.iter().enumerate() {
                out.push(self.detectors[c].push(x));
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        for detector in &mut self.detectors {
            detector.reset();
        }
    }

    fn save_state(&self, w: &mut StateWriter) {
        w.write_u16(self.channels as u16);
        for detector in &self.detectors {
            let mut state = Vec::with_capacity(detector.state_len());
            detector.save(&mut state);
            w.write_f64_slice(&state);
        }
    }

    fn load_state(&mut self, r: &mut StateReader<'_>, sample_rate: f64) -> Result<()> {
        let channels = read_channels(r)?;
        if self.channels == 0 && channels != 0 {
            self.init(channels, sample_rate)?;
        } else if self.channels != channels {
            return Err(DspError::StateMismatch(format!(
                "peakDetector stage has {} channels, payload has {channels}",
                self.channels
            )));
        }
        for detector in self.detectors.iter_mut() {
            let state = r.read_f64_slice()?;
            detector.load(&state)?;
        }
        Ok(())
    }
}

// ============ Adaptive stages ============

struct LmsStage<F: Float> {
    taps: usize,
    mu: f64,
    leak: f64,
    normalized: bool,
    filters: Vec<crate::adaptive::LmsFilter<F>>,
    channels: usize,
}

impl<F: Float> LmsStage<F> {
    fn new(taps: usize, mu: f64, leak: f64, normalized: bool) -> Self {
        Self {
            taps,
            mu,
            leak,
            normalized,
            filters: Vec::new(),
            channels: 0,
        }
    }
}

impl<F: Float> Stage<F> for LmsStage<F> {
    fn kind(&self) -> StageKind {
        StageKind::Lms
    }

    fn init(&mut self, channels: usize, _sample_rate: f64) -> Result<()> {
        if channels == 0 || channels % 2 != 0 {
            return Err(DspError::invalid(
                "adaptive stages take (signal, desired) channel pairs",
            ));
        }
        if self.channels == channels {
            return Ok(());
        }
        let mut filters = Vec::with_capacity(channels / 2);
        for _ in 0..channels / 2 {
            filters.push(crate::adaptive::LmsFilter::new(
                self.taps,
                self.mu,
                self.leak,
                self.normalized,
            )?);
        }
        self.filters = filters;
        self.channels = channels;
        Ok(())
    }

    fn input_channels(&self) -> usize {
        self.channels
    }

    fn output_channels(&self) -> usize {
        self.channels / 2
    }

    fn process(
        &mut self,
        input: &[F],
        _timestamps: Option<&[f64]>,
        out: &mut Vec<F>,
    ) -> Result<()> {
        check_shape(input, self.channels)?;
        for frame in input.chunks_exact(self.channels) {
            for (p, pair) in frame.chunks_exact(2).enumerate() {
                out.push(self.filters[p].adapt(pair[0], pair[1]));
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        for filter in &mut self.filters {
            filter.reset();
        }
    }

    fn save_state(&self, w: &mut StateWriter) {
        w.write_u16(self.channels as u16);
        for filter in &self.filters {
            let mut state = Vec::with_capacity(filter.state_len());
            filter.save(&mut state);
            w.write_f64_slice(&state);
        }
    }

    fn load_state(&mut self, r: &mut StateReader<'_>, sample_rate: f64) -> Result<()> {
        let channels = read_channels(r)?;
        if self.channels == 0 && channels != 0 {
            self.init(channels, sample_rate)?;
        } else if self.channels != channels {
            return Err(DspError::StateMismatch(format!(
                "lms stage has {} channels, payload has {channels}",
                self.channels
            )));
        }
        for filter in self.filters.iter_mut() {
            let state = r.read_f64_slice()?;
            filter.load(&state)?;
        }
        Ok(())
    }
}

struct RlsStage<F: Float> {
    taps: usize,
    lambda: f64,
    delta: f64,
    filters: Vec<crate::adaptive::RlsFilter<F>>,
    channels: usize,
}

impl<F: Float> RlsStage<F> {
    fn new(taps: usize, lambda: f64, delta: f64) -> Self {
        Self {
            taps,
            lambda,
            delta,
            filters: Vec::new(),
            channels: 0,
        }
    }
}

impl<F: Float> Stage<F> for RlsStage<F> {
    fn kind(&self) -> StageKind {
        StageKind::Rls
    }

    fn init(&mut self, channels: usize, _sample_rate: f64) -> Result<()> {
        if channels == 0 || channels % 2 != 0 {
            return Err(DspError::invalid(
                "adaptive stages take (signal, desired) channel pairs",
            ));
        }
        if self.channels == channels {
            return Ok(());
        }
        let mut filters = Vec::with_capacity(channels / 2);
        for _ in 0..channels / 2 {
            filters.push(crate::adaptive::RlsFilter::new(
                self.taps,
                self.lambda,
                self.delta,
            )?);
        }
        self.filters = filters;
        self.channels = channels;
        Ok(())
    }

    fn input_channels(&self) -> usize {
        self.channels
    }

    fn output_channels(&self) -> usize {
        self.channels / 2
    }

    fn process(
        &mut self,
        input: &[F],
        _timestamps: Option<&[f64]>,
        out: &mut Vec<F>,
    ) -> Result<()> {
        check_shape(input, self.channels)?;
        for frame in input.chunks_exact(self.channels) {
            for (p, pair) in frame.chunks_exact(2).enumerate() {
                out.push(self.filters[p].adapt(pair[0], pair[1]));
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        for filter in &mut self.filters {
            filter.reset();
        }
    }

    fn save_state(&self, w: &mut StateWriter) {
        w.write_u16(self.channels as u16);
        for filter in &self.filters {
            let mut state = Vec::with_capacity(filter.state_len());
            filter.save(&mut state);
            w.write_f64_slice(&state);
        }
    }

    fn load_state(&mut self, r: &mut StateReader<'_>, sample_rate: f64) -> Result<()> {
        let channels = read_channels(r)?;
        if self.channels == 0 && channels != 0 {
            self.init(channels, sample_rate)?;
        } else if self.channels != channels {
            return Err(DspError::StateMismatch(format!(
                "rls stage has {} channels, payload has {channels}",
                self.channels
            )));
        }
        for filter in self.filters.iter_mut() {
            let state = r.read_f64_slice()?;
            filter.load(&state)?;
        }
        Ok(())
    }
}

// ============ Matrix stage ============

struct MatrixStage<F: Float> {
    transform: MatrixTransform<F>,
    channels: usize,
}

impl<F: Float> MatrixStage<F> {
    fn new(transform: MatrixTransform<F>) -> Self {
        Self {
            transform,
            channels: 0,
        }
    }
}

impl<F: Float> Stage<F> for MatrixStage<F> {
    fn kind(&self) -> StageKind {
        StageKind::Matrix
    }

    fn init(&mut self, channels: usize, _sample_rate: f64) -> Result<()> {
        if channels != self.transform.cols() {
            return Err(DspError::ShapeMismatch(format!(
                "matrix transform expects {} channels, got {channels}",
                self.transform.cols()
            )));
        }
        self.channels = channels;
        Ok(())
    }

    fn input_channels(&self) -> usize {
        self.channels
    }

    fn output_channels(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.transform.rows()
        }
    }

    fn process(
        &mut self,
        input: &[F],
        _timestamps: Option<&[f64]>,
        out: &mut Vec<F>,
    ) -> Result<()> {
        check_shape(input, self.channels)?;
        self.transform.process(input, out)
    }

    fn reset(&mut self) {
        // Train-then-apply stages carry no streaming state.
    }

    fn save_state(&self, w: &mut StateWriter) {
        w.write_u16(self.channels as u16);
    }

    fn load_state(&mut self, r: &mut StateReader<'_>, sample_rate: f64) -> Result<()> {
        let channels = read_channels(r)?;
        if self.channels == 0 && channels != 0 {
            self.init(channels, sample_rate)?;
        } else if channels != self.channels {
            return Err(DspError::StateMismatch(format!(
                "matrix stage has {} channels, payload has {channels}",
                self.channels
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_rejects_bad_params() {
        assert!(StageConfig::<f64>::MovingStat {
            statistic: Statistic::Mean,
            window: WindowSpec::Count(0),
        }
        .build()
        .is_err());
        assert!(StageConfig::<f64>::Convolution {
            kernel: vec![],
            mode: ConvolutionMode::Batch,
        }
        .build()
        .is_err());
        assert!(StageConfig::<f64>::MovingStat {
            statistic: Statistic::Ema { alpha: 1.5 },
            window: WindowSpec::Count(8),
        }
        .build()
        .is_err());
    }

    #[test]
    fn test_moving_average_stage_multichannel() {
        let mut stage = StageConfig::<f64>::MovingStat {
            statistic: Statistic::Mean,
            window: WindowSpec::Count(2),
        }
        .build()
        .unwrap();
        stage.init(2, 1000.0).unwrap();
        let mut out = Vec::new();
        stage
            .process(&[1.0, 10.0, 3.0, 20.0, 5.0, 30.0], None, &mut out)
            .unwrap();
        assert_eq!(out, vec![1.0, 10.0, 2.0, 15.0, 4.0, 25.0]);
    }

    #[test]
    fn test_fft_stage_fan_out() {
        let mut stage = StageConfig::<f64>::Fft {
            mode: FftMode::Batch,
            size: 8,
            hop: None,
            transform: TransformKind::Real,
            output: SpectrumOutput::Magnitude,
            window: None,
        }
        .build()
        .unwrap();
        stage.init(2, 1000.0).unwrap();
        assert_eq!(stage.output_channels(), 2 * 5);
        let mut out = Vec::new();
        // 8 frames of 2 channels trigger exactly one spectral frame.
        let input: Vec<f64> = (0..16).map(|i| i as f64).collect();
        stage.process(&input, None, &mut out).unwrap();
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn test_stage_state_round_trip_via_codec() {
        let mut a = StageConfig::<f64>::Iir {
            spec: IirSpec::ButterworthLowpass { cutoff: 1000.0 },
        }
        .build()
        .unwrap();
        a.init(1, 44100.0).unwrap();
        let mut sink = Vec::new();
        let input: Vec<f64> = (0..64).map(|i| (i as f64 * 0.17).sin()).collect();
        a.process(&input, None, &mut sink).unwrap();

        let mut w = StateWriter::new();
        a.save_state(&mut w);
        let bytes = w.into_bytes();

        let mut b = StageConfig::<f64>::Iir {
            spec: IirSpec::ButterworthLowpass { cutoff: 1000.0 },
        }
        .build()
        .unwrap();
        let mut r = StateReader::new(&bytes);
        b.load_state(&mut r, 44100.0).unwrap();
        r.finish().unwrap();

        let mut out_a = Vec::new();
        let mut out_b = Vec::new();
        a.process(&[0.5, -0.25, 0.125], None, &mut out_a).unwrap();
        b.process(&[0.5, -0.25, 0.125], None, &mut out_b).unwrap();
        assert_eq!(out_a, out_b);
    }
}
