//! Sliding / moving FFT (streaming short-time Fourier transform).

use num_complex::Complex;

use super::error::{DspError, Result};
use super::fft::{spectrum_magnitude, spectrum_phase, spectrum_power, FftEngine};
use super::ring::Ring;
use super::window::{window_vector, WindowType};
use super::Float;

/// What a spectral frame contains.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SpectrumOutput {
    /// Bin magnitudes.
    #[default]
    Magnitude,
    /// Bin phases in radians.
    Phase,
    /// Bin powers (squared magnitudes).
    Power,
    /// Interleaved (re, im) pairs.
    Complex,
}

/// Whether frames are transformed with the full complex FFT or the real
/// half-spectrum transform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransformKind {
    /// Real input, `size/2 + 1` bins.
    #[default]
    Real,
    /// Complex transform of the real input, `size` bins.
    Full,
}

/// Streaming windowed FFT: one spectral frame per `hop` input samples once
/// the analysis buffer has filled.
pub struct MovingFft<F: Float> {
    size: usize,
    hop: usize,
    window_type: WindowType,
    window: Vec<F>,
    transform: TransformKind,
    output: SpectrumOutput,
    ring: Ring<F>,
    /// Total samples pushed, saturating at `size`.
    filled: usize,
    samples_since_emit: usize,
    engine: FftEngine<F>,
    /// Windowed frame scratch.
    scratch: Vec<F>,
    /// Assembled output frame scratch.
    frame: Vec<F>,
}

impl<F: Float> MovingFft<F> {
    pub fn new(
        size: usize,
        hop: usize,
        window_type: WindowType,
        transform: TransformKind,
        output: SpectrumOutput,
    ) -> Result<Self> {
        if size == 0 {
            return Err(DspError::invalid("FFT size must be nonzero"));
        }
        if hop == 0 || hop > size {
            return Err(DspError::invalid("hop must be in 1..=size"));
        }
        Ok(Self {
            size,
            hop,
            window_type,
            window: window_vector(window_type, size),
            transform,
            output,
            ring: Ring::new(size)?,
            filled: 0,
            samples_since_emit: 0,
            engine: FftEngine::new(),
            scratch: vec![F::zero(); size],
            frame: Vec::new(),
        })
    }

    /// Number of bins per emitted frame.
    pub fn bins(&self) -> usize {
        match self.transform {
            TransformKind::Real => self.size / 2 + 1,
            TransformKind::Full => self.size,
        }
    }

    /// Number of output values per emitted frame; complex output interleaves
    /// two values per bin.
    pub fn frame_len(&self) -> usize {
        match self.output {
            SpectrumOutput::Complex => self.bins() * 2,
            _ => self.bins(),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn hop(&self) -> usize {
        self.hop
    }

    /// Samples of delay before the first frame can be emitted.
    pub fn latency(&self) -> usize {
        self.size - 1
    }

    /// Push samples, invoking `on_frame` with each completed spectral frame.
    pub fn process<C: FnMut(&[F])>(&mut self, input: &[F], mut on_frame: C) -> Result<()> {
        for &x in input {
            self.ring.push(x);
            if self.filled < self.size {
                self.filled += 1;
            }
            self.samples_since_emit += 1;
            if self.filled == self.size && self.samples_since_emit >= self.hop {
                self.emit()?;
                // Zeroing rather than subtracting the hop keeps the first
                // filled buffer from draining as a burst of frames.
                self.samples_since_emit = 0;
                on_frame(&self.frame);
            }
        }
        Ok(())
    }

    fn emit(&mut self) -> Result<()> {
        let view = self.ring.read_back(self.size);
        for i in 0..self.size {
            self.scratch[i] = view[i] * self.window[i];
        }
        let spectrum: Vec<Complex<F>> = match self.transform {
            TransformKind::Real => self.engine.rfft(&self.scratch)?,
            TransformKind::Full => {
                let buffer: Vec<Complex<F>> = self
                    .scratch
                    .iter()
                    .map(|&x| Complex::new(x, F::zero()))
                    .collect();
                self.engine.fft(&buffer)?
            }
        };
        self.frame.clear();
        match self.output {
            SpectrumOutput::Magnitude => self.frame.extend(spectrum_magnitude(&spectrum)),
            SpectrumOutput::Power => self.frame.extend(spectrum_power(&spectrum)),
            SpectrumOutput::Phase => self.frame.extend(spectrum_phase(&spectrum)),
            SpectrumOutput::Complex => {
                for bin in &spectrum {
                    self.frame.push(bin.re);
                    self.frame.push(bin.im);
                }
            }
        }
        Ok(())
    }

    /// Zero the analysis buffer and the hop counter.
    pub fn reset(&mut self) {
        self.ring.clear();
        self.filled = 0;
        self.samples_since_emit = 0;
    }

    /// Serialize the analysis state.
    pub fn save(&self, out: &mut Vec<f64>) {
        out.push(self.ring.head() as f64);
        out.push(self.ring.count() as f64);
        out.push(self.filled as f64);
        out.push(self.samples_since_emit as f64);
        out.extend(self.ring.primary().iter().map(|x| <F as crate::Float>::to_f64(*x)));
    }

    /// Restore state written by `save`.
    pub fn load(&mut self, state: &[f64]) -> Result<()> {
        let capacity = self.ring.capacity();
        if state.len() != 4 + capacity {
            return Err(DspError::StateMismatch(format!(
                "moving FFT state length {} != {}",
                state.len(),
                4 + capacity
            )));
        }
        let filled = state[2] as usize;
        let since = state[3] as usize;
        if filled > self.size || since > self.size {
            return Err(DspError::StateCorrupted("moving FFT counters".into()));
        }
        let samples: Vec<F> = state[4..].iter().map(|&v| <F as crate::Float>::from_f64(v)).collect();
        self.ring
            .restore(&samples, state[0] as usize, state[1] as usize)?;
        self.filled = filled;
        self.samples_since_emit = since;
        Ok(())
    }

    /// Length of the vector `save` writes.
    pub fn state_len(&self) -> usize {
        4 + self.ring.capacity()
    }

    /// The configured window shape.
    pub fn window_type(&self) -> WindowType {
        self.window_type
    }
}
