//! Convolution: stateless batch, streaming direct, and streaming FFT
//! overlap-save for long kernels.

use num_complex::Complex;

use super::error::{DspError, Result};
use super::fft::FftEngine;
use super::math::next_pow2;
use super::ring::Ring;
use super::Float;

/// Kernel length above which the streaming path switches to FFT
/// overlap-save.
pub const FFT_CROSSOVER: usize = 128;

/// How a convolution stage consumes its input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvolutionMode {
    /// Stateless "valid" convolution over the whole call.
    Batch,
    /// Streaming convolution; output length equals input length and the
    /// first `K - 1` outputs of a fresh stream are zero while the kernel
    /// window fills.
    Moving,
}

/// Stateless "valid" convolution: output length is `max(0, T - K + 1)`.
pub fn convolve_valid<F: Float>(input: &[F], kernel: &[F]) -> Result<Vec<F>> {
    if kernel.is_empty() {
        return Err(DspError::invalid("convolution kernel must be nonempty"));
    }
    let k = kernel.len();
    if input.len() < k {
        return Ok(Vec::new());
    }
    let kernel_rev: Vec<F> = kernel.iter().rev().copied().collect();
    Ok((0..=input.len() - k)
        .map(|i| F::dot(&input[i..i + k], &kernel_rev))
        .collect())
}

/// Streaming overlap-save convolution.
///
/// Input accumulates into blocks of `block` samples; each full block is
/// transformed, multiplied with the kernel spectrum and inverse-transformed,
/// and the valid tail is emitted. Output therefore lags input by up to
/// `block - 1` samples. With `zero_ramp` the first `K - 1` outputs of a
/// fresh stream are forced to zero (moving-convolution semantics); without
/// it they are the partial sums a direct FIR would produce.
pub(crate) struct OverlapSave<F: Float> {
    kernel_len: usize,
    fft_size: usize,
    /// Valid outputs per block: `fft_size - kernel_len + 1`.
    block: usize,
    kernel_spectrum: Vec<Complex<F>>,
    /// Last `kernel_len - 1` input samples.
    history: Vec<F>,
    /// Input samples waiting for a full block.
    pending: Vec<F>,
    /// Total outputs emitted, for the fresh-stream zero ramp.
    emitted: u64,
    zero_ramp: bool,
    engine: FftEngine<F>,
}

impl<F: Float> OverlapSave<F> {
    pub(crate) fn new(kernel: &[F], zero_ramp: bool) -> Result<Self> {
        if kernel.is_empty() {
            return Err(DspError::invalid("convolution kernel must be nonempty"));
        }
        let kernel_len = kernel.len();
        let fft_size = next_pow2(kernel_len * 4);
        let mut engine = FftEngine::new();
        let mut padded = kernel.to_vec();
        padded.resize(fft_size, F::zero());
        let kernel_spectrum = engine.rfft(&padded)?;
        Ok(Self {
            kernel_len,
            fft_size,
            block: fft_size - kernel_len + 1,
            kernel_spectrum,
            history: vec![F::zero(); kernel_len - 1],
            pending: Vec::with_capacity(fft_size),
            emitted: 0,
            zero_ramp,
            engine,
        })
    }

    /// Output delay in samples.
    pub(crate) fn latency(&self) -> usize {
        self.block - 1
    }

    pub(crate) fn process(&mut self, input: &[F], out: &mut Vec<F>) -> Result<()> {
        for &x in input {
            self.pending.push(x);
            if self.pending.len() == self.block {
                self.flush_block(out)?;
            }
        }
        Ok(())
    }

    fn flush_block(&mut self, out: &mut Vec<F>) -> Result<()> {
        let mut frame = Vec::with_capacity(self.fft_size);
        frame.extend_from_slice(&self.history);
        frame.extend_from_slice(&self.pending);
        debug_assert!(frame.len() == self.fft_size);

        let mut spectrum = self.engine.rfft(&frame)?;
        for (bin, k) in spectrum.iter_mut().zip(&self.kernel_spectrum) {
            *bin = *bin * *k;
        }
        let convolved = self.engine.irfft(&spectrum, self.fft_size)?;

        // The first kernel_len - 1 samples are circular wraparound; the rest
        // are valid linear convolution outputs.
        for &y in &convolved[self.kernel_len - 1..] {
            let y = if self.zero_ramp && self.emitted < (self.kernel_len - 1) as u64 {
                F::zero()
            } else {
                y
            };
            out.push(y);
            self.emitted += 1;
        }

        self.history
            .copy_from_slice(&frame[self.fft_size - (self.kernel_len - 1)..]);
        self.pending.clear();
        Ok(())
    }

    pub(crate) fn reset(&mut self) {
        self.history.fill(F::zero());
        self.pending.clear();
        self.emitted = 0;
    }

    pub(crate) fn save(&self, out: &mut Vec<f64>) {
        out.push(self.emitted as f64);
        out.push(self.pending.len() as f64);
        out.extend(self.history.iter().map(|x| <F as crate::Float>::to_f64(*x)));
        out.extend(self.pending.iter().map(|x| <F as crate::Float>::to_f64(*x)));
    }

    pub(crate) fn load(&mut self, state: &[f64]) -> Result<()> {
        if state.len() < 2 + self.history.len() {
            return Err(DspError::StateCorrupted(
                "overlap-save state too short".into(),
            ));
        }
        let pending_len = state[1] as usize;
        if pending_len >= self.block || state.len() != 2 + self.history.len() + pending_len {
            return Err(DspError::StateCorrupted(
                "overlap-save pending length".into(),
            ));
        }
        let history_end = 2 + self.history.len();
        for (slot, &v) in self.history.iter_mut().zip(&state[2..history_end]) {
            *slot = <F as crate::Float>::from_f64(v);
        }
        self.pending.clear();
        self.pending
            .extend(state[history_end..].iter().map(|&v| <F as crate::Float>::from_f64(v)));
        self.emitted = state[0] as u64;
        Ok(())
    }

    pub(crate) fn state_len(&self) -> usize {
        2 + self.history.len() + self.pending.len()
    }
}

/// Streaming direct convolution over a guarded ring.
struct Direct<F: Float> {
    kernel_rev: Vec<F>,
    ring: Ring<F>,
}

impl<F: Float> Direct<F> {
    fn new(kernel: &[F]) -> Result<Self> {
        Ok(Self {
            kernel_rev: kernel.iter().rev().copied().collect(),
            ring: Ring::new(kernel.len())?,
        })
    }

    #[inline]
    fn push(&mut self, x: F) -> F {
        self.ring.push(x);
        if self.ring.count() < self.kernel_rev.len() {
            // Window still filling.
            F::zero()
        } else {
            F::dot(self.ring.read_back(self.kernel_rev.len()), &self.kernel_rev)
        }
    }
}

enum StreamEngine<F: Float> {
    Direct(Direct<F>),
    Fft(OverlapSave<F>),
}

/// Convolution of a stream with a fixed kernel.
pub struct Convolver<F: Float> {
    kernel: Vec<F>,
    mode: ConvolutionMode,
    stream: Option<StreamEngine<F>>,
}

impl<F: Float> Convolver<F> {
    /// Create a convolver. Streaming convolvers with kernels longer than
    /// [`FFT_CROSSOVER`] use the overlap-save path automatically.
    pub fn new(kernel: Vec<F>, mode: ConvolutionMode) -> Result<Self> {
        if kernel.is_empty() {
            return Err(DspError::invalid("convolution kernel must be nonempty"));
        }
        let stream = match mode {
            ConvolutionMode::Batch => None,
            ConvolutionMode::Moving => Some(if kernel.len() > FFT_CROSSOVER {
                StreamEngine::Fft(OverlapSave::new(&kernel, true)?)
            } else {
                StreamEngine::Direct(Direct::new(&kernel)?)
            }),
        };
        Ok(Self {
            kernel,
            mode,
            stream,
        })
    }

    #[inline]
    pub fn mode(&self) -> ConvolutionMode {
        self.mode
    }

    #[inline]
    pub fn kernel(&self) -> &[F] {
        &self.kernel
    }

    /// Whether the streaming path runs through block FFTs.
    pub fn uses_fft(&self) -> bool {
        matches!(self.stream, Some(StreamEngine::Fft(_)))
    }

    /// Output delay in samples.
    pub fn latency(&self) -> usize {
        match &self.stream {
            Some(StreamEngine::Fft(engine)) => engine.latency(),
            _ => 0,
        }
    }

    /// Convolve `input`, appending to `out`. Batch mode emits
    /// `max(0, len - K + 1)` samples; moving mode emits as many samples as
    /// the engine has ready (equal to the input length for the direct path).
    pub fn process(&mut self, input: &[F], out: &mut Vec<F>) -> Result<()> {
        match &mut self.stream {
            None => {
                out.extend(convolve_valid(input, &self.kernel)?);
                Ok(())
            }
            Some(StreamEngine::Direct(engine)) => {
                out.extend(input.iter().map(|&x| engine.push(x)));
                Ok(())
            }
            Some(StreamEngine::Fft(engine)) => engine.process(input, out),
        }
    }

    /// Zero all streaming state.
    pub fn reset(&mut self) {
        match &mut self.stream {
            None => {}
            Some(StreamEngine::Direct(engine)) => engine.ring.clear(),
            Some(StreamEngine::Fft(engine)) => engine.reset(),
        }
    }

    /// Serialize streaming state.
    pub fn save(&self, out: &mut Vec<f64>) {
        match &self.stream {
            None => {}
            Some(StreamEngine::Direct(engine)) => {
                out.push(engine.ring.head() as f64);
                out.push(engine.ring.count() as f64);
                out.extend(engine.ring.primary().iter().map(|x| <F as crate::Float>::to_f64(*x)));
            }
            Some(StreamEngine::Fft(engine)) => engine.save(out),
        }
    }

    /// Restore state written by `save`.
    pub fn load(&mut self, state: &[f64]) -> Result<()> {
        match &mut self.stream {
            None => {
                if !state.is_empty() {
                    return Err(DspError::StateMismatch(
                        "batch convolution carries no state".into(),
                    ));
                }
                Ok(())
            }
            Some(StreamEngine::Direct(engine)) => {
                let capacity = engine.ring.capacity();
                if state.len() != 2 + capacity {
                    return Err(DspError::StateMismatch(format!(
                        "convolution state length {} != {}",
                        state.len(),
                        2 + capacity
                    )));
                }
                let samples: Vec<F> = state[2..].iter().map(|&v| <F as crate::Float>::from_f64(v)).collect();
                engine
                    .ring
                    .restore(&samples, state[0] as usize, state[1] as usize)
            }
            Some(StreamEngine::Fft(engine)) => engine.load(state),
        }
    }

    /// Length of the vector `save` writes.
    pub fn state_len(&self) -> usize {
        match &self.stream {
            None => 0,
            Some(StreamEngine::Direct(engine)) => 2 + engine.ring.capacity(),
            Some(StreamEngine::Fft(engine)) => engine.state_len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_valid() {
        let out = convolve_valid(&[2.0f64, 4.0, 6.0, 8.0, 10.0], &[0.5, 0.5]).unwrap();
        assert_eq!(out, vec![3.0, 5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_batch_short_input() {
        let out = convolve_valid(&[1.0f64, 2.0], &[0.25, 0.25, 0.25, 0.25]).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_moving_ramp_up() {
        let mut conv = Convolver::new(vec![0.5f64, 0.5], ConvolutionMode::Moving).unwrap();
        let mut out = Vec::new();
        conv.process(&[2.0, 4.0, 6.0, 8.0, 10.0], &mut out).unwrap();
        assert_eq!(out, vec![0.0, 3.0, 5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_fft_path_matches_direct() {
        // A kernel past the crossover takes the overlap-save path; compare
        // it against the direct engine on the same input.
        let kernel: Vec<f64> = (0..200).map(|i| ((i * 31) % 17) as f64 / 100.0 - 0.08).collect();
        let mut fft_conv = Convolver::new(kernel.clone(), ConvolutionMode::Moving).unwrap();
        assert!(fft_conv.uses_fft());

        let mut direct = Direct::new(&kernel).unwrap();
        let input: Vec<f64> = (0..4000)
            .map(|i| ((i * 7919) % 1001) as f64 / 500.0 - 1.0)
            .collect();
        let expected: Vec<f64> = input.iter().map(|&x| direct.push(x)).collect();

        let mut out = Vec::new();
        fft_conv.process(&input, &mut out).unwrap();
        assert!(out.len() <= expected.len());
        for (i, (a, b)) in out.iter().zip(&expected).enumerate() {
            assert!((a - b).abs() < 1.0e-6, "sample {i}: {a} vs {b}");
        }
    }

    #[test]
    fn test_overlap_save_partial_ramp_without_gate() {
        // Without the zero ramp the FFT path reproduces direct-FIR partial
        // sums during warm-up.
        let kernel: Vec<f64> = (0..150).map(|i| 1.0 / (i + 1) as f64).collect();
        let mut ola = OverlapSave::new(&kernel, false).unwrap();
        let input: Vec<f64> = (0..2000).map(|i| ((i * 37) % 101) as f64 / 50.0 - 1.0).collect();
        let mut out = Vec::new();
        ola.process(&input, &mut out).unwrap();

        // Direct partial-sum reference.
        for (n, y) in out.iter().enumerate() {
            let mut reference = 0.0;
            for (k, &b) in kernel.iter().enumerate() {
                if n >= k {
                    reference += b * input[n - k];
                }
            }
            assert!((y - reference).abs() < 1.0e-6, "sample {n}");
        }
    }

    #[test]
    fn test_moving_split_invariance() {
        let kernel = vec![0.2f64, -0.1, 0.4, 0.3, 0.05];
        let input: Vec<f64> = (0..100).map(|i| (i as f64 * 0.13).sin()).collect();

        let mut whole = Convolver::new(kernel.clone(), ConvolutionMode::Moving).unwrap();
        let mut out_whole = Vec::new();
        whole.process(&input, &mut out_whole).unwrap();

        let mut split = Convolver::new(kernel, ConvolutionMode::Moving).unwrap();
        let mut out_split = Vec::new();
        split.process(&input[..33], &mut out_split).unwrap();
        split.process(&input[33..], &mut out_split).unwrap();

        assert_eq!(out_whole, out_split);
    }

    #[test]
    fn test_save_load_round_trip() {
        let kernel = vec![0.5f64, 0.25, 0.125];
        let input: Vec<f64> = (0..17).map(|i| i as f64).collect();
        let mut a = Convolver::new(kernel.clone(), ConvolutionMode::Moving).unwrap();
        let mut sink = Vec::new();
        a.process(&input, &mut sink).unwrap();

        let mut state = Vec::new();
        a.save(&mut state);
        let mut b = Convolver::new(kernel, ConvolutionMode::Moving).unwrap();
        b.load(&state).unwrap();

        let tail = [5.0f64, -3.0, 2.5];
        let mut out_a = Vec::new();
        let mut out_b = Vec::new();
        a.process(&tail, &mut out_a).unwrap();
        b.process(&tail, &mut out_b).unwrap();
        assert_eq!(out_a, out_b);
    }
}
