//! Fourier transforms with cached plans.
//!
//! Plans are built per size on first use and reused afterwards; power-of-two
//! sizes take the radix-2 path inside the backend, everything else goes
//! mixed-radix. Real transforms use the specialized half-spectrum algorithm
//! rather than a complex transform plus packing.
//!
//! Conventions: forward `X[k] = sum x[n] exp(-j 2 pi k n / N)`; the inverse
//! applies the `1/N` scale itself, for both `ifft` and `irfft`.

use num_complex::Complex;
use realfft::RealFftPlanner;
use rustfft::FftPlanner;

use super::error::{DspError, Result};
use super::simd;
use super::Float;

/// Forward/inverse transform engine with per-size plan caches.
///
/// The engine is cheap to construct; all expensive setup happens lazily per
/// transform size and is kept for the engine's lifetime.
pub struct FftEngine<F: Float> {
    planner: FftPlanner<F>,
    real_planner: RealFftPlanner<F>,
}

impl<F: Float> Default for FftEngine<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Float> FftEngine<F> {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
            real_planner: RealFftPlanner::new(),
        }
    }

    fn check_size(len: usize) -> Result<()> {
        if len == 0 {
            return Err(DspError::Numerical("zero-size transform".into()));
        }
        Ok(())
    }

    /// In-place forward complex FFT.
    pub fn fft_inplace(&mut self, buffer: &mut [Complex<F>]) -> Result<()> {
        Self::check_size(buffer.len())?;
        self.planner.plan_fft_forward(buffer.len()).process(buffer);
        Ok(())
    }

    /// In-place inverse complex FFT including the `1/N` scale.
    pub fn ifft_inplace(&mut self, buffer: &mut [Complex<F>]) -> Result<()> {
        Self::check_size(buffer.len())?;
        self.planner.plan_fft_inverse(buffer.len()).process(buffer);
        let scale = <F as crate::Float>::from_f64(1.0 / buffer.len() as f64);
        for bin in buffer.iter_mut() {
            *bin = *bin * scale;
        }
        Ok(())
    }

    /// Forward complex FFT of `input`.
    pub fn fft(&mut self, input: &[Complex<F>]) -> Result<Vec<Complex<F>>> {
        let mut buffer = input.to_vec();
        self.fft_inplace(&mut buffer)?;
        Ok(buffer)
    }

    /// Inverse complex FFT of `input`, scaled by `1/N`.
    pub fn ifft(&mut self, input: &[Complex<F>]) -> Result<Vec<Complex<F>>> {
        let mut buffer = input.to_vec();
        self.ifft_inplace(&mut buffer)?;
        Ok(buffer)
    }

    /// Forward real FFT: `N/2 + 1` complex bins. DC (and Nyquist for even
    /// `N`) come out purely real.
    pub fn rfft(&mut self, input: &[F]) -> Result<Vec<Complex<F>>> {
        Self::check_size(input.len())?;
        let plan = self.real_planner.plan_fft_forward(input.len());
        let mut scratch = input.to_vec();
        let mut spectrum = plan.make_output_vec();
        plan.process(&mut scratch, &mut spectrum)
            .map_err(|e| DspError::Numerical(format!("rfft: {e}")))?;
        Ok(spectrum)
    }

    /// Inverse real FFT reconstructing `n` samples from `n/2 + 1` bins,
    /// scaled by `1/N`. Hermitian symmetry of the full spectrum is assumed;
    /// the imaginary parts of DC and Nyquist are ignored.
    pub fn irfft(&mut self, spectrum: &[Complex<F>], n: usize) -> Result<Vec<F>> {
        Self::check_size(n)?;
        if spectrum.len() != n / 2 + 1 {
            return Err(DspError::ShapeMismatch(format!(
                "irfft of {} samples needs {} bins, got {}",
                n,
                n / 2 + 1,
                spectrum.len()
            )));
        }
        let plan = self.real_planner.plan_fft_inverse(n);
        let mut scratch = spectrum.to_vec();
        // The backend insists on exactly real DC/Nyquist bins.
        scratch[0].im = F::zero();
        if n % 2 == 0 {
            let last = scratch.len() - 1;
            scratch[last].im = F::zero();
        }
        let mut output = plan.make_output_vec();
        plan.process(&mut scratch, &mut output)
            .map_err(|e| DspError::Numerical(format!("irfft: {e}")))?;
        let scale = <F as crate::Float>::from_f64(1.0 / n as f64);
        for x in output.iter_mut() {
            *x = *x * scale;
        }
        Ok(output)
    }
}

/// Magnitude of each bin.
pub fn spectrum_magnitude<F: Float>(bins: &[Complex<F>]) -> Vec<F> {
    let mut out = vec![F::zero(); bins.len()];
    simd::magnitude(bins, &mut out);
    out
}

/// Power (squared magnitude) of each bin.
pub fn spectrum_power<F: Float>(bins: &[Complex<F>]) -> Vec<F> {
    let mut out = vec![F::zero(); bins.len()];
    simd::power(bins, &mut out);
    out
}

/// Phase of each bin in radians.
pub fn spectrum_phase<F: Float>(bins: &[Complex<F>]) -> Vec<F> {
    bins.iter().map(|c| c.im.atan2(c.re)).collect()
}

/// Center frequencies in Hz of the `size/2 + 1` real-spectrum bins.
pub fn bin_frequencies(size: usize, sample_rate: f64) -> Vec<f64> {
    (0..=size / 2)
        .map(|k| k as f64 * sample_rate / size as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math;

    fn sine(n: usize, cycles: f64) -> Vec<f64> {
        (0..n)
            .map(|i| (math::TAU * cycles * i as f64 / n as f64).sin())
            .collect()
    }

    #[test]
    fn test_rfft_peak_bin() {
        let mut engine = FftEngine::new();
        let signal = sine(1024, 8.0);
        let spectrum = engine.rfft(&signal).unwrap();
        assert_eq!(spectrum.len(), 513);
        let magnitude = spectrum_magnitude(&spectrum);
        let peak = magnitude
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert_eq!(peak, 8);
        // A full-scale sine concentrates N/2 of magnitude in its bin.
        assert!(magnitude[peak] > 500.0);
    }

    #[test]
    fn test_fft_ifft_reconstruction() {
        let mut engine = FftEngine::new();
        for n in [2usize, 8, 37, 64, 100, 243, 1024] {
            let signal: Vec<Complex<f64>> = (0..n)
                .map(|i| Complex::new(((i * 31) % 17) as f64 - 8.0, ((i * 13) % 11) as f64))
                .collect();
            let transformed = engine.fft(&signal).unwrap();
            let restored = engine.ifft(&transformed).unwrap();
            for (x, y) in signal.iter().zip(&restored) {
                assert!((x - y).norm() < 1.0e-5, "size {n}");
            }
        }
    }

    #[test]
    fn test_rfft_irfft_reconstruction() {
        let mut engine = FftEngine::new();
        for n in [2usize, 9, 16, 100, 255, 1024] {
            let signal: Vec<f64> = (0..n).map(|i| ((i * 7919) % 101) as f64 / 50.0 - 1.0).collect();
            let spectrum = engine.rfft(&signal).unwrap();
            assert_eq!(spectrum.len(), n / 2 + 1);
            let restored = engine.irfft(&spectrum, n).unwrap();
            for (x, y) in signal.iter().zip(&restored) {
                assert!((x - y).abs() < 1.0e-5, "size {n}");
            }
        }
    }

    #[test]
    fn test_dc_and_nyquist_are_real() {
        let mut engine = FftEngine::new();
        let signal: Vec<f64> = (0..64).map(|i| (i as f64 * 0.3).cos()).collect();
        let spectrum = engine.rfft(&signal).unwrap();
        assert!(spectrum[0].im.abs() < 1.0e-12);
        assert!(spectrum[32].im.abs() < 1.0e-12);
    }

    #[test]
    fn test_parseval() {
        let mut engine = FftEngine::new();
        let signal: Vec<f64> = (0..512).map(|i| ((i * 37) % 19) as f64 / 9.5 - 1.0).collect();
        let time_energy: f64 = signal.iter().map(|x| x * x).sum();
        let spectrum = engine
            .fft(&signal.iter().map(|&x| Complex::new(x, 0.0)).collect::<Vec<_>>())
            .unwrap();
        let freq_energy: f64 =
            spectrum.iter().map(|c| c.norm_sqr()).sum::<f64>() / signal.len() as f64;
        assert!((time_energy - freq_energy).abs() / time_energy < 1.0e-4);
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut engine = FftEngine::<f64>::new();
        assert!(engine.fft(&[]).is_err());
        assert!(engine.rfft(&[]).is_err());
    }

    #[test]
    fn test_bin_frequencies() {
        let bins = bin_frequencies(1024, 44100.0);
        assert_eq!(bins.len(), 513);
        assert_eq!(bins[0], 0.0);
        assert!((bins[10] - 430.66).abs() < 0.01);
        assert!((bins[512] - 22050.0).abs() < 1.0e-9);
    }
}
