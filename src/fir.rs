//! FIR filters.

use num_complex::Complex64;

use super::error::{DspError, Result};
use super::ring::Ring;
use super::window::WindowType;
use super::{math, Float};

/// Immutable FIR coefficient vector. `b[0]` applies to the newest sample.
#[derive(Clone, Debug)]
pub struct FirCoefs<F: Float> {
    b: Vec<F>,
}

impl<F: Float> FirCoefs<F> {
    pub fn new(b: Vec<F>) -> Result<Self> {
        if b.is_empty() {
            return Err(DspError::invalid("FIR filter needs at least one tap"));
        }
        Ok(Self { b })
    }

    /// Tap count.
    #[inline]
    pub fn len(&self) -> usize {
        self.b.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Coefficients, newest tap first.
    #[inline]
    pub fn taps(&self) -> &[F] {
        &self.b
    }

    /// Frequency response at `frequency` Hz for the given sample rate.
    pub fn response(&self, frequency: f64, sample_rate: f64) -> Complex64 {
        let z1 = Complex64::from_polar(1.0, -math::TAU * frequency / sample_rate);
        let mut z = Complex64::new(1.0, 0.0);
        let mut x = Complex64::default();
        for i in 0..self.b.len() {
            x += Complex64::new(self.b[i].to_f64(), 0.0) * z;
            z *= z1;
        }
        x
    }

    /// Scale the taps so the DC gain is exactly one.
    pub fn normalize_dc(&mut self) {
        let sum: f64 = self.b.iter().map(|x| <F as crate::Float>::to_f64(*x)).sum();
        if sum != 0.0 {
            let scale = <F as crate::Float>::from_f64(1.0 / sum);
            for tap in self.b.iter_mut() {
                *tap = *tap * scale;
            }
        }
    }
}

fn check_cutoff(cutoff: f64, sample_rate: f64) -> Result<f64> {
    let normalized = cutoff / sample_rate;
    if !(normalized > 0.0 && normalized <= 0.5) {
        return Err(DspError::invalid(format!(
            "cutoff {cutoff} Hz outside (0, {}] at {sample_rate} Hz",
            sample_rate * 0.5
        )));
    }
    Ok(normalized)
}

fn check_order(order: usize) -> Result<usize> {
    if order == 0 {
        return Err(DspError::invalid("FIR order must be nonzero"));
    }
    Ok(order)
}

/// Windowed-sinc low-pass design with `order + 1` taps and unit DC gain.
pub fn lowpass<F: Float>(
    cutoff: f64,
    sample_rate: f64,
    order: usize,
    window: WindowType,
) -> Result<FirCoefs<F>> {
    let fc = check_cutoff(cutoff, sample_rate)?;
    let order = check_order(order)?;
    let m = order as f64 / 2.0;
    let taps: Vec<F> = (0..=order)
        .map(|i| {
            let x = i as f64 - m;
            let w: f64 = window.at::<f64>(i, order + 1);
            <F as crate::Float>::from_f64(2.0 * fc * math::sinc(2.0 * fc * x) * w)
        })
        .collect();
    let mut coefs = FirCoefs::new(taps)?;
    coefs.normalize_dc();
    Ok(coefs)
}

/// Windowed-sinc high-pass design by spectral inversion of the low-pass.
/// The order is rounded up to even so the inverted impulse stays symmetric.
pub fn highpass<F: Float>(
    cutoff: f64,
    sample_rate: f64,
    order: usize,
    window: WindowType,
) -> Result<FirCoefs<F>> {
    let order = check_order(order)? + (order & 1);
    let low = lowpass::<F>(cutoff, sample_rate, order, window)?;
    let mut taps = vec![F::zero(); order + 1];
    for i in 0..=order {
        taps[i] = -low.taps()[i];
    }
    taps[order / 2] = taps[order / 2] + F::one();
    FirCoefs::new(taps)
}

/// Band-pass design: difference of two low-pass prototypes.
pub fn bandpass<F: Float>(
    low: f64,
    high: f64,
    sample_rate: f64,
    order: usize,
    window: WindowType,
) -> Result<FirCoefs<F>> {
    if low >= high {
        return Err(DspError::invalid("band edges must satisfy low < high"));
    }
    let order = check_order(order)? + (order & 1);
    let upper = lowpass::<F>(high, sample_rate, order, window)?;
    let lower = lowpass::<F>(low, sample_rate, order, window)?;
    let taps: Vec<F> = (0..=order)
        .map(|i| upper.taps()[i] - lower.taps()[i])
        .collect();
    FirCoefs::new(taps)
}

/// Band-stop design by spectral inversion of the band-pass.
pub fn bandstop<F: Float>(
    low: f64,
    high: f64,
    sample_rate: f64,
    order: usize,
    window: WindowType,
) -> Result<FirCoefs<F>> {
    let order = check_order(order)? + (order & 1);
    let pass = bandpass::<F>(low, high, sample_rate, order, window)?;
    let mut taps = vec![F::zero(); order + 1];
    for i in 0..=order {
        taps[i] = -pass.taps()[i];
    }
    taps[order / 2] = taps[order / 2] + F::one();
    FirCoefs::new(taps)
}

/// Streaming FIR filter `y[n] = sum b[i] x[n-i]`.
///
/// Holds the input history in a guarded ring so every tap window is one
/// contiguous slice, which feeds the SIMD dot product without per-sample
/// branching. Ramp-up from a fresh state reads the zero initialization, so
/// the first `len - 1` outputs are partial sums.
#[derive(Clone)]
pub struct FirFilter<F: Float> {
    coefs: FirCoefs<F>,
    /// Taps reversed to match the oldest-first window view.
    taps_rev: Vec<F>,
    ring: Ring<F>,
}

impl<F: Float> FirFilter<F> {
    pub fn new(coefs: FirCoefs<F>) -> Result<Self> {
        let ring = Ring::new(coefs.len())?;
        let taps_rev: Vec<F> = coefs.taps().iter().rev().copied().collect();
        Ok(Self {
            coefs,
            taps_rev,
            ring,
        })
    }

    /// Tap count.
    #[inline]
    pub fn len(&self) -> usize {
        self.coefs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn coefs(&self) -> &FirCoefs<F> {
        &self.coefs
    }

    /// Replace the coefficients. Resets the filter state.
    pub fn set_coefs(&mut self, coefs: FirCoefs<F>) -> Result<()> {
        *self = Self::new(coefs)?;
        Ok(())
    }

    /// Filter one sample.
    #[inline]
    pub fn filter(&mut self, x: F) -> F {
        self.ring.push(x);
        let window = self.ring.read_back(self.taps_rev.len());
        F::dot(window, &self.taps_rev)
    }

    /// Filter a slice in place order, writing to `out`.
    pub fn filter_slice(&mut self, input: &[F], out: &mut [F]) {
        debug_assert!(input.len() == out.len());
        for i in 0..input.len() {
            out[i] = self.filter(input[i]);
        }
    }

    /// Zero the input history.
    pub fn reset(&mut self) {
        self.ring.clear();
    }

    /// Serialize the ring contents and head index. The full ring capacity is
    /// stored, not just the tap count.
    pub fn save(&self, out: &mut Vec<f64>) {
        out.push(self.ring.head() as f64);
        out.push(self.ring.count() as f64);
        out.extend(self.ring.primary().iter().map(|x| <F as crate::Float>::to_f64(*x)));
    }

    /// Restore state written by `save`.
    pub fn load(&mut self, state: &[f64]) -> Result<()> {
        let capacity = self.ring.capacity();
        if state.len() != 2 + capacity {
            return Err(DspError::StateMismatch(format!(
                "FIR state length {} != {}",
                state.len(),
                2 + capacity
            )));
        }
        let head = state[0] as usize;
        let count = state[1] as usize;
        let samples: Vec<F> = state[2..].iter().map(|&x| <F as crate::Float>::from_f64(x)).collect();
        self.ring.restore(&samples, head, count)
    }

    /// Length of the vector `save` writes.
    pub fn state_len(&self) -> usize {
        2 + self.ring.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moving_pair_average() {
        let coefs = FirCoefs::new(vec![0.5f64, 0.5]).unwrap();
        let mut fir = FirFilter::new(coefs).unwrap();
        let input = [2.0, 4.0, 6.0, 8.0, 10.0];
        let mut out = [0.0; 5];
        fir.filter_slice(&input, &mut out);
        // First output is a ramp-up partial.
        assert_eq!(out, [1.0, 3.0, 5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_impulse_response_recovers_taps() {
        let taps = vec![0.3f64, -0.2, 0.5, 0.1];
        let mut fir = FirFilter::new(FirCoefs::new(taps.clone()).unwrap()).unwrap();
        let mut impulse = vec![0.0; taps.len()];
        impulse[0] = 1.0;
        let mut out = vec![0.0; taps.len()];
        fir.filter_slice(&impulse, &mut out);
        for (y, b) in out.iter().zip(&taps) {
            assert!((y - b).abs() < 1.0e-12);
        }
    }

    #[test]
    fn test_lowpass_design_dc_and_nyquist() {
        let coefs = lowpass::<f64>(1000.0, 44100.0, 64, WindowType::Hamming).unwrap();
        let dc = coefs.response(0.0, 44100.0).norm();
        let nyquist = coefs.response(22050.0, 44100.0).norm();
        assert!((dc - 1.0).abs() < 1.0e-9);
        assert!(nyquist < 1.0e-3);
    }

    #[test]
    fn test_highpass_design_dc_and_nyquist() {
        let coefs = highpass::<f64>(4000.0, 44100.0, 64, WindowType::Hamming).unwrap();
        let dc = coefs.response(0.0, 44100.0).norm();
        let nyquist = coefs.response(22050.0, 44100.0).norm();
        assert!(dc < 1.0e-3);
        assert!((nyquist - 1.0).abs() < 1.0e-2);
    }

    #[test]
    fn test_rejects_bad_cutoff() {
        assert!(lowpass::<f64>(0.0, 44100.0, 16, WindowType::Hann).is_err());
        assert!(lowpass::<f64>(30000.0, 44100.0, 16, WindowType::Hann).is_err());
    }

    #[test]
    fn test_save_load_round_trip() {
        let coefs = FirCoefs::new(vec![0.25f64, 0.5, 0.25]).unwrap();
        let mut fir = FirFilter::new(coefs.clone()).unwrap();
        for i in 0..11 {
            fir.filter(i as f64 * 0.1);
        }
        let mut state = Vec::new();
        fir.save(&mut state);

        let mut restored = FirFilter::new(coefs).unwrap();
        restored.load(&state).unwrap();
        for i in 0..5 {
            assert_eq!(fir.filter(i as f64), restored.filter(i as f64));
        }
    }
}
