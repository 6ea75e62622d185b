//! Adaptive filters: LMS/NLMS and RLS.

use super::error::{DspError, Result};
use super::ring::Ring;
use super::Float;

/// Least-mean-squares adaptive FIR with optional leakage and input-power
/// normalization (NLMS).
///
/// Weight update: `w <- (1 - mu lambda) w + mu_eff e x`, where `mu_eff` is
/// `mu` for plain LMS and `mu / (p + eps)` for NLMS with `p` an
/// exponentially smoothed estimate of the input power.
#[derive(Clone)]
pub struct LmsFilter<F: Float> {
    weights: Vec<F>,
    ring: Ring<F>,
    mu: f64,
    leak: f64,
    normalized: bool,
    /// Smoothed estimate of `||x||^2 / taps`.
    power: f64,
    power_smoothing: f64,
    epsilon: f64,
}

impl<F: Float> LmsFilter<F> {
    pub fn new(taps: usize, mu: f64, leak: f64, normalized: bool) -> Result<Self> {
        if taps == 0 {
            return Err(DspError::invalid("LMS filter needs at least one tap"));
        }
        if !(mu > 0.0) {
            return Err(DspError::invalid("LMS step size must be positive"));
        }
        if !(0.0..1.0).contains(&leak) {
            return Err(DspError::invalid("LMS leakage must be in [0, 1)"));
        }
        Ok(Self {
            weights: vec![F::zero(); taps],
            ring: Ring::new(taps)?,
            mu,
            leak,
            normalized,
            power: 0.0,
            power_smoothing: 0.9,
            epsilon: 1.0e-8,
        })
    }

    #[inline]
    pub fn taps(&self) -> usize {
        self.weights.len()
    }

    pub fn weights(&self) -> &[F] {
        &self.weights
    }

    /// Feed input `x` and desired response `d`; adapts the weights and
    /// returns the filter output before adaptation.
    pub fn adapt(&mut self, x: F, desired: F) -> F {
        self.ring.push(x);
        let taps = self.weights.len();
        let window = self.ring.read_back(taps);
        // window is oldest-first; weight 0 applies to the newest sample.
        let mut y = F::zero();
        for i in 0..taps {
            y = y + self.weights[i] * window[taps - 1 - i];
        }
        let error = (desired - y).to_f64();

        let x64 = x.to_f64();
        self.power =
            self.power_smoothing * self.power + (1.0 - self.power_smoothing) * x64 * x64;
        let mu_eff = if self.normalized {
            self.mu / (self.power * taps as f64 + self.epsilon)
        } else {
            self.mu
        };
        let decay = <F as crate::Float>::from_f64(1.0 - self.mu * self.leak);
        let scale = <F as crate::Float>::from_f64(mu_eff * error);
        for i in 0..taps {
            self.weights[i] = decay * self.weights[i] + scale * window[taps - 1 - i];
        }
        y
    }

    /// Filter without adaptation.
    pub fn filter(&mut self, x: F) -> F {
        self.ring.push(x);
        let taps = self.weights.len();
        let window = self.ring.read_back(taps);
        let mut y = F::zero();
        for i in 0..taps {
            y = y + self.weights[i] * window[taps - 1 - i];
        }
        y
    }

    /// Zero weights, history and the power estimate.
    pub fn reset(&mut self) {
        self.weights.fill(F::zero());
        self.ring.clear();
        self.power = 0.0;
    }

    /// Serialize weights, input history and power estimate.
    pub fn save(&self, out: &mut Vec<f64>) {
        out.push(self.ring.head() as f64);
        out.push(self.ring.count() as f64);
        out.push(self.power);
        out.extend(self.weights.iter().map(|w| <F as crate::Float>::to_f64(*w)));
        out.extend(self.ring.primary().iter().map(|x| <F as crate::Float>::to_f64(*x)));
    }

    /// Restore state written by `save`.
    pub fn load(&mut self, state: &[f64]) -> Result<()> {
        let taps = self.weights.len();
        let capacity = self.ring.capacity();
        if state.len() != 3 + taps + capacity {
            return Err(DspError::StateMismatch(format!(
                "LMS state length {} != {}",
                state.len(),
                3 + taps + capacity
            )));
        }
        let samples: Vec<F> = state[3 + taps..].iter().map(|&v| <F as crate::Float>::from_f64(v)).collect();
        self.ring
            .restore(&samples, state[0] as usize, state[1] as usize)?;
        self.power = state[2];
        for (w, &v) in self.weights.iter_mut().zip(&state[3..3 + taps]) {
            *w = <F as crate::Float>::from_f64(v);
        }
        Ok(())
    }

    /// Length of the vector `save` writes.
    pub fn state_len(&self) -> usize {
        3 + self.weights.len() + self.ring.capacity()
    }
}

/// Recursive-least-squares adaptive FIR.
///
/// Maintains the inverse input covariance estimate `P`, initialized to
/// `delta I`, with a Kalman-style gain update. O(N^2) per sample.
#[derive(Clone)]
pub struct RlsFilter<F: Float> {
    weights: Vec<F>,
    /// Row-major N x N inverse covariance estimate.
    inverse_cov: Vec<f64>,
    ring: Ring<F>,
    /// Forgetting factor, slightly below one.
    lambda: f64,
    /// Initial inverse-covariance scale, kept for `reset`.
    delta: f64,
}

impl<F: Float> RlsFilter<F> {
    pub fn new(taps: usize, lambda: f64, delta: f64) -> Result<Self> {
        if taps == 0 {
            return Err(DspError::invalid("RLS filter needs at least one tap"));
        }
        if !(lambda > 0.0 && lambda <= 1.0) {
            return Err(DspError::invalid("RLS forgetting factor must be in (0, 1]"));
        }
        if !(delta > 0.0) {
            return Err(DspError::invalid("RLS initial covariance must be positive"));
        }
        let mut inverse_cov = vec![0.0; taps * taps];
        for i in 0..taps {
            inverse_cov[i * taps + i] = delta;
        }
        Ok(Self {
            weights: vec![F::zero(); taps],
            inverse_cov,
            ring: Ring::new(taps)?,
            lambda,
            delta,
        })
    }

    #[inline]
    pub fn taps(&self) -> usize {
        self.weights.len()
    }

    pub fn weights(&self) -> &[F] {
        &self.weights
    }

    /// Inverse covariance estimate, row-major.
    pub fn inverse_cov(&self) -> &[f64] {
        &self.inverse_cov
    }

    /// Feed input `x` and desired response `d`; adapts and returns the
    /// filter output before adaptation.
    pub fn adapt(&mut self, x: F, desired: F) -> F {
        self.ring.push(x);
        let n = self.weights.len();
        let window = self.ring.read_back(n);
        // Newest-first input vector.
        let u: Vec<f64> = (0..n).map(|i| window[n - 1 - i].to_f64()).collect();

        let mut y = 0.0;
        for i in 0..n {
            y += self.weights[i].to_f64() * u[i];
        }
        let error = desired.to_f64() - y;

        // pu = P u
        let mut pu = vec![0.0; n];
        for i in 0..n {
            let row = &self.inverse_cov[i * n..(i + 1) * n];
            let mut acc = 0.0;
            for j in 0..n {
                acc += row[j] * u[j];
            }
            pu[i] = acc;
        }
        let mut denom = self.lambda;
        for i in 0..n {
            denom += u[i] * pu[i];
        }
        // Gain k = P u / (lambda + u' P u)
        let gain: Vec<f64> = pu.iter().map(|&v| v / denom).collect();

        for i in 0..n {
            self.weights[i] = <F as crate::Float>::from_f64(self.weights[i].to_f64() + gain[i] * error);
        }
        // P <- (P - k (u' P)) / lambda; u' P equals pu' because P stays
        // symmetric.
        let inv_lambda = 1.0 / self.lambda;
        for i in 0..n {
            for j in 0..n {
                self.inverse_cov[i * n + j] =
                    (self.inverse_cov[i * n + j] - gain[i] * pu[j]) * inv_lambda;
            }
        }
        <F as crate::Float>::from_f64(y)
    }

    /// Zero weights and history and reset `P` to `delta I`.
    pub fn reset(&mut self) {
        let n = self.weights.len();
        self.weights.fill(F::zero());
        self.ring.clear();
        self.inverse_cov.fill(0.0);
        for i in 0..n {
            self.inverse_cov[i * n + i] = self.delta;
        }
    }

    /// Serialize weights, covariance and input history.
    pub fn save(&self, out: &mut Vec<f64>) {
        out.push(self.ring.head() as f64);
        out.push(self.ring.count() as f64);
        out.extend(self.weights.iter().map(|w| <F as crate::Float>::to_f64(*w)));
        out.extend(self.inverse_cov.iter());
        out.extend(self.ring.primary().iter().map(|x| <F as crate::Float>::to_f64(*x)));
    }

    /// Restore state written by `save`.
    pub fn load(&mut self, state: &[f64]) -> Result<()> {
        let n = self.weights.len();
        let capacity = self.ring.capacity();
        let expected = 2 + n + n * n + capacity;
        if state.len() != expected {
            return Err(DspError::StateMismatch(format!(
                "RLS state length {} != {expected}",
                state.len()
            )));
        }
        let samples: Vec<F> = state[2 + n + n * n..]
            .iter()
            .map(|&v| <F as crate::Float>::from_f64(v))
            .collect();
        self.ring
            .restore(&samples, state[0] as usize, state[1] as usize)?;
        for (w, &v) in self.weights.iter_mut().zip(&state[2..2 + n]) {
            *w = <F as crate::Float>::from_f64(v);
        }
        self.inverse_cov.copy_from_slice(&state[2 + n..2 + n + n * n]);
        Ok(())
    }

    /// Length of the vector `save` writes.
    pub fn state_len(&self) -> usize {
        2 + self.taps() + self.taps() * self.taps() + self.ring.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Identify a short FIR system from its input/output pair.
    fn system_output(taps: &[f64], input: &[f64], i: usize) -> f64 {
        let mut y = 0.0;
        for (k, &b) in taps.iter().enumerate() {
            if i >= k {
                y += b * input[i - k];
            }
        }
        y
    }

    #[test]
    fn test_nlms_identifies_system() {
        let system = [0.6f64, -0.3, 0.1];
        let input: Vec<f64> = (0..4000)
            .map(|i| (((i * 7919) % 2003) as f64 / 1001.5 - 1.0))
            .collect();
        let mut lms = LmsFilter::<f64>::new(3, 0.5, 0.0, true).unwrap();
        for i in 0..input.len() {
            let desired = system_output(&system, &input, i);
            lms.adapt(input[i], desired);
        }
        for (w, b) in lms.weights().iter().zip(&system) {
            assert!((w - b).abs() < 0.05, "weight {w} vs {b}");
        }
    }

    #[test]
    fn test_rls_identifies_system_quickly() {
        let system = [0.5f64, 0.25];
        let input: Vec<f64> = (0..300)
            .map(|i| (((i * 127) % 101) as f64 / 50.5 - 1.0))
            .collect();
        let mut rls = RlsFilter::<f64>::new(2, 0.99, 100.0).unwrap();
        for i in 0..input.len() {
            let desired = system_output(&system, &input, i);
            rls.adapt(input[i], desired);
        }
        for (w, b) in rls.weights().iter().zip(&system) {
            assert!((w - b).abs() < 1.0e-3, "weight {w} vs {b}");
        }
    }

    #[test]
    fn test_lms_save_load_round_trip() {
        let mut a = LmsFilter::<f64>::new(4, 0.1, 0.01, false).unwrap();
        for i in 0..50 {
            let x = (i as f64 * 0.37).sin();
            a.adapt(x, x * 0.5);
        }
        let mut state = Vec::new();
        a.save(&mut state);
        let mut b = LmsFilter::<f64>::new(4, 0.1, 0.01, false).unwrap();
        b.load(&state).unwrap();
        for i in 0..10 {
            let x = (i as f64 * 0.71).cos();
            assert_eq!(a.adapt(x, x), b.adapt(x, x));
        }
    }
}
