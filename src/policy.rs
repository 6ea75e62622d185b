//! Statistical policies consumed by the sliding-window filter.
//!
//! A policy is a small strategy object keeping a running aggregate that stays
//! consistent with the window contents under `on_add`/`on_remove`. The
//! sliding-window filter owns the buffer; policies only see the samples that
//! enter and leave it.

use std::collections::VecDeque;

use super::error::{DspError, Result};
use super::Float;

/// Default standard deviation floor for the Z-score policy.
pub const ZSCORE_EPSILON: f64 = 1.0e-8;

/// The statistical contract of a sliding aggregate.
///
/// After any sequence of `on_add`/`on_remove` calls consistent with the
/// window contents, `result` equals a full recomputation from the window
/// up to floating-point rounding.
pub trait Policy<F: Float>: Clone + Send {
    /// A sample entered the window.
    fn on_add(&mut self, x: F);
    /// A sample left the window.
    fn on_remove(&mut self, x: F);
    /// Forget everything.
    fn clear(&mut self);
    /// Current aggregate given the number of samples in the window.
    fn result(&self, count: usize) -> F;
    /// Append the aggregate state to `out`.
    fn save(&self, out: &mut Vec<f64>);
    /// Restore the aggregate state written by `save`.
    fn load(&mut self, state: &[f64]) -> Result<()>;
    /// Number of values `save` appends. Variable-length policies override
    /// `save`/`load` and report the current length here.
    fn state_len(&self) -> usize;
}

fn take<const N: usize>(state: &[f64]) -> Result<[f64; N]> {
    if state.len() != N {
        return Err(DspError::StateCorrupted(format!(
            "policy state length {} != {}",
            state.len(),
            N
        )));
    }
    let mut out = [0.0; N];
    out.copy_from_slice(state);
    Ok(out)
}

/// Running sum.
#[derive(Clone, Default)]
pub struct SumPolicy {
    sum: f64,
}

impl<F: Float> Policy<F> for SumPolicy {
    #[inline]
    fn on_add(&mut self, x: F) {
        self.sum += x.to_f64();
    }
    #[inline]
    fn on_remove(&mut self, x: F) {
        self.sum -= x.to_f64();
    }
    fn clear(&mut self) {
        self.sum = 0.0;
    }
    #[inline]
    fn result(&self, _count: usize) -> F {
        <F as crate::Float>::from_f64(self.sum)
    }
    fn save(&self, out: &mut Vec<f64>) {
        out.push(self.sum);
    }
    fn load(&mut self, state: &[f64]) -> Result<()> {
        [self.sum] = take::<1>(state)?;
        Ok(())
    }
    fn state_len(&self) -> usize {
        1
    }
}

/// Number of samples currently in the window.
#[derive(Clone, Default)]
pub struct CounterPolicy {
    count: i64,
}

impl<F: Float> Policy<F> for CounterPolicy {
    #[inline]
    fn on_add(&mut self, _x: F) {
        self.count += 1;
    }
    #[inline]
    fn on_remove(&mut self, _x: F) {
        self.count -= 1;
    }
    fn clear(&mut self) {
        self.count = 0;
    }
    #[inline]
    fn result(&self, _count: usize) -> F {
        <F as crate::Float>::from_f64(self.count as f64)
    }
    fn save(&self, out: &mut Vec<f64>) {
        out.push(self.count as f64);
    }
    fn load(&mut self, state: &[f64]) -> Result<()> {
        let [count] = take::<1>(state)?;
        self.count = count as i64;
        Ok(())
    }
    fn state_len(&self) -> usize {
        1
    }
}

/// Arithmetic mean over the window.
#[derive(Clone, Default)]
pub struct MeanPolicy {
    sum: f64,
}

impl<F: Float> Policy<F> for MeanPolicy {
    #[inline]
    fn on_add(&mut self, x: F) {
        self.sum += x.to_f64();
    }
    #[inline]
    fn on_remove(&mut self, x: F) {
        self.sum -= x.to_f64();
    }
    fn clear(&mut self) {
        self.sum = 0.0;
    }
    #[inline]
    fn result(&self, count: usize) -> F {
        if count == 0 {
            F::zero()
        } else {
            <F as crate::Float>::from_f64(self.sum / count as f64)
        }
    }
    fn save(&self, out: &mut Vec<f64>) {
        out.push(self.sum);
    }
    fn load(&mut self, state: &[f64]) -> Result<()> {
        [self.sum] = take::<1>(state)?;
        Ok(())
    }
    fn state_len(&self) -> usize {
        1
    }
}

/// Root mean square over the window.
/// The mean square is clamped at zero before the root, so rounding in the
/// running sum can never produce NaN.
#[derive(Clone, Default)]
pub struct RmsPolicy {
    sum_sq: f64,
}

impl<F: Float> Policy<F> for RmsPolicy {
    #[inline]
    fn on_add(&mut self, x: F) {
        let x = x.to_f64();
        self.sum_sq += x * x;
    }
    #[inline]
    fn on_remove(&mut self, x: F) {
        let x = x.to_f64();
        self.sum_sq -= x * x;
    }
    fn clear(&mut self) {
        self.sum_sq = 0.0;
    }
    #[inline]
    fn result(&self, count: usize) -> F {
        if count == 0 {
            F::zero()
        } else {
            <F as crate::Float>::from_f64((self.sum_sq / count as f64).max(0.0).sqrt())
        }
    }
    fn save(&self, out: &mut Vec<f64>) {
        out.push(self.sum_sq);
    }
    fn load(&mut self, state: &[f64]) -> Result<()> {
        [self.sum_sq] = take::<1>(state)?;
        Ok(())
    }
    fn state_len(&self) -> usize {
        1
    }
}

/// Population variance `max(0, E[x^2] - E[x]^2)` over the window.
#[derive(Clone, Default)]
pub struct VariancePolicy {
    sum: f64,
    sum_sq: f64,
}

impl VariancePolicy {
    fn variance(&self, count: usize) -> f64 {
        if count == 0 {
            return 0.0;
        }
        let n = count as f64;
        let mean = self.sum / n;
        (self.sum_sq / n - mean * mean).max(0.0)
    }
}

impl<F: Float> Policy<F> for VariancePolicy {
    #[inline]
    fn on_add(&mut self, x: F) {
        let x = x.to_f64();
        self.sum += x;
        self.sum_sq += x * x;
    }
    #[inline]
    fn on_remove(&mut self, x: F) {
        let x = x.to_f64();
        self.sum -= x;
        self.sum_sq -= x * x;
    }
    fn clear(&mut self) {
        self.sum = 0.0;
        self.sum_sq = 0.0;
    }
    #[inline]
    fn result(&self, count: usize) -> F {
        <F as crate::Float>::from_f64(self.variance(count))
    }
    fn save(&self, out: &mut Vec<f64>) {
        out.push(self.sum);
        out.push(self.sum_sq);
    }
    fn load(&mut self, state: &[f64]) -> Result<()> {
        [self.sum, self.sum_sq] = take::<2>(state)?;
        Ok(())
    }
    fn state_len(&self) -> usize {
        2
    }
}

/// Mean absolute value over the window.
#[derive(Clone, Default)]
pub struct MavPolicy {
    sum_abs: f64,
}

impl<F: Float> Policy<F> for MavPolicy {
    #[inline]
    fn on_add(&mut self, x: F) {
        self.sum_abs += x.to_f64().abs();
    }
    #[inline]
    fn on_remove(&mut self, x: F) {
        self.sum_abs -= x.to_f64().abs();
    }
    fn clear(&mut self) {
        self.sum_abs = 0.0;
    }
    #[inline]
    fn result(&self, count: usize) -> F {
        if count == 0 {
            F::zero()
        } else {
            <F as crate::Float>::from_f64(self.sum_abs / count as f64)
        }
    }
    fn save(&self, out: &mut Vec<f64>) {
        out.push(self.sum_abs);
    }
    fn load(&mut self, state: &[f64]) -> Result<()> {
        [self.sum_abs] = take::<1>(state)?;
        Ok(())
    }
    fn state_len(&self) -> usize {
        1
    }
}

/// Z-score of the most recent sample against the window statistics.
/// Returns 0 when the standard deviation is below `epsilon`.
#[derive(Clone)]
pub struct ZScorePolicy {
    moments: VariancePolicy,
    last: f64,
    epsilon: f64,
}

impl Default for ZScorePolicy {
    fn default() -> Self {
        Self {
            moments: VariancePolicy::default(),
            last: 0.0,
            epsilon: ZSCORE_EPSILON,
        }
    }
}

impl ZScorePolicy {
    pub fn with_epsilon(epsilon: f64) -> Self {
        Self {
            epsilon,
            ..Self::default()
        }
    }
}

impl<F: Float> Policy<F> for ZScorePolicy {
    #[inline]
    fn on_add(&mut self, x: F) {
        Policy::<F>::on_add(&mut self.moments, x);
        self.last = x.to_f64();
    }
    #[inline]
    fn on_remove(&mut self, x: F) {
        Policy::<F>::on_remove(&mut self.moments, x);
    }
    fn clear(&mut self) {
        Policy::<F>::clear(&mut self.moments);
        self.last = 0.0;
    }
    #[inline]
    fn result(&self, count: usize) -> F {
        if count == 0 {
            return F::zero();
        }
        let stddev = self.moments.variance(count).sqrt();
        if stddev < self.epsilon {
            return F::zero();
        }
        let mean = self.moments.sum / count as f64;
        <F as crate::Float>::from_f64((self.last - mean) / stddev)
    }
    fn save(&self, out: &mut Vec<f64>) {
        Policy::<F>::save(&self.moments, out);
        out.push(self.last);
    }
    fn load(&mut self, state: &[f64]) -> Result<()> {
        if state.len() != 3 {
            return Err(DspError::StateCorrupted(
                "z-score policy state length".into(),
            ));
        }
        Policy::<F>::load(&mut self.moments, &state[..2])?;
        self.last = state[2];
        Ok(())
    }
    fn state_len(&self) -> usize {
        3
    }
}

/// Exponential moving average with smoothing factor `alpha`.
/// Initialized to the first sample; removal is a no-op because the EMA
/// recursion is not reversible. Exposed through the policy surface for API
/// uniformity.
#[derive(Clone)]
pub struct EmaPolicy {
    alpha: f64,
    ema: f64,
    initialized: bool,
}

impl EmaPolicy {
    /// `alpha` must lie in (0, 1].
    pub fn new(alpha: f64) -> Result<Self> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(DspError::invalid("EMA alpha must be in (0, 1]"));
        }
        Ok(Self {
            alpha,
            ema: 0.0,
            initialized: false,
        })
    }
}

impl<F: Float> Policy<F> for EmaPolicy {
    #[inline]
    fn on_add(&mut self, x: F) {
        let x = x.to_f64();
        if self.initialized {
            self.ema = self.alpha * x + (1.0 - self.alpha) * self.ema;
        } else {
            self.ema = x;
            self.initialized = true;
        }
    }
    #[inline]
    fn on_remove(&mut self, _x: F) {}
    fn clear(&mut self) {
        self.ema = 0.0;
        self.initialized = false;
    }
    #[inline]
    fn result(&self, _count: usize) -> F {
        <F as crate::Float>::from_f64(self.ema)
    }
    fn save(&self, out: &mut Vec<f64>) {
        out.push(self.ema);
        out.push(if self.initialized { 1.0 } else { 0.0 });
    }
    fn load(&mut self, state: &[f64]) -> Result<()> {
        let [ema, initialized] = take::<2>(state)?;
        self.ema = ema;
        self.initialized = initialized != 0.0;
        Ok(())
    }
    fn state_len(&self) -> usize {
        2
    }
}

/// Cumulative moving average over everything ever added.
/// Keeps a global sum and count independent of the window size.
#[derive(Clone, Default)]
pub struct CmaPolicy {
    sum: f64,
    count: i64,
}

impl<F: Float> Policy<F> for CmaPolicy {
    #[inline]
    fn on_add(&mut self, x: F) {
        self.sum += x.to_f64();
        self.count += 1;
    }
    #[inline]
    fn on_remove(&mut self, x: F) {
        self.sum -= x.to_f64();
        self.count -= 1;
    }
    fn clear(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
    #[inline]
    fn result(&self, _count: usize) -> F {
        if self.count <= 0 {
            F::zero()
        } else {
            <F as crate::Float>::from_f64(self.sum / self.count as f64)
        }
    }
    fn save(&self, out: &mut Vec<f64>) {
        out.push(self.sum);
        out.push(self.count as f64);
    }
    fn load(&mut self, state: &[f64]) -> Result<()> {
        let [sum, count] = take::<2>(state)?;
        self.sum = sum;
        self.count = count as i64;
        Ok(())
    }
    fn state_len(&self) -> usize {
        2
    }
}

/// Maximum over the window via a monotonically decreasing deque.
/// Amortized O(1) per sample.
#[derive(Clone, Default)]
pub struct PeakPolicy {
    deque: VecDeque<f64>,
}

impl<F: Float> Policy<F> for PeakPolicy {
    #[inline]
    fn on_add(&mut self, x: F) {
        let x = x.to_f64();
        while matches!(self.deque.back(), Some(&back) if back < x) {
            self.deque.pop_back();
        }
        self.deque.push_back(x);
    }
    #[inline]
    fn on_remove(&mut self, x: F) {
        if matches!(self.deque.front(), Some(&front) if front == x.to_f64()) {
            self.deque.pop_front();
        }
    }
    fn clear(&mut self) {
        self.deque.clear();
    }
    #[inline]
    fn result(&self, _count: usize) -> F {
        match self.deque.front() {
            Some(&front) => <F as crate::Float>::from_f64(front),
            None => F::zero(),
        }
    }
    fn save(&self, out: &mut Vec<f64>) {
        out.extend(self.deque.iter());
    }
    fn load(&mut self, state: &[f64]) -> Result<()> {
        self.deque = state.iter().copied().collect();
        Ok(())
    }
    fn state_len(&self) -> usize {
        self.deque.len()
    }
}

/// Policy selected at runtime. Dispatches the statistical contract to the
/// concrete policy; used by stages built from configuration records.
#[derive(Clone)]
pub enum AnyPolicy {
    Mean(MeanPolicy),
    Rms(RmsPolicy),
    Variance(VariancePolicy),
    Mav(MavPolicy),
    ZScore(ZScorePolicy),
    Ema(EmaPolicy),
    Cma(CmaPolicy),
    Sum(SumPolicy),
    Counter(CounterPolicy),
    Peak(PeakPolicy),
}

macro_rules! dispatch {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            AnyPolicy::Mean($inner) => $body,
            AnyPolicy::Rms($inner) => $body,
            AnyPolicy::Variance($inner) => $body,
            AnyPolicy::Mav($inner) => $body,
            AnyPolicy::ZScore($inner) => $body,
            AnyPolicy::Ema($inner) => $body,
            AnyPolicy::Cma($inner) => $body,
            AnyPolicy::Sum($inner) => $body,
            AnyPolicy::Counter($inner) => $body,
            AnyPolicy::Peak($inner) => $body,
        }
    };
}

impl<F: Float> Policy<F> for AnyPolicy {
    #[inline]
    fn on_add(&mut self, x: F) {
        dispatch!(self, inner => Policy::<F>::on_add(inner, x))
    }
    #[inline]
    fn on_remove(&mut self, x: F) {
        dispatch!(self, inner => Policy::<F>::on_remove(inner, x))
    }
    fn clear(&mut self) {
        dispatch!(self, inner => Policy::<F>::clear(inner))
    }
    #[inline]
    fn result(&self, count: usize) -> F {
        dispatch!(self, inner => Policy::<F>::result(inner, count))
    }
    fn save(&self, out: &mut Vec<f64>) {
        dispatch!(self, inner => Policy::<F>::save(inner, out))
    }
    fn load(&mut self, state: &[f64]) -> Result<()> {
        dispatch!(self, inner => Policy::<F>::load(inner, state))
    }
    fn state_len(&self) -> usize {
        dispatch!(self, inner => Policy::<F>::state_len(inner))
    }
}
