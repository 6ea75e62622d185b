//! Policy-driven sliding-window filter.

use super::error::{DspError, Result};
use super::policy::Policy;
use super::ring::Ring;
use super::Float;

/// Default sample capacity for time-windowed filters.
pub const DEFAULT_TIME_CAPACITY: usize = 1024;

/// Window extent: a fixed number of samples, or a wall-clock duration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WindowSpec {
    /// The window holds the last `n` samples.
    Count(usize),
    /// The window holds samples younger than `ms` milliseconds, bounded by
    /// `capacity` samples. Oldest samples are overwritten past the bound.
    Duration { ms: f64, capacity: usize },
}

impl WindowSpec {
    /// Time window of `ms` milliseconds with the default sample capacity.
    pub fn duration(ms: f64) -> Self {
        WindowSpec::Duration {
            ms,
            capacity: DEFAULT_TIME_CAPACITY,
        }
    }
}

/// Generic sliding aggregate over a streaming signal.
///
/// Feeding a sample updates the policy with the arriving value and any
/// values that leave the window, then returns the aggregate. In time-aware
/// mode samples older than the window duration are expired first.
#[derive(Clone)]
pub struct SlidingFilter<F: Float, P: Policy<F>> {
    ring: Ring<F>,
    /// Arrival timestamps, present in time-aware mode only.
    times: Option<Ring<f64>>,
    /// Eviction threshold in samples (count mode) or capacity bound
    /// (duration mode).
    window: usize,
    /// Window duration in milliseconds for time-aware mode.
    duration_ms: Option<f64>,
    policy: P,
}

impl<F: Float, P: Policy<F>> SlidingFilter<F, P> {
    pub fn new(spec: WindowSpec, policy: P) -> Result<Self> {
        match spec {
            WindowSpec::Count(window) => {
                if window == 0 {
                    return Err(DspError::invalid("window size must be nonzero"));
                }
                Ok(Self {
                    ring: Ring::new(window)?,
                    times: None,
                    window,
                    duration_ms: None,
                    policy,
                })
            }
            WindowSpec::Duration { ms, capacity } => {
                if !(ms > 0.0) {
                    return Err(DspError::invalid("window duration must be positive"));
                }
                if capacity == 0 {
                    return Err(DspError::invalid("window capacity must be nonzero"));
                }
                Ok(Self {
                    ring: Ring::new(capacity)?,
                    times: Some(Ring::new(capacity)?),
                    window: capacity,
                    duration_ms: Some(ms),
                    policy,
                })
            }
        }
    }

    /// Number of samples currently inside the window.
    #[inline]
    pub fn count(&self) -> usize {
        self.ring.count()
    }

    /// Current aggregate without feeding a sample.
    #[inline]
    pub fn value(&self) -> F {
        self.policy.result(self.ring.count())
    }

    /// Feed one sample and return the updated aggregate.
    /// `time` is the sample's wall-clock timestamp in milliseconds; it is
    /// ignored in count mode, and without it a time-aware filter performs no
    /// expiry and degrades to a capacity-bounded window.
    pub fn add(&mut self, x: F, time: Option<f64>) -> F {
        if let (Some(duration), Some(t)) = (self.duration_ms, time) {
            self.expire_older_than(t - duration);
        }
        if self.ring.count() == self.window {
            self.evict_oldest();
        }
        self.ring.push(x);
        if let Some(times) = &mut self.times {
            times.push(time.unwrap_or(f64::NAN));
        }
        self.policy.on_add(x);
        self.policy.result(self.ring.count())
    }

    fn evict_oldest(&mut self) {
        let oldest = self.ring.at_back(self.ring.count() - 1);
        self.policy.on_remove(oldest);
        self.ring.pop_oldest();
        if let Some(times) = &mut self.times {
            times.pop_oldest();
        }
    }

    fn expire_older_than(&mut self, cutoff: f64) {
        while self.ring.count() > 0 {
            let age = self.ring.count() - 1;
            let t = match &self.times {
                Some(times) => times.at_back(age),
                None => return,
            };
            // NaN timestamps (samples fed without time) never expire.
            if !(t < cutoff) {
                break;
            }
            self.evict_oldest();
        }
    }

    /// Zero the buffer and the aggregate.
    pub fn reset(&mut self) {
        self.ring.clear();
        if let Some(times) = &mut self.times {
            times.clear();
        }
        self.policy.clear();
    }

    /// Serialize buffer contents and policy aggregate as one flat f64 vector.
    /// Layout: head, count, ring samples, [timestamps], policy state.
    pub fn save(&self, out: &mut Vec<f64>) {
        out.push(self.ring.head() as f64);
        out.push(self.ring.count() as f64);
        out.extend(self.ring.primary().iter().map(|x| <F as crate::Float>::to_f64(*x)));
        if let Some(times) = &self.times {
            out.extend(times.primary().iter());
        }
        self.policy.save(out);
    }

    /// Restore state written by `save`. Buffer and policy swap atomically:
    /// on any error the filter is left untouched.
    pub fn load(&mut self, state: &[f64]) -> Result<()> {
        let capacity = self.ring.capacity();
        let time_len = if self.times.is_some() { capacity } else { 0 };
        if state.len() < 2 + capacity + time_len {
            return Err(DspError::StateCorrupted(
                "sliding filter state too short".into(),
            ));
        }
        let head = state[0] as usize;
        let count = state[1] as usize;
        let samples: Vec<F> = state[2..2 + capacity]
            .iter()
            .map(|&x| <F as crate::Float>::from_f64(x))
            .collect();
        let times = &state[2 + capacity..2 + capacity + time_len];
        let policy_state = &state[2 + capacity + time_len..];

        // Validate into a scratch policy before mutating anything.
        let mut policy = self.policy.clone();
        policy.load(policy_state)?;
        let mut ring = self.ring.clone();
        ring.restore(&samples, head, count)?;
        let mut time_ring = self.times.clone();
        if let Some(time_ring) = &mut time_ring {
            time_ring.restore(times, head, count)?;
        }

        self.policy = policy;
        self.ring = ring;
        self.times = time_ring;
        Ok(())
    }

    /// Length of the vector `save` writes.
    pub fn state_len(&self) -> usize {
        let time_len = if self.times.is_some() {
            self.ring.capacity()
        } else {
            0
        };
        2 + self.ring.capacity() + time_len + self.policy.state_len()
    }
}
