//! Peak detection.

use super::error::{DspError, Result};
use super::ring::Ring;
use super::Float;

fn check_window(window: usize) -> Result<usize> {
    if window < 3 || window % 2 == 0 {
        return Err(DspError::invalid("peak window must be odd and at least 3"));
    }
    Ok(window)
}

/// Find local maxima in `data`.
///
/// A sample is a peak when it exceeds its `window/2` neighbors on each side
/// and is at least `threshold`. When `min_distance` is nonzero, any peak
/// within that many samples of an already-accepted higher peak is dropped.
/// Returns accepted peak indices in ascending order.
pub fn find_peaks<F: Float>(
    data: &[F],
    window: usize,
    threshold: F,
    min_distance: usize,
) -> Result<Vec<usize>> {
    let window = check_window(window)?;
    let half = window / 2;
    let mut candidates: Vec<usize> = Vec::new();
    if data.len() >= window {
        for i in half..data.len() - half {
            let x = data[i];
            if x < threshold {
                continue;
            }
            let mut is_peak = true;
            for j in 1..=half {
                if data[i - j] >= x || data[i + j] >= x {
                    is_peak = false;
                    break;
                }
            }
            if is_peak {
                candidates.push(i);
            }
        }
    }
    if min_distance == 0 || candidates.len() < 2 {
        return Ok(candidates);
    }
    // Accept from highest to lowest, suppressing anything too close to an
    // already-accepted peak.
    let mut by_height = candidates.clone();
    by_height.sort_by(|&a, &b| data[b].partial_cmp(&data[a]).unwrap_or(core::cmp::Ordering::Equal));
    let mut accepted: Vec<usize> = Vec::new();
    for i in by_height {
        if accepted
            .iter()
            .all(|&j| i.abs_diff(j) > min_distance)
        {
            accepted.push(i);
        }
    }
    accepted.sort_unstable();
    Ok(accepted)
}

/// Streaming peak detector.
///
/// Emits one output sample per input sample, delayed by `window/2` samples:
/// the peak's value at peak positions and zero elsewhere. Suppression of
/// close peaks is greedy in time order, keeping the earliest peak of a
/// cluster.
pub struct PeakDetector<F: Float> {
    window: usize,
    threshold: F,
    min_distance: usize,
    ring: Ring<F>,
    /// Total samples seen.
    seen: u64,
    /// Global index of the last accepted peak.
    last_peak: Option<u64>,
}

impl<F: Float> PeakDetector<F> {
    pub fn new(window: usize, threshold: F, min_distance: usize) -> Result<Self> {
        let window = check_window(window)?;
        Ok(Self {
            window,
            threshold,
            min_distance,
            ring: Ring::new(window)?,
            seen: 0,
            last_peak: None,
        })
    }

    /// Output delay in samples.
    pub fn latency(&self) -> usize {
        self.window / 2
    }

    /// Feed one sample; returns the delayed detector output.
    pub fn push(&mut self, x: F) -> F {
        self.ring.push(x);
        self.seen += 1;
        if self.seen < self.window as u64 {
            return F::zero();
        }
        let view = self.ring.read_back(self.window);
        let half = self.window / 2;
        let center = view[half];
        if center < self.threshold {
            return F::zero();
        }
        for j in 0..self.window {
            if j != half && view[j] >= center {
                return F::zero();
            }
        }
        // Center index of the window in global sample numbering.
        let center_index = self.seen - 1 - half as u64;
        if let Some(last) = self.last_peak {
            if (center_index - last) as usize <= self.min_distance {
                return F::zero();
            }
        }
        self.last_peak = Some(center_index);
        center
    }

    /// Feed a slice, appending one output per input.
    pub fn process(&mut self, input: &[F], out: &mut Vec<F>) {
        out.extend(input.iter().map(|&x| self.push(x)));
    }

    pub fn reset(&mut self) {
        self.ring.clear();
        self.seen = 0;
        self.last_peak = None;
    }

    /// Serialize detector state.
    pub fn save(&self, out: &mut Vec<f64>) {
        out.push(self.ring.head() as f64);
        out.push(self.ring.count() as f64);
        out.push(self.seen as f64);
        match self.last_peak {
            Some(index) => {
                out.push(1.0);
                out.push(index as f64);
            }
            None => {
                out.push(0.0);
                out.push(0.0);
            }
        }
        out.extend(self.ring.primary().iter().map(|x| <F as crate::Float>::to_f64(*x)));
    }

    /// Restore state written by `save`.
    pub fn load(&mut self, state: &[f64]) -> Result<()> {
        let capacity = self.ring.capacity();
        if state.len() != 5 + capacity {
            return Err(DspError::StateMismatch(format!(
                "peak detector state length {} != {}",
                state.len(),
                5 + capacity
            )));
        }
        let samples: Vec<F> = state[5..].iter().map(|&v| <F as crate::Float>::from_f64(v)).collect();
        self.ring
            .restore(&samples, state[0] as usize, state[1] as usize)?;
        self.seen = state[2] as u64;
        self.last_peak = if state[3] != 0.0 {
            Some(state[4] as u64)
        } else {
            None
        };
        Ok(())
    }

    /// Length of the vector `save` writes.
    pub fn state_len(&self) -> usize {
        5 + self.ring.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_even_window() {
        assert!(find_peaks(&[0.0f64; 8], 4, 0.0, 0).is_err());
        assert!(find_peaks(&[0.0f64; 8], 1, 0.0, 0).is_err());
    }

    #[test]
    fn test_simple_peaks() {
        let data = [0.0f64, 1.0, 0.0, 0.5, 2.0, 0.5, 0.0, 3.0, 0.0];
        let peaks = find_peaks(&data, 3, 0.5, 0).unwrap();
        assert_eq!(peaks, vec![1, 4, 7]);
    }

    #[test]
    fn test_threshold_filters_low_peaks() {
        let data = [0.0f64, 1.0, 0.0, 0.5, 2.0, 0.5, 0.0, 3.0, 0.0];
        let peaks = find_peaks(&data, 3, 1.5, 0).unwrap();
        assert_eq!(peaks, vec![4, 7]);
    }

    #[test]
    fn test_min_distance_keeps_higher_peak() {
        let data = [0.0f64, 2.0, 0.0, 3.0, 0.0, 0.1, 0.0];
        // Peaks at 1 and 3; with distance 2 only the higher (index 3)
        // survives.
        let peaks = find_peaks(&data, 3, 0.0, 2).unwrap();
        assert_eq!(peaks, vec![3]);
    }

    #[test]
    fn test_streaming_matches_batch_positions() {
        let data: Vec<f64> = (0..64)
            .map(|i| (i as f64 * 0.71).sin() + 0.3 * (i as f64 * 0.13).cos())
            .collect();
        let batch = find_peaks(&data, 5, 0.2, 0).unwrap();

        let mut detector = PeakDetector::new(5, 0.2, 0).unwrap();
        let mut out = Vec::new();
        detector.process(&data, &mut out);
        let streamed: Vec<usize> = out
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != 0.0)
            .map(|(i, _)| i - detector.latency())
            .collect();
        assert_eq!(streamed, batch);
    }

    #[test]
    fn test_streaming_split_invariance() {
        let data: Vec<f64> = (0..50).map(|i| ((i * 17) % 13) as f64).collect();
        let mut whole = PeakDetector::new(3, 1.0, 2).unwrap();
        let mut out_whole = Vec::new();
        whole.process(&data, &mut out_whole);

        let mut split = PeakDetector::new(3, 1.0, 2).unwrap();
        let mut out_split = Vec::new();
        split.process(&data[..17], &mut out_split);
        split.process(&data[17..], &mut out_split);
        assert_eq!(out_whole, out_split);
    }
}
