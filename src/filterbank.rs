//! Banks of band filters with per-channel fan-out.

use super::error::{DspError, Result};
use super::iir::{butterworth_bandpass, IirCoefs, IirFilter};
use super::Float;

/// Frequency spacing of the band centers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BankScale {
    /// Evenly spaced edges in Hz.
    Linear,
    /// Evenly spaced edges in log frequency.
    Log,
    /// Evenly spaced edges on the mel scale.
    Mel,
    /// Evenly spaced edges on the Bark scale.
    Bark,
}

fn to_scale(scale: BankScale, hz: f64) -> f64 {
    match scale {
        BankScale::Linear => hz,
        BankScale::Log => hz.ln(),
        BankScale::Mel => 2595.0 * (1.0 + hz / 700.0).log10(),
        BankScale::Bark => {
            13.0 * (0.00076 * hz).atan() + 3.5 * ((hz / 7500.0) * (hz / 7500.0)).atan()
        }
    }
}

fn from_scale(scale: BankScale, v: f64) -> f64 {
    match scale {
        BankScale::Linear => v,
        BankScale::Log => v.exp(),
        BankScale::Mel => 700.0 * (10.0f64.powf(v / 2595.0) - 1.0),
        BankScale::Bark => {
            // No closed form; bisect the forward map.
            let (mut lo, mut hi) = (1.0e-3, 30000.0);
            for _ in 0..64 {
                let mid = 0.5 * (lo + hi);
                if to_scale(BankScale::Bark, mid) < v {
                    lo = mid;
                } else {
                    hi = mid;
                }
            }
            0.5 * (lo + hi)
        }
    }
}

/// Band edges for `bands` filters between `fmin` and `fmax`, evenly spaced
/// on the chosen scale. Returns `bands + 1` edges in Hz.
pub fn band_edges(
    scale: BankScale,
    bands: usize,
    fmin: f64,
    fmax: f64,
) -> Result<Vec<f64>> {
    if bands == 0 {
        return Err(DspError::invalid("filter bank needs at least one band"));
    }
    if !(fmin > 0.0 && fmin < fmax) {
        return Err(DspError::invalid("band range must satisfy 0 < fmin < fmax"));
    }
    let lo = to_scale(scale, fmin);
    let hi = to_scale(scale, fmax);
    Ok((0..=bands)
        .map(|i| from_scale(scale, lo + (hi - lo) * i as f64 / bands as f64))
        .collect())
}

/// Design a bank of Butterworth band-pass filters on the chosen scale.
pub fn design_bank<F: Float>(
    scale: BankScale,
    bands: usize,
    fmin: f64,
    fmax: f64,
    sample_rate: f64,
) -> Result<Vec<IirCoefs<F>>> {
    if fmax >= sample_rate * 0.5 {
        return Err(DspError::invalid("fmax must be below Nyquist"));
    }
    let edges = band_edges(scale, bands, fmin, fmax)?;
    edges
        .windows(2)
        .map(|edge| butterworth_bandpass(edge[0], edge[1], sample_rate))
        .collect()
}

/// A bank of filters applied to every input channel.
///
/// For `C` input channels and `B` band definitions the output carries
/// `C * B` channels in channel-fan-out order: all bands of input channel 0,
/// then all bands of channel 1, and so on.
pub struct FilterBank<F: Float> {
    definitions: Vec<IirCoefs<F>>,
    /// One filter per (input channel, band), channel-major.
    filters: Vec<IirFilter<F>>,
    channels: usize,
}

impl<F: Float> FilterBank<F> {
    pub fn new(definitions: Vec<IirCoefs<F>>) -> Result<Self> {
        if definitions.is_empty() {
            return Err(DspError::invalid("filter bank needs at least one band"));
        }
        Ok(Self {
            definitions,
            filters: Vec::new(),
            channels: 0,
        })
    }

    /// Number of band definitions.
    pub fn bands(&self) -> usize {
        self.definitions.len()
    }

    /// Allocate per-channel filters. Idempotent for an unchanged channel
    /// count.
    pub fn init(&mut self, channels: usize) -> Result<()> {
        if channels == 0 {
            return Err(DspError::invalid("channel count must be nonzero"));
        }
        if self.channels == channels && !self.filters.is_empty() {
            return Ok(());
        }
        let mut filters = Vec::with_capacity(channels * self.definitions.len());
        for _ in 0..channels {
            for definition in &self.definitions {
                filters.push(IirFilter::new(definition.clone())?);
            }
        }
        self.filters = filters;
        self.channels = channels;
        Ok(())
    }

    /// Process interleaved frames, appending `C * B` interleaved output
    /// channels per frame.
    pub fn process(&mut self, input: &[F], out: &mut Vec<F>) -> Result<()> {
        if self.channels == 0 {
            return Err(DspError::invalid("filter bank not initialized"));
        }
        if input.len() % self.channels != 0 {
            return Err(DspError::ShapeMismatch(format!(
                "input length {} not a multiple of {} channels",
                input.len(),
                self.channels
            )));
        }
        let bands = self.definitions.len();
        for frame in input.chunks_exact(self.channels) {
            for (c, &x) in frame.iter().enumerate() {
                for b in 0..bands {
                    out.push(self.filters[c * bands + b].filter(x));
                }
            }
        }
        Ok(())
    }

    /// Zero every filter.
    pub fn reset(&mut self) {
        for filter in &mut self.filters {
            filter.reset();
        }
    }

    /// Serialize every filter's state, channel-major.
    pub fn save(&self, out: &mut Vec<f64>) {
        for filter in &self.filters {
            filter.save(out);
        }
    }

    /// Restore state written by `save`.
    pub fn load(&mut self, state: &[f64]) -> Result<()> {
        let expected: usize = self.filters.iter().map(|f| f.state_len()).sum();
        if state.len() != expected {
            return Err(DspError::StateMismatch(format!(
                "filter bank state length {} != {}",
                state.len(),
                expected
            )));
        }
        // Validate all restores on clones before committing.
        let mut restored = self.filters.clone();
        let mut offset = 0;
        for filter in &mut restored {
            let len = filter.state_len();
            filter.load(&state[offset..offset + len])?;
            offset += len;
        }
        self.filters = restored;
        Ok(())
    }

    /// Length of the vector `save` writes.
    pub fn state_len(&self) -> usize {
        self.filters.iter().map(|f| f.state_len()).sum()
    }
}
