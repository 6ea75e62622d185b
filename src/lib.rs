//! flowdsp is a composable, stateful, multi-channel signal processing library.
//!
//! The user assembles an ordered [`Pipeline`](crate::pipeline::Pipeline) of
//! processing stages (filters, transforms, statistics) and pushes buffers of
//! interleaved samples through it. Each stage maintains its own streaming
//! state across calls, so a long input split into arbitrary chunks produces
//! the same output as if it had been processed whole.

#![allow(clippy::precedence, clippy::needless_range_loop, clippy::len_zero)]

use rustfft::FftNum;

pub mod adaptive;
pub mod batch;
pub mod codec;
pub mod convolve;
pub mod dct;
pub mod error;
pub mod fft;
pub mod filterbank;
pub mod fir;
pub mod iir;
pub mod math;
pub mod matrix;
pub mod peaks;
pub mod pipeline;
pub mod policy;
pub mod ring;
pub mod simd;
pub mod sliding;
pub mod stage;
pub mod stft;
pub mod window;

/// Default sample rate in Hz.
pub const DEFAULT_SR: f64 = 44100.0;

/// Sample type abstraction. Pipelines are monomorphic in the sample type:
/// every stage of a `Pipeline<F>` processes `F` samples end to end.
///
/// The bounds pull in everything a stage kernel may need: transcendental
/// functions, FFT capability, byte views for hashing and serialization.
pub trait Float:
    FftNum + num_traits::Float + num_traits::FloatConst + bytemuck::Pod + Default + core::iter::Sum
{
    /// Convert from `f64`, rounding to nearest.
    fn from_f64(x: f64) -> Self;
    /// Convert from `f32`.
    fn from_f32(x: f32) -> Self;
    /// Convert to `f64`.
    fn to_f64(self) -> f64;
    /// Convert to `f32`.
    fn to_f32(self) -> f32;
    /// Dot product of two equal-length slices using the best available
    /// SIMD path for this sample type.
    fn dot(a: &[Self], b: &[Self]) -> Self;
}

impl Float for f32 {
    #[inline(always)]
    fn from_f64(x: f64) -> Self {
        x as f32
    }
    #[inline(always)]
    fn from_f32(x: f32) -> Self {
        x
    }
    #[inline(always)]
    fn to_f64(self) -> f64 {
        self as f64
    }
    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }
    #[inline]
    fn dot(a: &[Self], b: &[Self]) -> Self {
        simd::dot_f32(a, b)
    }
}

impl Float for f64 {
    #[inline(always)]
    fn from_f64(x: f64) -> Self {
        x
    }
    #[inline(always)]
    fn from_f32(x: f32) -> Self {
        x as f64
    }
    #[inline(always)]
    fn to_f64(self) -> f64 {
        self
    }
    #[inline(always)]
    fn to_f32(self) -> f32 {
        self as f32
    }
    #[inline]
    fn dot(a: &[Self], b: &[Self]) -> Self {
        simd::dot_f64(a, b)
    }
}

pub use error::{DspError, Result};
pub use pipeline::{Pipeline, PipelineConfig};
pub use stage::{Stage, StageConfig, StageKind};

/// Commonly used items.
pub mod prelude {
    pub use super::adaptive::{LmsFilter, RlsFilter};
    pub use super::batch::{FftBatchConfig, FftBatchProcessor, FftJob};
    pub use super::convolve::{ConvolutionMode, Convolver};
    pub use super::dct::Dct;
    pub use super::error::{DspError, Result};
    pub use super::fft::{bin_frequencies, FftEngine};
    pub use super::filterbank::{BankScale, FilterBank};
    pub use super::fir::{FirCoefs, FirFilter};
    pub use super::iir::{IirCoefs, IirFilter};
    pub use super::matrix::{fast_ica, pca, zca_whitening, MatrixTransform};
    pub use super::peaks::{find_peaks, PeakDetector};
    pub use super::pipeline::{Pipeline, PipelineConfig};
    pub use super::policy::*;
    pub use super::sliding::{SlidingFilter, WindowSpec};
    pub use super::stage::{Stage, StageConfig, StageKind};
    pub use super::stft::{MovingFft, SpectrumOutput};
    pub use super::window::{window_vector, WindowType};
    pub use super::{Float, DEFAULT_SR};
}
