//! Analysis window functions.

use super::Float;

/// Window function shapes used by FIR design and short-time transforms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WindowType {
    /// All-ones window.
    Rectangular,
    /// Raised cosine, zero at the edges.
    #[default]
    Hann,
    /// Raised cosine on a pedestal.
    Hamming,
    /// Three-term Blackman window.
    Blackman,
    /// Triangular window.
    Bartlett,
}

impl WindowType {
    /// Window value at position `i` of an `n`-point window.
    pub fn at<F: Float>(&self, i: usize, n: usize) -> F {
        if n <= 1 {
            return F::one();
        }
        let x = <F as crate::Float>::from_f64(i as f64 / (n - 1) as f64);
        let tau = F::TAU();
        match self {
            WindowType::Rectangular => F::one(),
            WindowType::Hann => <F as crate::Float>::from_f64(0.5) * (F::one() - (tau * x).cos()),
            WindowType::Hamming => {
                <F as crate::Float>::from_f64(0.54) - <F as crate::Float>::from_f64(0.46) * (tau * x).cos()
            }
            WindowType::Blackman => {
                <F as crate::Float>::from_f64(0.42) - <F as crate::Float>::from_f64(0.5) * (tau * x).cos()
                    + <F as crate::Float>::from_f64(0.08) * (<F as crate::Float>::from_f64(2.0) * tau * x).cos()
            }
            WindowType::Bartlett => {
                let two = <F as crate::Float>::from_f64(2.0);
                F::one() - num_traits::Float::abs(two * x - F::one())
            }
        }
    }
}

/// Materialize an `n`-point window vector.
pub fn window_vector<F: Float>(window: WindowType, n: usize) -> Vec<F> {
    (0..n).map(|i| window.at(i, n)).collect()
}
