//! Discrete cosine transform with a precomputed coefficient table.

use super::error::{DspError, Result};
use super::{math, Float};

/// Orthonormal type-II DCT; the inverse is the type-III transform using the
/// same table. Construction precomputes the full `N x N` cosine table, so a
/// transform is `N` dot products against contiguous rows.
pub struct Dct<F: Float> {
    size: usize,
    /// Row-major `table[k * size + n] = s(k) cos(pi (2n+1) k / (2N))`.
    table: Vec<F>,
}

impl<F: Float> Dct<F> {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(DspError::invalid("DCT size must be nonzero"));
        }
        let n = size as f64;
        let mut table = Vec::with_capacity(size * size);
        for k in 0..size {
            let scale = if k == 0 {
                (1.0 / n).sqrt()
            } else {
                (2.0 / n).sqrt()
            };
            for i in 0..size {
                let angle = math::PI * (2.0 * i as f64 + 1.0) * k as f64 / (2.0 * n);
                table.push(<F as crate::Float>::from_f64(scale * angle.cos()));
            }
        }
        Ok(Self { size, table })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Forward type-II transform.
    pub fn forward(&self, input: &[F]) -> Result<Vec<F>> {
        if input.len() != self.size {
            return Err(DspError::ShapeMismatch(format!(
                "DCT input length {} != {}",
                input.len(),
                self.size
            )));
        }
        Ok((0..self.size)
            .map(|k| F::dot(&self.table[k * self.size..(k + 1) * self.size], input))
            .collect())
    }

    /// Inverse (type-III) transform.
    pub fn inverse(&self, input: &[F]) -> Result<Vec<F>> {
        if input.len() != self.size {
            return Err(DspError::ShapeMismatch(format!(
                "DCT input length {} != {}",
                input.len(),
                self.size
            )));
        }
        let mut out = vec![F::zero(); self.size];
        for k in 0..self.size {
            let row = &self.table[k * self.size..(k + 1) * self.size];
            let coef = input[k];
            for n in 0..self.size {
                out[n] = out[n] + coef * row[n];
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dct = Dct::<f64>::new(32).unwrap();
        let input: Vec<f64> = (0..32).map(|i| ((i * 13) % 7) as f64 - 3.0).collect();
        let transformed = dct.forward(&input).unwrap();
        let restored = dct.inverse(&transformed).unwrap();
        for (x, y) in input.iter().zip(&restored) {
            assert!((x - y).abs() < 1.0e-10);
        }
    }

    #[test]
    fn test_orthonormal_energy() {
        let dct = Dct::<f64>::new(16).unwrap();
        let input: Vec<f64> = (0..16).map(|i| (i as f64 * 0.7).sin()).collect();
        let transformed = dct.forward(&input).unwrap();
        let time: f64 = input.iter().map(|x| x * x).sum();
        let freq: f64 = transformed.iter().map(|x| x * x).sum();
        assert!((time - freq).abs() < 1.0e-10);
    }

    #[test]
    fn test_constant_concentrates_in_dc() {
        let dct = Dct::<f64>::new(8).unwrap();
        let transformed = dct.forward(&[1.0; 8]).unwrap();
        assert!((transformed[0] - 8.0f64.sqrt()).abs() < 1.0e-12);
        for &x in &transformed[1..] {
            assert!(x.abs() < 1.0e-12);
        }
    }
}
