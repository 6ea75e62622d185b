//! Train-then-apply matrix transforms: PCA, ZCA whitening, FastICA.
//!
//! Training runs once, offline, over an interleaved buffer and produces a
//! matrix plus a mean vector; the streaming stage then applies
//! `y = M (x - mean)` to every frame.

use super::error::{DspError, Result};
use super::Float;

/// A trained linear per-frame transform.
#[derive(Clone, Debug)]
pub struct MatrixTransform<F: Float> {
    /// Row-major `rows x cols`.
    matrix: Vec<F>,
    /// Per-input-channel mean, length `cols`.
    mean: Vec<F>,
    rows: usize,
    cols: usize,
}

impl<F: Float> MatrixTransform<F> {
    pub fn new(matrix: Vec<F>, mean: Vec<F>, rows: usize, cols: usize) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(DspError::invalid("transform must have nonzero shape"));
        }
        if matrix.len() != rows * cols || mean.len() != cols {
            return Err(DspError::ShapeMismatch(format!(
                "matrix {}x{} needs {} + {} values, got {} + {}",
                rows,
                cols,
                rows * cols,
                cols,
                matrix.len(),
                mean.len()
            )));
        }
        Ok(Self {
            matrix,
            mean,
            rows,
            cols,
        })
    }

    /// Output channels.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Input channels.
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn matrix(&self) -> &[F] {
        &self.matrix
    }

    pub fn mean(&self) -> &[F] {
        &self.mean
    }

    /// Apply to one frame: `out = M (frame - mean)`.
    pub fn apply_frame(&self, frame: &[F], out: &mut [F]) {
        debug_assert!(frame.len() == self.cols && out.len() == self.rows);
        for r in 0..self.rows {
            let row = &self.matrix[r * self.cols..(r + 1) * self.cols];
            let mut acc = F::zero();
            for c in 0..self.cols {
                acc = acc + row[c] * (frame[c] - self.mean[c]);
            }
            out[r] = acc;
        }
    }

    /// Apply to interleaved frames, appending `rows` outputs per frame.
    pub fn process(&self, input: &[F], out: &mut Vec<F>) -> Result<()> {
        if input.len() % self.cols != 0 {
            return Err(DspError::ShapeMismatch(format!(
                "input length {} not a multiple of {} channels",
                input.len(),
                self.cols
            )));
        }
        let mut frame_out = vec![F::zero(); self.rows];
        for frame in input.chunks_exact(self.cols) {
            self.apply_frame(frame, &mut frame_out);
            out.extend_from_slice(&frame_out);
        }
        Ok(())
    }
}

fn channel_means(data: &[f64], channels: usize) -> Vec<f64> {
    let frames = data.len() / channels;
    let mut mean = vec![0.0; channels];
    for frame in data.chunks_exact(channels) {
        for (m, &x) in mean.iter_mut().zip(frame) {
            *m += x;
        }
    }
    for m in mean.iter_mut() {
        *m /= frames as f64;
    }
    mean
}

fn covariance(data: &[f64], channels: usize, mean: &[f64]) -> Vec<f64> {
    let frames = data.len() / channels;
    let mut cov = vec![0.0; channels * channels];
    for frame in data.chunks_exact(channels) {
        for i in 0..channels {
            let di = frame[i] - mean[i];
            for j in i..channels {
                cov[i * channels + j] += di * (frame[j] - mean[j]);
            }
        }
    }
    let scale = 1.0 / frames as f64;
    for i in 0..channels {
        for j in i..channels {
            let v = cov[i * channels + j] * scale;
            cov[i * channels + j] = v;
            cov[j * channels + i] = v;
        }
    }
    cov
}

/// Cyclic Jacobi eigendecomposition of a symmetric matrix.
/// Returns eigenvalues and row-major eigenvectors (row `k` is the
/// eigenvector of eigenvalue `k`), sorted by descending eigenvalue.
fn jacobi_eigen(mut a: Vec<f64>, n: usize) -> (Vec<f64>, Vec<f64>) {
    // V accumulates rotations; columns are eigenvectors.
    let mut v = vec![0.0; n * n];
    for i in 0..n {
        v[i * n + i] = 1.0;
    }
    for _sweep in 0..100 {
        let mut off = 0.0;
        for p in 0..n {
            for q in p + 1..n {
                off += a[p * n + q] * a[p * n + q];
            }
        }
        if off < 1.0e-24 {
            break;
        }
        for p in 0..n {
            for q in p + 1..n {
                let apq = a[p * n + q];
                if apq.abs() < 1.0e-30 {
                    continue;
                }
                let app = a[p * n + p];
                let aqq = a[q * n + q];
                let theta = 0.5 * (aqq - app) / apq;
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..n {
                    let akp = a[k * n + p];
                    let akq = a[k * n + q];
                    a[k * n + p] = c * akp - s * akq;
                    a[k * n + q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[p * n + k];
                    let aqk = a[q * n + k];
                    a[p * n + k] = c * apk - s * aqk;
                    a[q * n + k] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[k * n + p];
                    let vkq = v[k * n + q];
                    v[k * n + p] = c * vkp - s * vkq;
                    v[k * n + q] = s * vkp + c * vkq;
                }
            }
        }
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| {
        a[j * n + j]
            .partial_cmp(&a[i * n + i])
            .unwrap_or(core::cmp::Ordering::Equal)
    });
    let eigenvalues: Vec<f64> = order.iter().map(|&i| a[i * n + i]).collect();
    let mut eigenvectors = vec![0.0; n * n];
    for (row, &col) in order.iter().enumerate() {
        for k in 0..n {
            eigenvectors[row * n + k] = v[k * n + col];
        }
    }
    (eigenvalues, eigenvectors)
}

fn check_training(data_len: usize, channels: usize, components: usize) -> Result<usize> {
    if channels == 0 {
        return Err(DspError::invalid("channel count must be nonzero"));
    }
    if data_len % channels != 0 {
        return Err(DspError::ShapeMismatch(format!(
            "training length {data_len} not a multiple of {channels} channels"
        )));
    }
    let frames = data_len / channels;
    if frames < 2 {
        return Err(DspError::invalid("training needs at least two frames"));
    }
    if components == 0 || components > channels {
        return Err(DspError::invalid("components must be in 1..=channels"));
    }
    Ok(frames)
}

/// Principal component analysis: project frames onto the `components`
/// directions of largest variance.
pub fn pca<F: Float>(
    data: &[F],
    channels: usize,
    components: usize,
) -> Result<MatrixTransform<F>> {
    check_training(data.len(), channels, components)?;
    let data64: Vec<f64> = data.iter().map(|x| <F as crate::Float>::to_f64(*x)).collect();
    let mean = channel_means(&data64, channels);
    let cov = covariance(&data64, channels, &mean);
    let (_values, vectors) = jacobi_eigen(cov, channels);
    let matrix: Vec<F> = vectors[..components * channels]
        .iter()
        .map(|&x| <F as crate::Float>::from_f64(x))
        .collect();
    MatrixTransform::new(
        matrix,
        mean.iter().map(|&m| <F as crate::Float>::from_f64(m)).collect(),
        components,
        channels,
    )
}

/// ZCA whitening: decorrelate channels and equalize their variance while
/// staying as close to the original coordinates as possible.
pub fn zca_whitening<F: Float>(
    data: &[F],
    channels: usize,
    epsilon: f64,
) -> Result<MatrixTransform<F>> {
    check_training(data.len(), channels, channels)?;
    let data64: Vec<f64> = data.iter().map(|x| <F as crate::Float>::to_f64(*x)).collect();
    let mean = channel_means(&data64, channels);
    let cov = covariance(&data64, channels, &mean);
    let (values, vectors) = jacobi_eigen(cov, channels);
    // M = E diag(1/sqrt(lambda + eps)) E'
    let mut matrix = vec![0.0; channels * channels];
    for i in 0..channels {
        for j in 0..channels {
            let mut acc = 0.0;
            for k in 0..channels {
                let scale = 1.0 / (values[k].max(0.0) + epsilon).sqrt();
                acc += vectors[k * channels + i] * scale * vectors[k * channels + j];
            }
            matrix[i * channels + j] = acc;
        }
    }
    MatrixTransform::new(
        matrix.iter().map(|&x| <F as crate::Float>::from_f64(x)).collect(),
        mean.iter().map(|&m| <F as crate::Float>::from_f64(m)).collect(),
        channels,
        channels,
    )
}

/// Small deterministic generator for FastICA initial directions.
struct Lcg(u64);

impl Lcg {
    fn next_f64(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64 - 0.5
    }
}

/// FastICA with the tanh contrast function and deflationary
/// orthogonalization. Returns the combined unmixing transform
/// (whitening folded in).
pub fn fast_ica<F: Float>(
    data: &[F],
    channels: usize,
    components: usize,
    max_iterations: usize,
    tolerance: f64,
) -> Result<MatrixTransform<F>> {
    let frames = check_training(data.len(), channels, components)?;
    let data64: Vec<f64> = data.iter().map(|x| <F as crate::Float>::to_f64(*x)).collect();
    let mean = channel_means(&data64, channels);
    let cov = covariance(&data64, channels, &mean);
    let (values, vectors) = jacobi_eigen(cov, channels);

    // PCA whitening matrix: diag(1/sqrt(lambda)) E.
    let mut whitening = vec![0.0; channels * channels];
    for k in 0..channels {
        let scale = 1.0 / (values[k].max(0.0) + 1.0e-10).sqrt();
        for j in 0..channels {
            whitening[k * channels + j] = scale * vectors[k * channels + j];
        }
    }
    // Whitened frames, frame-major.
    let mut z = vec![0.0; frames * channels];
    for (t, frame) in data64.chunks_exact(channels).enumerate() {
        for k in 0..channels {
            let mut acc = 0.0;
            for j in 0..channels {
                acc += whitening[k * channels + j] * (frame[j] - mean[j]);
            }
            z[t * channels + k] = acc;
        }
    }

    let mut rng = Lcg(0x5DEECE66D);
    let mut w_rows: Vec<Vec<f64>> = Vec::with_capacity(components);
    for _p in 0..components {
        let mut w: Vec<f64> = (0..channels).map(|_| rng.next_f64()).collect();
        normalize(&mut w);
        for _iter in 0..max_iterations {
            // w_new = E[z g(w'z)] - E[g'(w'z)] w, g = tanh.
            let mut new_w = vec![0.0; channels];
            let mut gprime_sum = 0.0;
            for frame in z.chunks_exact(channels) {
                let mut proj = 0.0;
                for j in 0..channels {
                    proj += w[j] * frame[j];
                }
                let g = proj.tanh();
                gprime_sum += 1.0 - g * g;
                for j in 0..channels {
                    new_w[j] += frame[j] * g;
                }
            }
            let inv_frames = 1.0 / frames as f64;
            let gprime_mean = gprime_sum * inv_frames;
            for j in 0..channels {
                new_w[j] = new_w[j] * inv_frames - gprime_mean * w[j];
            }
            // Deflation: stay orthogonal to previously found rows.
            for prev in &w_rows {
                let mut proj = 0.0;
                for j in 0..channels {
                    proj += new_w[j] * prev[j];
                }
                for j in 0..channels {
                    new_w[j] -= proj * prev[j];
                }
            }
            normalize(&mut new_w);
            let mut agreement = 0.0;
            for j in 0..channels {
                agreement += new_w[j] * w[j];
            }
            w = new_w;
            if (agreement.abs() - 1.0).abs() < tolerance {
                break;
            }
        }
        w_rows.push(w);
    }

    // Fold whitening into the unmixing rows: M = W_ica * W_white.
    let mut matrix = vec![0.0; components * channels];
    for (p, w) in w_rows.iter().enumerate() {
        for j in 0..channels {
            let mut acc = 0.0;
            for k in 0..channels {
                acc += w[k] * whitening[k * channels + j];
            }
            matrix[p * channels + j] = acc;
        }
    }
    MatrixTransform::new(
        matrix.iter().map(|&x| <F as crate::Float>::from_f64(x)).collect(),
        mean.iter().map(|&m| <F as crate::Float>::from_f64(m)).collect(),
        components,
        channels,
    )
}

fn normalize(w: &mut [f64]) {
    let norm = w.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 {
        for x in w.iter_mut() {
            *x /= norm;
        }
    } else {
        w[0] = 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlated_data(frames: usize) -> Vec<f64> {
        // Three sources mixed into three channels; full rank so whitening
        // has no near-null directions.
        let mut out = Vec::with_capacity(frames * 3);
        for i in 0..frames {
            let s1 = (i as f64 * 0.37).sin();
            let s2 = ((i * 31) % 17) as f64 / 8.5 - 1.0;
            let s3 = ((i * 53) % 29) as f64 / 14.5 - 1.0;
            out.push(s1 + 0.5 * s2 + 0.1 * s3 + 1.0);
            out.push(0.8 * s1 - 0.3 * s2 + 0.3 * s3);
            out.push(0.2 * s1 + s2 - 0.5 * s3 - 2.0);
        }
        out
    }

    #[test]
    fn test_jacobi_diagonalizes() {
        // Symmetric matrix with known eigenvalues 6, 1 (trace 7, det 6).
        let a = vec![5.0, 2.0, 2.0, 2.0];
        let (values, vectors) = jacobi_eigen(a, 2);
        assert!((values[0] - 6.0).abs() < 1.0e-10);
        assert!((values[1] - 1.0).abs() < 1.0e-10);
        // Eigenvector of 6 solves (5-6)x + 2y = 0 -> (2, 1)/sqrt(5).
        let e0 = &vectors[0..2];
        let ratio = e0[0] / e0[1];
        assert!((ratio - 2.0).abs() < 1.0e-8);
    }

    #[test]
    fn test_pca_output_is_decorrelated() {
        let data = correlated_data(500);
        let transform = pca::<f64>(&data, 3, 2).unwrap();
        let mut out = Vec::new();
        transform.process(&data, &mut out).unwrap();
        let mean = channel_means(&out, 2);
        let cov = covariance(&out, 2, &mean);
        // Off-diagonal covariance vanishes and components come out
        // variance-sorted.
        assert!(cov[1].abs() < 1.0e-8);
        assert!(cov[0] >= cov[3]);
    }

    #[test]
    fn test_zca_whitens_to_identity() {
        let data = correlated_data(800);
        let transform = zca_whitening::<f64>(&data, 3, 1.0e-9).unwrap();
        let mut out = Vec::new();
        transform.process(&data, &mut out).unwrap();
        let mean = channel_means(&out, 3);
        let cov = covariance(&out, 3, &mean);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (cov[i * 3 + j] - expected).abs() < 1.0e-4,
                    "cov[{i}][{j}] = {}",
                    cov[i * 3 + j]
                );
            }
        }
    }

    #[test]
    fn test_ica_unmixes_sources() {
        // Mix two independent-ish sources, then check the unmixed outputs
        // are decorrelated with unit variance.
        let frames = 2000;
        let mut data = Vec::with_capacity(frames * 2);
        for i in 0..frames {
            let s1 = (i as f64 * 0.71).sin();
            let s2 = ((i * 7919) % 1237) as f64 / 618.5 - 1.0;
            data.push(0.7 * s1 + 0.3 * s2);
            data.push(0.2 * s1 + 0.9 * s2);
        }
        let transform = fast_ica::<f64>(&data, 2, 2, 200, 1.0e-10).unwrap();
        let mut out = Vec::new();
        transform.process(&data, &mut out).unwrap();
        let mean = channel_means(&out, 2);
        let cov = covariance(&out, 2, &mean);
        assert!((cov[0] - 1.0).abs() < 0.05);
        assert!((cov[3] - 1.0).abs() < 0.05);
        assert!(cov[1].abs() < 0.05);
    }

    #[test]
    fn test_rejects_bad_shapes() {
        assert!(pca::<f64>(&[1.0, 2.0, 3.0], 2, 1).is_err());
        assert!(pca::<f64>(&[1.0, 2.0, 3.0, 4.0], 2, 3).is_err());
    }
}
