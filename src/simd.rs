//! Runtime SIMD dispatch for the vectorized inner loops.
//!
//! Detection happens once and is cached; after that each entry point is a
//! direct branch to the widest available implementation. Scalar fallbacks are
//! written as 4x unrolled loops that autovectorize on most targets.

use num_complex::Complex;
use std::sync::OnceLock;

use super::Float;

/// Detected SIMD capability level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SimdLevel {
    /// No SIMD, scalar fallback.
    Scalar = 0,
    /// SSE3 (128-bit).
    Sse3 = 1,
    /// AVX2 + FMA (256-bit).
    Avx2 = 2,
    /// ARM NEON (128-bit).
    Neon = 3,
}

impl SimdLevel {
    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            SimdLevel::Scalar => "Scalar",
            SimdLevel::Sse3 => "SSE3",
            SimdLevel::Avx2 => "AVX2",
            SimdLevel::Neon => "NEON",
        }
    }
}

static DETECTED_SIMD_LEVEL: OnceLock<SimdLevel> = OnceLock::new();

/// Detect the best available SIMD level. The result is computed once.
pub fn simd_level() -> SimdLevel {
    *DETECTED_SIMD_LEVEL.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
                return SimdLevel::Avx2;
            }
            if is_x86_feature_detected!("sse3") {
                return SimdLevel::Sse3;
            }
            SimdLevel::Scalar
        }

        #[cfg(target_arch = "aarch64")]
        {
            // NEON is always available on aarch64.
            SimdLevel::Neon
        }

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            SimdLevel::Scalar
        }
    })
}

// ============ Dot product ============

/// Dot product of two equal-length `f32` slices.
#[inline]
#[allow(unreachable_code)]
pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert!(a.len() == b.len());
    #[cfg(target_arch = "x86_64")]
    {
        if simd_level() >= SimdLevel::Avx2 {
            // Safety: AVX2 and FMA presence established by `simd_level`.
            return unsafe { dot_f32_avx2(a, b) };
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { dot_f32_neon(a, b) };
    }
    dot_scalar_unrolled(a, b)
}

/// Dot product of two equal-length `f64` slices.
#[inline]
#[allow(unreachable_code)]
pub fn dot_f64(a: &[f64], b: &[f64]) -> f64 {
    debug_assert!(a.len() == b.len());
    #[cfg(target_arch = "x86_64")]
    {
        if simd_level() >= SimdLevel::Avx2 {
            // Safety: AVX2 and FMA presence established by `simd_level`.
            return unsafe { dot_f64_avx2(a, b) };
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { dot_f64_neon(a, b) };
    }
    dot_scalar_unrolled(a, b)
}

/// 4x unrolled scalar dot product. Autovectorizers lift this to SSE/AVX.
fn dot_scalar_unrolled<F: Float>(a: &[F], b: &[F]) -> F {
    let n = a.len();
    let mut s0 = F::zero();
    let mut s1 = F::zero();
    let mut s2 = F::zero();
    let mut s3 = F::zero();
    let mut i = 0;
    while i + 4 <= n {
        s0 = s0 + a[i] * b[i];
        s1 = s1 + a[i + 1] * b[i + 1];
        s2 = s2 + a[i + 2] * b[i + 2];
        s3 = s3 + a[i + 3] * b[i + 3];
        i += 4;
    }
    let mut sum = (s0 + s1) + (s2 + s3);
    while i < n {
        sum = sum + a[i] * b[i];
        i += 1;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn dot_f32_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;
    let n = a.len();
    let mut acc0 = _mm256_setzero_ps();
    let mut acc1 = _mm256_setzero_ps();
    let mut i = 0;
    // Two accumulators hide FMA latency.
    while i + 16 <= n {
        let x0 = _mm256_loadu_ps(a.as_ptr().add(i));
        let y0 = _mm256_loadu_ps(b.as_ptr().add(i));
        acc0 = _mm256_fmadd_ps(x0, y0, acc0);
        let x1 = _mm256_loadu_ps(a.as_ptr().add(i + 8));
        let y1 = _mm256_loadu_ps(b.as_ptr().add(i + 8));
        acc1 = _mm256_fmadd_ps(x1, y1, acc1);
        i += 16;
    }
    while i + 8 <= n {
        let x = _mm256_loadu_ps(a.as_ptr().add(i));
        let y = _mm256_loadu_ps(b.as_ptr().add(i));
        acc0 = _mm256_fmadd_ps(x, y, acc0);
        i += 8;
    }
    let acc = _mm256_add_ps(acc0, acc1);
    let hi = _mm256_extractf128_ps(acc, 1);
    let lo = _mm256_castps256_ps128(acc);
    let sum4 = _mm_add_ps(lo, hi);
    let sum2 = _mm_add_ps(sum4, _mm_movehl_ps(sum4, sum4));
    let sum1 = _mm_add_ss(sum2, _mm_shuffle_ps(sum2, sum2, 1));
    let mut sum = _mm_cvtss_f32(sum1);
    while i < n {
        sum += a[i] * b[i];
        i += 1;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn dot_f64_avx2(a: &[f64], b: &[f64]) -> f64 {
    use std::arch::x86_64::*;
    let n = a.len();
    let mut acc = _mm256_setzero_pd();
    let mut i = 0;
    while i + 4 <= n {
        let x = _mm256_loadu_pd(a.as_ptr().add(i));
        let y = _mm256_loadu_pd(b.as_ptr().add(i));
        acc = _mm256_fmadd_pd(x, y, acc);
        i += 4;
    }
    let hi = _mm256_extractf128_pd(acc, 1);
    let lo = _mm256_castpd256_pd128(acc);
    let sum2 = _mm_add_pd(lo, hi);
    let sum1 = _mm_add_sd(sum2, _mm_unpackhi_pd(sum2, sum2));
    let mut sum = _mm_cvtsd_f64(sum1);
    while i < n {
        sum += a[i] * b[i];
        i += 1;
    }
    sum
}

#[cfg(target_arch = "aarch64")]
unsafe fn dot_f32_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;
    let n = a.len();
    let mut acc0 = vdupq_n_f32(0.0);
    let mut acc1 = vdupq_n_f32(0.0);
    let mut i = 0;
    // 2x unrolled FMA over 4-lane vectors.
    while i + 8 <= n {
        let x0 = vld1q_f32(a.as_ptr().add(i));
        let y0 = vld1q_f32(b.as_ptr().add(i));
        acc0 = vfmaq_f32(acc0, x0, y0);
        let x1 = vld1q_f32(a.as_ptr().add(i + 4));
        let y1 = vld1q_f32(b.as_ptr().add(i + 4));
        acc1 = vfmaq_f32(acc1, x1, y1);
        i += 8;
    }
    while i + 4 <= n {
        let x = vld1q_f32(a.as_ptr().add(i));
        let y = vld1q_f32(b.as_ptr().add(i));
        acc0 = vfmaq_f32(acc0, x, y);
        i += 4;
    }
    let mut sum = vaddvq_f32(vaddq_f32(acc0, acc1));
    while i < n {
        sum += a[i] * b[i];
        i += 1;
    }
    sum
}

#[cfg(target_arch = "aarch64")]
unsafe fn dot_f64_neon(a: &[f64], b: &[f64]) -> f64 {
    use std::arch::aarch64::*;
    let n = a.len();
    let mut acc = vdupq_n_f64(0.0);
    let mut i = 0;
    while i + 2 <= n {
        let x = vld1q_f64(a.as_ptr().add(i));
        let y = vld1q_f64(b.as_ptr().add(i));
        acc = vfmaq_f64(acc, x, y);
        i += 2;
    }
    let mut sum = vaddvq_f64(acc);
    while i < n {
        sum += a[i] * b[i];
        i += 1;
    }
    sum
}

// ============ Spectrum kernels ============

/// Per-bin power `re^2 + im^2` of a complex spectrum.
pub fn power<F: Float>(bins: &[Complex<F>], out: &mut [F]) {
    debug_assert!(bins.len() == out.len());
    #[cfg(target_arch = "aarch64")]
    {
        if core::any::TypeId::of::<F>() == core::any::TypeId::of::<f32>() {
            // Safety: F = f32 established above; Complex<f32> is a repr(C)
            // (re, im) pair so the slice is plain interleaved f32 data.
            unsafe {
                power_f32_neon(
                    core::slice::from_raw_parts(bins.as_ptr() as *const f32, bins.len() * 2),
                    core::slice::from_raw_parts_mut(out.as_mut_ptr() as *mut f32, out.len()),
                );
            }
            return;
        }
    }
    for i in 0..bins.len() {
        out[i] = bins[i].re * bins[i].re + bins[i].im * bins[i].im;
    }
}

/// Per-bin magnitude `sqrt(re^2 + im^2)` of a complex spectrum.
pub fn magnitude<F: Float>(bins: &[Complex<F>], out: &mut [F]) {
    power(bins, out);
    for x in out.iter_mut() {
        *x = x.sqrt();
    }
}

#[cfg(target_arch = "aarch64")]
unsafe fn power_f32_neon(interleaved: &[f32], out: &mut [f32]) {
    use std::arch::aarch64::*;
    let n = out.len();
    let mut i = 0;
    // vld2 deinterleaves (re, im) pairs into separate lanes.
    while i + 4 <= n {
        let pairs = vld2q_f32(interleaved.as_ptr().add(i * 2));
        let p = vfmaq_f32(vmulq_f32(pairs.0, pairs.0), pairs.1, pairs.1);
        vst1q_f32(out.as_mut_ptr().add(i), p);
        i += 4;
    }
    while i < n {
        let re = interleaved[i * 2];
        let im = interleaved[i * 2 + 1];
        out[i] = re * re + im * im;
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_matches_scalar() {
        let a: Vec<f32> = (0..133).map(|i| (i as f32) * 0.25 - 7.0).collect();
        let b: Vec<f32> = (0..133).map(|i| 3.0 - (i as f32) * 0.125).collect();
        let reference: f32 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
        // Accumulation order differs between paths; allow float slack.
        assert!((dot_f32(&a, &b) - reference).abs() < 0.5);

        let a64: Vec<f64> = a.iter().map(|&x| x as f64).collect();
        let b64: Vec<f64> = b.iter().map(|&x| x as f64).collect();
        let reference64: f64 = a64.iter().zip(&b64).map(|(x, y)| x * y).sum();
        assert!((dot_f64(&a64, &b64) - reference64).abs() < 1.0e-9);
    }

    #[test]
    fn test_power_magnitude() {
        let bins: Vec<Complex<f64>> = vec![
            Complex::new(3.0, 4.0),
            Complex::new(0.0, 0.0),
            Complex::new(-1.0, 1.0),
        ];
        let mut p = vec![0.0; 3];
        let mut m = vec![0.0; 3];
        power(&bins, &mut p);
        magnitude(&bins, &mut m);
        assert_eq!(p, vec![25.0, 0.0, 2.0]);
        assert!((m[0] - 5.0).abs() < 1.0e-12);
    }
}
