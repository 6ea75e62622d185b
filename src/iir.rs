//! Recursive (IIR) filters in Direct Form I, and filter designers.

use num_complex::Complex64;

use super::error::{DspError, Result};
use super::math;
use super::ring::Ring;
use super::Float;

/// Immutable IIR coefficient pair, normalized so the leading denominator
/// coefficient is one. `b` is the feedforward vector; `a` holds the feedback
/// coefficients starting at `a[1]` (the implied `a[0] = 1` is not stored).
#[derive(Clone, Debug)]
pub struct IirCoefs<F: Float> {
    b: Vec<F>,
    a: Vec<F>,
}

impl<F: Float> IirCoefs<F> {
    /// Build from numerator `b` and denominator `a`. `a` may either include
    /// the leading coefficient (normalized away here) or start at `a[1]`
    /// when `leading_one` is false.
    pub fn from_transfer(b: Vec<F>, a: Vec<F>) -> Result<Self> {
        if b.is_empty() {
            return Err(DspError::invalid("IIR numerator must be nonempty"));
        }
        if a.is_empty() {
            return Err(DspError::invalid("IIR denominator must be nonempty"));
        }
        let a0 = a[0];
        if a0 == F::zero() {
            return Err(DspError::Numerical(
                "leading denominator coefficient is zero".into(),
            ));
        }
        let inv = F::one() / a0;
        let b = b.into_iter().map(|x| x * inv).collect();
        let a = a[1..].iter().map(|&x| x * inv).collect();
        Ok(Self { b, a })
    }

    /// Build from already-normalized parts: `b` and the feedback tail
    /// (coefficients from `a[1]` on).
    pub fn new(b: Vec<F>, feedback: Vec<F>) -> Result<Self> {
        if b.is_empty() {
            return Err(DspError::invalid("IIR numerator must be nonempty"));
        }
        Ok(Self { b, a: feedback })
    }

    /// Feedforward coefficients.
    #[inline]
    pub fn b(&self) -> &[F] {
        &self.b
    }

    /// Feedback coefficients from `a[1]` on.
    #[inline]
    pub fn feedback(&self) -> &[F] {
        &self.a
    }

    /// Full denominator including the leading one.
    pub fn denominator(&self) -> Vec<F> {
        let mut a = Vec::with_capacity(self.a.len() + 1);
        a.push(F::one());
        a.extend_from_slice(&self.a);
        a
    }

    /// Necessary (not sufficient) stability check: the feedback coefficients
    /// sum to less than one in absolute value.
    pub fn is_stable(&self) -> bool {
        let sum: f64 = self.a.iter().map(|x| <F as crate::Float>::to_f64(*x).abs()).sum();
        sum < 1.0
    }

    /// Frequency response `B(z)/A(z)` at `frequency` Hz.
    pub fn response(&self, frequency: f64, sample_rate: f64) -> Complex64 {
        let z1 = Complex64::from_polar(1.0, -math::TAU * frequency / sample_rate);
        let eval = |coefs: &[F]| {
            let mut z = Complex64::new(1.0, 0.0);
            let mut acc = Complex64::default();
            for &c in coefs {
                acc += Complex64::new(c.to_f64(), 0.0) * z;
                z *= z1;
            }
            acc
        };
        eval(&self.b) / eval(&self.denominator())
    }

    /// Series combination: multiply numerators and denominators and
    /// re-normalize by the product's leading coefficient.
    pub fn cascade(&self, other: &IirCoefs<F>) -> Result<IirCoefs<F>> {
        let b = polynomial_product(&self.b, &other.b);
        let a = polynomial_product(&self.denominator(), &other.denominator());
        IirCoefs::from_transfer(b, a)
    }
}

/// Convolution of two coefficient polynomials.
fn polynomial_product<F: Float>(p: &[F], q: &[F]) -> Vec<F> {
    let mut out = vec![F::zero(); p.len() + q.len() - 1];
    for (i, &pi) in p.iter().enumerate() {
        for (j, &qj) in q.iter().enumerate() {
            out[i + j] = out[i + j] + pi * qj;
        }
    }
    out
}

fn warp(cutoff: f64, sample_rate: f64) -> Result<f64> {
    let normalized = cutoff / sample_rate;
    if !(normalized > 0.0 && normalized < 0.5) {
        return Err(DspError::invalid(format!(
            "cutoff {cutoff} Hz outside (0, {}) at {sample_rate} Hz",
            sample_rate * 0.5
        )));
    }
    Ok((math::PI * normalized).tan())
}

/// First-order low-pass via the bilinear transform.
pub fn first_order_lowpass<F: Float>(cutoff: f64, sample_rate: f64) -> Result<IirCoefs<F>> {
    let k = warp(cutoff, sample_rate)?;
    let norm = 1.0 / (k + 1.0);
    IirCoefs::new(
        vec![<F as crate::Float>::from_f64(k * norm), <F as crate::Float>::from_f64(k * norm)],
        vec![<F as crate::Float>::from_f64((k - 1.0) * norm)],
    )
}

/// First-order high-pass via the bilinear transform.
pub fn first_order_highpass<F: Float>(cutoff: f64, sample_rate: f64) -> Result<IirCoefs<F>> {
    let k = warp(cutoff, sample_rate)?;
    let norm = 1.0 / (k + 1.0);
    IirCoefs::new(
        vec![<F as crate::Float>::from_f64(norm), <F as crate::Float>::from_f64(-norm)],
        vec![<F as crate::Float>::from_f64((k - 1.0) * norm)],
    )
}

/// DC blocker: a one-pole high-pass with its zero at DC.
pub fn dc_blocker<F: Float>(cutoff: f64, sample_rate: f64) -> Result<IirCoefs<F>> {
    if !(cutoff > 0.0 && cutoff < sample_rate * 0.5) {
        return Err(DspError::invalid("DC blocker cutoff out of range"));
    }
    let r = 1.0 - math::TAU * cutoff / sample_rate;
    IirCoefs::new(
        vec![F::one(), <F as crate::Float>::from_f64(-1.0)],
        vec![<F as crate::Float>::from_f64(-r)],
    )
}

/// Second-order Butterworth low-pass.
/// Cutoff is the -3 dB point of the filter in Hz.
pub fn butterworth_lowpass<F: Float>(cutoff: f64, sample_rate: f64) -> Result<IirCoefs<F>> {
    let f = warp(cutoff, sample_rate)?;
    let a0r = 1.0 / (1.0 + math::SQRT_2 * f + f * f);
    let b0 = f * f * a0r;
    IirCoefs::new(
        vec![<F as crate::Float>::from_f64(b0), <F as crate::Float>::from_f64(2.0 * b0), <F as crate::Float>::from_f64(b0)],
        vec![
            <F as crate::Float>::from_f64((2.0 * f * f - 2.0) * a0r),
            <F as crate::Float>::from_f64((1.0 - math::SQRT_2 * f + f * f) * a0r),
        ],
    )
}

/// Second-order Butterworth high-pass.
pub fn butterworth_highpass<F: Float>(cutoff: f64, sample_rate: f64) -> Result<IirCoefs<F>> {
    let f = warp(cutoff, sample_rate)?;
    let a0r = 1.0 / (1.0 + math::SQRT_2 * f + f * f);
    IirCoefs::new(
        vec![
            <F as crate::Float>::from_f64(a0r),
            <F as crate::Float>::from_f64(-2.0 * a0r),
            <F as crate::Float>::from_f64(a0r),
        ],
        vec![
            <F as crate::Float>::from_f64((2.0 * f * f - 2.0) * a0r),
            <F as crate::Float>::from_f64((1.0 - math::SQRT_2 * f + f * f) * a0r),
        ],
    )
}

/// Band-pass as a cascade of Butterworth low-pass at the upper edge and
/// high-pass at the lower edge, combined by polynomial convolution.
pub fn butterworth_bandpass<F: Float>(
    low: f64,
    high: f64,
    sample_rate: f64,
) -> Result<IirCoefs<F>> {
    if low >= high {
        return Err(DspError::invalid("band edges must satisfy low < high"));
    }
    let lp = butterworth_lowpass::<F>(high, sample_rate)?;
    let hp = butterworth_highpass::<F>(low, sample_rate)?;
    lp.cascade(&hp)
}

/// Second-order analog prototype `K / (s^2 + b s + c)` of a Chebyshev
/// Type-I response with the given passband ripple in dB.
fn chebyshev_prototype(ripple_db: f64) -> Result<(f64, f64, f64)> {
    if !(ripple_db > 0.0) {
        return Err(DspError::invalid("Chebyshev ripple must be positive dB"));
    }
    let epsilon = (10.0f64.powf(ripple_db / 10.0) - 1.0).sqrt();
    let mu = 0.5 * (1.0 / epsilon).asinh();
    let sigma = mu.sinh() * (math::PI / 4.0).sin();
    let omega = mu.cosh() * (math::PI / 4.0).cos();
    let c = sigma * sigma + omega * omega;
    let b = 2.0 * sigma;
    // Even-order Chebyshev peaks at 1; DC sits at the ripple floor.
    let k = c / (1.0 + epsilon * epsilon).sqrt();
    Ok((k, b, c))
}

/// Bilinear transform of `K / (s^2 + B s + C)` with the low-pass mapping
/// `s -> (1/tan(pi fc/sr)) (1 - z^-1)/(1 + z^-1)`.
fn bilinear_second_order<F: Float>(
    k: f64,
    b: f64,
    c: f64,
    cutoff: f64,
    sample_rate: f64,
    highpass: bool,
) -> Result<IirCoefs<F>> {
    let f = warp(cutoff, sample_rate)?;
    let lambda = 1.0 / f;
    let (k, b, c) = if highpass {
        // LP -> HP prototype transform s -> 1/s.
        (k / c, b / c, 1.0 / c)
    } else {
        (k, b, c)
    };
    let l2 = lambda * lambda;
    let a0 = l2 + b * lambda + c;
    let a1 = 2.0 * (c - l2);
    let a2 = l2 - b * lambda + c;
    let (b0, b1, b2) = if highpass {
        (k * l2, -2.0 * k * l2, k * l2)
    } else {
        (k, 2.0 * k, k)
    };
    IirCoefs::from_transfer(
        vec![<F as crate::Float>::from_f64(b0), <F as crate::Float>::from_f64(b1), <F as crate::Float>::from_f64(b2)],
        vec![<F as crate::Float>::from_f64(a0), <F as crate::Float>::from_f64(a1), <F as crate::Float>::from_f64(a2)],
    )
}

/// Second-order Chebyshev Type-I low-pass with passband ripple in dB.
pub fn chebyshev_lowpass<F: Float>(
    cutoff: f64,
    sample_rate: f64,
    ripple_db: f64,
) -> Result<IirCoefs<F>> {
    let (k, b, c) = chebyshev_prototype(ripple_db)?;
    bilinear_second_order(k, b, c, cutoff, sample_rate, false)
}

/// Second-order Chebyshev Type-I high-pass with passband ripple in dB.
pub fn chebyshev_highpass<F: Float>(
    cutoff: f64,
    sample_rate: f64,
    ripple_db: f64,
) -> Result<IirCoefs<F>> {
    let (k, b, c) = chebyshev_prototype(ripple_db)?;
    bilinear_second_order(k, b, c, cutoff, sample_rate, true)
}

/// Chebyshev band-pass as low-pass/high-pass cascade.
pub fn chebyshev_bandpass<F: Float>(
    low: f64,
    high: f64,
    sample_rate: f64,
    ripple_db: f64,
) -> Result<IirCoefs<F>> {
    if low >= high {
        return Err(DspError::invalid("band edges must satisfy low < high"));
    }
    let lp = chebyshev_lowpass::<F>(high, sample_rate, ripple_db)?;
    let hp = chebyshev_highpass::<F>(low, sample_rate, ripple_db)?;
    lp.cascade(&hp)
}

/// Constant-gain bandpass resonator.
/// Bandwidth is the difference in Hz between the -3 dB points; the overall
/// gain is independent of bandwidth.
pub fn resonator<F: Float>(
    center: f64,
    bandwidth: f64,
    sample_rate: f64,
) -> Result<IirCoefs<F>> {
    if !(center > 0.0 && center < sample_rate * 0.5) || !(bandwidth > 0.0) {
        return Err(DspError::invalid("resonator center or bandwidth out of range"));
    }
    let r = (-math::PI * bandwidth / sample_rate).exp();
    let b0 = (1.0 - r * r).sqrt() * 0.5;
    IirCoefs::new(
        vec![<F as crate::Float>::from_f64(b0), F::zero(), <F as crate::Float>::from_f64(-b0)],
        vec![
            <F as crate::Float>::from_f64(-2.0 * r * (math::TAU * center / sample_rate).cos()),
            <F as crate::Float>::from_f64(r * r),
        ],
    )
}

fn cookbook_params(
    frequency: f64,
    gain_db: f64,
    q: f64,
    sample_rate: f64,
) -> Result<(f64, f64, f64, f64)> {
    if !(frequency > 0.0 && frequency < sample_rate * 0.5) {
        return Err(DspError::invalid("EQ frequency out of range"));
    }
    if !(q > 0.0) {
        return Err(DspError::invalid("EQ Q must be positive"));
    }
    let a = 10.0f64.powf(gain_db / 40.0);
    let w0 = math::TAU * frequency / sample_rate;
    let alpha = w0.sin() / (2.0 * q);
    Ok((a, w0.cos(), alpha, w0.sin()))
}

/// Peaking EQ biquad per the Audio EQ Cookbook.
pub fn peaking_eq<F: Float>(
    frequency: f64,
    gain_db: f64,
    q: f64,
    sample_rate: f64,
) -> Result<IirCoefs<F>> {
    let (a, cos_w0, alpha, _) = cookbook_params(frequency, gain_db, q, sample_rate)?;
    IirCoefs::from_transfer(
        vec![
            <F as crate::Float>::from_f64(1.0 + alpha * a),
            <F as crate::Float>::from_f64(-2.0 * cos_w0),
            <F as crate::Float>::from_f64(1.0 - alpha * a),
        ],
        vec![
            <F as crate::Float>::from_f64(1.0 + alpha / a),
            <F as crate::Float>::from_f64(-2.0 * cos_w0),
            <F as crate::Float>::from_f64(1.0 - alpha / a),
        ],
    )
}

/// Low-shelf biquad per the Audio EQ Cookbook.
pub fn low_shelf<F: Float>(
    frequency: f64,
    gain_db: f64,
    q: f64,
    sample_rate: f64,
) -> Result<IirCoefs<F>> {
    let (a, cos_w0, alpha, _) = cookbook_params(frequency, gain_db, q, sample_rate)?;
    let root = 2.0 * a.sqrt() * alpha;
    IirCoefs::from_transfer(
        vec![
            <F as crate::Float>::from_f64(a * ((a + 1.0) - (a - 1.0) * cos_w0 + root)),
            <F as crate::Float>::from_f64(2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w0)),
            <F as crate::Float>::from_f64(a * ((a + 1.0) - (a - 1.0) * cos_w0 - root)),
        ],
        vec![
            <F as crate::Float>::from_f64((a + 1.0) + (a - 1.0) * cos_w0 + root),
            <F as crate::Float>::from_f64(-2.0 * ((a - 1.0) + (a + 1.0) * cos_w0)),
            <F as crate::Float>::from_f64((a + 1.0) + (a - 1.0) * cos_w0 - root),
        ],
    )
}

/// High-shelf biquad per the Audio EQ Cookbook.
pub fn high_shelf<F: Float>(
    frequency: f64,
    gain_db: f64,
    q: f64,
    sample_rate: f64,
) -> Result<IirCoefs<F>> {
    let (a, cos_w0, alpha, _) = cookbook_params(frequency, gain_db, q, sample_rate)?;
    let root = 2.0 * a.sqrt() * alpha;
    IirCoefs::from_transfer(
        vec![
            <F as crate::Float>::from_f64(a * ((a + 1.0) + (a - 1.0) * cos_w0 + root)),
            <F as crate::Float>::from_f64(-2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w0)),
            <F as crate::Float>::from_f64(a * ((a + 1.0) + (a - 1.0) * cos_w0 - root)),
        ],
        vec![
            <F as crate::Float>::from_f64((a + 1.0) - (a - 1.0) * cos_w0 + root),
            <F as crate::Float>::from_f64(2.0 * ((a - 1.0) - (a + 1.0) * cos_w0)),
            <F as crate::Float>::from_f64((a + 1.0) - (a - 1.0) * cos_w0 - root),
        ],
    )
}

/// Streaming IIR filter in Direct Form I:
/// `y[n] = sum b[i] x[n-i] - sum a[j] y[n-j]`.
#[derive(Clone)]
pub struct IirFilter<F: Float> {
    coefs: IirCoefs<F>,
    /// Feedforward taps reversed to match oldest-first window views.
    b_rev: Vec<F>,
    /// Feedback taps reversed likewise.
    a_rev: Vec<F>,
    x_state: Ring<F>,
    y_state: Ring<F>,
}

impl<F: Float> IirFilter<F> {
    pub fn new(coefs: IirCoefs<F>) -> Result<Self> {
        let x_state = Ring::new(coefs.b().len())?;
        let y_state = Ring::new(coefs.feedback().len().max(1))?;
        let b_rev: Vec<F> = coefs.b().iter().rev().copied().collect();
        let a_rev: Vec<F> = coefs.feedback().iter().rev().copied().collect();
        Ok(Self {
            coefs,
            b_rev,
            a_rev,
            x_state,
            y_state,
        })
    }

    pub fn coefs(&self) -> &IirCoefs<F> {
        &self.coefs
    }

    /// Replace the coefficients. Resets the filter state.
    pub fn set_coefs(&mut self, coefs: IirCoefs<F>) -> Result<()> {
        *self = Self::new(coefs)?;
        Ok(())
    }

    /// Necessary stability condition on the feedback coefficients.
    pub fn is_stable(&self) -> bool {
        self.coefs.is_stable()
    }

    /// Filter one sample.
    #[inline]
    pub fn filter(&mut self, x: F) -> F {
        self.x_state.push(x);
        let forward = F::dot(self.x_state.read_back(self.b_rev.len()), &self.b_rev);
        let feedback = if self.a_rev.is_empty() {
            F::zero()
        } else {
            F::dot(self.y_state.read_back(self.a_rev.len()), &self.a_rev)
        };
        let y = forward - feedback;
        self.y_state.push(y);
        y
    }

    /// Filter a slice, writing to `out`.
    pub fn filter_slice(&mut self, input: &[F], out: &mut [F]) {
        debug_assert!(input.len() == out.len());
        for i in 0..input.len() {
            out[i] = self.filter(input[i]);
        }
    }

    /// Zero both state rings.
    pub fn reset(&mut self) {
        self.x_state.clear();
        self.y_state.clear();
    }

    /// Serialize both rings with their head indices.
    pub fn save(&self, out: &mut Vec<f64>) {
        out.push(self.x_state.head() as f64);
        out.push(self.x_state.count() as f64);
        out.extend(self.x_state.primary().iter().map(|x| <F as crate::Float>::to_f64(*x)));
        out.push(self.y_state.head() as f64);
        out.push(self.y_state.count() as f64);
        out.extend(self.y_state.primary().iter().map(|x| <F as crate::Float>::to_f64(*x)));
    }

    /// Restore state written by `save`.
    pub fn load(&mut self, state: &[f64]) -> Result<()> {
        let xc = self.x_state.capacity();
        let yc = self.y_state.capacity();
        if state.len() != 4 + xc + yc {
            return Err(DspError::StateMismatch(format!(
                "IIR state length {} != {}",
                state.len(),
                4 + xc + yc
            )));
        }
        let (x_part, y_part) = state.split_at(2 + xc);
        let x: Vec<F> = x_part[2..].iter().map(|&v| <F as crate::Float>::from_f64(v)).collect();
        let y: Vec<F> = y_part[2..].iter().map(|&v| <F as crate::Float>::from_f64(v)).collect();
        // Stage both restores before committing either.
        let mut x_state = self.x_state.clone();
        x_state.restore(&x, x_part[0] as usize, x_part[1] as usize)?;
        let mut y_state = self.y_state.clone();
        y_state.restore(&y, y_part[0] as usize, y_part[1] as usize)?;
        self.x_state = x_state;
        self.y_state = y_state;
        Ok(())
    }

    /// Length of the vector `save` writes.
    pub fn state_len(&self) -> usize {
        4 + self.x_state.capacity() + self.y_state.capacity()
    }
}
