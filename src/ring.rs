//! Fixed-capacity ring buffer with a mirrored guard zone.
//!
//! Capacity is always a power of two so the write index wraps with a bitmask.
//! Every write is mirrored `capacity` slots ahead, which keeps the most
//! recent `n` samples readable as one contiguous slice for any `n` up to
//! capacity and any wrap position. The mirror costs one extra store per push
//! and makes the SIMD tap loops branch-free.

use super::error::{DspError, Result};
use super::math::next_pow2;
use super::Float;

/// Ring buffer of floating-point samples.
#[derive(Clone, Debug)]
pub struct Ring<F: Float> {
    /// `2 * capacity` samples; the upper half mirrors the lower half.
    data: Vec<F>,
    /// Index of the most recent write, `< capacity`.
    head: usize,
    /// `capacity - 1`.
    mask: usize,
    /// Number of samples pushed, saturating at capacity.
    count: usize,
}

impl<F: Float> Ring<F> {
    /// Create a ring that can hold at least `window` samples.
    /// The capacity is rounded up to a power of two.
    /// Rejects a zero window.
    pub fn new(window: usize) -> Result<Self> {
        if window == 0 {
            return Err(DspError::invalid("ring buffer capacity must be nonzero"));
        }
        let capacity = next_pow2(window);
        Ok(Self {
            data: vec![F::zero(); capacity * 2],
            head: 0,
            mask: capacity - 1,
            count: 0,
        })
    }

    /// Number of samples the ring can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of samples currently held, saturating at capacity.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Index of the most recent write.
    #[inline]
    pub fn head(&self) -> usize {
        self.head
    }

    /// Push a sample, overwriting the oldest once full.
    #[inline]
    pub fn push(&mut self, x: F) {
        self.head = (self.head + 1) & self.mask;
        self.data[self.head] = x;
        // Guard mirror.
        let mirror = self.head + self.capacity();
        self.data[mirror] = x;
        if self.count <= self.mask {
            self.count += 1;
        }
    }

    /// The sample written `age` pushes ago; `age` 0 is the most recent.
    /// `age` must be less than capacity.
    #[inline]
    pub fn at_back(&self, age: usize) -> F {
        debug_assert!(age <= self.mask);
        self.data[(self.head + self.capacity() - age) & self.mask]
    }

    /// Contiguous view of the most recent `n` samples, oldest first.
    /// Samples never pushed read as zero. `n` must not exceed capacity.
    #[inline]
    pub fn read_back(&self, n: usize) -> &[F] {
        debug_assert!(n <= self.capacity());
        let start = (self.head + self.capacity() + 1 - n) & self.mask;
        &self.data[start..start + n]
    }

    /// Forget the oldest sample without touching storage.
    /// Used by time-windowed filters to expire samples.
    #[inline]
    pub fn pop_oldest(&mut self) {
        debug_assert!(self.count > 0);
        self.count -= 1;
    }

    /// Zero the buffer and rewind the head.
    pub fn clear(&mut self) {
        self.data.fill(F::zero());
        self.head = 0;
        self.count = 0;
    }

    /// Primary storage (without the mirror), for serialization.
    pub fn primary(&self) -> &[F] {
        &self.data[..self.capacity()]
    }

    /// Restore from serialized parts. The data length must equal the
    /// current capacity; the mirror is rebuilt here.
    pub fn restore(&mut self, data: &[F], head: usize, count: usize) -> Result<()> {
        if data.len() != self.capacity() {
            return Err(DspError::StateMismatch(format!(
                "ring length {} does not match capacity {}",
                data.len(),
                self.capacity()
            )));
        }
        if head >= self.capacity() || count > self.capacity() {
            return Err(DspError::StateCorrupted(
                "ring head or count out of range".into(),
            ));
        }
        let capacity = self.capacity();
        self.data[..capacity].copy_from_slice(data);
        for i in 0..capacity {
            self.data[capacity + i] = data[i];
        }
        self.head = head;
        self.count = count;
        Ok(())
    }
}
