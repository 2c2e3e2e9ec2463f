//! Rolling checksum implementation for block matching.
//!
//! This module implements the Adler-32 style weak checksum used to find
//! candidate block matches. Sliding the window by one byte is O(1), which is
//! what makes a byte-by-byte scan of a whole file tractable.

/// Base modulus for checksum arithmetic.
/// Largest prime less than 2^16.
const MOD: u32 = 65521;

/// Multiplier combining the two components into one 32-bit sum.
const COMBINE: u32 = 65536;

/// Multiplier used when folding a weak sum into a 16-bit bucket key.
const FOLD: u32 = 1009;

/// Rolling checksum state for incremental computation.
///
/// The checksum consists of two components over a window of `len` bytes:
/// - `a`: sum of all bytes in the window (mod 65521)
/// - `b`: sum of `(len - i) * byte[i]` (mod 65521)
///
/// The combined digest is `a + b * 65536`.
///
/// # Example
///
/// ```rust
/// use vfsync::RollingChecksum;
///
/// let data = b"hello!";
/// let mut rolling = RollingChecksum::new(&data[..5]);
/// rolling.roll(b'h', b'!');
/// assert_eq!(rolling, RollingChecksum::new(&data[1..]));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollingChecksum {
    /// Sum of all bytes in window
    a: u32,
    /// Weighted sum: sum of (`window_size` - i) * byte\[i\]
    b: u32,
    /// Current window size
    count: usize,
}

impl RollingChecksum {
    /// Create a new rolling checksum over a full window.
    #[must_use]
    pub fn new(data: &[u8]) -> Self {
        let modulus = u64::from(MOD);
        let len = data.len();
        let mut a: u64 = 0;
        let mut b: u64 = 0;

        for (i, &byte) in data.iter().enumerate() {
            let weight = (len - i) as u64 % modulus;
            a = (a + u64::from(byte)) % modulus;
            b = (b + weight * u64::from(byte)) % modulus;
        }

        #[allow(clippy::cast_possible_truncation)] // both reduced below MOD
        Self {
            a: a as u32,
            b: b as u32,
            count: len,
        }
    }

    /// Create an empty rolling checksum.
    #[must_use]
    pub const fn empty() -> Self {
        Self { a: 0, b: 0, count: 0 }
    }

    /// Slide the window by one byte: `old_byte` leaves the front, `new_byte`
    /// enters at the back. The window length is unchanged.
    ///
    /// `a' = (a - old + new) mod N`, `b' = (b - len * old + a') mod N`.
    #[inline]
    pub fn roll(&mut self, old_byte: u8, new_byte: u8) {
        let modulus = u64::from(MOD);
        let old = u64::from(old_byte);
        let new = u64::from(new_byte);

        let a = (u64::from(self.a) + modulus - old + new) % modulus;
        let leaving = (self.count as u64 % modulus) * old % modulus;
        let b = (u64::from(self.b) + modulus - leaving + a) % modulus;

        #[allow(clippy::cast_possible_truncation)] // both reduced below MOD
        {
            self.a = a as u32;
            self.b = b as u32;
        }
    }

    /// Get the combined 32-bit weak sum: `a + b * 65536`.
    #[inline]
    #[must_use]
    pub const fn digest(&self) -> u32 {
        self.a + self.b * COMBINE
    }

    /// Get the 16-bit bucket key for this window.
    #[inline]
    #[must_use]
    pub const fn weak16(&self) -> u16 {
        weak16(self.digest())
    }

    /// Get the current window size.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    /// Check if the window is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Get the `a` component (simple sum).
    #[inline]
    #[must_use]
    pub const fn sum_a(&self) -> u32 {
        self.a
    }

    /// Get the `b` component (weighted sum).
    #[inline]
    #[must_use]
    pub const fn sum_b(&self) -> u32 {
        self.b
    }
}

impl Default for RollingChecksum {
    fn default() -> Self {
        Self::empty()
    }
}

/// Weak checksum of `data[start..end]`.
///
/// When `prev` describes the window `data[start - 1..end - 1]` the result is
/// derived from it in O(1); otherwise the window is summed from scratch.
///
/// # Panics
///
/// Panics if `start..end` is not a valid range of `data`.
#[must_use]
pub fn calc_weak32(
    data: &[u8],
    prev: Option<RollingChecksum>,
    start: usize,
    end: usize,
) -> RollingChecksum {
    match prev {
        Some(mut state) if start > 0 && state.len() == end - start => {
            state.roll(data[start - 1], data[end - 1]);
            state
        }
        _ => RollingChecksum::new(&data[start..end]),
    }
}

/// Fold a 32-bit weak sum into a 16-bit hash-bucket key.
///
/// The key only selects a bucket; it never decides a match.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn weak16(sum: u32) -> u16 {
    (0xFFFF & ((sum >> 16) ^ sum.wrapping_mul(FOLD))) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // CONSTRUCTION
    // ==========================================================================

    #[test]
    fn new_empty_slice() {
        let checksum = RollingChecksum::new(b"");
        assert_eq!(checksum.digest(), 0);
        assert!(checksum.is_empty());
    }

    #[test]
    fn new_single_byte() {
        let checksum = RollingChecksum::new(b"a");
        assert_eq!(checksum.sum_a(), 97);
        assert_eq!(checksum.sum_b(), 97);
        assert_eq!(checksum.len(), 1);
    }

    #[test]
    fn new_weights_first_byte_highest() {
        // a = 1 + 2 = 3, b = 2*1 + 1*2 = 4
        let checksum = RollingChecksum::new(&[1, 2]);
        assert_eq!(checksum.sum_a(), 3);
        assert_eq!(checksum.sum_b(), 4);
        assert_eq!(checksum.digest(), 3 + 4 * 65536);
    }

    #[test]
    fn default_is_empty() {
        assert_eq!(RollingChecksum::default(), RollingChecksum::empty());
    }

    #[test]
    fn all_max_bytes_stay_bounded() {
        let checksum = RollingChecksum::new(&vec![0xFF; 100_000]);
        assert!(checksum.sum_a() < MOD);
        assert!(checksum.sum_b() < MOD);
    }

    // ==========================================================================
    // ROLLING
    // ==========================================================================

    #[test]
    fn roll_matches_recompute() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let window = 8;
        let mut rolling = RollingChecksum::new(&data[..window]);

        for start in 1..=data.len() - window {
            rolling.roll(data[start - 1], data[start + window - 1]);
            assert_eq!(rolling, RollingChecksum::new(&data[start..start + window]));
        }
    }

    #[test]
    fn roll_handles_underflow() {
        // Leaving byte larger than the running sums forces the modular wrap.
        let data = [255u8, 0, 0, 0, 1];
        let mut rolling = RollingChecksum::new(&data[..4]);
        rolling.roll(255, 1);
        assert_eq!(rolling, RollingChecksum::new(&data[1..]));
    }

    #[test]
    fn roll_preserves_window_size() {
        let mut rolling = RollingChecksum::new(b"abcd");
        rolling.roll(b'a', b'e');
        assert_eq!(rolling.len(), 4);
    }

    #[test]
    fn calc_weak32_fresh_without_prev() {
        let data = b"abcdefgh";
        assert_eq!(
            calc_weak32(data, None, 2, 6),
            RollingChecksum::new(&data[2..6])
        );
    }

    #[test]
    fn calc_weak32_incremental_with_prev() {
        let data = b"abcdefgh";
        let prev = calc_weak32(data, None, 0, 4);
        let next = calc_weak32(data, Some(prev), 1, 5);
        assert_eq!(next, RollingChecksum::new(&data[1..5]));
    }

    #[test]
    fn calc_weak32_ignores_mismatched_prev() {
        let data = b"abcdefgh";
        let prev = calc_weak32(data, None, 0, 3);
        let next = calc_weak32(data, Some(prev), 1, 5);
        assert_eq!(next, RollingChecksum::new(&data[1..5]));
    }

    // ==========================================================================
    // WEAK16
    // ==========================================================================

    #[test]
    fn weak16_zero() {
        assert_eq!(weak16(0), 0);
    }

    #[test]
    fn weak16_known_value() {
        // sum = 0x0001_0001: (1) ^ (65537 * 1009 mod 2^32) = 1 ^ 66_126_833
        let expected = (1u32 ^ 66_126_833u32) & 0xFFFF;
        assert_eq!(u32::from(weak16(0x0001_0001)), expected);
    }

    #[test]
    fn weak16_matches_method() {
        let checksum = RollingChecksum::new(b"bucket me");
        assert_eq!(checksum.weak16(), weak16(checksum.digest()));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Sliding across the whole buffer always agrees with a fresh sum.
        #[test]
        fn rolling_equals_recompute(
            data in prop::collection::vec(any::<u8>(), 2..600),
            window in 1usize..64,
        ) {
            let window = window.min(data.len());
            let mut prev = None;
            for start in 0..=data.len() - window {
                let state = calc_weak32(&data, prev, start, start + window);
                prop_assert_eq!(state, RollingChecksum::new(&data[start..start + window]));
                prev = Some(state);
            }
        }

        #[test]
        fn components_always_bounded(data in prop::collection::vec(any::<u8>(), 0..2000)) {
            let checksum = RollingChecksum::new(&data);
            prop_assert!(checksum.sum_a() < MOD);
            prop_assert!(checksum.sum_b() < MOD);
        }

        #[test]
        fn deterministic(data in prop::collection::vec(any::<u8>(), 0..500)) {
            prop_assert_eq!(RollingChecksum::new(&data), RollingChecksum::new(&data));
        }
    }
}
