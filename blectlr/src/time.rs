//! Modular 32-bit microsecond time arithmetic.
//!
//! The scheduler works in microseconds on a free-running 32-bit counter that
//! wraps roughly every 71 minutes. All request horizons are bounded to less
//! than 128 s, which keeps every comparison well inside the monotonic
//! half-range of the counter.

/// The longest horizon any request may reach into the future, in microseconds.
///
/// Chosen to keep a safe margin from the counter wrap: all valid deltas fit
/// comfortably in a signed 32-bit difference.
pub const HORIZON_MAX_US: u32 = 128_000_000 - 1;

/// Returns `true` if `a` is strictly before `b` in wrapping time.
#[inline]
pub fn is_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Signed distance from `from` to `to` in wrapping time.
///
/// Positive when `to` is in the future of `from`.
#[inline]
pub fn delta(from: u32, to: u32) -> i32 {
    to.wrapping_sub(from) as i32
}

/// The later of two instants in wrapping time.
#[inline]
pub fn later(a: u32, b: u32) -> u32 {
    if is_before(a, b) {
        b
    } else {
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_monotonic_across_wrap() {
        let a = u32::MAX - 100;
        let b = a.wrapping_add(200);
        assert!(is_before(a, b));
        assert!(!is_before(b, a));
        assert_eq!(delta(a, b), 200);
        assert_eq!(delta(b, a), -200);
    }

    #[test]
    fn later_across_wrap() {
        let a = u32::MAX - 10;
        let b = 20u32;
        assert_eq!(later(a, b), b);
        assert_eq!(later(b, a), b);
    }

    #[test]
    fn horizon_fits_signed_range() {
        // Two instants a full horizon apart must still order correctly.
        let now = 0x8000_0000u32;
        let far = now.wrapping_add(HORIZON_MAX_US);
        assert!(is_before(now, far));
        assert!(delta(now, far) > 0);
    }
}
