//! Comparisons over a wrapping 32 bit tick domain.
//!
//! Timers across the stack are microsecond ticks taken from a free running
//! 32 bit counter that wraps roughly every 71 minutes. Two ticks are
//! comparable as long as they are less than half the counter range apart;
//! the difference viewed as a signed value then gives the direction of
//! time. All timer decisions must go through these helpers instead of
//! comparing tick values directly.

/// Returns `true` if `lhs` is strictly earlier than `rhs`.
#[inline]
pub fn less(lhs: u32, rhs: u32) -> bool {
    (rhs.wrapping_sub(lhs) as i32) > 0
}

/// Returns `true` if `lhs` is earlier than or equal to `rhs`.
#[inline]
pub fn less_or_equal(lhs: u32, rhs: u32) -> bool {
    (rhs.wrapping_sub(lhs) as i32) >= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_less_plain_ordering() {
        assert!(less(0, 1));
        assert!(less(100, 5000));
        assert!(!less(1, 0));
        assert!(!less(17, 17));
    }

    #[test]
    fn test_less_or_equal_plain_ordering() {
        assert!(less_or_equal(0, 1));
        assert!(less_or_equal(17, 17));
        assert!(!less_or_equal(1, 0));
    }

    #[test]
    fn test_less_across_wrap_around() {
        assert!(less(u32::MAX - 5, 3));
        assert!(!less(3, u32::MAX - 5));
        assert!(less(u32::MAX, 0));
    }

    #[test]
    fn test_less_or_equal_across_wrap_around() {
        assert!(less_or_equal(u32::MAX, 0));
        assert!(less_or_equal(u32::MAX - 1999, 1));
        assert!(!less_or_equal(1, u32::MAX));
    }

    #[test]
    fn test_half_range_is_the_horizon() {
        // Differences up to (but excluding) 2^31 read as forward time.
        assert!(less(0, 0x7fff_ffff));
        assert!(!less(0, 0x8000_0000));
        assert!(less_or_equal(0, 0x7fff_ffff));
        assert!(!less_or_equal(0, 0x8000_0001));
    }
}
