//! Modular 32-bit sequence number comparisons.
//!
//! TCP sequence numbers wrap; ordering is defined by casting the wrapping
//! difference to the signed half-type (RFC 1323 window semantics). A number
//! is "before" another when it is within 2^31 behind it.

/// Returns `true` if `lhs` comes strictly before `rhs` in sequence space.
#[inline]
pub fn seq_lt(lhs: u32, rhs: u32) -> bool {
    (lhs.wrapping_sub(rhs) as i32) < 0
}

/// Returns `true` if `lhs` comes before or equals `rhs` in sequence space.
#[inline]
pub fn seq_leq(lhs: u32, rhs: u32) -> bool {
    (lhs.wrapping_sub(rhs) as i32) <= 0
}

/// Returns `true` if `lhs` comes strictly after `rhs` in sequence space.
#[inline]
pub fn seq_gt(lhs: u32, rhs: u32) -> bool {
    (lhs.wrapping_sub(rhs) as i32) > 0
}

/// Returns `true` if `lhs` comes after or equals `rhs` in sequence space.
#[inline]
pub fn seq_geq(lhs: u32, rhs: u32) -> bool {
    (lhs.wrapping_sub(rhs) as i32) >= 0
}

/// Returns `true` if `lhs` equals `rhs`.
#[inline]
pub fn seq_eq(lhs: u32, rhs: u32) -> bool {
    lhs == rhs
}

/// Smaller of two sequence numbers under wrapping order.
#[inline]
pub fn seq_min(lhs: u32, rhs: u32) -> u32 {
    if seq_lt(lhs, rhs) {
        lhs
    } else {
        rhs
    }
}

/// Larger of two sequence numbers under wrapping order.
#[inline]
pub fn seq_max(lhs: u32, rhs: u32) -> u32 {
    if seq_gt(lhs, rhs) {
        lhs
    } else {
        rhs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ordering() {
        assert!(seq_lt(1, 2));
        assert!(seq_gt(2, 1));
        assert!(seq_leq(2, 2));
        assert!(seq_geq(2, 2));
        assert!(!seq_lt(2, 2));
    }

    #[test]
    fn wraparound_ordering() {
        // 0xffff_fff0 is just before the wrap; 0x10 is just after it.
        assert!(seq_lt(0xffff_fff0, 0x10));
        assert!(seq_gt(0x10, 0xffff_fff0));
        assert!(seq_geq(0x0, u32::MAX));
        assert!(seq_leq(u32::MAX, 0x0));
        assert_eq!(seq_min(0xffff_fff0, 0x10), 0xffff_fff0);
        assert_eq!(seq_max(0xffff_fff0, 0x10), 0x10);
    }

    #[test]
    fn half_space_boundary() {
        // Differences of exactly 2^31 flip sign; anything below stays ordered.
        assert!(seq_lt(0, (1 << 31) - 1));
        assert!(seq_gt(0, 1 << 31));
    }
}
