//! TCP sequence number arithmetic
//!
//! Sequence numbers live in a 32-bit circular space; every comparison goes
//! through the signed distance so wraparound is handled uniformly.

/// Signed distance from `b` to `a` (`a - b`) in sequence space
#[inline]
pub fn seq_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// `a` is strictly before `b`
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    seq_diff(a, b) < 0
}

/// `a` is before or equal to `b`
#[inline]
pub fn seq_leq(a: u32, b: u32) -> bool {
    seq_diff(a, b) <= 0
}

/// `a` is strictly after `b`
#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_diff(a, b) > 0
}

/// `a` is after or equal to `b`
#[inline]
pub fn seq_geq(a: u32, b: u32) -> bool {
    seq_diff(a, b) >= 0
}

/// The later of two sequence numbers
#[inline]
pub fn seq_max(a: u32, b: u32) -> u32 {
    if seq_gt(a, b) {
        a
    } else {
        b
    }
}

/// The earlier of two sequence numbers
#[inline]
pub fn seq_min(a: u32, b: u32) -> u32 {
    if seq_lt(a, b) {
        a
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_ordering() {
        assert!(seq_lt(1, 2));
        assert!(seq_leq(2, 2));
        assert!(seq_gt(3, 2));
        assert!(seq_geq(3, 3));
        assert!(!seq_lt(5, 5));
    }

    #[test]
    fn test_seq_wraparound() {
        let near_end = u32::MAX - 10;
        let wrapped = 5u32;

        assert!(seq_lt(near_end, wrapped));
        assert!(seq_gt(wrapped, near_end));
        assert_eq!(seq_diff(wrapped, near_end), 16);
        assert_eq!(seq_max(near_end, wrapped), wrapped);
        assert_eq!(seq_min(near_end, wrapped), near_end);
    }
}
