//! Bit scan helpers.
//!
//! The scheduler picks the *largest* set priority number, so everything here
//! scans from the most significant end. `leading_zeros` lowers to a single
//! instruction (`clz` or equivalent) on every supported target, which is what
//! makes the ready queue's peek operation constant-time.

/// Get the position of the most significant set bit of `x`, or `None` if
/// `x` is zero.
#[inline]
pub const fn find_last_set(x: usize) -> Option<u32> {
    if x == 0 {
        None
    } else {
        Some(usize::BITS - 1 - x.leading_zeros())
    }
}

/// `⌈a / b⌉` for `b > 0`.
#[inline]
pub(crate) const fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// `⌈log₂ x⌉` for `x ≥ 1`.
#[inline]
pub(crate) const fn ceil_log2(x: usize) -> u32 {
    if x <= 1 {
        0
    } else {
        usize::BITS - (x - 1).leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_last_set_zero() {
        assert_eq!(find_last_set(0), None);
    }

    #[test]
    fn find_last_set_single_bits() {
        for i in 0..usize::BITS {
            assert_eq!(find_last_set(1 << i), Some(i));
        }
    }

    #[test]
    fn find_last_set_ignores_lower_bits() {
        for i in 1..usize::BITS {
            let x = (1 << i) | ((1 << i) - 1);
            assert_eq!(find_last_set(x), Some(i));
        }
    }

    #[test]
    fn ceil_log2_small() {
        let expected = [0u32, 0, 1, 2, 2, 3, 3, 3, 3, 4];
        for (x, &e) in expected.iter().enumerate().skip(1) {
            assert_eq!(ceil_log2(x), e, "x = {x}");
        }
    }

    #[test]
    fn div_ceil_exact_and_rounded() {
        assert_eq!(div_ceil(64, 32), 2);
        assert_eq!(div_ceil(65, 32), 3);
        assert_eq!(div_ceil(1, 32), 1);
    }
}
