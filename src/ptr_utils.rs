//! Alignment helpers for segment offsets and addresses.

pub const WORD_SIZE: u64 = core::mem::size_of::<u64>() as u64;

/// Aligns `value` up to the next multiple of `align`, or `None` on overflow.
///
/// `align` must be a power of two.
#[inline]
pub const fn checked_align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());

    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[inline]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());

    value & !(align - 1)
}

#[inline]
pub const fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_test() {
        assert!(checked_align_up(0, WORD_SIZE) == Some(0));
        assert!(align_down(0, WORD_SIZE) == 0);

        assert!(checked_align_up(1, WORD_SIZE) == Some(WORD_SIZE));
        assert!(checked_align_up(7, WORD_SIZE) == Some(WORD_SIZE));
        assert!(checked_align_up(WORD_SIZE, WORD_SIZE) == Some(WORD_SIZE));
        assert!(checked_align_up(0x1001, 0x1000) == Some(0x2000));

        assert!(align_down(1, WORD_SIZE) == 0);
        assert!(align_down(15, WORD_SIZE) == WORD_SIZE);
        assert!(align_down(0x1fff, 0x1000) == 0x1000);

        assert!(checked_align_up(u64::MAX - 2, WORD_SIZE).is_none());
        assert!(checked_align_up(u64::MAX - 7, WORD_SIZE) == Some(u64::MAX - 7));

        assert!(is_aligned(0x40, 0x40));
        assert!(!is_aligned(0x48, 0x40));
    }
}
