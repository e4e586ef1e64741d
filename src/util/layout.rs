//! Layout utilities.

/// Align a size up to the given alignment.
#[inline]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Align a size up, returning `None` on overflow.
#[inline]
pub const fn checked_align_up(size: usize, align: usize) -> Option<usize> {
    match size.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Align a size down to the given alignment.
#[inline]
pub const fn align_down(size: usize, align: usize) -> usize {
    size & !(align - 1)
}

/// Check whether `value` is a multiple of `align`.
#[inline]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Calculate padding needed to align a size.
#[inline]
pub const fn padding_for(size: usize, align: usize) -> usize {
    let aligned = align_up(size, align);
    aligned - size
}

/// Base-2 logarithm of a power of two.
#[inline]
pub const fn log2(value: usize) -> u8 {
    value.trailing_zeros() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
    }

    #[test]
    fn test_checked_align_up_overflow() {
        assert_eq!(checked_align_up(9, 8), Some(16));
        assert_eq!(checked_align_up(usize::MAX - 2, 8), None);
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(15, 8), 8);
        assert_eq!(align_down(16, 8), 16);
        assert!(is_aligned(4096, 4096));
        assert!(!is_aligned(4100, 8));
    }

    #[test]
    fn test_padding_for() {
        assert_eq!(padding_for(0, 8), 0);
        assert_eq!(padding_for(1, 8), 7);
        assert_eq!(padding_for(8, 8), 0);
        assert_eq!(padding_for(9, 8), 7);
    }

    #[test]
    fn test_log2() {
        assert_eq!(log2(1), 0);
        assert_eq!(log2(8), 3);
        assert_eq!(log2(4096), 12);
    }
}
