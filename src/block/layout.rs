//! Block geometry.

use super::{HEADER_SIZE, MAX_BODY_SIZE, TRAILER_SIZE};
use crate::shadow::GRANULE;
use crate::util::layout::checked_align_up;

/// Sizes of every region of a block.
///
/// Purely computed; recomputed for every allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    /// Alignment of the block start.
    pub block_alignment: usize,
    /// Alignment of the body.
    pub body_alignment: usize,
    /// Total size, a multiple of `block_alignment`.
    pub block_size: usize,
    /// Always [`HEADER_SIZE`].
    pub header_size: usize,
    /// Bytes between the header and the body.
    pub header_padding_size: usize,
    /// Requested user size.
    pub body_size: usize,
    /// Bytes between the body and the trailer.
    pub trailer_padding_size: usize,
    /// Always [`TRAILER_SIZE`].
    pub trailer_size: usize,
}

impl BlockLayout {
    /// Plan a block holding `size` bytes.
    ///
    /// The left redzone is at least `min_left_redzone` bytes and always
    /// holds the header; the right redzone is at least `min_right_redzone`
    /// bytes and always holds the trailer. The block size is rounded up to
    /// `chunk_size` and the body is pushed as far right as the alignment
    /// allows, growing the trailer padding.
    ///
    /// Returns `None` if the sizes overflow.
    ///
    /// # Panics
    ///
    /// Panics unless `alignment` and `chunk_size` are powers of two of at
    /// least one granule with `chunk_size >= alignment`.
    pub fn plan(
        chunk_size: usize,
        alignment: usize,
        size: usize,
        min_left_redzone: usize,
        min_right_redzone: usize,
    ) -> Option<Self> {
        assert!(alignment.is_power_of_two() && alignment >= GRANULE);
        assert!(chunk_size.is_power_of_two() && chunk_size >= alignment);

        if size > MAX_BODY_SIZE {
            return None;
        }

        let left = checked_align_up(min_left_redzone.max(HEADER_SIZE), alignment)?;
        let right = min_right_redzone.max(TRAILER_SIZE);
        let total = checked_align_up(left.checked_add(size)?.checked_add(right)?, chunk_size)?;

        // Body plus right redzone, rounded so that the body stays aligned
        // when placed at the end of the block.
        let body_and_right = checked_align_up(size.checked_add(right)?, alignment)?;
        let right = body_and_right - size;
        let left = total - body_and_right;

        Some(Self {
            block_alignment: chunk_size,
            body_alignment: alignment,
            block_size: total,
            header_size: HEADER_SIZE,
            header_padding_size: left - HEADER_SIZE,
            body_size: size,
            trailer_padding_size: right - TRAILER_SIZE,
            trailer_size: TRAILER_SIZE,
        })
    }

    /// Plan with the block aligned like the body.
    pub fn compute(
        size: usize,
        alignment: usize,
        min_left_redzone: usize,
        min_right_redzone: usize,
    ) -> Option<Self> {
        let alignment = alignment.max(GRANULE);
        Self::plan(alignment, alignment, size, min_left_redzone, min_right_redzone)
    }

    /// Header plus header padding.
    pub fn left_redzone_size(&self) -> usize {
        self.header_size + self.header_padding_size
    }

    /// Offset of the body from the block start.
    pub fn body_offset(&self) -> usize {
        self.left_redzone_size()
    }

    /// Trailer padding plus trailer.
    pub fn right_redzone_size(&self) -> usize {
        self.trailer_padding_size + self.trailer_size
    }

    /// Offset of the trailer from the block start.
    pub fn trailer_offset(&self) -> usize {
        self.block_size - self.trailer_size
    }

    /// Total block size.
    pub fn total_size(&self) -> usize {
        self.block_size
    }
}
