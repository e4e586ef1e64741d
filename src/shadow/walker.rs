//! Iteration over the blocks recorded in a region of the shadow.

use super::{Shadow, ShadowBlock, GRANULE};
use crate::util::layout::{align_down, align_up};

/// Walks block start markers in `[lower, upper)` and yields block extents.
///
/// A non-recursive walker only yields top-level blocks and skips over their
/// contents. A recursive walker also yields every nested block, outer
/// blocks first.
pub struct ShadowWalker<'a> {
    shadow: &'a Shadow,
    recursive: bool,
    lower: usize,
    cursor: usize,
    upper: usize,
}

impl<'a> ShadowWalker<'a> {
    /// Create a walker over `[lower, upper)`, clamped to the window.
    pub fn new(shadow: &'a Shadow, recursive: bool, lower: usize, upper: usize) -> Self {
        let lower = align_up(lower.max(shadow.lower_bound()), GRANULE);
        let upper = align_down(upper.min(shadow.upper_bound()), GRANULE);
        Self {
            shadow,
            recursive,
            lower,
            cursor: lower,
            upper,
        }
    }

    /// A walker over the whole window.
    pub fn whole(shadow: &'a Shadow, recursive: bool) -> Self {
        Self::new(shadow, recursive, shadow.lower_bound(), shadow.upper_bound())
    }

    /// Restart the walk from its lower bound.
    pub fn reset(&mut self) {
        self.cursor = self.lower;
    }
}

impl<'a> Iterator for ShadowWalker<'a> {
    type Item = ShadowBlock;

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor < self.upper {
            let here = self.cursor;
            let marker = self.shadow.marker_for(here);
            if marker.is_block_start() && (self.recursive || !marker.is_nested_block_start()) {
                if let Some(extent) = self.shadow.block_extent(here) {
                    self.cursor = if self.recursive {
                        here + GRANULE
                    } else {
                        extent.end()
                    };
                    return Some(extent);
                }
            }
            self.cursor = here + GRANULE;
        }
        None
    }
}
