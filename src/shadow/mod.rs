//! Shadow memory.
//!
//! One marker byte describes each 8-byte granule of the monitored window.
//! The window is the arena a [`GuardedHeap`](crate::GuardedHeap) reserves at
//! construction; addresses outside of it are never dereferenced.
//!
//! Markers are stored as relaxed atomics. Distinct blocks never share a
//! granule, so concurrent transitions of different blocks touch disjoint
//! shadow bytes.

pub mod marker;
pub mod text;
pub mod walker;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::block::BlockInfo;
use crate::util::layout::{align_down, align_up, is_aligned};

pub use marker::ShadowMarker;
pub use walker::ShadowWalker;

/// Bytes covered by one shadow marker.
pub const GRANULE: usize = 8;

/// `log2(GRANULE)`.
pub const GRANULE_SHIFT: u32 = 3;

/// Size of the invalid region at the bottom of every window.
pub const GUARD_SIZE: usize = 4096;

/// Marker-delimited extent of one block, recovered from the shadow alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowBlock {
    /// Address of the first byte of the block (its header).
    pub block: usize,
    /// Total size of the block, redzones included.
    pub block_size: usize,
    /// Whether the block lives inside the body of another block.
    pub is_nested: bool,
    /// Body size modulo the granule size.
    pub body_size_mod: u8,
}

impl ShadowBlock {
    /// One past the last byte of the block.
    pub fn end(&self) -> usize {
        self.block + self.block_size
    }

    /// Whether `addr` falls inside the block.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.block && addr < self.end()
    }
}

/// Shadow memory for one monitored window.
pub struct Shadow {
    base: usize,
    len: usize,
    bytes: Box<[AtomicU8]>,
}

impl Shadow {
    /// Create an all-addressable shadow for `[base, base + len)`.
    ///
    /// # Panics
    ///
    /// Panics if `base` or `len` is not granule aligned.
    pub fn new(base: usize, len: usize) -> Self {
        assert!(is_aligned(base, GRANULE), "shadow base must be granule aligned");
        assert!(is_aligned(len, GRANULE), "shadow length must be granule aligned");
        assert!(base.checked_add(len).is_some(), "shadow window overflows");

        let bytes = (0..len >> GRANULE_SHIFT)
            .map(|_| AtomicU8::new(ShadowMarker::ADDRESSABLE.raw()))
            .collect();
        Self { base, len, bytes }
    }

    /// Mark the guard region at the bottom of the window as invalid.
    pub fn set_up(&self) {
        let guard = GUARD_SIZE.min(self.len);
        self.poison(self.base, guard, ShadowMarker::INVALID_ADDRESS);
    }

    /// Return every granule to the addressable state.
    pub fn tear_down(&self) {
        for byte in self.bytes.iter() {
            byte.store(ShadowMarker::ADDRESSABLE.raw(), Ordering::Relaxed);
        }
    }

    /// First address of the window.
    #[inline]
    pub fn lower_bound(&self) -> usize {
        self.base
    }

    /// One past the last address of the window.
    #[inline]
    pub fn upper_bound(&self) -> usize {
        self.base + self.len
    }

    /// Whether `addr` lies in the window.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.upper_bound()
    }

    /// Whether `[addr, addr + size)` lies in the window.
    #[inline]
    pub fn contains_range(&self, addr: usize, size: usize) -> bool {
        match addr.checked_add(size) {
            Some(end) => addr >= self.base && end <= self.upper_bound(),
            None => false,
        }
    }

    #[inline]
    fn index(&self, addr: usize) -> Option<usize> {
        if self.contains(addr) {
            Some((addr - self.base) >> GRANULE_SHIFT)
        } else {
            None
        }
    }

    #[inline]
    fn address_of(&self, index: usize) -> usize {
        self.base + (index << GRANULE_SHIFT)
    }

    #[inline]
    fn load(&self, index: usize) -> ShadowMarker {
        ShadowMarker::from_raw(self.bytes[index].load(Ordering::Relaxed))
    }

    #[inline]
    fn store(&self, index: usize, marker: ShadowMarker) {
        self.bytes[index].store(marker.raw(), Ordering::Relaxed);
    }

    fn fill(&self, addr: usize, size: usize, marker: ShadowMarker) {
        let first = (addr - self.base) >> GRANULE_SHIFT;
        let count = size >> GRANULE_SHIFT;
        for index in first..first + count {
            self.store(index, marker);
        }
    }

    fn assert_granule_range(&self, addr: usize, size: usize) {
        assert!(
            is_aligned(addr, GRANULE) && is_aligned(size, GRANULE),
            "shadow range {:#x}+{} is not granule aligned",
            addr,
            size
        );
        assert!(
            self.contains_range(addr, size),
            "shadow range {:#x}+{} is outside the monitored window",
            addr,
            size
        );
    }

    /// Mark `size` bytes at `addr` with `marker`.
    ///
    /// # Panics
    ///
    /// Panics if the range is not granule aligned or leaves the window.
    pub fn poison(&self, addr: usize, size: usize, marker: ShadowMarker) {
        self.assert_granule_range(addr, size);
        self.fill(addr, size, marker);
    }

    /// Make `size` bytes at `addr` accessible.
    ///
    /// A trailing partial granule is recorded with a partial marker.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not granule aligned or the range leaves the window.
    pub fn unpoison(&self, addr: usize, size: usize) {
        let whole = align_down(size, GRANULE);
        self.assert_granule_range(addr, align_up(size, GRANULE));
        self.fill(addr, whole, ShadowMarker::ADDRESSABLE);

        let remainder = size - whole;
        if remainder != 0 {
            let index = (addr + whole - self.base) >> GRANULE_SHIFT;
            self.store(index, ShadowMarker::partial(remainder));
        }
    }

    /// Mark a range as freed, keeping the structure of nested blocks.
    ///
    /// Granules owned directly by the range become FREED. Inside nested
    /// blocks the start/end markers and redzones are kept and only their
    /// bodies become FREED, so nested blocks can still be located.
    pub fn mark_as_freed(&self, addr: usize, size: usize) {
        self.assert_granule_range(addr, size);
        let first = (addr - self.base) >> GRANULE_SHIFT;
        let mut depth = 0usize;
        for index in first..first + (size >> GRANULE_SHIFT) {
            let marker = self.load(index);
            if marker.is_block_start() {
                depth += 1;
                continue;
            }
            if marker.is_block_end() {
                depth = depth.saturating_sub(1);
                continue;
            }
            if depth == 0 || marker.is_addressable() {
                self.store(index, ShadowMarker::FREED);
            }
        }
    }

    /// Marker for the granule containing `addr`.
    ///
    /// Addresses outside the window read as INVALID_ADDRESS.
    pub fn marker_for(&self, addr: usize) -> ShadowMarker {
        match self.index(addr) {
            Some(index) => self.load(index),
            None => ShadowMarker::INVALID_ADDRESS,
        }
    }

    /// Whether the byte at `addr` may be accessed.
    pub fn is_accessible(&self, addr: usize) -> bool {
        let marker = self.marker_for(addr);
        if marker == ShadowMarker::ADDRESSABLE {
            return true;
        }
        if marker.is_redzone() {
            return false;
        }
        (addr & (GRANULE - 1)) < marker.raw() as usize
    }

    /// Address of the first inaccessible byte in `[addr, addr + size)`.
    pub fn find_first_poisoned_byte(&self, addr: usize, size: usize) -> Option<usize> {
        let end = addr.checked_add(size)?;
        let mut cursor = addr;
        while cursor < end {
            if is_aligned(cursor, GRANULE)
                && cursor + GRANULE <= end
                && self.marker_for(cursor) == ShadowMarker::ADDRESSABLE
            {
                cursor += GRANULE;
                continue;
            }
            if !self.is_accessible(cursor) {
                return Some(cursor);
            }
            cursor += 1;
        }
        None
    }

    /// Whether every byte of `[addr, addr + size)` is accessible.
    pub fn is_range_accessible(&self, addr: usize, size: usize) -> bool {
        self.find_first_poisoned_byte(addr, size).is_none()
    }

    /// Whether `addr` is in the left redzone of a block.
    pub fn is_left_redzone(&self, addr: usize) -> bool {
        self.marker_for(addr).is_left_redzone()
    }

    /// Whether `addr` is in the right redzone of a block.
    pub fn is_right_redzone(&self, addr: usize) -> bool {
        self.marker_for(addr).is_right_redzone()
    }

    /// Whether `addr` is in the first granule of a block.
    pub fn is_block_start_byte(&self, addr: usize) -> bool {
        self.marker_for(addr).is_block_start()
    }

    /// Write the shadow of a freshly allocated block.
    ///
    /// # Panics
    ///
    /// Panics if the block is not granule aligned or leaves the window.
    pub fn poison_allocated_block(&self, info: &BlockInfo) {
        self.assert_granule_range(info.block, info.block_size);
        debug_assert!(info.block_size >= 2 * GRANULE);

        let first = (info.block - self.base) >> GRANULE_SHIFT;
        let last = first + (info.block_size >> GRANULE_SHIFT) - 1;
        let body_first = (info.body - self.base) >> GRANULE_SHIFT;
        let body_end = align_up(info.body + info.body_size, GRANULE);
        let right_first = (body_end - self.base) >> GRANULE_SHIFT;

        self.store(
            first,
            ShadowMarker::block_start(info.is_nested, (info.body_size % GRANULE) as u8),
        );
        for index in first + 1..body_first {
            self.store(index, ShadowMarker::LEFT_REDZONE);
        }
        for index in body_first..right_first {
            self.store(index, ShadowMarker::ADDRESSABLE);
        }
        if info.body_size % GRANULE != 0 {
            self.store(right_first - 1, ShadowMarker::partial(info.body_size));
        }
        for index in right_first..last {
            self.store(index, ShadowMarker::RIGHT_REDZONE);
        }
        self.store(last, ShadowMarker::block_end(info.is_nested));
    }

    /// Copy the shadow of `[src, src + size)` onto `[dst, dst + size)`.
    ///
    /// # Panics
    ///
    /// Panics if either range is not granule aligned or leaves the window.
    pub fn clone_shadow_range(&self, src: usize, dst: usize, size: usize) {
        self.assert_granule_range(src, size);
        self.assert_granule_range(dst, size);
        let src_first = (src - self.base) >> GRANULE_SHIFT;
        let dst_first = (dst - self.base) >> GRANULE_SHIFT;
        let count = size >> GRANULE_SHIFT;
        if dst_first <= src_first {
            for i in 0..count {
                self.store(dst_first + i, self.load(src_first + i));
            }
        } else {
            for i in (0..count).rev() {
                self.store(dst_first + i, self.load(src_first + i));
            }
        }
    }

    /// Length in bytes of a null-terminated array of `T` starting at `addr`.
    ///
    /// Elements are read while they are accessible. Returns `Ok(size)` with
    /// the size including the terminator, or `Ok(max_size)` when no
    /// terminator was met within `max_size` bytes. Returns `Err(offset)`
    /// with the offset of the first inaccessible byte when the scan runs
    /// into poisoned memory first.
    ///
    /// # Safety
    ///
    /// Every accessible byte of the window must be readable memory.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero sized, wider than a granule, or `addr` is not
    /// aligned to `size_of::<T>()`.
    pub unsafe fn null_terminated_array_size<T>(
        &self,
        addr: usize,
        max_size: usize,
    ) -> Result<usize, usize> {
        let elem = std::mem::size_of::<T>();
        assert!(elem > 0 && elem <= GRANULE && GRANULE % elem == 0);
        assert!(is_aligned(addr, elem));

        let mut size = 0usize;
        let mut cursor = addr;
        while size < max_size {
            let marker = self.marker_for(cursor);
            if marker.is_redzone() {
                return Err(cursor - addr);
            }
            let granule = align_down(cursor, GRANULE);
            let accessible = if marker == ShadowMarker::ADDRESSABLE {
                GRANULE
            } else {
                marker.raw() as usize
            };
            let limit = granule + accessible;

            while cursor + elem <= limit {
                // SAFETY: the shadow says these bytes are accessible and
                // the caller guarantees accessible window memory is readable.
                let bytes = std::slice::from_raw_parts(cursor as *const u8, elem);
                let terminator = bytes.iter().all(|&b| b == 0);
                size += elem;
                cursor += elem;
                if terminator || size >= max_size {
                    return Ok(size);
                }
            }

            if accessible < GRANULE {
                return Err(limit.max(cursor) - addr);
            }
        }
        Ok(size)
    }

    /// Total block size of the block containing `addr`, from markers alone.
    pub fn alloc_size(&self, addr: usize) -> Option<usize> {
        self.block_extent(addr).map(|extent| extent.block_size)
    }

    /// The innermost block whose extent contains `addr`.
    pub fn block_extent(&self, addr: usize) -> Option<ShadowBlock> {
        self.extent_at_depth(addr, 0)
    }

    /// The block directly enclosing a nested block.
    pub fn parent_block_extent(&self, child: &ShadowBlock) -> Option<ShadowBlock> {
        if !child.is_nested {
            return None;
        }
        self.extent_at_depth(child.block, 1)
    }

    fn extent_at_depth(&self, addr: usize, depth: usize) -> Option<ShadowBlock> {
        let cursor = self.index(addr)?;
        let start = self.scan_left(cursor, depth)?;
        let end = self.scan_right(cursor, depth)?;
        let start_marker = self.load(start);
        let end_marker = self.load(end);
        if start_marker.is_nested_block_start() != end_marker.is_nested_block_end() {
            return None;
        }
        Some(ShadowBlock {
            block: self.address_of(start),
            block_size: (end - start + 1) << GRANULE_SHIFT,
            is_nested: start_marker.is_nested_block_start(),
            body_size_mod: start_marker.block_start_data(),
        })
    }

    /// Walk left to the start marker that encloses `cursor` at `depth`
    /// levels of nesting.
    fn scan_left(&self, cursor: usize, depth: usize) -> Option<usize> {
        let mut depth = depth;
        let mut index = cursor;
        loop {
            let marker = self.load(index);
            if marker.is_block_start() {
                if depth == 0 {
                    return Some(index);
                }
                depth -= 1;
            } else if marker.is_block_end() && index != cursor {
                // A top-level block ended before we found an enclosing start.
                if depth == 0 && !marker.is_nested_block_end() {
                    return None;
                }
                depth += 1;
            }
            if index == 0 {
                return None;
            }
            index -= 1;
        }
    }

    /// Walk right to the end marker that encloses `cursor` at `depth`
    /// levels of nesting.
    fn scan_right(&self, cursor: usize, depth: usize) -> Option<usize> {
        let mut depth = depth;
        let mut index = cursor;
        let last = self.bytes.len().checked_sub(1)?;
        loop {
            let marker = self.load(index);
            if marker.is_block_end() {
                if depth == 0 {
                    return Some(index);
                }
                depth -= 1;
            } else if marker.is_block_start() && index != cursor {
                if depth == 0 && !marker.is_nested_block_start() {
                    return None;
                }
                depth += 1;
            }
            if index == last {
                return None;
            }
            index += 1;
        }
    }

    /// Recover the body of an allocated block from its redzone markers.
    ///
    /// Returns `(body, body_size)`, or `None` if the block has been
    /// quarantined (its redzones were overwritten with FREED).
    pub fn body_bounds(&self, extent: &ShadowBlock) -> Option<(usize, usize)> {
        let first = self.index(extent.block)?;
        let last = first + (extent.block_size >> GRANULE_SHIFT) - 1;

        let mut body_first = first + 1;
        while body_first < last && self.load(body_first) == ShadowMarker::LEFT_REDZONE {
            body_first += 1;
        }
        if self.load(body_first) == ShadowMarker::FREED {
            return None;
        }

        let mut body_end = last;
        while body_end > body_first && self.load(body_end - 1) == ShadowMarker::RIGHT_REDZONE {
            body_end -= 1;
        }

        let body = self.address_of(body_first);
        let mut body_size = (body_end - body_first) << GRANULE_SHIFT;
        if extent.body_size_mod != 0 && body_size != 0 {
            body_size -= GRANULE - extent.body_size_mod as usize;
        }
        Some((body, body_size))
    }
}

impl fmt::Debug for Shadow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shadow")
            .field("lower_bound", &format_args!("{:#x}", self.lower_bound()))
            .field("upper_bound", &format_args!("{:#x}", self.upper_bound()))
            .finish()
    }
}
