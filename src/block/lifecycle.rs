//! Block lifecycle: ALLOCATED, then QUARANTINED, then FREED.
//!
//! [`BlockLifecycle`] is a borrowed view over the shadow and the stack
//! cache of one heap. It writes block metadata, keeps the shadow in sync
//! with each transition, and answers questions about blocks found from
//! arbitrary addresses.
//!
//! Stack references are only ever taken and given back here: filling an
//! alloc or free slot takes a reference, destroying the block releases both.

use std::ptr;
use std::time::Duration;

use super::{
    checksum, BlockHeader, BlockInfo, BlockLayout, BlockState, BlockTrailer, BLOCK_HEADER_MAGIC,
    HEADER_PADDING_BYTE, HEADER_SIZE, TRAILER_PADDING_BYTE,
};
use crate::diagnostics::BadAccessKind;
use crate::error::BlockError;
use crate::shadow::{Shadow, ShadowMarker, GRANULE};
use crate::stack::{StackCapture, StackCaptureCache, StackId};
use crate::util::clock;
use crate::util::layout::is_aligned;

/// Lifecycle operations over one heap's shadow and stack cache.
#[derive(Clone, Copy)]
pub struct BlockLifecycle<'a> {
    shadow: &'a Shadow,
    stacks: &'a StackCaptureCache,
}

impl<'a> BlockLifecycle<'a> {
    /// Borrow the shadow and stack cache of a heap.
    pub fn new(shadow: &'a Shadow, stacks: &'a StackCaptureCache) -> Self {
        Self { shadow, stacks }
    }

    /// The shadow this view writes to.
    pub fn shadow(&self) -> &'a Shadow {
        self.shadow
    }

    fn acquire_stack(&self, slot: &mut StackId, capture: &StackCapture) {
        self.release_stack(slot);
        *slot = self.stacks.save(capture);
    }

    fn release_stack(&self, slot: &mut StackId) {
        self.stacks.release(*slot);
        *slot = StackId::NONE;
    }

    /// Lay out a block in `memory` and mark it allocated.
    ///
    /// Writes the header, both paddings and the trailer, takes a reference
    /// on `alloc_stack`, then poisons the redzones and unpoisons the body.
    /// The returned info's `body` is the user pointer.
    ///
    /// # Safety
    ///
    /// `memory` must be writable for `layout.block_size` bytes, aligned to
    /// `layout.block_alignment`, and not used by any other live block.
    ///
    /// # Panics
    ///
    /// Panics if the block is not granule aligned or leaves the window.
    pub unsafe fn initialize_block(
        &self,
        memory: usize,
        layout: &BlockLayout,
        nested: bool,
        heap_id: u32,
        alloc_stack: &StackCapture,
    ) -> BlockInfo {
        assert!(is_aligned(memory, layout.block_alignment.max(GRANULE)));
        assert!(self.shadow.contains_range(memory, layout.block_size));

        let info = BlockInfo::from_layout(memory, layout, nested);

        let mut header = BlockHeader::new(layout, nested);
        self.acquire_stack(&mut header.alloc_stack, alloc_stack);
        ptr::write(info.header_ptr(), header);

        if info.header_padding_size > 0 {
            let padding = info.header_padding();
            ptr::write_bytes(padding as *mut u8, HEADER_PADDING_BYTE, info.header_padding_size);
            let size = info.header_padding_size as u32;
            ptr::write_unaligned(padding as *mut u32, size);
            ptr::write_unaligned((padding + info.header_padding_size - 4) as *mut u32, size);
        }

        if info.trailer_padding_size > 0 {
            let padding = info.body_end();
            ptr::write_bytes(padding as *mut u8, TRAILER_PADDING_BYTE, info.trailer_padding_size);
            if header.has_excess_trailer_padding() {
                ptr::write_unaligned(padding as *mut u32, info.trailer_padding_size as u32);
            }
        }

        ptr::write(
            info.trailer_ptr(),
            BlockTrailer::new(clock::current_thread_serial(), clock::ticks(), heap_id),
        );

        checksum::set(&info);
        self.shadow.poison_allocated_block(&info);
        info
    }

    /// Move an allocated block to the quarantined state.
    ///
    /// Records the free site, thread and time, then marks everything
    /// between the block start and end markers as FREED. The body bytes
    /// are left as they are.
    ///
    /// # Safety
    ///
    /// `info` must describe a block in readable and writable memory.
    pub unsafe fn mark_as_quarantined(
        &self,
        info: &BlockInfo,
        free_stack: &StackCapture,
    ) -> Result<(), BlockError> {
        let header_ptr = info.header_ptr();
        if ptr::addr_of!((*header_ptr).magic).read() != BLOCK_HEADER_MAGIC {
            return Err(BlockError::InvalidState {
                block: info.block,
                expected: BlockState::Allocated,
                found: None,
            });
        }
        // Concurrent frees of one block race here; only one wins.
        BlockHeader::transition(header_ptr, BlockState::Allocated, BlockState::Quarantined)
            .map_err(|found| BlockError::InvalidState {
                block: info.block,
                expected: BlockState::Allocated,
                found,
            })?;

        let header = &mut *header_ptr;
        self.acquire_stack(&mut header.free_stack, free_stack);

        let trailer = &mut *info.trailer_ptr();
        trailer.free_tid = clock::current_thread_serial();
        trailer.free_ticks = clock::ticks();

        self.shadow
            .mark_as_freed(info.block + GRANULE, info.block_size - 2 * GRANULE);
        checksum::set(info);
        Ok(())
    }

    /// Retire a quarantined block.
    ///
    /// Releases both stack references, marks the block FREED and unpoisons
    /// its whole range. Returning the memory to the underlying heap is the
    /// caller's job.
    ///
    /// # Safety
    ///
    /// `info` must describe a block in readable and writable memory.
    pub unsafe fn destroy_block(&self, info: &BlockInfo) -> Result<(), BlockError> {
        let header = &mut *info.header_ptr();
        expect_state(info, header, BlockState::Quarantined)?;

        self.release_stack(&mut header.alloc_stack);
        self.release_stack(&mut header.free_stack);
        header.set_state(BlockState::Freed);

        self.shadow.unpoison(info.block, info.block_size);
        Ok(())
    }

    /// Release the metadata of a block whose header cannot be trusted.
    ///
    /// Stack ids are only released if the cache knows them. The shadow of
    /// `extent` is unpoisoned.
    ///
    /// # Safety
    ///
    /// `[block, block + block_size)` must be readable and writable memory.
    pub unsafe fn destroy_corrupt_block(&self, block: usize, block_size: usize) {
        if self.shadow.contains_range(block, HEADER_SIZE) {
            let header = &mut *(block as *mut BlockHeader);
            if header.has_valid_magic() {
                for slot in [&mut header.alloc_stack, &mut header.free_stack] {
                    if self.stacks.contains(*slot) {
                        self.release_stack(slot);
                    }
                }
                header.set_state(BlockState::Freed);
            }
        }
        self.shadow.unpoison(block, block_size);
    }

    /// Copy a block to `dst`, shadow included.
    ///
    /// The copy takes its own references on the stacks of the source.
    ///
    /// # Safety
    ///
    /// `dst` must be writable for `src.block_size` bytes, granule aligned
    /// and not overlap `src` or any live block.
    pub unsafe fn clone_block(&self, src: &BlockInfo, dst: usize) -> Option<BlockInfo> {
        if !is_aligned(dst, GRANULE) || !self.shadow.contains_range(dst, src.block_size) {
            return None;
        }
        ptr::copy_nonoverlapping(src.block as *const u8, dst as *mut u8, src.block_size);
        self.shadow.clone_shadow_range(src.block, dst, src.block_size);

        let header = ptr::read(dst as *const BlockHeader);
        for id in [header.alloc_stack, header.free_stack] {
            if !id.is_none() {
                self.stacks.add_ref(id);
            }
        }
        BlockInfo::parse(self.shadow, dst)
    }

    /// Parse the block whose header is at `header`.
    pub fn block_info(&self, header: usize) -> Option<BlockInfo> {
        // SAFETY: parse bounds checks every read against the window,
        // which is heap memory for the lifetime of the shadow.
        unsafe { BlockInfo::parse(self.shadow, header) }
    }

    /// Find the header of the block whose body starts at `body`.
    ///
    /// Tries the header directly in front of the body first, then the
    /// header padding length stored right before the body. The result is
    /// only returned if parsing it leads back to `body`.
    pub fn user_pointer_to_header(&self, body: usize) -> Option<usize> {
        if !is_aligned(body, GRANULE) {
            return None;
        }
        let direct = body.checked_sub(HEADER_SIZE)?;
        if self.shadow.contains_range(direct, HEADER_SIZE) {
            // SAFETY: in the window.
            let header = unsafe { ptr::read(direct as *const BlockHeader) };
            if header.has_valid_magic() && !header.has_header_padding() {
                return self.confirm(direct, body);
            }
        }

        let tail = body.checked_sub(4)?;
        if !self.shadow.contains_range(tail, 4) {
            return None;
        }
        // SAFETY: in the window.
        let padding = unsafe { ptr::read_unaligned(tail as *const u32) } as usize;
        if padding < 8 || !is_aligned(padding, GRANULE) {
            return None;
        }
        let header = body.checked_sub(padding)?.checked_sub(HEADER_SIZE)?;
        self.confirm(header, body)
    }

    fn confirm(&self, header: usize, body: usize) -> Option<usize> {
        match self.block_info(header) {
            Some(info) if info.body == body => Some(header),
            _ => None,
        }
    }

    /// User pointer of the block whose header is at `header`.
    pub fn header_to_user_pointer(&self, header: usize) -> Option<usize> {
        self.block_info(header).map(|info| info.body)
    }

    /// Header of the block whose underlying allocation starts at `block`.
    pub fn asan_pointer_to_header(&self, block: usize) -> Option<usize> {
        self.block_info(block).map(|info| info.block)
    }

    /// Trailer of the block whose header is at `header`.
    pub fn header_to_trailer(&self, header: usize) -> Option<usize> {
        self.block_info(header).map(|info| info.trailer_addr())
    }

    /// The block whose body directly contains the nested block `info`.
    pub fn find_containing_block(&self, info: &BlockInfo) -> Option<BlockInfo> {
        if !info.is_nested {
            return None;
        }
        let extent = self.shadow.block_extent(info.block)?;
        let parent = self.shadow.parent_block_extent(&extent)?;
        let parent_info = self.block_info(parent.block)?;
        if parent_info.block_size != parent.block_size {
            return None;
        }
        Some(parent_info)
    }

    /// The nearest enclosing block that has been quarantined or freed.
    pub fn find_containing_freed_block(&self, info: &BlockInfo) -> Option<BlockInfo> {
        let mut current = *info;
        loop {
            let parent = self.find_containing_block(&current)?;
            // SAFETY: parsed from window memory.
            match unsafe { parent.state() } {
                Some(BlockState::Quarantined) | Some(BlockState::Freed) => return Some(parent),
                _ => current = parent,
            }
        }
    }

    /// Classify an access at `addr` relative to the block `info`.
    pub fn bad_access_kind(&self, addr: usize, info: &BlockInfo) -> BadAccessKind {
        // SAFETY: parsed from window memory.
        let state = unsafe { info.state() };
        let in_body = addr >= info.body && addr < info.body_end();

        if in_body && state != Some(BlockState::Allocated) {
            return BadAccessKind::UseAfterFree;
        }
        if addr < info.body {
            return BadAccessKind::HeapBufferUnderflow;
        }
        if addr >= info.body_end() {
            return BadAccessKind::HeapBufferOverflow;
        }
        // A live block inside a freed one: the enclosing free poisoned it.
        if self.shadow.marker_for(addr) == ShadowMarker::FREED {
            return BadAccessKind::UseAfterFree;
        }
        BadAccessKind::UnknownBadAccess
    }

    /// Time since the block was freed, zero while it is allocated.
    pub fn time_since_free(&self, info: &BlockInfo) -> Duration {
        // SAFETY: parsed from window memory.
        let (header, trailer) = unsafe { (info.header(), info.trailer()) };
        match header.state() {
            Some(BlockState::Allocated) | None => Duration::ZERO,
            Some(_) => clock::since(trailer.free_ticks),
        }
    }

    /// Checksum of the block as it is now.
    pub fn checksum(&self, info: &BlockInfo) -> u16 {
        // SAFETY: parsed from window memory.
        unsafe { checksum::compute(info) }
    }

    /// Whether the stored checksum matches.
    pub fn is_checksum_valid(&self, info: &BlockInfo) -> bool {
        // SAFETY: parsed from window memory.
        unsafe { checksum::is_valid(info) }
    }

    /// Whether the block at `header` fails any consistency check.
    ///
    /// Checks the header parse, the checksum and, for blocks that still
    /// have shadow markers, that the markers agree with the header.
    pub fn is_block_corrupt(&self, header: usize) -> bool {
        let info = match self.block_info(header) {
            Some(info) => info,
            None => return true,
        };
        if !self.is_checksum_valid(&info) {
            return true;
        }
        // SAFETY: parsed from window memory.
        if unsafe { info.state() } == Some(BlockState::Freed) {
            return false;
        }
        match self.shadow.block_extent(info.block) {
            Some(extent) => {
                extent.block != info.block
                    || extent.block_size != info.block_size
                    || extent.is_nested != info.is_nested
            }
            None => true,
        }
    }

    /// Resolve the stacks recorded in a header.
    pub fn stacks_of(
        &self,
        info: &BlockInfo,
    ) -> (
        Option<std::sync::Arc<StackCapture>>,
        Option<std::sync::Arc<StackCapture>>,
    ) {
        // SAFETY: parsed from window memory.
        let header = unsafe { info.header() };
        (self.stacks.get(header.alloc_stack), self.stacks.get(header.free_stack))
    }
}

fn expect_state(
    info: &BlockInfo,
    header: &BlockHeader,
    expected: BlockState,
) -> Result<(), BlockError> {
    match header.state() {
        Some(state) if state == expected && header.has_valid_magic() => Ok(()),
        found => Err(BlockError::InvalidState {
            block: info.block,
            expected,
            found,
        }),
    }
}
