//! From a faulting address to an [`ErrorInfo`].

use super::info::{BlockDescription, CorruptRange, ErrorInfo};
use super::kind::{AccessMode, BadAccessKind};
use crate::block::{BlockInfo, BlockLifecycle, BlockState};
use crate::shadow::{ShadowBlock, ShadowMarker};

/// Classifies bad accesses against one heap's shadow.
pub struct BadAccessClassifier<'a> {
    blocks: BlockLifecycle<'a>,
}

impl<'a> BadAccessClassifier<'a> {
    /// Classify against the shadow and stacks behind `blocks`.
    pub fn new(blocks: BlockLifecycle<'a>) -> Self {
        Self { blocks }
    }

    /// Build the report for an access of `size` bytes at `addr`.
    ///
    /// Only the shadow and block metadata inside the window are read.
    pub fn classify(&self, addr: usize, mode: AccessMode, size: usize) -> ErrorInfo {
        let shadow = self.blocks.shadow();
        let mut info = ErrorInfo::new(addr, BadAccessKind::UnknownBadAccess, mode, size);

        if addr >= shadow.upper_bound() {
            info.kind = BadAccessKind::WildAccess;
            return info;
        }
        info.shadow_memory = shadow.shadow_memory_text(addr);

        match shadow.marker_for(addr) {
            ShadowMarker::INTERNAL_MEMORY => {
                info.kind = BadAccessKind::WildAccess;
                return info;
            }
            ShadowMarker::INVALID_ADDRESS => {
                info.kind = BadAccessKind::InvalidAddress;
                return info;
            }
            _ => {}
        }

        let extent = match shadow.block_extent(addr) {
            Some(extent) => extent,
            None => return info,
        };

        let block = match self.blocks.block_info(extent.block) {
            Some(block) => block,
            None => {
                self.describe_corrupt(&mut info, &extent);
                return info;
            }
        };

        info.kind = self.blocks.bad_access_kind(addr, &block);
        self.describe(&mut info, &block);

        // Damaged metadata does not change what the access hit.
        if self.blocks.is_block_corrupt(block.block) {
            info.heap_is_corrupt = true;
            info.corrupt_ranges = vec![CorruptRange {
                address: block.block,
                length: block.block_size,
                block_count: 1,
            }];
        }

        // SAFETY: the block was parsed from window memory.
        let state = unsafe { block.state() };
        if info.kind == BadAccessKind::UseAfterFree && state == Some(BlockState::Allocated) {
            if let Some(freed) = self.blocks.find_containing_freed_block(&block) {
                self.take_free_details(&mut info, &freed);
            }
        }
        info
    }

    fn describe(&self, info: &mut ErrorInfo, block: &BlockInfo) {
        // SAFETY: the block was parsed from window memory.
        let (header, trailer) = unsafe { (block.header(), block.trailer()) };
        let description = BlockDescription::from_info(block, header.state(), trailer.heap_id);
        info.shadow_info = description.locate(info.location);
        info.block = Some(description);

        let (alloc_stack, free_stack) = self.blocks.stacks_of(block);
        info.alloc_stack = alloc_stack;
        info.alloc_tid = trailer.alloc_tid;
        if header.state() != Some(BlockState::Allocated) {
            info.free_stack = free_stack;
            info.free_tid = trailer.free_tid;
            info.time_since_free = self.blocks.time_since_free(block);
        }
    }

    /// Report the free of an enclosing block for an access into a live
    /// block nested inside it.
    fn take_free_details(&self, info: &mut ErrorInfo, freed: &BlockInfo) {
        // SAFETY: the block was parsed from window memory.
        let trailer = unsafe { freed.trailer() };
        let (_, free_stack) = self.blocks.stacks_of(freed);
        info.free_stack = free_stack;
        info.free_tid = trailer.free_tid;
        info.time_since_free = self.blocks.time_since_free(freed);
    }

    /// Describe a block whose header does not parse, using the shadow for
    /// the geometry.
    fn describe_corrupt(&self, info: &mut ErrorInfo, extent: &ShadowBlock) {
        info.kind = BadAccessKind::CorruptBlock;
        info.heap_is_corrupt = true;
        info.corrupt_ranges = vec![CorruptRange {
            address: extent.block,
            length: extent.block_size,
            block_count: 1,
        }];
        if let Some((body, body_size)) = self.blocks.shadow().body_bounds(extent) {
            let description = BlockDescription {
                block: extent.block,
                block_size: extent.block_size,
                body,
                body_size,
                state: None,
                heap_id: 0,
                is_nested: extent.is_nested,
            };
            info.shadow_info = description.locate(info.location);
            info.block = Some(description);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockLayout;
    use crate::shadow::{Shadow, GUARD_SIZE};
    use crate::stack::{StackCapture, StackCaptureCache};
    use crate::util::layout::align_up;

    struct Fixture {
        _buf: Vec<u64>,
        shadow: Shadow,
        stacks: StackCaptureCache,
    }

    impl Fixture {
        fn new() -> Self {
            let len = 4 * GUARD_SIZE;
            let mut buf = vec![0u64; (len + GUARD_SIZE) / 8];
            let base = align_up(buf.as_mut_ptr() as usize, GUARD_SIZE);
            let shadow = Shadow::new(base, len);
            shadow.set_up();
            Self {
                _buf: buf,
                shadow,
                stacks: StackCaptureCache::new(),
            }
        }

        fn blocks(&self) -> BlockLifecycle<'_> {
            BlockLifecycle::new(&self.shadow, &self.stacks)
        }

        fn classify(&self, addr: usize, mode: AccessMode) -> ErrorInfo {
            BadAccessClassifier::new(self.blocks()).classify(addr, mode, 1)
        }

        fn block(&self, offset: usize, size: usize) -> BlockInfo {
            let layout = BlockLayout::compute(size, 8, 0, 0).unwrap();
            let alloc = StackCapture::from_frames(vec![0x100, offset]);
            unsafe {
                self.blocks().initialize_block(
                    self.shadow.lower_bound() + GUARD_SIZE + offset,
                    &layout,
                    false,
                    0,
                    &alloc,
                )
            }
        }
    }

    #[test]
    fn test_outside_the_window() {
        let fx = Fixture::new();
        let wild = fx.classify(fx.shadow.upper_bound() + 64, AccessMode::Read);
        assert_eq!(wild.kind, BadAccessKind::WildAccess);

        let guard = fx.classify(fx.shadow.lower_bound() + 16, AccessMode::Read);
        assert_eq!(guard.kind, BadAccessKind::InvalidAddress);
        assert!(!guard.shadow_memory.is_empty());
    }

    #[test]
    fn test_overflow_and_underflow() {
        let fx = Fixture::new();
        let block = fx.block(0, 13);

        let over = fx.classify(block.body + 13, AccessMode::Write);
        assert_eq!(over.kind, BadAccessKind::HeapBufferOverflow);
        assert!(over.shadow_info.contains("0 bytes beyond 13-byte block"));
        assert!(over.alloc_stack.is_some());
        assert!(over.free_stack.is_none());

        let under = fx.classify(block.body - 1, AccessMode::Read);
        assert_eq!(under.kind, BadAccessKind::HeapBufferUnderflow);
        assert_eq!(under.block.map(|b| b.body), Some(block.body));
    }

    #[test]
    fn test_use_after_free_reports_free_stack() {
        let fx = Fixture::new();
        let block = fx.block(0, 32);
        let free = StackCapture::from_frames(vec![0xdead]);
        unsafe { fx.blocks().mark_as_quarantined(&block, &free) }.unwrap();

        let report = fx.classify(block.body + 8, AccessMode::Read);
        assert_eq!(report.kind, BadAccessKind::UseAfterFree);
        assert_eq!(report.free_stack.as_deref(), Some(&free));
        assert_eq!(report.block.and_then(|b| b.state), Some(BlockState::Quarantined));
    }

    #[test]
    fn test_nested_use_after_free_takes_parent_free() {
        let fx = Fixture::new();
        let outer = fx.block(0, 1024);
        let inner_layout = BlockLayout::compute(64, 8, 0, 0).unwrap();
        let inner = unsafe {
            fx.blocks().initialize_block(
                outer.body,
                &inner_layout,
                true,
                0,
                &StackCapture::from_frames(vec![0x200]),
            )
        };
        let free = StackCapture::from_frames(vec![0xf7ee]);
        unsafe { fx.blocks().mark_as_quarantined(&outer, &free) }.unwrap();

        let report = fx.classify(inner.body, AccessMode::Read);
        assert_eq!(report.kind, BadAccessKind::UseAfterFree);
        assert_eq!(report.block.map(|b| b.block), Some(inner.block));
        assert_eq!(report.free_stack.as_deref(), Some(&free));
    }

    #[test]
    fn test_corrupt_header() {
        let fx = Fixture::new();
        let block = fx.block(0, 40);
        unsafe { (*block.header_ptr()).magic = 0xFFFF };

        let report = fx.classify(block.body + 40, AccessMode::Read);
        assert_eq!(report.kind, BadAccessKind::CorruptBlock);
        let desc = report.block.unwrap();
        assert_eq!(desc.block, block.block);
        assert_eq!(desc.body, block.body);
        assert_eq!(desc.body_size, 40);
        assert!(report.heap_is_corrupt);
    }

    #[test]
    fn test_write_after_free_keeps_use_after_free() {
        let fx = Fixture::new();
        let block = fx.block(0, 100);
        let free = StackCapture::from_frames(vec![0xdead]);
        unsafe { fx.blocks().mark_as_quarantined(&block, &free) }.unwrap();
        unsafe { *(block.body as *mut u8) = 0x41 };

        let report = fx.classify(block.body, AccessMode::Read);
        assert_eq!(report.kind, BadAccessKind::UseAfterFree);
        assert_eq!(report.free_stack.as_deref(), Some(&free));
        assert!(report.heap_is_corrupt);
        assert_eq!(report.corrupt_ranges.len(), 1);
        assert_eq!(report.corrupt_ranges[0].address, block.block);
    }

    #[test]
    fn test_overflow_into_trailer_padding_keeps_overflow() {
        let fx = Fixture::new();
        let block = fx.block(0, 13);
        unsafe { *((block.body + 13) as *mut u8) = 0x41 };

        let report = fx.classify(block.body + 13, AccessMode::Write);
        assert_eq!(report.kind, BadAccessKind::HeapBufferOverflow);
        assert!(report.heap_is_corrupt);
        assert_eq!(report.block.map(|b| b.body), Some(block.body));
    }

    #[test]
    fn test_adjacent_blocks_split_at_the_boundary() {
        let fx = Fixture::new();
        let first = fx.block(0, 40);
        let second = fx.block(first.block_size, 40);
        assert_eq!(second.block, first.block + first.block_size);

        let trailer = fx.classify(first.block + first.block_size - 1, AccessMode::Read);
        assert_eq!(trailer.kind, BadAccessKind::HeapBufferOverflow);
        assert_eq!(trailer.block.map(|b| b.block), Some(first.block));

        let header = fx.classify(second.block, AccessMode::Read);
        assert_eq!(header.kind, BadAccessKind::HeapBufferUnderflow);
        assert_eq!(header.block.map(|b| b.block), Some(second.block));
        assert!(!header.heap_is_corrupt);
    }

    #[test]
    fn test_poison_outside_blocks_is_unknown() {
        let fx = Fixture::new();
        let addr = fx.shadow.lower_bound() + 2 * GUARD_SIZE;
        fx.shadow.poison(addr, 64, ShadowMarker::USER_REDZONE);
        let report = fx.classify(addr, AccessMode::Write);
        assert_eq!(report.kind, BadAccessKind::UnknownBadAccess);
        assert!(report.block.is_none());
    }
}
