//! State shared by every handle of one heap.

use std::ptr;
use std::sync::Arc;

use crate::allocators::ArenaHeap;
use crate::api::config::HeapConfig;
use crate::api::stats::HeapStats;
use crate::block::{BlockInfo, BlockLayout, BlockLifecycle, BlockState, TRAILER_SIZE};
use crate::core::registry::{HeapId, HeapRegistry};
use crate::core::sampler::GuardSampler;
use crate::diagnostics::info::BlockDescription;
use crate::diagnostics::macros::{sh_debug, sh_trace, sh_warn};
use crate::diagnostics::{
    emit_report, AccessMode, BadAccessClassifier, BadAccessKind, CorruptRange, DiagnosticSink,
    ErrorInfo,
};
use crate::error::{HeapError, SetupError};
use crate::quarantine::{Quarantine, QuarantineObject, ShardedQuarantine};
use crate::sh_emit;
use crate::shadow::{Shadow, ShadowMarker, GRANULE};
use crate::stack::{StackCapture, StackCaptureCache};
use crate::sync::atomics::{AtomicCounter, AtomicGauge};
use crate::sync::mutex::Mutex;
use crate::util::layout::{align_up, is_aligned};

/// Frames of the heap itself on top of every capture.
const CAPTURE_SKIP_FRAMES: usize = 3;

/// Quarantine entry for one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuarantinedBlock {
    /// Block start.
    pub block: usize,
    /// Total block size.
    pub block_size: usize,
    hash: usize,
}

impl QuarantineObject for QuarantinedBlock {
    fn quarantine_size(&self) -> usize {
        self.block_size
    }

    fn quarantine_hash(&self) -> usize {
        self.hash
    }
}

/// Why a block is being released without going through the quarantine.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Release {
    /// Normal eviction; corruption is reported.
    Evict,
    /// Heap teardown; nothing is reported.
    Silent,
}

/// Everything one heap owns.
///
/// Owns the arena and the shadow covering it. The shadow is set up in
/// [`new`](Self::new) and torn down on drop.
pub struct HeapState {
    config: HeapConfig,
    arena: ArenaHeap,
    shadow: Shadow,
    stacks: StackCaptureCache,
    quarantine: ShardedQuarantine<QuarantinedBlock>,
    heaps: HeapRegistry,
    sampler: GuardSampler,
    sink: Mutex<Option<Arc<dyn DiagnosticSink>>>,

    live_bytes: AtomicGauge,
    peak_live_bytes: AtomicGauge,
    live_blocks: AtomicGauge,
    allocation_count: AtomicCounter,
    free_count: AtomicCounter,
    unguarded_allocations: AtomicCounter,
    quarantine_evictions: AtomicCounter,
    errors_reported: AtomicCounter,
}

impl HeapState {
    /// Reserve the arena and set up its shadow.
    pub fn new(config: HeapConfig) -> Result<Self, SetupError> {
        config.validate()?;
        let arena = ArenaHeap::reserve(config.arena_size)?;
        let shadow = Shadow::new(arena.base(), arena.len());
        shadow.set_up();
        shadow.poison(
            arena.usable_start(),
            arena.end() - arena.usable_start(),
            ShadowMarker::RESERVED,
        );

        sh_debug!(
            "heap created: arena {:#x}..{:#x}, quarantine {} bytes in {} shard(s)",
            arena.base(),
            arena.end(),
            config.quarantine_size,
            config.quarantine_shards
        );

        Ok(Self {
            quarantine: ShardedQuarantine::new(
                config.quarantine_shards,
                config.quarantine_size,
                config.quarantine_block_size,
            ),
            sampler: GuardSampler::new(config.allocation_guard_rate),
            arena,
            shadow,
            stacks: StackCaptureCache::new(),
            heaps: HeapRegistry::new(),
            sink: Mutex::new(None),
            config,
            live_bytes: AtomicGauge::new(0),
            peak_live_bytes: AtomicGauge::new(0),
            live_blocks: AtomicGauge::new(0),
            allocation_count: AtomicCounter::new(0),
            free_count: AtomicCounter::new(0),
            unguarded_allocations: AtomicCounter::new(0),
            quarantine_evictions: AtomicCounter::new(0),
            errors_reported: AtomicCounter::new(0),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The shadow of the arena.
    pub fn shadow(&self) -> &Shadow {
        &self.shadow
    }

    /// The stack cache shared by every block.
    pub fn stack_cache(&self) -> &StackCaptureCache {
        &self.stacks
    }

    /// The arena.
    pub fn arena(&self) -> &ArenaHeap {
        &self.arena
    }

    /// Lifecycle operations on this heap's blocks.
    pub fn blocks(&self) -> BlockLifecycle<'_> {
        BlockLifecycle::new(&self.shadow, &self.stacks)
    }

    fn capture(&self, stack: Option<StackCapture>) -> StackCapture {
        stack.unwrap_or_else(|| {
            StackCapture::capture(CAPTURE_SKIP_FRAMES, self.config.max_stack_frames)
        })
    }

    fn record_alloc(&self, size: usize) {
        self.allocation_count.increment();
        self.live_blocks.add(1);
        let live = self.live_bytes.add(size);
        self.peak_live_bytes.update_max(live);
    }

    fn record_free(&self, size: usize) {
        self.free_count.increment();
        self.live_blocks.sub(1);
        self.live_bytes.sub(size);
    }

    /// Whether `addr` starts a chunk handed out without redzones.
    fn is_unguarded_chunk(&self, addr: usize) -> bool {
        self.arena.is_allocated(addr) && !self.shadow.is_block_start_byte(addr)
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate `size` bytes aligned to `alignment` from logical heap `heap`.
    ///
    /// Returns null when the heap is unknown, the alignment is not a power
    /// of two, or the arena is exhausted.
    pub fn allocate(
        &self,
        heap: HeapId,
        size: usize,
        alignment: usize,
        stack: Option<StackCapture>,
    ) -> *mut u8 {
        if !self.heaps.contains(heap) {
            return ptr::null_mut();
        }
        let alignment = match alignment {
            0 => GRANULE,
            a if a.is_power_of_two() => a.max(GRANULE),
            _ => return ptr::null_mut(),
        };

        if !self.sampler.should_guard() {
            return self.allocate_unguarded(heap, size, alignment);
        }

        let min_right = TRAILER_SIZE.saturating_add(self.config.trailer_padding_size);
        let layout = match BlockLayout::plan(alignment, alignment, size, 0, min_right) {
            Some(layout) => layout,
            None => return ptr::null_mut(),
        };
        let (chunk, _) =
            match self
                .arena
                .allocate(layout.block_size, layout.block_alignment, heap)
            {
                Some(chunk) => chunk,
                None => {
                    sh_emit!(SH201, "requested {} bytes", size);
                    return ptr::null_mut();
                }
            };

        let alloc_stack = self.capture(stack);
        // SAFETY: the chunk is fresh arena memory of at least block_size
        // bytes aligned to the block alignment.
        let info = unsafe {
            self.blocks()
                .initialize_block(chunk, &layout, false, heap.raw(), &alloc_stack)
        };
        self.record_alloc(size);
        sh_trace!("allocated {} bytes at {:#x}", size, info.body);
        info.body as *mut u8
    }

    fn allocate_unguarded(&self, heap: HeapId, size: usize, alignment: usize) -> *mut u8 {
        match self.arena.allocate(size, alignment, heap) {
            Some((chunk, chunk_size)) => {
                self.shadow.unpoison(chunk, chunk_size);
                self.unguarded_allocations.increment();
                self.record_alloc(chunk_size);
                chunk as *mut u8
            }
            None => {
                sh_emit!(SH201, "requested {} bytes", size);
                ptr::null_mut()
            }
        }
    }

    // =========================================================================
    // Free
    // =========================================================================

    /// Free a pointer returned by [`allocate`](Self::allocate).
    ///
    /// With `heap` set, the block must belong to that logical heap. A block
    /// whose metadata fails validation is reported and released right away
    /// (returning [`HeapError::CorruptBlock`]); everything else enters the
    /// quarantine.
    pub fn free(
        &self,
        heap: Option<HeapId>,
        ptr: *mut u8,
        stack: Option<StackCapture>,
    ) -> Result<(), HeapError> {
        if ptr.is_null() {
            return Ok(());
        }
        let addr = ptr as usize;
        let blocks = self.blocks();

        let header = match blocks.user_pointer_to_header(addr) {
            Some(header) => header,
            None if self.is_unguarded_chunk(addr) => return self.free_unguarded(heap, addr),
            None => {
                sh_emit!(SH101, "free of {:#x}", addr);
                return Err(HeapError::InvalidPointer(addr));
            }
        };
        let info = blocks
            .block_info(header)
            .ok_or(HeapError::InvalidPointer(addr))?;
        if info.is_nested {
            return Err(HeapError::ForeignBlock(addr));
        }

        // SAFETY: parsed from window memory.
        let (header_copy, trailer) = unsafe { (info.header(), info.trailer()) };
        if let Some(requested) = heap {
            if trailer.heap_id != requested.raw() {
                sh_emit!(SH102, "{:#x} is owned by heap #{}", addr, trailer.heap_id);
                return Err(HeapError::WrongHeap {
                    ptr: addr,
                    owner: HeapId::from_raw(trailer.heap_id),
                    requested,
                });
            }
        }

        if header_copy.state() != Some(BlockState::Allocated) {
            return Err(self.report_double_free(addr, &info));
        }

        let free_stack = self.capture(stack);
        let checksum_valid = blocks.is_checksum_valid(&info);
        // SAFETY: parsed from window memory. The state is claimed atomically,
        // so a concurrent free of the same block loses here.
        if unsafe { blocks.mark_as_quarantined(&info, &free_stack) }.is_err() {
            return Err(self.report_double_free(addr, &info));
        }
        self.record_free(info.body_size);

        if !checksum_valid {
            let mut report =
                ErrorInfo::new(addr, BadAccessKind::CorruptBlock, AccessMode::Unknown, 0);
            self.describe_block(&mut report, &info);
            self.report(report);
            self.release_block(info.block, info.block_size, Release::Silent);
            return Err(HeapError::CorruptBlock(addr));
        }

        let entry = QuarantinedBlock {
            block: info.block,
            block_size: info.block_size,
            hash: (trailer.alloc_ticks as usize) ^ info.block,
        };
        if let Err(rejected) = self.quarantine.push(entry) {
            self.quarantine_evictions.increment();
            self.release_block(rejected.block, rejected.block_size, Release::Evict);
        }
        self.trim_quarantine();
        Ok(())
    }

    fn free_unguarded(&self, heap: Option<HeapId>, addr: usize) -> Result<(), HeapError> {
        let owner = self.arena.lock().chunk(addr).map(|chunk| chunk.heap);
        if let (Some(requested), Some(owner)) = (heap, owner) {
            if requested != owner {
                return Err(HeapError::WrongHeap {
                    ptr: addr,
                    owner,
                    requested,
                });
            }
        }
        let chunk = self
            .arena
            .free(addr)
            .ok_or(HeapError::InvalidPointer(addr))?;
        self.shadow.poison(addr, chunk.size, ShadowMarker::RESERVED);
        self.record_free(chunk.size);
        Ok(())
    }

    /// Retire a quarantined block and give its chunk back to the arena.
    fn release_block(&self, block: usize, block_size: usize, mode: Release) {
        let blocks = self.blocks();
        let parsed = blocks
            .block_info(block)
            // SAFETY: parsed from window memory.
            .filter(|info| unsafe { info.state() } == Some(BlockState::Quarantined));

        match parsed {
            Some(info) if blocks.is_checksum_valid(&info) || mode == Release::Silent => {
                // SAFETY: the state was checked above.
                let _ = unsafe { blocks.destroy_block(&info) };
            }
            _ => {
                if mode == Release::Evict {
                    // A write into a quarantined block, or smashed metadata.
                    let mut report = ErrorInfo::new(
                        block,
                        BadAccessKind::CorruptBlock,
                        AccessMode::Unknown,
                        0,
                    );
                    if let Some(info) = parsed {
                        self.describe_block(&mut report, &info);
                    }
                    self.report(report);
                }
                match parsed {
                    // SAFETY: the state was checked above.
                    Some(info) => {
                        let _ = unsafe { blocks.destroy_block(&info) };
                    }
                    // SAFETY: the range is a live arena chunk.
                    None => unsafe { blocks.destroy_corrupt_block(block, block_size) },
                }
            }
        }

        if let Some(chunk) = self.arena.free(block) {
            self.shadow.poison(block, chunk.size, ShadowMarker::RESERVED);
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// The allocated block whose body starts at `ptr`.
    fn live_block(&self, ptr: usize) -> Option<BlockInfo> {
        let blocks = self.blocks();
        let info = blocks.block_info(blocks.user_pointer_to_header(ptr)?)?;
        // SAFETY: parsed from window memory.
        match unsafe { info.state() } {
            Some(BlockState::Allocated) => Some(info),
            _ => None,
        }
    }

    /// User size of a live allocation.
    ///
    /// Pass-through allocations report their chunk size.
    pub fn query_size(&self, ptr: *const u8) -> Option<usize> {
        let addr = ptr as usize;
        if let Some(info) = self.live_block(addr) {
            return Some(info.body_size);
        }
        if self.is_unguarded_chunk(addr) {
            return self.arena.size_of(addr);
        }
        None
    }

    /// Move an allocation to a block of `new_size` bytes.
    ///
    /// The contents up to the smaller size are preserved and the old block
    /// is freed. A null `ptr` allocates. Returns null, leaving the old block
    /// untouched, if `ptr` is not a live allocation or memory runs out.
    pub fn resize(&self, ptr: *mut u8, new_size: usize, stack: Option<StackCapture>) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(HeapId::PROCESS, new_size, GRANULE, stack);
        }
        let addr = ptr as usize;

        let (heap, old_size, alignment) = match self.live_block(addr) {
            // SAFETY: parsed from window memory.
            Some(info) => unsafe {
                let header = info.header();
                let trailer = info.trailer();
                (HeapId::from_raw(trailer.heap_id), info.body_size, header.alignment())
            },
            None if self.is_unguarded_chunk(addr) => {
                match self.arena.lock().chunk(addr) {
                    Some(chunk) => (chunk.heap, chunk.size, GRANULE),
                    None => return ptr::null_mut(),
                }
            }
            None => {
                sh_emit!(SH101, "resize of {:#x}", addr);
                return ptr::null_mut();
            }
        };

        let stack = self.capture(stack);
        let new_ptr = self.allocate(heap, new_size, alignment, Some(stack.clone()));
        if new_ptr.is_null() {
            return new_ptr;
        }
        // SAFETY: both ranges are accessible user memory of distinct blocks.
        unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size)) };
        if let Err(err) = self.free(None, ptr, Some(stack)) {
            sh_warn!("resize of {:#x} could not free the old block: {}", addr, err);
        }
        new_ptr
    }

    // =========================================================================
    // Logical heaps
    // =========================================================================

    /// Register a new logical heap.
    pub fn create_heap(&self) -> HeapId {
        let id = self.heaps.create();
        sh_debug!("logical heap {} created", id);
        id
    }

    /// Destroy a logical heap, releasing its quarantined and live blocks.
    pub fn destroy_heap(&self, id: HeapId) -> Result<(), HeapError> {
        self.heaps.destroy(id)?;

        let mut released = 0usize;
        for entry in self.quarantine.empty() {
            if self.owner_of(entry.block) == Some(id) {
                self.release_block(entry.block, entry.block_size, Release::Silent);
                released += 1;
            } else if let Err(rejected) = self.quarantine.push(entry) {
                self.release_block(rejected.block, rejected.block_size, Release::Evict);
            }
        }

        let blocks = self.blocks();
        for (addr, chunk) in self.arena.chunks_of(id) {
            if !self.shadow.is_block_start_byte(addr) {
                self.arena.free(addr);
                self.shadow.poison(addr, chunk.size, ShadowMarker::RESERVED);
                self.record_free(chunk.size);
                released += 1;
                continue;
            }
            if let Some(info) = blocks.block_info(addr) {
                // SAFETY: parsed from window memory.
                if unsafe { info.state() } == Some(BlockState::Allocated) {
                    let stack = StackCapture::default();
                    // SAFETY: the state was checked above.
                    let _ = unsafe { blocks.mark_as_quarantined(&info, &stack) };
                    self.record_free(info.body_size);
                }
            }
            self.release_block(addr, chunk.size, Release::Silent);
            released += 1;
        }

        sh_debug!("logical heap {} destroyed, {} block(s) released", id, released);
        Ok(())
    }

    fn owner_of(&self, block: usize) -> Option<HeapId> {
        self.arena.lock().chunk(block).map(|chunk| chunk.heap)
    }

    // =========================================================================
    // Quarantine
    // =========================================================================

    /// Evict quarantined blocks until the budget holds. Returns the count.
    pub fn trim_quarantine(&self) -> usize {
        let evicted = self.quarantine.trim(|entry| {
            self.release_block(entry.block, entry.block_size, Release::Evict);
        });
        if evicted > 0 {
            self.quarantine_evictions.add(evicted as u64);
            sh_trace!("quarantine trimmed, {} block(s) evicted", evicted);
        }
        evicted
    }

    /// Change the quarantine budget and trim to it.
    pub fn set_quarantine_max_size(&self, size: usize) {
        self.quarantine.set_max_quarantine_size(size);
        self.trim_quarantine();
    }

    /// Change the largest block accepted by the quarantine.
    pub fn set_quarantine_max_block_size(&self, size: usize) {
        self.quarantine.set_max_object_size(size);
    }

    /// Current quarantine budget.
    pub fn quarantine_max_size(&self) -> usize {
        self.quarantine.max_quarantine_size()
    }

    // =========================================================================
    // Errors
    // =========================================================================

    /// Install the receiver of memory error reports.
    pub fn set_sink(&self, sink: Option<Arc<dyn DiagnosticSink>>) {
        *self.sink.lock() = sink;
    }

    /// Classify an access without reporting it.
    pub fn classify(&self, addr: usize, mode: AccessMode, size: usize) -> ErrorInfo {
        BadAccessClassifier::new(self.blocks()).classify(addr, mode, size)
    }

    /// Fill block details of a report made outside the classifier.
    fn report_double_free(&self, addr: usize, info: &BlockInfo) -> HeapError {
        let mut report = ErrorInfo::new(addr, BadAccessKind::DoubleFree, AccessMode::Unknown, 0);
        self.describe_block(&mut report, info);
        self.report(report);
        HeapError::DoubleFree(addr)
    }

    fn describe_block(&self, report: &mut ErrorInfo, info: &BlockInfo) {
        let blocks = self.blocks();
        // SAFETY: parsed from window memory.
        let (header, trailer) = unsafe { (info.header(), info.trailer()) };
        let description = BlockDescription::from_info(info, header.state(), trailer.heap_id);
        report.shadow_info = description.locate(report.location);
        report.block = Some(description);
        report.shadow_memory = self.shadow.shadow_memory_text(report.location);

        let (alloc_stack, free_stack) = blocks.stacks_of(info);
        report.alloc_stack = alloc_stack;
        report.free_stack = free_stack;
        report.alloc_tid = trailer.alloc_tid;
        report.free_tid = trailer.free_tid;
        report.time_since_free = blocks.time_since_free(info);
    }

    /// Deliver a report: heap walk, emitter, sink, then the failure policy.
    pub fn report(&self, mut info: ErrorInfo) -> ErrorInfo {
        if self.config.check_heap_on_failure {
            info.corrupt_ranges = self.check_heap();
            info.heap_is_corrupt = !info.corrupt_ranges.is_empty();
            if info.heap_is_corrupt && info.kind == BadAccessKind::UnknownBadAccess {
                info.kind = BadAccessKind::CorruptHeap;
            }
        }
        self.errors_reported.increment();

        emit_report(&info);
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink.report(&info);
        }
        self.config.failure_policy.apply(&info);
        info
    }

    /// Walk every guarded block and collect runs of corrupt ones.
    ///
    /// Blocks are visited in address order; adjacent corrupt blocks merge
    /// into one range.
    pub fn check_heap(&self) -> Vec<CorruptRange> {
        let blocks = self.blocks();
        let arena = self.arena.lock();
        let mut chunks: Vec<_> = arena.chunks().collect();
        chunks.sort_unstable_by_key(|&(addr, _)| addr);

        let mut ranges: Vec<CorruptRange> = Vec::new();
        for (addr, chunk) in chunks {
            if !self.shadow.is_block_start_byte(addr) || !blocks.is_block_corrupt(addr) {
                continue;
            }
            match ranges.last_mut() {
                Some(range) if range.end() == addr => {
                    range.length += chunk.size;
                    range.block_count += 1;
                }
                _ => ranges.push(CorruptRange {
                    address: addr,
                    length: chunk.size,
                    block_count: 1,
                }),
            }
        }
        drop(arena);

        if !ranges.is_empty() {
            sh_warn!("heap walk found {} corrupt range(s)", ranges.len());
        }
        ranges
    }

    // =========================================================================
    // User poisoning
    // =========================================================================

    /// Mark a granule aligned range of a live allocation as USER_REDZONE.
    ///
    /// The size is rounded up to whole granules. Returns false if the range
    /// is misaligned or leaves the arena.
    pub fn poison_user_range(&self, ptr: *const u8, size: usize) -> bool {
        let addr = ptr as usize;
        let size = align_up(size, GRANULE);
        if !is_aligned(addr, GRANULE)
            || addr < self.arena.usable_start()
            || !self.shadow.contains_range(addr, size)
        {
            return false;
        }
        self.shadow.poison(addr, size, ShadowMarker::USER_REDZONE);
        true
    }

    /// Make a range poisoned with [`poison_user_range`](Self::poison_user_range)
    /// accessible again.
    pub fn unpoison_user_range(&self, ptr: *const u8, size: usize) -> bool {
        let addr = ptr as usize;
        if !is_aligned(addr, GRANULE)
            || addr < self.arena.usable_start()
            || !self.shadow.contains_range(addr, align_up(size, GRANULE))
        {
            return false;
        }
        self.shadow.unpoison(addr, size);
        true
    }

    // =========================================================================
    // Stats
    // =========================================================================

    /// Get current statistics.
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live_bytes: self.live_bytes.get(),
            peak_live_bytes: self.peak_live_bytes.get(),
            live_blocks: self.live_blocks.get(),
            allocation_count: self.allocation_count.get(),
            free_count: self.free_count.get(),
            unguarded_allocations: self.unguarded_allocations.get(),
            quarantine_count: self.quarantine.count(),
            quarantine_bytes: self.quarantine.size(),
            quarantine_evictions: self.quarantine_evictions.get(),
            arena_bytes: self.arena.allocated_bytes(),
            errors_reported: self.errors_reported.get(),
            cached_stacks: self.stacks.len(),
        }
    }
}

impl Drop for HeapState {
    fn drop(&mut self) {
        for entry in self.quarantine.empty() {
            self.release_block(entry.block, entry.block_size, Release::Silent);
        }
        self.shadow.tear_down();
        sh_debug!("heap at {:#x} dropped", self.arena.base());
    }
}
