//! The main heap type.

use std::sync::Arc;

use crate::api::config::HeapConfig;
use crate::api::stats::HeapStats;
use crate::block::BlockLifecycle;
use crate::core::global::HeapState;
use crate::core::registry::HeapId;
use crate::diagnostics::{AccessMode, CorruptRange, DiagnosticSink, ErrorInfo};
use crate::error::{HeapError, SetupError};
use crate::shadow::Shadow;
use crate::stack::{StackCapture, StackCaptureCache};

/// A heap that surrounds every allocation with redzones and tracks it in
/// shadow memory.
///
/// Cheap to clone (internally uses `Arc`) and thread-safe. Freed blocks
/// stay poisoned in a quarantine until the quarantine budget forces them
/// out, so a use after free hits FREED shadow rather than reused memory.
///
/// # Example
///
/// ```rust,no_run
/// use shadowheap::{AccessMode, GuardedHeap, HeapConfig};
///
/// let heap = GuardedHeap::new(HeapConfig::default()).unwrap();
/// let ptr = heap.allocate(100, 0);
/// heap.free(ptr).unwrap();
///
/// let report = heap.classify_access(ptr as usize, AccessMode::Read, 4);
/// println!("{}", report);
/// ```
#[derive(Clone)]
pub struct GuardedHeap {
    inner: Arc<HeapState>,
}

impl GuardedHeap {
    /// Create a heap with the given configuration.
    pub fn new(config: HeapConfig) -> Result<Self, SetupError> {
        Ok(Self {
            inner: Arc::new(HeapState::new(config)?),
        })
    }

    /// Create a heap with default configuration.
    pub fn with_defaults() -> Result<Self, SetupError> {
        Self::new(HeapConfig::default())
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate `size` bytes from the process heap.
    ///
    /// The body is aligned to `alignment` (0 means one granule) and
    /// surrounded by redzones. Returns null if the alignment is not a power
    /// of two or the arena is exhausted. A zero-size request still returns
    /// a unique pointer.
    pub fn allocate(&self, size: usize, alignment: usize) -> *mut u8 {
        self.inner.allocate(HeapId::PROCESS, size, alignment, None)
    }

    /// Allocate from a logical heap.
    ///
    /// `stack` replaces the captured allocation stack when given. Returns
    /// null if `heap` is unknown.
    pub fn allocate_in(
        &self,
        heap: HeapId,
        size: usize,
        alignment: usize,
        stack: Option<StackCapture>,
    ) -> *mut u8 {
        self.inner.allocate(heap, size, alignment, stack)
    }

    /// Free a pointer returned by this heap.
    ///
    /// Freeing null is a no-op. A double free is reported through the
    /// error callback and refused.
    pub fn free(&self, ptr: *mut u8) -> Result<(), HeapError> {
        self.inner.free(None, ptr, None)
    }

    /// Free a pointer that must belong to logical heap `heap`.
    ///
    /// `stack` replaces the captured free stack when given.
    pub fn free_in(
        &self,
        heap: HeapId,
        ptr: *mut u8,
        stack: Option<StackCapture>,
    ) -> Result<(), HeapError> {
        self.inner.free(Some(heap), ptr, stack)
    }

    /// Reallocate to `new_size`, preserving contents up to the smaller size.
    ///
    /// A null `ptr` allocates. The old block is freed into the quarantine,
    /// so the returned pointer always differs from `ptr`.
    pub fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        self.inner.resize(ptr, new_size, None)
    }

    /// User size of a live allocation, `None` if `ptr` is not one.
    pub fn query_size(&self, ptr: *const u8) -> Option<usize> {
        self.inner.query_size(ptr)
    }

    // =========================================================================
    // Logical heaps
    // =========================================================================

    /// Create a logical heap sharing this arena.
    pub fn create_heap(&self) -> HeapId {
        self.inner.create_heap()
    }

    /// Destroy a logical heap and release every block it owns.
    pub fn destroy_heap(&self, heap: HeapId) -> Result<(), HeapError> {
        self.inner.destroy_heap(heap)
    }

    // =========================================================================
    // Error reporting
    // =========================================================================

    /// Install a closure receiving every memory error report.
    pub fn set_heap_error_callback<F>(&self, callback: F)
    where
        F: Fn(&ErrorInfo) + Send + Sync + 'static,
    {
        let sink: Arc<dyn DiagnosticSink> = Arc::new(callback);
        self.inner.set_sink(Some(sink));
    }

    /// Install a shared sink receiving every memory error report.
    pub fn set_heap_error_sink(&self, sink: Arc<dyn DiagnosticSink>) {
        self.inner.set_sink(Some(sink));
    }

    /// Remove the installed callback or sink.
    pub fn clear_heap_error_callback(&self) {
        self.inner.set_sink(None);
    }

    /// Describe an access to `addr` without reporting it.
    pub fn classify_access(&self, addr: usize, mode: AccessMode, size: usize) -> ErrorInfo {
        self.inner.classify(addr, mode, size)
    }

    /// Classify an access and report it as a memory error.
    ///
    /// This is the entry point for access checks done outside the heap,
    /// e.g. by instrumented loads and stores.
    pub fn report_bad_access(&self, addr: usize, mode: AccessMode, size: usize) -> ErrorInfo {
        let info = self.inner.classify(addr, mode, size);
        self.inner.report(info)
    }

    /// Check an access and report it if any byte of it is poisoned.
    ///
    /// Returns the report, or `None` if the access is valid.
    pub fn check_access(&self, addr: usize, mode: AccessMode, size: usize) -> Option<ErrorInfo> {
        let shadow = self.inner.shadow();
        if !shadow.contains(addr) || shadow.is_range_accessible(addr, size.max(1)) {
            return None;
        }
        Some(self.report_bad_access(addr, mode, size))
    }

    /// Walk every block and return the corrupt runs.
    pub fn check_heap(&self) -> Vec<CorruptRange> {
        self.inner.check_heap()
    }

    /// Shadow bytes around `addr`, formatted for a report.
    pub fn shadow_memory_text(&self, addr: usize) -> String {
        self.inner.shadow().shadow_memory_text(addr)
    }

    // =========================================================================
    // Quarantine
    // =========================================================================

    /// Change the quarantine budget. Shrinking it evicts immediately.
    pub fn set_quarantine_max_size(&self, size: usize) {
        self.inner.set_quarantine_max_size(size);
    }

    /// Change the largest block the quarantine accepts.
    pub fn set_quarantine_max_block_size(&self, size: usize) {
        self.inner.set_quarantine_max_block_size(size);
    }

    /// Current quarantine budget.
    pub fn quarantine_max_size(&self) -> usize {
        self.inner.quarantine_max_size()
    }

    /// Evict quarantined blocks until the budget holds.
    pub fn trim_quarantine(&self) -> usize {
        self.inner.trim_quarantine()
    }

    // =========================================================================
    // User poisoning
    // =========================================================================

    /// Poison part of a live allocation so any access to it is reported.
    ///
    /// `ptr` must be granule aligned. Returns false if the range is not
    /// inside the arena.
    pub fn poison_user_range(&self, ptr: *const u8, size: usize) -> bool {
        self.inner.poison_user_range(ptr, size)
    }

    /// Undo [`poison_user_range`](Self::poison_user_range).
    pub fn unpoison_user_range(&self, ptr: *const u8, size: usize) -> bool {
        self.inner.unpoison_user_range(ptr, size)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Get current statistics.
    pub fn stats(&self) -> HeapStats {
        self.inner.stats()
    }

    /// Get the configuration.
    pub fn config(&self) -> &HeapConfig {
        self.inner.config()
    }

    /// The shadow memory of the arena.
    pub fn shadow(&self) -> &Shadow {
        self.inner.shadow()
    }

    /// Lifecycle operations on the blocks of this heap.
    pub fn blocks(&self) -> BlockLifecycle<'_> {
        self.inner.blocks()
    }

    /// The stack cache shared by every block.
    pub fn stack_cache(&self) -> &StackCaptureCache {
        self.inner.stack_cache()
    }
}

impl std::fmt::Debug for GuardedHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedHeap")
            .field("arena", self.inner.arena())
            .field("stats", &self.stats())
            .finish()
    }
}
