//! The backing heap every block is carved from.
//!
//! One contiguous, page aligned reservation from the system allocator. The
//! first page is never handed out. Chunks come from a first-fit free list
//! keyed by size, or from a bump cursor when no freed chunk fits. Freed
//! chunks coalesce with their neighbours and give memory back to the
//! cursor when they end there.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ptr::NonNull;

use crate::core::registry::HeapId;
use crate::error::SetupError;
use crate::shadow::{GRANULE, GUARD_SIZE};
use crate::sync::atomics::{AtomicCounter, AtomicGauge};
use crate::sync::mutex::{Mutex, MutexGuard};
use crate::util::layout::{align_up, checked_align_up};

/// A chunk handed out by the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk size, a multiple of the granule.
    pub size: usize,
    /// Logical heap the chunk was allocated for.
    pub heap: HeapId,
}

/// Bookkeeping protected by the arena lock.
pub struct ArenaState {
    cursor: usize,
    free_by_addr: BTreeMap<usize, usize>,
    free_by_size: BTreeSet<(usize, usize)>,
    live: HashMap<usize, Chunk>,
}

impl ArenaState {
    fn insert_free(&mut self, addr: usize, size: usize) {
        if size == 0 {
            return;
        }
        self.free_by_addr.insert(addr, size);
        self.free_by_size.insert((size, addr));
    }

    fn remove_free(&mut self, addr: usize, size: usize) {
        self.free_by_addr.remove(&addr);
        self.free_by_size.remove(&(size, addr));
    }

    /// First fit by size that can also satisfy the alignment.
    fn take_free(&mut self, size: usize, align: usize) -> Option<usize> {
        let (chunk_size, chunk) = self
            .free_by_size
            .range((size, 0)..)
            .copied()
            .find(|&(chunk_size, chunk)| {
                align_up(chunk, align) + size <= chunk + chunk_size
            })?;
        self.remove_free(chunk, chunk_size);

        let addr = align_up(chunk, align);
        self.insert_free(chunk, addr - chunk);
        self.insert_free(addr + size, chunk + chunk_size - addr - size);
        Some(addr)
    }

    fn release(&mut self, addr: usize, size: usize) {
        let mut start = addr;
        let mut size = size;

        if let Some((&prev, &prev_size)) = self.free_by_addr.range(..addr).next_back() {
            if prev + prev_size == addr {
                self.remove_free(prev, prev_size);
                start = prev;
                size += prev_size;
            }
        }
        if let Some(&next_size) = self.free_by_addr.get(&(start + size)) {
            self.remove_free(start + size, next_size);
            size += next_size;
        }

        if start + size == self.cursor {
            self.cursor = start;
        } else {
            self.insert_free(start, size);
        }
    }

    /// Live chunks, in no particular order.
    pub fn chunks(&self) -> impl Iterator<Item = (usize, Chunk)> + '_ {
        self.live.iter().map(|(&addr, &chunk)| (addr, chunk))
    }

    /// The live chunk starting at `addr`.
    pub fn chunk(&self, addr: usize) -> Option<Chunk> {
        self.live.get(&addr).copied()
    }
}

/// The arena backing one [`GuardedHeap`](crate::GuardedHeap).
pub struct ArenaHeap {
    base: NonNull<u8>,
    layout: Layout,
    state: Mutex<ArenaState>,
    allocated_bytes: AtomicGauge,
    allocation_count: AtomicCounter,
}

// SAFETY: the reservation is plain memory owned by the arena; all mutable
// bookkeeping sits behind the mutex.
unsafe impl Send for ArenaHeap {}
unsafe impl Sync for ArenaHeap {}

impl ArenaHeap {
    /// Reserve `size` bytes, rounded up to whole pages.
    pub fn reserve(size: usize) -> Result<Self, SetupError> {
        let len = checked_align_up(size, GUARD_SIZE)
            .filter(|&len| len > GUARD_SIZE)
            .ok_or(SetupError::InvalidConfig("arena_size must exceed one page"))?;
        let layout = Layout::from_size_align(len, GUARD_SIZE)
            .map_err(|_| SetupError::ArenaReservation { size: len })?;

        // SAFETY: the layout has a non-zero size.
        let base = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(SetupError::ArenaReservation { size: len })?;

        let start = base.as_ptr() as usize + GUARD_SIZE;
        Ok(Self {
            base,
            layout,
            state: Mutex::new(ArenaState {
                cursor: start,
                free_by_addr: BTreeMap::new(),
                free_by_size: BTreeSet::new(),
                live: HashMap::new(),
            }),
            allocated_bytes: AtomicGauge::new(0),
            allocation_count: AtomicCounter::new(0),
        })
    }

    /// First byte of the reservation.
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Size of the reservation.
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// One past the last byte of the reservation.
    pub fn end(&self) -> usize {
        self.base() + self.len()
    }

    /// First byte that can ever be handed out.
    pub fn usable_start(&self) -> usize {
        self.base() + GUARD_SIZE
    }

    /// Allocate a chunk of at least `size` bytes aligned to `align`.
    ///
    /// The size is rounded up to a whole number of granules. Returns the
    /// chunk address and size, or `None` when the arena is exhausted.
    pub fn allocate(&self, size: usize, align: usize, heap: HeapId) -> Option<(usize, usize)> {
        debug_assert!(align.is_power_of_two());
        let align = align.max(GRANULE);
        let size = checked_align_up(size.max(GRANULE), GRANULE)?;
        let end = self.end();

        let mut state = self.state.lock();
        let addr = match state.take_free(size, align) {
            Some(addr) => addr,
            None => {
                let addr = checked_align_up(state.cursor, align)?;
                if addr.checked_add(size)? > end {
                    return None;
                }
                let gap = addr - state.cursor;
                let cursor = state.cursor;
                state.insert_free(cursor, gap);
                state.cursor = addr + size;
                addr
            }
        };
        state.live.insert(addr, Chunk { size, heap });
        drop(state);

        self.allocated_bytes.add(size);
        self.allocation_count.increment();
        Some((addr, size))
    }

    /// Return a chunk. Returns `None` if `addr` is not a live chunk.
    pub fn free(&self, addr: usize) -> Option<Chunk> {
        let mut state = self.state.lock();
        let chunk = state.live.remove(&addr)?;
        state.release(addr, chunk.size);
        drop(state);

        self.allocated_bytes.sub(chunk.size);
        Some(chunk)
    }

    /// Whether `addr` is the start of a live chunk.
    pub fn is_allocated(&self, addr: usize) -> bool {
        self.state.lock().live.contains_key(&addr)
    }

    /// Size of the live chunk at `addr`.
    pub fn size_of(&self, addr: usize) -> Option<usize> {
        self.state.lock().chunk(addr).map(|chunk| chunk.size)
    }

    /// Live chunks owned by `heap`, sorted by address.
    pub fn chunks_of(&self, heap: HeapId) -> Vec<(usize, Chunk)> {
        let mut chunks: Vec<_> = self
            .state
            .lock()
            .chunks()
            .filter(|(_, chunk)| chunk.heap == heap)
            .collect();
        chunks.sort_unstable_by_key(|&(addr, _)| addr);
        chunks
    }

    /// Hold the arena lock, freezing the set of live chunks.
    pub fn lock(&self) -> MutexGuard<'_, ArenaState> {
        self.state.lock()
    }

    /// Bytes currently handed out.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.get()
    }

    /// Chunks handed out so far.
    pub fn allocation_count(&self) -> u64 {
        self.allocation_count.get()
    }
}

impl Drop for ArenaHeap {
    fn drop(&mut self) {
        // SAFETY: allocated in `reserve` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for ArenaHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaHeap")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("len", &self.len())
            .field("allocated_bytes", &self.allocated_bytes())
            .field("allocation_count", &self.allocation_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> ArenaHeap {
        ArenaHeap::reserve(64 * 1024).unwrap()
    }

    #[test]
    fn test_guard_page_is_skipped() {
        let arena = arena();
        let (addr, size) = arena.allocate(1, 8, HeapId::PROCESS).unwrap();
        assert!(addr >= arena.usable_start());
        assert_eq!(size, GRANULE);
        assert_eq!(arena.base() % GUARD_SIZE, 0);
    }

    #[test]
    fn test_alignment_and_tracking() {
        let arena = arena();
        let (a, _) = arena.allocate(24, 8, HeapId::PROCESS).unwrap();
        let (b, _) = arena.allocate(100, 256, HeapId::PROCESS).unwrap();
        assert_eq!(b % 256, 0);
        assert!(arena.is_allocated(a));
        assert!(arena.is_allocated(b));
        assert!(!arena.is_allocated(a + 8));
        assert_eq!(arena.size_of(b), Some(104));
        assert_eq!(arena.allocated_bytes(), 24 + 104);
    }

    #[test]
    fn test_free_reuses_and_coalesces() {
        let arena = arena();
        let (a, _) = arena.allocate(64, 8, HeapId::PROCESS).unwrap();
        let (b, _) = arena.allocate(64, 8, HeapId::PROCESS).unwrap();
        let (_c, _) = arena.allocate(64, 8, HeapId::PROCESS).unwrap();
        assert!(arena.free(a).is_some());
        assert!(arena.free(b).is_some());
        assert_eq!(arena.free(b), None);

        // The two freed neighbours merged into one 128-byte hole.
        let (d, size) = arena.allocate(128, 8, HeapId::PROCESS).unwrap();
        assert_eq!(d, a);
        assert_eq!(size, 128);
    }

    #[test]
    fn test_exhaustion() {
        let arena = ArenaHeap::reserve(2 * GUARD_SIZE).unwrap();
        assert!(arena.allocate(GUARD_SIZE, 8, HeapId::PROCESS).is_some());
        assert!(arena.allocate(8, 8, HeapId::PROCESS).is_none());
        assert!(arena.allocate(usize::MAX - 4, 8, HeapId::PROCESS).is_none());
    }

    #[test]
    fn test_freeing_the_tail_rewinds_the_cursor() {
        let arena = ArenaHeap::reserve(2 * GUARD_SIZE).unwrap();
        let (a, _) = arena.allocate(GUARD_SIZE, 8, HeapId::PROCESS).unwrap();
        arena.free(a).unwrap();
        let (b, _) = arena.allocate(GUARD_SIZE, 8, HeapId::PROCESS).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_chunks_of_heap() {
        let arena = arena();
        let other = HeapId::from_raw(4);
        let (a, _) = arena.allocate(8, 8, other).unwrap();
        arena.allocate(8, 8, HeapId::PROCESS).unwrap();
        let (b, _) = arena.allocate(8, 8, other).unwrap();
        let owned: Vec<_> = arena.chunks_of(other).into_iter().map(|(addr, _)| addr).collect();
        assert_eq!(owned, vec![a, b]);
        assert_eq!(arena.lock().chunk(a).map(|c| c.heap), Some(other));
    }

    #[test]
    fn test_zero_page_reservation_is_rejected() {
        assert!(ArenaHeap::reserve(0).is_err());
        assert!(ArenaHeap::reserve(GUARD_SIZE).is_err());
    }
}
