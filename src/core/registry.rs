//! Logical heaps.
//!
//! Every block records the id of the logical heap it was allocated from.
//! All logical heaps share one arena; the id only scopes ownership checks
//! and bulk release at destruction.

use std::collections::HashSet;
use std::fmt;

use crate::error::HeapError;
use crate::sync::mutex::Mutex;

/// Identifier of a logical heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(u32);

impl HeapId {
    /// The heap that exists for the whole lifetime of a [`GuardedHeap`](crate::GuardedHeap).
    pub const PROCESS: Self = Self(0);

    /// Raw id as stored in block trailers.
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for HeapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Registered {
    live: HashSet<HeapId>,
    next: u32,
}

/// Set of live logical heaps.
pub struct HeapRegistry {
    inner: Mutex<Registered>,
}

impl HeapRegistry {
    /// A registry holding only the process heap.
    pub fn new() -> Self {
        let mut live = HashSet::new();
        live.insert(HeapId::PROCESS);
        Self {
            inner: Mutex::new(Registered { live, next: 1 }),
        }
    }

    /// Register a fresh heap.
    pub fn create(&self) -> HeapId {
        let mut inner = self.inner.lock();
        loop {
            let id = HeapId(inner.next);
            inner.next = inner.next.wrapping_add(1).max(1);
            if inner.live.insert(id) {
                return id;
            }
        }
    }

    /// Unregister a heap. The process heap cannot be removed.
    pub fn destroy(&self, id: HeapId) -> Result<(), HeapError> {
        if id == HeapId::PROCESS {
            return Err(HeapError::ProcessHeap);
        }
        if self.inner.lock().live.remove(&id) {
            Ok(())
        } else {
            Err(HeapError::UnknownHeap(id))
        }
    }

    /// Whether `id` is live.
    pub fn contains(&self, id: HeapId) -> bool {
        self.inner.lock().live.contains(&id)
    }

    /// Number of live heaps, the process heap included.
    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }
}

impl Default for HeapRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_destroy() {
        let registry = HeapRegistry::new();
        assert!(registry.contains(HeapId::PROCESS));

        let a = registry.create();
        let b = registry.create();
        assert_ne!(a, b);
        assert_ne!(a, HeapId::PROCESS);
        assert_eq!(registry.len(), 3);

        registry.destroy(a).unwrap();
        assert!(!registry.contains(a));
        assert_eq!(registry.destroy(a), Err(HeapError::UnknownHeap(a)));
    }

    #[test]
    fn test_process_heap_is_permanent() {
        let registry = HeapRegistry::new();
        assert_eq!(registry.destroy(HeapId::PROCESS), Err(HeapError::ProcessHeap));
        assert!(registry.contains(HeapId::PROCESS));
    }

    #[test]
    fn test_display() {
        assert_eq!(HeapId::from_raw(3).to_string(), "#3");
    }
}
