//! Deduplicating, reference counted store of stack captures.

use std::collections::HashMap;
use std::sync::Arc;

use super::{StackCapture, StackId};
use crate::sync::atomics::AtomicCounter;
use crate::sync::mutex::Mutex;

struct CachedStack {
    capture: Arc<StackCapture>,
    refs: usize,
}

/// Shared store of captures referenced from block headers.
///
/// Every [`save`](Self::save) or [`add_ref`](Self::add_ref) takes one
/// reference that a later [`release`](Self::release) gives back. A capture
/// is dropped from the cache with its last reference.
#[derive(Default)]
pub struct StackCaptureCache {
    entries: Mutex<HashMap<StackId, CachedStack>>,
    saved: AtomicCounter,
    deduplicated: AtomicCounter,
}

impl StackCaptureCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `capture` (or find an identical one) and take a reference.
    pub fn save(&self, capture: &StackCapture) -> StackId {
        self.saved.increment();
        let mut entries = self.entries.lock();
        let mut id = capture.relative_id();
        loop {
            match entries.get_mut(&id) {
                Some(entry) if *entry.capture == *capture => {
                    entry.refs += 1;
                    self.deduplicated.increment();
                    return id;
                }
                Some(_) => id = id.next(),
                None => {
                    entries.insert(
                        id,
                        CachedStack {
                            capture: Arc::new(capture.clone()),
                            refs: 1,
                        },
                    );
                    return id;
                }
            }
        }
    }

    /// Take one more reference on `id`. Returns false for unknown ids.
    pub fn add_ref(&self, id: StackId) -> bool {
        match self.entries.lock().get_mut(&id) {
            Some(entry) => {
                entry.refs += 1;
                true
            }
            None => false,
        }
    }

    /// Give back one reference on `id`. Unknown ids and NONE are ignored.
    pub fn release(&self, id: StackId) {
        if id.is_none() {
            return;
        }
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&id) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(&id);
            }
        }
    }

    /// Look up a capture.
    pub fn get(&self, id: StackId) -> Option<Arc<StackCapture>> {
        if id.is_none() {
            return None;
        }
        self.entries
            .lock()
            .get(&id)
            .map(|entry| Arc::clone(&entry.capture))
    }

    /// Whether `id` names a live capture.
    pub fn contains(&self, id: StackId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Reference count of `id`, 0 if unknown.
    pub fn ref_count(&self, id: StackId) -> usize {
        self.entries.lock().get(&id).map_or(0, |entry| entry.refs)
    }

    /// Number of distinct captures held.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total captures saved, duplicates included.
    pub fn saved_count(&self) -> u64 {
        self.saved.get()
    }

    /// Saves that found an identical capture already cached.
    pub fn deduplicated_count(&self) -> u64 {
        self.deduplicated.get()
    }
}
