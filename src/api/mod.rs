//! Public API for shadowheap.
//!
//! Most users only need [`GuardedHeap`](heap::GuardedHeap) and
//! [`HeapConfig`](config::HeapConfig).

pub mod config;
pub mod heap;
pub mod stats;
