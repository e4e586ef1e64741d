//! # shadowheap
//!
//! A redzone heap for catching memory errors at the moment they happen.
//!
//! ## Features
//!
//! - Every allocation is wrapped in a block: header, left redzone, body,
//!   right redzone and trailer, all inside one arena chunk
//! - A shadow byte per 8-byte granule records which memory is accessible
//! - Freed blocks wait in a size-bounded quarantine while staying poisoned
//! - Bad accesses are classified (overflow, underflow, use after free,
//!   double free, wild access, corrupt block) with allocation and free
//!   stacks attached
//! - Block metadata is checksummed; a heap walk finds corrupt runs
//! - Logical heaps sharing one arena, each destroyable on its own
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shadowheap::{AccessMode, BadAccessKind, GuardedHeap, HeapConfig};
//!
//! let heap = GuardedHeap::new(HeapConfig::default()).unwrap();
//! heap.set_heap_error_callback(|info| eprintln!("{}", info));
//!
//! let ptr = heap.allocate(16, 0);
//! let report = heap.classify_access(ptr as usize + 16, AccessMode::Write, 1);
//! assert_eq!(report.kind, BadAccessKind::HeapBufferOverflow);
//!
//! heap.free(ptr).unwrap();
//! ```

pub mod api;
pub mod block;
pub mod diagnostics;
pub mod error;
pub mod quarantine;
pub mod shadow;
pub mod stack;

mod allocators;
mod core;
mod sync;
mod util;

// Re-export public API at crate root for convenience
pub use api::config::HeapConfig;
pub use api::heap::GuardedHeap;
pub use api::stats::HeapStats;
pub use crate::core::registry::HeapId;

// Blocks
pub use block::{BlockHeader, BlockInfo, BlockLayout, BlockState, BlockTrailer};

// Diagnostics
pub use diagnostics::{
    AccessMode, BadAccessKind, BlockDescription, CollectingSink, CorruptRange, Diagnostic,
    DiagnosticKind, DiagnosticSink, ErrorInfo, FailurePolicy,
};

// Errors
pub use error::{BlockError, HeapError, SetupError};

// Quarantine
pub use quarantine::{Quarantine, QuarantineObject, ShardedQuarantine, SizeLimitedQuarantine};

// Shadow memory
pub use shadow::{Shadow, ShadowMarker, ShadowWalker, GRANULE, GUARD_SIZE};

// Stacks
pub use stack::{StackCapture, StackCaptureCache, StackId};
