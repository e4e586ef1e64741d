//! Error types for fallible heap operations.
//!
//! Bad memory accesses are not errors of this crate: they are reported as
//! [`ErrorInfo`](crate::ErrorInfo) through the diagnostics layer. The
//! types here describe operations the heap refused to perform.

use thiserror::Error;

use crate::block::BlockState;
use crate::core::registry::HeapId;

/// Failure to build a heap.
#[derive(Debug, Error, PartialEq)]
pub enum SetupError {
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The arena could not be reserved.
    #[error("could not reserve a {size}-byte arena")]
    ArenaReservation {
        /// Requested arena size.
        size: usize,
    },
}

/// Failure of a lifecycle transition.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum BlockError {
    /// The block is not in the state the transition starts from.
    #[error("block at {block:#x} is {}, expected {expected}", .found.map_or("corrupt", BlockState::as_str))]
    InvalidState {
        /// Block start.
        block: usize,
        /// Required state.
        expected: BlockState,
        /// State found in the header.
        found: Option<BlockState>,
    },
}

/// Failure of a heap operation.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum HeapError {
    /// The pointer was not returned by this heap.
    #[error("{0:#x} was not allocated by this heap")]
    InvalidPointer(usize),

    /// The block was already freed.
    #[error("attempting double-free on {0:#x}")]
    DoubleFree(usize),

    /// The block metadata failed validation.
    #[error("block metadata at {0:#x} is corrupt")]
    CorruptBlock(usize),

    /// The block belongs to a different logical heap.
    #[error("{ptr:#x} belongs to heap {owner}, not heap {requested}")]
    WrongHeap {
        /// User pointer.
        ptr: usize,
        /// Heap recorded in the block.
        owner: HeapId,
        /// Heap the caller named.
        requested: HeapId,
    },

    /// The block is nested inside another block and owned by its allocator.
    #[error("{0:#x} is a nested block not owned by this heap")]
    ForeignBlock(usize),

    /// The heap id is unknown or already destroyed.
    #[error("unknown heap {0}")]
    UnknownHeap(HeapId),

    /// The process heap cannot be destroyed.
    #[error("the process heap cannot be destroyed")]
    ProcessHeap,
}

impl From<BlockError> for HeapError {
    fn from(error: BlockError) -> Self {
        match error {
            BlockError::InvalidState { block, .. } => HeapError::DoubleFree(block),
        }
    }
}
