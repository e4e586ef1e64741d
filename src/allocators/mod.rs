//! Allocation backends.
//!
//! Blocks are laid out inside chunks of the arena. Apart from the shadow
//! and block modules, this is the only place that touches raw memory
//! ownership.

pub(crate) mod arena;

pub use arena::{ArenaHeap, ArenaState, Chunk};
