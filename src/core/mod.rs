//! Heap internals shared by every handle.

pub mod global;
pub mod registry;
pub mod sampler;
