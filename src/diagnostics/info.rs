//! Structured bad access reports.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::kind::{AccessMode, BadAccessKind};
use crate::block::{BlockInfo, BlockState};
use crate::stack::StackCapture;

/// A contiguous run of corrupt blocks found by a heap walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorruptRange {
    /// Start of the first corrupt block.
    pub address: usize,
    /// Bytes from the first corrupt block to the end of the last.
    pub length: usize,
    /// Number of corrupt blocks in the run.
    pub block_count: usize,
}

impl CorruptRange {
    /// One past the last byte of the run.
    pub fn end(&self) -> usize {
        self.address + self.length
    }
}

/// The block an error was attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDescription {
    /// Block start.
    pub block: usize,
    /// Total block size.
    pub block_size: usize,
    /// User pointer.
    pub body: usize,
    /// User size.
    pub body_size: usize,
    /// State from the header, `None` if it could not be read.
    pub state: Option<BlockState>,
    /// Raw id of the owning logical heap.
    pub heap_id: u32,
    /// Whether the block is nested in another block.
    pub is_nested: bool,
}

impl BlockDescription {
    pub(crate) fn from_info(info: &BlockInfo, state: Option<BlockState>, heap_id: u32) -> Self {
        Self {
            block: info.block,
            block_size: info.block_size,
            body: info.body,
            body_size: info.body_size,
            state,
            heap_id,
            is_nested: info.is_nested,
        }
    }

    /// One past the last body byte.
    pub fn body_end(&self) -> usize {
        self.body + self.body_size
    }

    /// `"{addr} is {n} bytes {before|inside|beyond} {size}-byte block [{body},{end})"`.
    pub fn locate(&self, addr: usize) -> String {
        let (distance, relation) = if addr < self.body {
            (self.body - addr, "before")
        } else if addr < self.body_end() {
            (addr - self.body, "inside")
        } else {
            (addr - self.body_end(), "beyond")
        };
        format!(
            "{:#x} is {} bytes {} {}-byte block [{:#x},{:#x})",
            addr,
            distance,
            relation,
            self.body_size,
            self.body,
            self.body_end()
        )
    }
}

/// Everything known about one bad access.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    /// Faulting address.
    pub location: usize,
    /// Classification.
    pub kind: BadAccessKind,
    /// Access direction.
    pub access_mode: AccessMode,
    /// Access width in bytes.
    pub access_size: usize,
    /// Block the address was attributed to.
    pub block: Option<BlockDescription>,
    /// Allocation site of the block.
    pub alloc_stack: Option<Arc<StackCapture>>,
    /// Free site of the block, or of the freed block containing it.
    pub free_stack: Option<Arc<StackCapture>>,
    /// Thread serial of the allocation.
    pub alloc_tid: u32,
    /// Thread serial of the free, 0 if not freed.
    pub free_tid: u32,
    /// Time between the free and the report.
    pub time_since_free: Duration,
    /// Location of the address relative to the block body.
    pub shadow_info: String,
    /// Shadow bytes around the address.
    pub shadow_memory: String,
    /// Whether a heap walk found corruption.
    pub heap_is_corrupt: bool,
    /// Corrupt runs found by the heap walk.
    pub corrupt_ranges: Vec<CorruptRange>,
}

impl ErrorInfo {
    /// A report with nothing but the access filled in.
    pub fn new(
        location: usize,
        kind: BadAccessKind,
        access_mode: AccessMode,
        access_size: usize,
    ) -> Self {
        Self {
            location,
            kind,
            access_mode,
            access_size,
            block: None,
            alloc_stack: None,
            free_stack: None,
            alloc_tid: 0,
            free_tid: 0,
            time_since_free: Duration::ZERO,
            shadow_info: String::new(),
            shadow_memory: String::new(),
            heap_is_corrupt: false,
            corrupt_ranges: Vec::new(),
        }
    }

    /// Diagnostic code of the kind.
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// One line summary.
    pub fn summary(&self) -> String {
        format!("{} on address {:#x}", self.kind, self.location)
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[shadowheap][{}] {}", self.code(), self.summary())?;
        if self.access_mode != AccessMode::Unknown {
            writeln!(
                f,
                "{} of size {} at {:#x}",
                self.access_mode, self.access_size, self.location
            )?;
        }
        if !self.shadow_info.is_empty() {
            writeln!(f, "{}", self.shadow_info)?;
        }
        if let Some(stack) = &self.free_stack {
            writeln!(
                f,
                "freed by thread T{} {:?} ago here:",
                self.free_tid, self.time_since_free
            )?;
            write!(f, "{}", stack)?;
        }
        if let Some(stack) = &self.alloc_stack {
            writeln!(f, "previously allocated by thread T{} here:", self.alloc_tid)?;
            write!(f, "{}", stack)?;
        }
        if self.heap_is_corrupt {
            writeln!(f, "the heap is corrupt: {} range(s)", self.corrupt_ranges.len())?;
            for range in &self.corrupt_ranges {
                writeln!(
                    f,
                    "  [{:#x},{:#x}) {} block(s)",
                    range.address,
                    range.end(),
                    range.block_count
                )?;
            }
        }
        if !self.shadow_memory.is_empty() {
            write!(f, "{}", self.shadow_memory)?;
        }
        Ok(())
    }
}
