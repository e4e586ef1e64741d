//! Blocks: header, left redzone, body, right redzone and trailer.
//!
//! ```text
//! +--------+----------------+------------------+-----------------+---------+
//! | header | header padding |       body       | trailer padding | trailer |
//! +--------+----------------+------------------+-----------------+---------+
//! |<---- left redzone ----->|                  |<--- right redzone ------->|
//! ```
//!
//! All metadata lives inside the block itself. The header sits at the block
//! start; its padding records its own length at both ends so the header can
//! be found from a body pointer in constant time.

pub mod checksum;
pub mod info;
pub mod layout;
pub mod lifecycle;

use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::stack::StackId;

pub use info::BlockInfo;
pub use layout::BlockLayout;
pub use lifecycle::BlockLifecycle;

/// Signature stored at the start of every header.
pub const BLOCK_HEADER_MAGIC: u16 = 0xCA80;

/// Fill byte of header padding.
pub const HEADER_PADDING_BYTE: u8 = 0x1C;

/// Fill byte of trailer padding.
pub const TRAILER_PADDING_BYTE: u8 = 0xC3;

/// Size of [`BlockHeader`].
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Size of [`BlockTrailer`].
pub const TRAILER_SIZE: usize = size_of::<BlockTrailer>();

/// Largest body a block can describe.
pub const MAX_BODY_SIZE: usize = isize::MAX as usize / 2;

const FLAG_NESTED: u8 = 1 << 0;
const FLAG_HEADER_PADDING: u8 = 1 << 1;
const FLAG_EXCESS_TRAILER_PADDING: u8 = 1 << 2;

const _: () = assert!(HEADER_SIZE == 24);
const _: () = assert!(TRAILER_SIZE == 32);

/// Lifecycle state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockState {
    /// Handed out to the user.
    Allocated = 1,
    /// Freed by the user, held poisoned in the quarantine.
    Quarantined = 2,
    /// Evicted from the quarantine and returned to the heap.
    Freed = 3,
}

impl BlockState {
    /// Decode a raw header byte.
    pub const fn from_raw(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Allocated),
            2 => Some(Self::Quarantined),
            3 => Some(Self::Freed),
            _ => None,
        }
    }

    /// Name used in reports.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allocated => "allocated",
            Self::Quarantined => "quarantined",
            Self::Freed => "freed",
        }
    }
}

impl std::fmt::Display for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata at the start of every block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BlockHeader {
    /// Always [`BLOCK_HEADER_MAGIC`] for a live header.
    pub magic: u16,
    /// Checksum over the block metadata, see [`checksum`].
    pub checksum: u16,
    flags: u8,
    state: u8,
    /// log2 of the body alignment.
    pub alignment_log: u8,
    _reserved: u8,
    /// Requested user size.
    pub body_size: u64,
    /// Allocation site.
    pub alloc_stack: StackId,
    /// Free site, [`StackId::NONE`] while allocated.
    pub free_stack: StackId,
}

impl BlockHeader {
    pub(crate) fn new(layout: &BlockLayout, nested: bool) -> Self {
        let mut flags = 0;
        if nested {
            flags |= FLAG_NESTED;
        }
        if layout.header_padding_size > 0 {
            flags |= FLAG_HEADER_PADDING;
        }
        if layout.trailer_padding_size > implicit_trailer_padding(layout.body_size) {
            flags |= FLAG_EXCESS_TRAILER_PADDING;
        }
        Self {
            magic: BLOCK_HEADER_MAGIC,
            checksum: 0,
            flags,
            state: BlockState::Allocated as u8,
            alignment_log: crate::util::layout::log2(layout.body_alignment),
            _reserved: 0,
            body_size: layout.body_size as u64,
            alloc_stack: StackId::NONE,
            free_stack: StackId::NONE,
        }
    }

    /// Whether the magic is intact.
    pub fn has_valid_magic(&self) -> bool {
        self.magic == BLOCK_HEADER_MAGIC
    }

    /// Decoded state, `None` if the byte is garbage.
    pub fn state(&self) -> Option<BlockState> {
        BlockState::from_raw(self.state)
    }

    pub(crate) fn set_state(&mut self, state: BlockState) {
        self.state = state as u8;
    }

    /// Move the header at `header` from `from` to `to` with a single
    /// compare-exchange on the state byte. Returns the state found when the
    /// exchange fails.
    ///
    /// # Safety
    ///
    /// `header` must point to a readable and writable header.
    pub(crate) unsafe fn transition(
        header: *mut BlockHeader,
        from: BlockState,
        to: BlockState,
    ) -> Result<(), Option<BlockState>> {
        // SAFETY: AtomicU8 has the layout of u8. Frees are the only
        // concurrent writers of the state byte and all of them exchange.
        let state = &*(ptr::addr_of_mut!((*header).state) as *const AtomicU8);
        state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(BlockState::from_raw)
    }

    /// Whether the block lives inside another block.
    pub fn is_nested(&self) -> bool {
        self.flags & FLAG_NESTED != 0
    }

    /// Whether padding separates the header from the body.
    pub fn has_header_padding(&self) -> bool {
        self.flags & FLAG_HEADER_PADDING != 0
    }

    /// Whether the trailer padding is longer than the body alignment needs.
    pub fn has_excess_trailer_padding(&self) -> bool {
        self.flags & FLAG_EXCESS_TRAILER_PADDING != 0
    }

    /// Body alignment in bytes.
    pub fn alignment(&self) -> usize {
        1usize << self.alignment_log
    }
}

/// Metadata at the end of every block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BlockTrailer {
    /// Serial of the allocating thread.
    pub alloc_tid: u32,
    /// Serial of the freeing thread, 0 while allocated.
    pub free_tid: u32,
    /// Ticks at allocation.
    pub alloc_ticks: u64,
    /// Ticks at free, 0 while allocated.
    pub free_ticks: u64,
    /// Logical heap that owns the block.
    pub heap_id: u32,
    _reserved: u32,
}

impl BlockTrailer {
    pub(crate) fn new(alloc_tid: u32, alloc_ticks: u64, heap_id: u32) -> Self {
        Self {
            alloc_tid,
            free_tid: 0,
            alloc_ticks,
            free_ticks: 0,
            heap_id,
            _reserved: 0,
        }
    }
}

/// Trailer padding needed to bring the body end back to granule alignment.
#[inline]
pub const fn implicit_trailer_padding(body_size: usize) -> usize {
    crate::util::layout::padding_for(body_size, crate::shadow::GRANULE)
}
