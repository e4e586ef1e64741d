//! Resolved addresses of one block.

use std::ptr;

use super::{
    implicit_trailer_padding, BlockHeader, BlockLayout, BlockState, BlockTrailer, HEADER_SIZE,
    TRAILER_SIZE,
};
use crate::shadow::{Shadow, GRANULE};
use crate::util::layout::is_aligned;

/// Addresses and sizes of every region of a block.
///
/// Addresses are plain integers so the value can travel between threads;
/// dereferencing goes through the unsafe accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Block start, which is also the header address.
    pub block: usize,
    /// Total block size.
    pub block_size: usize,
    /// Bytes between header and body.
    pub header_padding_size: usize,
    /// User pointer.
    pub body: usize,
    /// Requested user size.
    pub body_size: usize,
    /// Bytes between body and trailer.
    pub trailer_padding_size: usize,
    /// Whether the block lives in the body of another block.
    pub is_nested: bool,
}

impl BlockInfo {
    /// Addresses of a block about to be laid out at `block`.
    pub fn from_layout(block: usize, layout: &BlockLayout, nested: bool) -> Self {
        Self {
            block,
            block_size: layout.block_size,
            header_padding_size: layout.header_padding_size,
            body: block + layout.body_offset(),
            body_size: layout.body_size,
            trailer_padding_size: layout.trailer_padding_size,
            is_nested: nested,
        }
    }

    /// Header address.
    pub fn header_addr(&self) -> usize {
        self.block
    }

    /// Header padding address.
    pub fn header_padding(&self) -> usize {
        self.block + HEADER_SIZE
    }

    /// One past the last body byte, which is the trailer padding address.
    pub fn body_end(&self) -> usize {
        self.body + self.body_size
    }

    /// Trailer address.
    pub fn trailer_addr(&self) -> usize {
        self.block_end() - TRAILER_SIZE
    }

    /// One past the last byte of the block.
    pub fn block_end(&self) -> usize {
        self.block + self.block_size
    }

    /// Header plus header padding.
    pub fn left_redzone_size(&self) -> usize {
        self.body - self.block
    }

    /// Trailer padding plus trailer.
    pub fn right_redzone_size(&self) -> usize {
        self.block_end() - self.body_end()
    }

    /// Whether `addr` falls inside the block.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.block && addr < self.block_end()
    }

    /// Raw header pointer.
    pub fn header_ptr(&self) -> *mut BlockHeader {
        self.block as *mut BlockHeader
    }

    /// Raw trailer pointer.
    pub fn trailer_ptr(&self) -> *mut BlockTrailer {
        self.trailer_addr() as *mut BlockTrailer
    }

    /// Copy of the header.
    ///
    /// # Safety
    ///
    /// The block memory must be readable.
    pub unsafe fn header(&self) -> BlockHeader {
        ptr::read(self.header_ptr())
    }

    /// Copy of the trailer.
    ///
    /// # Safety
    ///
    /// The block memory must be readable.
    pub unsafe fn trailer(&self) -> BlockTrailer {
        ptr::read(self.trailer_ptr())
    }

    /// State recorded in the header.
    ///
    /// # Safety
    ///
    /// The block memory must be readable.
    pub unsafe fn state(&self) -> Option<BlockState> {
        self.header().state()
    }

    /// Parse the block whose header is at `header`.
    ///
    /// Every read is bounds checked against the shadow window first, and
    /// the padding length duplicates must agree.
    ///
    /// # Safety
    ///
    /// The shadow window must be readable memory.
    pub unsafe fn parse(shadow: &Shadow, header: usize) -> Option<Self> {
        if !is_aligned(header, GRANULE) || !shadow.contains_range(header, HEADER_SIZE) {
            return None;
        }
        let parsed = ptr::read(header as *const BlockHeader);
        if !parsed.has_valid_magic() || parsed.state().is_none() {
            return None;
        }

        let header_padding_size = if parsed.has_header_padding() {
            let padding = header + HEADER_SIZE;
            if !shadow.contains_range(padding, 4) {
                return None;
            }
            let size = ptr::read_unaligned(padding as *const u32) as usize;
            if size < 2 * 4 || !is_aligned(size, GRANULE) || !shadow.contains_range(padding, size)
            {
                return None;
            }
            let tail = ptr::read_unaligned((padding + size - 4) as *const u32) as usize;
            if tail != size {
                return None;
            }
            size
        } else {
            0
        };

        let body = header + HEADER_SIZE + header_padding_size;
        let body_size = usize::try_from(parsed.body_size).ok()?;
        let body_end = body.checked_add(body_size)?;
        if !shadow.contains_range(body, body_size) {
            return None;
        }

        let implicit = implicit_trailer_padding(body_size);
        let trailer_padding_size = if parsed.has_excess_trailer_padding() {
            if !shadow.contains_range(body_end, 4) {
                return None;
            }
            let size = ptr::read_unaligned(body_end as *const u32) as usize;
            if size <= implicit || (size - implicit) % GRANULE != 0 {
                return None;
            }
            size
        } else {
            implicit
        };

        let trailer = body_end.checked_add(trailer_padding_size)?;
        if !is_aligned(trailer, GRANULE) || !shadow.contains_range(trailer, TRAILER_SIZE) {
            return None;
        }

        Some(Self {
            block: header,
            block_size: trailer + TRAILER_SIZE - header,
            header_padding_size,
            body,
            body_size,
            trailer_padding_size,
            is_nested: parsed.is_nested(),
        })
    }
}
