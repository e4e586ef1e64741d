//! Block checksums.
//!
//! While a block is allocated the user owns its body, so only the
//! metadata (header, paddings, trailer) is covered. Once quarantined the
//! whole block is covered, which also catches writes through dangling
//! pointers.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::mem::size_of;
use std::ptr;

use super::{BlockHeader, BlockInfo, BlockState, HEADER_SIZE};

/// Hash a byte range of the block.
///
/// # Safety
///
/// `[addr, addr + len)` must be readable.
unsafe fn hash_range(hasher: &mut DefaultHasher, addr: usize, len: usize) {
    if len > 0 {
        hasher.write(std::slice::from_raw_parts(addr as *const u8, len));
    }
}

/// Fold a 64 bit hash into the 16 bit header field.
fn fold(hash: u64) -> u16 {
    let folded = hash ^ (hash >> 16) ^ (hash >> 32) ^ (hash >> 48);
    (folded & 0xFFFF) as u16
}

/// Compute the checksum of a block, ignoring the stored checksum.
///
/// # Safety
///
/// The whole block must be readable.
pub unsafe fn compute(info: &BlockInfo) -> u16 {
    let mut header = ptr::read(info.header_ptr());
    header.checksum = 0;

    let mut hasher = DefaultHasher::new();
    hasher.write(std::slice::from_raw_parts(
        &header as *const BlockHeader as *const u8,
        size_of::<BlockHeader>(),
    ));

    if header.state() == Some(BlockState::Allocated) {
        hash_range(&mut hasher, info.block + HEADER_SIZE, info.header_padding_size);
        hash_range(&mut hasher, info.body_end(), info.right_redzone_size());
    } else {
        hash_range(&mut hasher, info.block + HEADER_SIZE, info.block_size - HEADER_SIZE);
    }
    fold(hasher.finish())
}

/// Store a fresh checksum in the header.
///
/// # Safety
///
/// The whole block must be readable and the header writable.
pub unsafe fn set(info: &BlockInfo) {
    let checksum = compute(info);
    (*info.header_ptr()).checksum = checksum;
}

/// Whether the stored checksum matches the block contents.
///
/// # Safety
///
/// The whole block must be readable.
pub unsafe fn is_valid(info: &BlockInfo) -> bool {
    ptr::read(info.header_ptr()).checksum == compute(info)
}
