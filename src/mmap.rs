//! Large-block path. Payloads above [`MMAP_THRESHOLD`] never touch the heap:
//! each one gets a whole anonymous mapping of its own, released back to the
//! kernel in one piece on free.

use std::ptr::NonNull;

use crate::block::{Block, MAPPED, USED, WORD};
use crate::kernel::MemorySource;
use crate::utils::align;

/// Payload bytes above which a request bypasses the heap.
pub(crate) const MMAP_THRESHOLD: usize = 128 * 1024;

/// Maps a region big enough for `payload` bytes plus the header and formats
/// it as a mapped block.
///
/// The header records the full page-rounded mapping length with both the
/// used and mmap bits set, which is all [`release_mapped`] needs later.
/// Mapped blocks are islands: no footer, no free-list membership, no
/// neighbours to coalesce with.
pub(crate) unsafe fn allocate_mapped<S: MemorySource>(
    source: &mut S,
    payload: usize,
) -> Option<NonNull<u8>> {
    unsafe {
        let len = align(WORD + payload, source.page_size());

        let base = source.map_anon(len)?;

        let block = Block::from_base(base);
        block.write_header(len, USED | MAPPED);

        Some(block.payload())
    }
}

/// Returns a mapped block's whole mapping to the kernel.
///
/// **SAFETY**: `block` must have been produced by [`allocate_mapped`] on the
/// same source and not released yet.
pub(crate) unsafe fn release_mapped<S: MemorySource>(source: &mut S, block: Block) {
    unsafe {
        let len = block.size();
        source.unmap(block.base(), len);
    }
}
