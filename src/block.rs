use std::{mem, ptr::NonNull};

use crate::utils::align;


/// Machine word in bytes. Every block size is a multiple of this, payloads
/// are aligned to it, and header/footer are exactly one of these.
pub(crate) const WORD: usize = mem::size_of::<usize>();

/// Header bit marking a block as allocated.
pub(crate) const USED: usize = 0b001;

/// Header bit marking a block obtained through an anonymous mapping.
pub(crate) const MAPPED: usize = 0b010;

/// Low header bits that do not belong to the size. Bit 2 is reserved.
pub(crate) const FLAG_MASK: usize = 0b111;

/// Smallest block we ever create: header, the two link words a free block
/// needs, and the footer. Anything smaller could not rejoin the free lists.
pub(crate) const MIN_BLOCK_SIZE: usize = 4 * WORD;

/// Block size required to serve a payload of `requested` bytes.
pub(crate) fn block_size(requested: usize) -> usize {
    std::cmp::max(MIN_BLOCK_SIZE, align(requested, WORD) + 2 * WORD)
}

/// Handle over one heap block, identified by its base address.
///
/// The size is a multiple of [`WORD`], so its low three bits are free and the
/// header packs the flags into them. The same payload bytes serve two
/// purposes depending on the used bit: the caller's data when allocated, the
/// free-list links when free.
///
/// ```text
/// +--------------------+        +
/// |  size | used|mmap  |        | -> Header (1 word)
/// +--------------------+        +
/// |  next free link    |  \
/// +--------------------+   |-> Payload (links only while free)
/// |  prev free link    |  /
/// +--------------------+
/// |       ....         |
/// +--------------------+        +
/// |       size         |        | -> Footer (1 word)
/// +--------------------+        +
/// ```
///
/// The footer mirrors the size only. It is what lets [`Block::prev_size`]
/// find the left neighbour without walking the heap from the start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block(NonNull<u8>);

impl Block {
    /// Wraps the block whose header lives at `base`.
    pub fn from_base(base: NonNull<u8>) -> Self {
        Self(base)
    }

    /// Recovers the block from a payload pointer previously handed out.
    ///
    /// **SAFETY**: `payload` must have been produced by [`Block::payload`]
    /// on a live block; anything else reads a bogus header.
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        unsafe { Self(NonNull::new_unchecked(payload.as_ptr().sub(WORD))) }
    }

    #[inline]
    pub fn base(self) -> NonNull<u8> {
        self.0
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    fn header(self) -> *mut usize {
        self.0.as_ptr().cast()
    }

    pub unsafe fn size(self) -> usize {
        unsafe { *self.header() & !FLAG_MASK }
    }

    pub unsafe fn is_used(self) -> bool {
        unsafe { *self.header() & USED != 0 }
    }

    pub unsafe fn is_mapped(self) -> bool {
        unsafe { *self.header() & MAPPED != 0 }
    }

    /// Writes the header word. `size` must keep the low bits clear.
    pub unsafe fn write_header(self, size: usize, flags: usize) {
        debug_assert_eq!(size & FLAG_MASK, 0);
        debug_assert_eq!(flags & !FLAG_MASK, 0);

        unsafe { *self.header() = size | flags }
    }

    /// Mirrors the current size into the trailing footer word.
    ///
    /// Every operation that changes a block's size or flips it between used
    /// and free has to call this before letting go of the block.
    pub unsafe fn write_footer(self) {
        unsafe {
            let size = self.size();
            *(self.0.as_ptr().add(size - WORD) as *mut usize) = size;
        }
    }

    /// Address handed to the caller: one word past the header.
    pub fn payload(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.0.as_ptr().add(WORD)) }
    }

    /// The block starting where this one ends. Only meaningful while the
    /// result stays below the formatted top of the heap.
    pub unsafe fn next(self) -> Block {
        unsafe { Block(NonNull::new_unchecked(self.0.as_ptr().add(self.size()))) }
    }

    /// Size recorded in the footer of the block that ends right before this
    /// one. The caller must validate it before trusting it; see the
    /// coalescer.
    pub unsafe fn prev_size(self) -> usize {
        unsafe { *(self.0.as_ptr().sub(WORD) as *const usize) }
    }

    /// The block `prev_size` bytes below this one.
    pub unsafe fn prev(self, prev_size: usize) -> Block {
        unsafe { Block(NonNull::new_unchecked(self.0.as_ptr().sub(prev_size))) }
    }

    // The link words of a free block overlay the start of the payload. They
    // hold raw addresses, 0 standing for the end of a list.

    fn link(self, slot: usize) -> *mut usize {
        unsafe { self.0.as_ptr().add(WORD * (1 + slot)).cast() }
    }

    pub unsafe fn next_free(self) -> Option<Block> {
        unsafe { NonNull::new(*self.link(0) as *mut u8).map(Block) }
    }

    pub unsafe fn set_next_free(self, next: Option<Block>) {
        unsafe { *self.link(0) = next.map_or(0, Block::addr) }
    }

    pub unsafe fn prev_free(self) -> Option<Block> {
        unsafe { NonNull::new(*self.link(1) as *mut u8).map(Block) }
    }

    pub unsafe fn set_prev_free(self, prev: Option<Block>) {
        unsafe { *self.link(1) = prev.map_or(0, Block::addr) }
    }
}
