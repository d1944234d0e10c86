use std::ptr::NonNull;

use crate::block::{block_size, Block, MIN_BLOCK_SIZE, USED, WORD};
use crate::freelist::SegregatedList;
use crate::kernel::MemorySource;
use crate::mmap::{self, MMAP_THRESHOLD};
use crate::utils::{align, align_down};


/// The block-level heap engine.
///
/// Owns a contiguous byte range split in two by the `top` cursor:
///
/// ```text
/// +-------------------------------------------+----------------+ +------+
/// |                blocks                     |    reserve     | |fence |
/// +-------------------------------------------+----------------+ +------+
/// ^                                           ^                ^
/// start                                       top              end
/// ```
///
/// Blocks tile `[start, top)` exactly. `[top, end)` is raw reserve, and the
/// word at `end` is the fence: the last word of the span's physical memory,
/// kept unformatted so a gap-block header always has an owned slot to land
/// in when an extension turns out non-contiguous.
///
/// The engine is strictly single threaded; [`crate::SegAlloc`] provides the
/// serialized front end.
pub(crate) struct Heap<S: MemorySource> {
    source: S,
    /// Base of the first span. Zero until the first allocation.
    start: usize,
    /// Upper end of the formatted heap.
    top: usize,
    /// Upper end of the usable region; the fence word sits here.
    end: usize,
    free: SegregatedList,
}

impl<S: MemorySource> Heap<S> {
    pub const fn new(source: S) -> Self {
        Self {
            source,
            start: 0,
            top: 0,
            end: 0,
            free: SegregatedList::new(),
        }
    }

    /// Allocates a payload of `size` bytes.
    ///
    /// Returns `None` on a zero-size request or when the kernel refuses to
    /// hand out more memory; the heap state is untouched in that case.
    ///
    /// **SAFETY**: Calls must be serialized, and the engine must not move
    /// once the first allocation formatted the heap.
    pub unsafe fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        unsafe {
            if size == 0 {
                return None;
            }

            // Large payloads never touch the heap.
            if size > MMAP_THRESHOLD {
                return mmap::allocate_mapped(&mut self.source, size);
            }

            if self.start == 0 {
                self.init()?;
            }

            let need = block_size(size);

            let block = match self.free.find_first_fit(need) {
                Some(block) => block,
                None => {
                    self.extend(need).ok()?;
                    // The extender inserted a block covering `need`, so a
                    // second miss can only mean the heap is truly exhausted.
                    self.free.find_first_fit(need)?
                }
            };

            self.free.remove(block);
            let block = self.split(block, need);

            Some(block.payload())
        }
    }

    /// Releases the payload at `payload`.
    ///
    /// **SAFETY**: `payload` must come from [`Heap::allocate`] on this
    /// engine and must not have been freed already.
    pub unsafe fn free(&mut self, payload: NonNull<u8>) {
        unsafe {
            let block = Block::from_payload(payload);

            if block.is_mapped() {
                mmap::release_mapped(&mut self.source, block);
                return;
            }

            self.coalesce(block);
        }
    }

    /// Formats the initial reservation as the first heap span.
    unsafe fn init(&mut self) -> Option<()> {
        let (base, len) = self.source.initial_region()?;

        debug_assert!(len % WORD == 0 && len >= MIN_BLOCK_SIZE + WORD);

        self.start = base.as_ptr() as usize;
        self.top = self.start;
        self.end = self.start + len - WORD;

        unsafe { self.format_reserve() };

        Some(())
    }

    /// Turns the reserve `[top, end)` into one free block, advances `top`
    /// and rewrites the fence word at `end`.
    ///
    /// The block that ended where the reserve began may itself be free, so
    /// the fresh tail goes through the coalescer; merging stays total.
    unsafe fn format_reserve(&mut self) {
        unsafe {
            debug_assert!(self.end - self.top >= MIN_BLOCK_SIZE);

            let tail = Block::from_base(NonNull::new_unchecked(self.top as *mut u8));
            tail.write_header(self.end - self.top, 0);
            tail.write_footer();

            self.top = self.end;
            (self.end as *mut usize).write(USED);

            self.coalesce(tail);
        }
    }

    /// Splits `block` into a used head of `need` bytes and a free remainder,
    /// unless the remainder would be too small to stand alone.
    ///
    /// `block` must already be out of the free lists.
    unsafe fn split(&mut self, block: Block, need: usize) -> Block {
        unsafe {
            let total = block.size();
            debug_assert!(total >= need);

            if total - need >= MIN_BLOCK_SIZE {
                block.write_header(need, USED);
                block.write_footer();

                let remainder = block.next();
                remainder.write_header(total - need, 0);
                remainder.write_footer();
                self.free.insert(remainder);
            } else {
                // The whole block goes out; the slack stays internal.
                block.write_header(total, USED);
                block.write_footer();
            }

            block
        }
    }

    /// Merges `block` with its free neighbours on both sides and reinserts
    /// the surviving block under its new class.
    unsafe fn coalesce(&mut self, block: Block) {
        unsafe {
            let mut base = block;
            let mut size = block.size();

            let next = block.next();
            if next.addr() < self.top && !next.is_used() && !next.is_mapped() {
                self.free.remove(next);
                size += next.size();
            }

            if base.addr() > self.start {
                // The word below is a real footer, the gap block's footer,
                // or garbage past a span boundary. Trust it only when it is
                // plausible and its block agrees with it.
                let prev_size = base.prev_size();

                if prev_size % WORD == 0
                    && prev_size >= MIN_BLOCK_SIZE
                    && base.addr() - self.start >= prev_size
                {
                    let prev = base.prev(prev_size);

                    if !prev.is_used() && !prev.is_mapped() && prev.size() == prev_size {
                        self.free.remove(prev);
                        base = prev;
                        size += prev_size;
                    }
                }
            }

            base.write_header(size, 0);
            base.write_footer();
            self.free.insert(base);
        }
    }

    /// Grows the heap until the reserve can carry a block of `need` bytes,
    /// then formats it as one free block.
    ///
    /// The break grant usually continues the current span. When something
    /// else moved the break in between, the granted range starts higher up
    /// and the stretch between `top` and the new span is bridged with a gap
    /// block: permanently used, never merged, never freed. Its header lands
    /// on the old fence slot and its footer inside the new grant, so both
    /// boundary tags are owned memory.
    unsafe fn extend(&mut self, need: usize) -> Result<(), &'static str> {
        unsafe {
            if self.end - self.top >= need {
                self.format_reserve();
                return Ok(());
            }

            // 4 words of margin: up to two for pushing the span base past
            // the previous break, one for trimming an unaligned grant end
            // back to a word boundary, one for the fence.
            let delta = align(need + 4 * WORD, self.source.page_size());

            let previous = self
                .source
                .brk_adjust(delta)
                .ok_or("break adjustment refused")?;
            let previous = previous.as_ptr() as usize;

            if previous == self.end + WORD {
                // The grant starts right past the fence: the span grows.
                self.end += delta;
            } else {
                debug_assert!(previous > self.end + WORD);

                // The break was moved by someone else, so neither end of
                // the grant is guaranteed to sit on a word boundary. Work
                // from its aligned interior: the span starts one word past
                // the previous break, and the fence keeps the last aligned
                // word below the grant end.
                let span_base = align(previous, WORD) + WORD;
                let grant_end = align_down(previous + delta, WORD);

                let gap = Block::from_base(NonNull::new_unchecked(self.top as *mut u8));
                gap.write_header(span_base - self.top, USED);
                gap.write_footer();

                self.top = span_base;
                self.end = grant_end - WORD;
            }

            self.format_reserve();

            Ok(())
        }
    }
}

#[cfg(test)]
impl<S: MemorySource> Heap<S> {
    /// Walks the formatted heap: `(base, size, used)` per block.
    fn blocks(&self) -> Vec<(usize, usize, bool)> {
        let mut all = Vec::new();

        if self.start == 0 {
            return all;
        }

        let mut addr = self.start;

        while addr < self.top {
            let block = Block::from_base(NonNull::new(addr as *mut u8).unwrap());
            let (size, used) = unsafe { (block.size(), block.is_used()) };

            all.push((addr, size, used));
            addr += size;
        }

        all
    }

    fn free_block_count(&self) -> usize {
        self.free.members().len()
    }

    /// Asserts the structural invariants: exact tiling, sane sizes,
    /// mirrored footers, total coalescing, and agreement between the heap
    /// walk and the free-list membership.
    fn check_invariants(&self) {
        if self.start == 0 {
            return;
        }

        unsafe {
            let mut addr = self.start;
            let mut previous_free = false;
            let mut walked_free = Vec::new();

            while addr < self.top {
                let block = Block::from_base(NonNull::new(addr as *mut u8).unwrap());
                let size = block.size();

                assert!(size >= WORD && size % WORD == 0);
                // Only the gap block may undercut the minimum, and it is
                // always used.
                assert!(size >= MIN_BLOCK_SIZE || block.is_used());
                assert!(!block.is_mapped());

                let footer = *((addr + size - WORD) as *const usize);
                assert_eq!(footer, size);

                if block.is_used() {
                    previous_free = false;
                } else {
                    assert!(!previous_free, "adjacent free blocks at {addr:#x}");
                    previous_free = true;
                    walked_free.push(block);
                }

                addr += size;
            }

            assert_eq!(addr, self.top, "blocks must tile the formatted heap");

            let mut members = self.free.members();
            for block in &members {
                assert!(!block.is_used() && !block.is_mapped());
            }

            members.sort_by_key(|b| b.addr());
            walked_free.sort_by_key(|b| b.addr());
            assert_eq!(members, walked_free);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory [`MemorySource`] over one owned arena. The break moves
    /// through the arena linearly; `gap` bytes are skipped between the
    /// initial region and the first grant to simulate foreign data-segment
    /// residents below the break.
    struct StubSource {
        arena: Box<[usize]>,
        brk: usize,
        initial_len: usize,
        gap: usize,
        deny_growth: bool,
        maps: usize,
        unmaps: usize,
        mappings: Vec<Box<[usize]>>,
    }

    impl StubSource {
        fn new(arena_bytes: usize, initial_len: usize, gap: usize) -> Self {
            Self {
                arena: vec![0; arena_bytes / WORD].into_boxed_slice(),
                brk: 0,
                initial_len,
                gap,
                deny_growth: false,
                maps: 0,
                unmaps: 0,
                mappings: Vec::new(),
            }
        }

        fn base(&mut self) -> *mut u8 {
            self.arena.as_mut_ptr().cast()
        }

        fn contains(&self, addr: usize) -> bool {
            let base = self.arena.as_ptr() as usize;
            addr >= base && addr < base + self.arena.len() * WORD
        }
    }

    impl MemorySource for StubSource {
        fn initial_region(&mut self) -> Option<(NonNull<u8>, usize)> {
            self.brk = self.initial_len + self.gap;
            NonNull::new(self.base()).map(|base| (base, self.initial_len))
        }

        unsafe fn brk_adjust(&mut self, delta: usize) -> Option<NonNull<u8>> {
            if self.deny_growth || self.brk + delta > self.arena.len() * WORD {
                return None;
            }

            let previous = unsafe { self.base().add(self.brk) };
            self.brk += delta;

            NonNull::new(previous)
        }

        unsafe fn map_anon(&mut self, len: usize) -> Option<NonNull<u8>> {
            let mut buf = vec![0usize; len / WORD].into_boxed_slice();
            let base = NonNull::new(buf.as_mut_ptr().cast())?;

            self.mappings.push(buf);
            self.maps += 1;

            Some(base)
        }

        unsafe fn unmap(&mut self, addr: NonNull<u8>, _len: usize) {
            let addr = addr.as_ptr() as usize;
            self.mappings.retain(|m| m.as_ptr() as usize != addr);
            self.unmaps += 1;
        }

        fn page_size(&self) -> usize {
            4096
        }
    }

    fn heap(arena_bytes: usize, gap: usize) -> Heap<StubSource> {
        Heap::new(StubSource::new(arena_bytes, 4096, gap))
    }

    #[test]
    fn allocate_write_free_in_order() {
        let mut h = heap(64 * 1024, 0);

        unsafe {
            let mut payloads = Vec::new();

            for (i, size) in [32usize, 64, 128].into_iter().enumerate() {
                let p = h.allocate(size).unwrap();

                assert_eq!(p.as_ptr() as usize % WORD, 0);
                assert!(h.source.contains(p.as_ptr() as usize));

                p.as_ptr().write_bytes(0xA0 | i as u8, size);
                h.check_invariants();

                payloads.push((p, size));
            }

            // Patterns survive the neighbouring writes.
            for (i, &(p, size)) in payloads.iter().enumerate() {
                for off in 0..size {
                    assert_eq!(*p.as_ptr().add(off), 0xA0 | i as u8);
                }
            }

            for &(p, _) in &payloads {
                h.free(p);
                h.check_invariants();
            }

            // Everything coalesced back: at most the merged range plus the
            // pre-existing tail.
            assert!(h.free_block_count() <= 2);
        }
    }

    #[test]
    fn freed_payload_is_reused() {
        let mut h = heap(64 * 1024, 0);

        unsafe {
            let p1 = h.allocate(64).unwrap();
            h.free(p1);

            let p2 = h.allocate(64).unwrap();
            assert_eq!(p1, p2);

            h.free(p2);
            let p3 = h.allocate(64).unwrap();
            assert_eq!(p1, p3);

            h.check_invariants();
        }
    }

    #[test]
    fn coalescing_rebuilds_the_merged_range() {
        let mut h = heap(64 * 1024, 0);

        unsafe {
            let p1 = h.allocate(64).unwrap();
            let p2 = h.allocate(64).unwrap();
            let p3 = h.allocate(64).unwrap();

            // Back to back blocks of 80 bytes each.
            assert_eq!(p2.as_ptr() as usize - p1.as_ptr() as usize, 80);
            assert_eq!(p3.as_ptr() as usize - p2.as_ptr() as usize, 80);

            // Middle freed last so it merges in both directions.
            h.free(p1);
            h.check_invariants();
            h.free(p3);
            h.check_invariants();
            h.free(p2);
            h.check_invariants();

            // One block of 3 * 80 carries a payload of 240 - 16.
            let merged = h.allocate(3 * 80 - 2 * WORD).unwrap();
            assert_eq!(merged, p1);

            h.check_invariants();
        }
    }

    #[test]
    fn large_payloads_are_mapped_and_released() {
        let mut h = heap(64 * 1024, 0);

        unsafe {
            let p = h.allocate(262144).unwrap();

            assert_eq!(h.source.maps, 1);
            assert!(!h.source.contains(p.as_ptr() as usize));

            // First and last byte are writable.
            p.as_ptr().write(0x11);
            p.as_ptr().add(262144 - 1).write(0x22);
            assert_eq!(*p.as_ptr(), 0x11);
            assert_eq!(*p.as_ptr().add(262144 - 1), 0x22);

            h.free(p);
            assert_eq!(h.source.unmaps, 1);
            assert!(h.source.mappings.is_empty());

            // The heap path still works afterwards.
            let small = h.allocate(64).unwrap();
            assert!(h.source.contains(small.as_ptr() as usize));

            h.check_invariants();
        }
    }

    #[test]
    fn threshold_routes_between_heap_and_mapping() {
        let mut h = heap(320 * 1024, 0);

        unsafe {
            let below = h.allocate(MMAP_THRESHOLD).unwrap();
            assert_eq!(h.source.maps, 0);
            assert!(h.source.contains(below.as_ptr() as usize));

            let above = h.allocate(MMAP_THRESHOLD + 1).unwrap();
            assert_eq!(h.source.maps, 1);
            assert!(!h.source.contains(above.as_ptr() as usize));

            h.free(below);
            h.free(above);
            h.check_invariants();
        }
    }

    #[test]
    fn extension_keeps_invariants_through_churn() {
        let mut h = heap(64 * 1024, 0);

        unsafe {
            let mut payloads = Vec::new();

            // Far more than the initial reservation can carry.
            for _ in 0..70 {
                let p = h.allocate(96).unwrap();
                payloads.push(p);
            }

            h.check_invariants();

            for (i, &p) in payloads.iter().enumerate() {
                if i % 2 == 0 {
                    h.free(p);
                    h.check_invariants();
                }
            }

            for (i, &p) in payloads.iter().enumerate() {
                if i % 2 == 1 {
                    h.free(p);
                    h.check_invariants();
                }
            }

            // All extensions were contiguous: one span, fully coalesced.
            assert_eq!(h.free_block_count(), 1);
        }
    }

    #[test]
    fn non_contiguous_extension_is_bridged_by_a_gap_block() {
        let mut h = heap(32 * 1024, 4096);

        unsafe {
            // Consume the whole initial span in one block.
            let first = h.allocate(4064).unwrap();
            assert_eq!(h.blocks().len(), 1);

            // Forces an extension whose grant sits past a 4 KiB hole.
            let second = h.allocate(64).unwrap();
            h.check_invariants();

            let blocks = h.blocks();
            let (gap_base, gap_size, gap_used) = blocks[1];

            // The bridge starts where the first span ended and is
            // permanently used, outside every free list.
            assert_eq!(gap_base, h.start + 4096 - WORD);
            assert!(gap_used);
            assert!(gap_size >= 2 * WORD && gap_size % WORD == 0);
            assert!(!h
                .free
                .members()
                .iter()
                .any(|b| b.addr() == gap_base));

            // Freeing on both sides of the bridge never merges across it.
            h.free(first);
            h.check_invariants();
            h.free(second);
            h.check_invariants();

            let gap = Block::from_base(NonNull::new(gap_base as *mut u8).unwrap());
            assert!(gap.is_used());
            assert_eq!(gap.size(), gap_size);
            assert_eq!(h.free_block_count(), 2);
        }
    }

    #[test]
    fn unaligned_break_grant_keeps_block_sizes_aligned() {
        // A 4097-byte hole knocks the granted break off the word boundary,
        // so the whole new span has to be re-aligned by the bridge.
        let mut h = heap(32 * 1024, 4097);

        unsafe {
            let first = h.allocate(4064).unwrap();

            let second = h.allocate(64).unwrap();
            h.check_invariants();

            assert_eq!(second.as_ptr() as usize % WORD, 0);

            // Every formatted block, the bridge and the tail carved from
            // the unaligned grant included, keeps a word-multiple size.
            for &(_, size, _) in &h.blocks() {
                assert_eq!(size % WORD, 0);
            }

            let (gap_base, gap_size, gap_used) = h.blocks()[1];
            assert!(gap_used);
            assert_eq!(gap_base, h.start + 4096 - WORD);
            assert_eq!(gap_size % WORD, 0);

            // The realigned span still coalesces cleanly and never merges
            // across the bridge.
            h.free(first);
            h.check_invariants();
            h.free(second);
            h.check_invariants();

            assert_eq!(h.free_block_count(), 2);
        }
    }

    #[test]
    fn refused_break_surfaces_as_none() {
        let mut h = heap(16 * 1024, 0);

        unsafe {
            let p = h.allocate(64).unwrap();
            h.source.deny_growth = true;

            // Larger than the remaining initial span.
            assert!(h.allocate(8192).is_none());
            h.check_invariants();

            // The heap still serves what it has.
            let q = h.allocate(64).unwrap();
            assert_ne!(p, q);

            h.free(p);
            h.free(q);
            h.check_invariants();
        }
    }

    #[test]
    fn zero_size_returns_none() {
        let mut h = heap(16 * 1024, 0);

        unsafe {
            assert!(h.allocate(0).is_none());
        }

        // Zero-size requests don't even set the heap up.
        assert!(h.blocks().is_empty());
    }

    #[test]
    fn tiny_requests_get_minimum_blocks() {
        let mut h = heap(16 * 1024, 0);

        unsafe {
            let p = h.allocate(1).unwrap();

            assert_eq!(p.as_ptr() as usize % WORD, 0);
            assert_eq!(h.blocks()[0].1, MIN_BLOCK_SIZE);

            h.free(p);
            h.check_invariants();
        }
    }

    #[test]
    fn split_is_suppressed_below_the_minimum() {
        let mut h = heap(16 * 1024, 0);

        unsafe {
            // A 40-byte block fenced in by a used neighbour.
            let p = h.allocate(24).unwrap();
            let guard = h.allocate(64).unwrap();

            h.free(p);
            assert_eq!(h.blocks()[0].1, 40);

            // 40 - 32 leaves less than a minimum block: no split, the whole
            // 40 bytes go out again.
            let q = h.allocate(9).unwrap();
            assert_eq!(q, p);
            assert_eq!(h.blocks()[0].1, 40);
            assert!(h.blocks()[0].2);

            h.free(q);
            h.free(guard);
            h.check_invariants();
        }
    }

    #[test]
    fn payloads_stay_distinct_until_freed() {
        let mut h = heap(64 * 1024, 0);

        unsafe {
            let mut seen = Vec::new();

            for size in [16usize, 24, 32, 48, 64, 96, 128] {
                let p = h.allocate(size).unwrap();
                assert!(!seen.contains(&p));
                seen.push(p);
            }

            h.check_invariants();

            for p in seen {
                h.free(p);
            }

            h.check_invariants();
        }
    }
}
