use crate::block::{Block, MIN_BLOCK_SIZE};

/// Number of size classes in the segregated index.
pub(crate) const NUM_LISTS: usize = 8;

/// Segregated index of free [`Block`]s.
///
/// Free blocks don't need their payload for anything, so the index threads a
/// doubly linked list straight through the first two payload words of every
/// member. The heads are bucketed by size class:
///
/// ```text
///  class 0        [32, 64)      ->  free -> free
///  class 1        [64, 128)     ->  free
///  ...
///  class 7        [4096, ...)   ->  free -> free -> free
/// ```
///
/// Classes double from [`MIN_BLOCK_SIZE`] upward and the last one is
/// unbounded. Every free block lives in exactly one list; insertion pushes
/// at the head and removal unlinks by pointer, both O(1).
pub(crate) struct SegregatedList {
    heads: [Option<Block>; NUM_LISTS],
}

/// Size class for a block of `size` bytes.
///
/// Monotone in `size`, so a list never holds a block smaller than its class
/// lower bound and [`SegregatedList::find_first_fit`] can start its scan at
/// the request's class.
pub(crate) fn class_of(size: usize) -> usize {
    let mut class = 0;
    let mut bound = MIN_BLOCK_SIZE;

    while class < NUM_LISTS - 1 && size >= bound * 2 {
        bound *= 2;
        class += 1;
    }

    class
}

impl SegregatedList {
    pub const fn new() -> Self {
        Self { heads: [None; NUM_LISTS] }
    }

    /// Pushes `block` at the head of the list for its size class.
    ///
    /// **SAFETY**: Caller must guarantee that `block` is a formatted free
    /// block that is not a member of any list.
    pub unsafe fn insert(&mut self, block: Block) {
        unsafe {
            debug_assert!(!block.is_used() && !block.is_mapped());

            let class = class_of(block.size());

            block.set_prev_free(None);
            block.set_next_free(self.heads[class]);

            if let Some(head) = self.heads[class] {
                head.set_prev_free(Some(block));
            }

            self.heads[class] = Some(block);
        }
    }

    /// Unlinks `block` from whichever list holds it.
    ///
    /// A block with no back link is the head of one of the lists. We find
    /// which one by scanning the heads instead of recomputing the class from
    /// the current size, so a block whose size changed since insertion is
    /// still unlinked correctly.
    ///
    /// **SAFETY**: Caller must guarantee that `block` is a member of this
    /// index.
    pub unsafe fn remove(&mut self, block: Block) {
        unsafe {
            let next = block.next_free();
            let prev = block.prev_free();

            match prev {
                Some(prev) => prev.set_next_free(next),
                None => {
                    if let Some(class) = self.heads.iter().position(|&h| h == Some(block)) {
                        self.heads[class] = next;
                    } else {
                        debug_assert!(false, "free block missing from every list head");
                    }
                }
            }

            if let Some(next) = next {
                next.set_prev_free(prev);
            }

            block.set_next_free(None);
            block.set_prev_free(None);
        }
    }

    /// First free block able to hold a block of `size` bytes.
    ///
    /// The walk starts at `class_of(size)` and continues through every
    /// higher list. Scanning upward keeps the search correct even when a
    /// block sits in a class below its current size.
    pub unsafe fn find_first_fit(&self, size: usize) -> Option<Block> {
        unsafe {
            for class in class_of(size)..NUM_LISTS {
                let mut current = self.heads[class];

                while let Some(block) = current {
                    if block.size() >= size {
                        return Some(block);
                    }

                    current = block.next_free();
                }
            }

            None
        }
    }

    #[cfg(test)]
    pub fn members(&self) -> Vec<Block> {
        let mut all = Vec::new();

        for head in self.heads {
            let mut current = head;

            while let Some(block) = current {
                all.push(block);
                current = unsafe { block.next_free() };
            }
        }

        all
    }
}
