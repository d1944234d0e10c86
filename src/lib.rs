//! SegAlloc is a custom implementation of a memory allocator.
//! It manages a heap region that grows through the program break and routes
//! oversized requests to anonymous mappings, using:
//!
//! [`sbrk`](https://man7.org/linux/man-pages/man2/sbrk.2.html) for heap growth
//! [`mmap`](https://man7.org/linux/man-pages/man2/mmap.2.html) for large payloads
//!
//! The internal structure of the allocator looks like this:
//!
//! ```text
//!
//!   class 0        class 1                 class 7
//!  +--------+     +--------+              +--------+
//!  |  head  |     |  head  |    ......    |  head  |
//!  +---|----+     +---|----+              +--------+
//!      |              |
//!      v              v
//!  +---------------------------------------------------------------+
//!  |        |      |        |      |        |                      |
//!  |  Free  | Used |  Free  | Used |  Free  |       reserve        |
//!  |        |      |        |      |        |                      |
//!  +---------------------------------------------------------------+
//!  ^                                        ^                      ^
//!  heap_start                               heap_top               heap_end
//!
//! ```
//!
//! Every block starts with a one-word header packing its size together with a
//! used bit and an mmap bit, and ends with a one-word footer mirroring the
//! size. The footer lets a freed block find its left neighbour in O(1), so
//! adjacent free blocks are always merged back together.
//!
//! The main optimizations which are implemented are:
//! - **Segregated free lists**: free blocks are indexed by size class
//! - **Block splitting**: oversized blocks are cut down to the request
//! - **Block coalescing**: adjacent free blocks merge into a bigger one
//! - **Large-block mapping**: big payloads bypass the heap entirely
//!
//! The main structure is [`SegAlloc`], you can follow the codebase from there.

mod block;
mod freelist;
mod heap;
mod kernel;
mod mmap;
mod segalloc;
mod utils;

pub use segalloc::SegAlloc;
