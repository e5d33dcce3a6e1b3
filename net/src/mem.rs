//! Arena allocator backing `PBUF_RAM` buffers.
//!
//! # Architecture
//!
//! One contiguous byte region with an **inline header** in front of every
//! block:
//!
//! ```text
//!   0        4        8   9       12
//!   +--------+--------+---+-------+---------------- ... ----+
//!   | next   | prev   |use| pad   | payload                 |
//!   +--------+--------+---+-------+---------------- ... ----+
//! ```
//!
//! `next`/`prev` are byte offsets of the neighbouring headers, so the headers
//! form a doubly linked list spanning the whole region in address order. A
//! permanently used sentinel header sits at offset `size` (`ram_end`).
//!
//! * Allocation is first fit starting at the cached lowest free block and
//!   always splits the chosen block; a block only qualifies when the
//!   remainder can hold another header.
//! * Free merges with a free successor (never the sentinel) and with a free
//!   predecessor, so no two adjacent blocks are ever both free.
//! * `shrink` splits a block in place when the tail is big enough to be a
//!   block of its own; growth goes through [`Arena::realloc_move`].
//!
//! Failures are reported as `None`; the arena never panics on bad input.

use alloc::vec;
use alloc::vec::Vec;

use netsys_lib::{align_up_usize, klog_warn};

use crate::config::MEM_ALIGNMENT;

/// Size of the inline block header, aligned.
pub const SIZEOF_STRUCT_MEM: usize = align_up_usize(9, MEM_ALIGNMENT);

/// Smallest tail worth splitting off on shrink.
pub const MIN_SIZE: usize = 12;

const NEXT: usize = 0;
const PREV: usize = 4;
const USED: usize = 8;

/// Payload handle returned by the arena: the byte offset just past a header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemPtr(u32);

impl MemPtr {
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 as usize
    }

    #[inline]
    const fn header(self) -> usize {
        self.0 as usize - SIZEOF_STRUCT_MEM
    }
}

pub struct Arena {
    ram: Vec<u8>,
    /// Offset of the `ram_end` sentinel, i.e. the usable size.
    size: usize,
    /// Lowest free block; every block before it is used.
    lfree: usize,
}

impl Arena {
    /// Create an arena of `size` usable bytes (rounded up to the alignment).
    pub fn new(size: usize) -> Self {
        let size = align_up_usize(size.max(SIZEOF_STRUCT_MEM + MIN_SIZE), MEM_ALIGNMENT);
        let mut arena = Self {
            ram: vec![0u8; size + SIZEOF_STRUCT_MEM],
            size,
            lfree: 0,
        };
        arena.set_next(0, size);
        arena.set_prev(0, 0);
        arena.set_used(0, false);
        arena.set_next(size, size);
        arena.set_prev(size, size);
        arena.set_used(size, true);
        arena
    }

    // ---------------------------------------------------------------------
    // Header accessors
    // ---------------------------------------------------------------------

    #[inline]
    fn read_u32(&self, at: usize) -> usize {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.ram[at..at + 4]);
        u32::from_ne_bytes(b) as usize
    }

    #[inline]
    fn write_u32(&mut self, at: usize, val: usize) {
        self.ram[at..at + 4].copy_from_slice(&(val as u32).to_ne_bytes());
    }

    #[inline]
    fn next(&self, mem: usize) -> usize {
        self.read_u32(mem + NEXT)
    }

    #[inline]
    fn prev(&self, mem: usize) -> usize {
        self.read_u32(mem + PREV)
    }

    #[inline]
    fn used(&self, mem: usize) -> bool {
        self.ram[mem + USED] != 0
    }

    #[inline]
    fn set_next(&mut self, mem: usize, val: usize) {
        self.write_u32(mem + NEXT, val);
    }

    #[inline]
    fn set_prev(&mut self, mem: usize, val: usize) {
        self.write_u32(mem + PREV, val);
    }

    #[inline]
    fn set_used(&mut self, mem: usize, used: bool) {
        self.ram[mem + USED] = used as u8;
    }

    /// Map a payload handle back to its header, rejecting anything that does
    /// not address a live block.
    fn header_of(&self, ptr: MemPtr) -> Option<usize> {
        let off = ptr.offset();
        if off < SIZEOF_STRUCT_MEM || off > self.size {
            return None;
        }
        Some(ptr.header())
    }

    // ---------------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------------

    /// Allocate `size` bytes. Returns `None` for zero-sized requests and when
    /// no free block is large enough.
    pub fn alloc(&mut self, size: usize) -> Option<MemPtr> {
        if size == 0 {
            return None;
        }
        let size = align_up_usize(size, MEM_ALIGNMENT);
        if size > self.size {
            return None;
        }

        let mut ptr = self.lfree;
        while ptr < self.size {
            let next = self.next(ptr);
            if !self.used(ptr) && next - (ptr + SIZEOF_STRUCT_MEM) >= size + SIZEOF_STRUCT_MEM {
                let ptr2 = ptr + SIZEOF_STRUCT_MEM + size;
                self.set_prev(ptr2, ptr);
                self.set_next(ptr2, next);
                self.set_used(ptr2, false);
                self.set_next(ptr, ptr2);
                if next != self.size {
                    self.set_prev(next, ptr2);
                }
                self.set_used(ptr, true);

                if ptr == self.lfree {
                    while self.used(self.lfree) && self.lfree != self.size {
                        self.lfree = self.next(self.lfree);
                    }
                }
                return Some(MemPtr((ptr + SIZEOF_STRUCT_MEM) as u32));
            }
            ptr = next;
        }
        None
    }

    /// Return a block to the arena. Handles that do not address a used block
    /// are ignored.
    pub fn free(&mut self, ptr: MemPtr) {
        let Some(mem) = self.header_of(ptr) else {
            klog_warn!("mem: free of out-of-range pointer off={}", ptr.offset());
            return;
        };
        if !self.used(mem) {
            klog_warn!("mem: double free off={}", ptr.offset());
            return;
        }
        self.set_used(mem, false);
        if mem < self.lfree {
            self.lfree = mem;
        }
        self.plug_holes(mem);
    }

    fn plug_holes(&mut self, mem: usize) {
        let nmem = self.next(mem);
        if mem != nmem && !self.used(nmem) && nmem != self.size {
            if self.lfree == nmem {
                self.lfree = mem;
            }
            let after = self.next(nmem);
            self.set_next(mem, after);
            self.set_prev(after, mem);
        }

        let pmem = self.prev(mem);
        if pmem != mem && !self.used(pmem) {
            if self.lfree == mem {
                self.lfree = pmem;
            }
            let after = self.next(mem);
            self.set_next(pmem, after);
            self.set_prev(after, pmem);
        }
    }

    /// Shrink a block in place to `new_size` bytes. The pointer never moves;
    /// the freed tail is split off only when it can form a block of its own.
    /// Requests that would grow the block leave it untouched.
    pub fn shrink(&mut self, ptr: MemPtr, new_size: usize) -> Option<MemPtr> {
        let new_size = align_up_usize(new_size, MEM_ALIGNMENT);
        if new_size > self.size {
            return None;
        }
        let mem = self.header_of(ptr)?;
        if !self.used(mem) {
            return None;
        }
        let cur = self.next(mem) - ptr.offset();
        if new_size + SIZEOF_STRUCT_MEM + MIN_SIZE < cur {
            let mem2 = mem + SIZEOF_STRUCT_MEM + new_size;
            let next = self.next(mem);
            self.set_used(mem2, false);
            self.set_next(mem2, next);
            self.set_prev(mem2, mem);
            self.set_next(mem, mem2);
            if next != self.size {
                self.set_prev(next, mem2);
            }
            if mem2 < self.lfree {
                self.lfree = mem2;
            }
            self.plug_holes(mem2);
        }
        Some(ptr)
    }

    /// Resize a block, moving it when it has to grow: allocate, copy, free.
    /// Shrinking is done in place.
    pub fn realloc_move(&mut self, ptr: MemPtr, new_size: usize) -> Option<MemPtr> {
        let cur = self.capacity(ptr)?;
        if new_size <= cur {
            return self.shrink(ptr, new_size);
        }
        let new_ptr = self.alloc(new_size)?;
        let (src, dst) = (ptr.offset(), new_ptr.offset());
        self.ram.copy_within(src..src + cur, dst);
        self.free(ptr);
        Some(new_ptr)
    }

    // ---------------------------------------------------------------------
    // Access
    // ---------------------------------------------------------------------

    /// Usable bytes in the block behind `ptr`.
    pub fn capacity(&self, ptr: MemPtr) -> Option<usize> {
        let mem = self.header_of(ptr)?;
        if !self.used(mem) {
            return None;
        }
        Some(self.next(mem) - ptr.offset())
    }

    /// The whole payload of a used block. Empty for invalid handles.
    pub fn bytes(&self, ptr: MemPtr) -> &[u8] {
        match self.capacity(ptr) {
            Some(cap) => &self.ram[ptr.offset()..ptr.offset() + cap],
            None => &[],
        }
    }

    pub fn bytes_mut(&mut self, ptr: MemPtr) -> &mut [u8] {
        match self.capacity(ptr) {
            Some(cap) => &mut self.ram[ptr.offset()..ptr.offset() + cap],
            None => &mut [],
        }
    }

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    /// Usable size of the arena.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Sum of the payload capacity of every free block.
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut mem = 0;
        while mem < self.size {
            let next = self.next(mem);
            if !self.used(mem) {
                total += next - mem - SIZEOF_STRUCT_MEM;
            }
            mem = next;
        }
        total
    }

    /// Payload capacity of the largest free block.
    pub fn largest_free_block(&self) -> usize {
        let mut best = 0;
        let mut mem = 0;
        while mem < self.size {
            let next = self.next(mem);
            if !self.used(mem) {
                best = best.max(next - mem - SIZEOF_STRUCT_MEM);
            }
            mem = next;
        }
        best
    }

    /// `true` when the arena is one free block spanning the whole region.
    pub fn is_pristine(&self) -> bool {
        !self.used(0) && self.next(0) == self.size && self.lfree == 0
    }

    /// Walk the block list and verify its invariants: links are consistent,
    /// addresses increase, no two neighbours are both free, and `lfree` is
    /// at or before the first free block.
    pub fn check(&self) -> bool {
        let mut mem = 0;
        let mut prev_free = false;
        let mut first_free = None;
        while mem < self.size {
            let next = self.next(mem);
            if next <= mem || next > self.size {
                return false;
            }
            if next != self.size && self.prev(next) != mem {
                return false;
            }
            let free = !self.used(mem);
            if free && prev_free {
                return false;
            }
            if free && first_free.is_none() {
                first_free = Some(mem);
            }
            prev_free = free;
            mem = next;
        }
        match first_free {
            Some(first) => self.lfree <= first,
            None => true,
        }
    }
}
