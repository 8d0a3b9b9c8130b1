//! The allocator core. Bookkeeping happens on two levels:
//!
//! A span is a run of contiguous pages obtained from the OS in one mapping.
//! Spans are chained in a doubly linked registry, newest first, and each one
//! is carved wall-to-wall into blocks.
//!
//! A block is a logical chunk within a span, handed out to serve one
//! allocation. Free blocks of a span hang off its free list and carry a
//! boundary tag (their size, in their own last word) so the physical
//! neighbor above them can find their header in O(1) when coalescing.
//!
//! ```text
//! +------------------------+
//! | Span                   | ──┐
//! +------------------------+   │
//! | Block (in use)         |   │
//! +------------------------+   │
//! | 01010101...            |   │
//! | 10101010...            |   │
//! +------------------------+   │
//! | Block (free)           | <─┘
//! +------------------------+ ──┐
//! |                        |   │
//! | footer                 |   │
//! +------------------------+   │
//! | Block (free)           | <─┘
//! +------------------------+
//! |                        |
//! | footer                 |
//! +------------------------+
//! ```

use std::ptr::{self, NonNull};

use crate::{
    align::{gross_size, is_aligned},
    block::{Block, BLOCK_HEADER_SIZE, MAGIC_FRESH, MAGIC_SPENT, MIN_BLOCK_SIZE, WORD_SIZE},
    freelist, platform,
    span::{map_length, Span, SPAN_HEADER_SIZE},
    Pointer,
};

/// Number of idle spans kept mapped instead of being returned to the kernel.
/// Workloads that hover around empty would otherwise pay for a map/unmap
/// round trip on every allocation.
const SPAN_CACHE: usize = 1;

/// Byte smeared over freed payloads. Reads of garbage in a debugger that
/// come back as `0xAE 0xAE 0xAE...` point straight at a use after free.
const POISON_BYTE: u8 = 0xAE;

/// The single threaded allocator state: the span registry and nothing else.
/// The public entry points live at [`crate::Spanalloc`], which owns one of
/// these behind a lock; everything in here assumes it runs alone.
pub(crate) struct Heap {
    /// Head of the span registry. Null until the first mapping.
    spans: Pointer<Span>,
    /// Number of live spans.
    span_count: usize,
}

impl Heap {
    pub const fn new() -> Self {
        Self {
            spans: None,
            span_count: 0,
        }
    }

    /// Serves a request for `size` bytes. Finds the first free block that
    /// fits anywhere in the registry, or maps a new span when none does, and
    /// returns the payload address of the block taken. Null only for zero
    /// sized or absurd requests and when the kernel refuses the mapping.
    pub unsafe fn allocate(&mut self, size: usize) -> Pointer<u8> {
        if size == 0 || size > isize::MAX as usize {
            return None;
        }

        let gross = gross_size(size);

        let block = match self.find_free_block(gross) {
            Some(block) => block,
            // SAFETY: a fresh span has exactly one free block covering it.
            None => self.span_alloc(gross)?.as_ref().free.unwrap_unchecked(),
        };

        Some(Block::payload_of(block_alloc(gross, block)))
    }

    /// Releases the block behind a payload address previously handed out by
    /// [`Heap::allocate`]. Empty spans are returned to the kernel, except
    /// that the last [`SPAN_CACHE`] spans stay mapped; otherwise the block
    /// is merged with any free physical neighbor and its payload poisoned.
    pub unsafe fn deallocate(&mut self, payload: NonNull<u8>) {
        let block = Block::from_payload(payload);
        assert!(!block.as_ref().is_free(), "double free");
        assert_eq!(block.as_ref().magic, MAGIC_SPENT, "freeing a corrupt block");

        let owner = block.as_ref().owner;
        block_free(block);

        if owner.as_ref().used() == 0 && self.span_count > SPAN_CACHE {
            self.span_free(owner);
            return;
        }

        let block = coalesce(block);
        let len = block.as_ref().size() - BLOCK_HEADER_SIZE - WORD_SIZE;
        ptr::write_bytes(Block::payload_of(block).as_ptr(), POISON_BYTE, len);
    }

    /// Allocates room for `count` items of `size` bytes each and zeroes it.
    /// The whole payload is zeroed, not just the requested prefix, since
    /// rounding may have made the block bigger.
    pub unsafe fn allocate_zeroed(&mut self, count: usize, size: usize) -> Pointer<u8> {
        let bytes = count.checked_mul(size)?;
        let payload = self.allocate(bytes)?;

        let block = Block::from_payload(payload);
        ptr::write_bytes(
            payload.as_ptr(),
            0,
            block.as_ref().size() - BLOCK_HEADER_SIZE,
        );

        Some(payload)
    }

    /// Changes the size of the allocation behind `payload` to `size` bytes,
    /// in place whenever the block itself or its physical neighbor has the
    /// room, falling back to allocate-copy-free. Returns the new payload
    /// address; on failure returns null and the original allocation stays
    /// valid and untouched.
    pub unsafe fn reallocate(&mut self, payload: NonNull<u8>, size: usize) -> Pointer<u8> {
        if size > isize::MAX as usize {
            return None;
        }

        let block = Block::from_payload(payload);
        assert!(!block.as_ref().is_free(), "resizing a freed block");

        let current = block.as_ref().size();
        let gross = gross_size(size);

        if gross == current {
            return Some(payload);
        }

        if size == 0 || gross < current {
            return Some(truncate(block, gross));
        }

        self.extend(block, size, gross)
    }

    /// Whether `payload` points into a block region of some live span. The
    /// interposition layer uses this to tell our pointers from foreign ones
    /// before trusting the header math.
    pub unsafe fn owns(&self, payload: NonNull<u8>) -> bool {
        let Some(header) = (payload.as_ptr() as usize).checked_sub(BLOCK_HEADER_SIZE) else {
            return false;
        };

        let mut span = self.spans;
        while let Some(sp) = span {
            if Span::contains(sp, header) {
                return true;
            }
            span = sp.as_ref().next;
        }

        false
    }

    /// Maps a new span big enough for a block of `gross` bytes, prepends it
    /// to the registry and sets up its initial all-covering free block. Null
    /// if the kernel refuses or the mapping would blow the span size cap.
    unsafe fn span_alloc(&mut self, gross: usize) -> Pointer<Span> {
        let length = map_length(gross);
        if length > u32::MAX as usize {
            return None;
        }

        let mut new = platform::map(length)?.cast::<Span>();
        new.as_ptr().write(Span::new(length));

        if let Some(mut head) = self.spans {
            head.as_mut().prev = Some(new);
            new.as_mut().next = Some(head);
        }

        self.spans = Some(new);
        self.span_count += 1;

        let block = Span::first_block(new);
        block
            .as_ptr()
            .write(Block::new(length - SPAN_HEADER_SIZE, false, true, new));
        Block::write_footer(block);
        freelist::push(block);

        Some(new)
    }

    /// Splices a span out of the registry and gives its pages back to the
    /// kernel. The span memory is gone after this, links, blocks and all.
    unsafe fn span_free(&mut self, span: NonNull<Span>) {
        self.span_count -= 1;

        match span.as_ref().prev {
            Some(mut prev) => prev.as_mut().next = span.as_ref().next,
            None => self.spans = span.as_ref().next,
        }

        if let Some(mut next) = span.as_ref().next {
            next.as_mut().prev = span.as_ref().prev;
        }

        platform::unmap(span.cast(), span.as_ref().size());
    }

    /// First fit search: spans in registry order, and within each span its
    /// free list in list order. O(number of free blocks), which is fine for
    /// this design.
    unsafe fn find_free_block(&self, gross: usize) -> Pointer<Block> {
        let mut span = self.spans;

        while let Some(sp) = span {
            let mut block = sp.as_ref().free;

            while let Some(b) = block {
                if b.as_ref().size() >= gross {
                    return Some(b);
                }
                block = b.as_ref().next;
            }

            span = sp.as_ref().next;
        }

        None
    }

    /// Grows the allocation behind `block` to `gross` bytes. If the physical
    /// neighbor above is free and big enough the block grows in place,
    /// otherwise the contents move to a fresh allocation.
    unsafe fn extend(
        &mut self,
        mut block: NonNull<Block>,
        size: usize,
        gross: usize,
    ) -> Pointer<u8> {
        let current = block.as_ref().size();

        if let Some(mut next) = Block::next_adjacent(block) {
            if next.as_ref().is_free() && next.as_ref().size() >= gross - current {
                let total = current + next.as_ref().size();
                freelist::remove(next);

                if total - gross < MIN_BLOCK_SIZE {
                    // The leftover would be an unusable sliver, so the block
                    // swallows the neighbor whole.
                    block.as_mut().set_size(total);

                    if let Some(mut after) = Block::next_adjacent(block) {
                        after.as_mut().set_prev_in_use(true);
                    }
                } else {
                    block.as_mut().set_size(gross);

                    let tail = NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(gross))
                        .cast::<Block>();
                    tail.as_ptr()
                        .write(Block::new(total - gross, false, true, block.as_ref().owner));
                    Block::write_footer(tail);
                    freelist::push(tail);
                }

                return Some(Block::payload_of(block));
            }
        }

        // No room above; move. The old block is only released once the copy
        // has a home, so a failed allocation leaves the caller's data alone.
        let new = self.allocate(size)?;
        ptr::copy_nonoverlapping(
            Block::payload_of(block).as_ptr(),
            new.as_ptr(),
            current - BLOCK_HEADER_SIZE,
        );
        self.deallocate(Block::payload_of(block));

        Some(new)
    }

}

impl Drop for Heap {
    /// Gives every mapping back, the idle span included. Never runs for an
    /// allocator living in a `static`, which keeps its last span until the
    /// process exits, and that is fine: the kernel reclaims it anyway.
    fn drop(&mut self) {
        unsafe {
            while let Some(span) = self.spans {
                self.span_free(span);
            }
        }
    }
}

/// Takes a free block for a request of `gross` bytes. The tail of `block` is
/// split off and used when the remainder is big enough to live on as a block
/// of its own; otherwise the whole block is taken and the requester absorbs
/// the slack. Bumps the owner's used count and flags the physical neighbor
/// above.
unsafe fn block_alloc(gross: usize, mut block: NonNull<Block>) -> NonNull<Block> {
    debug_assert!(block.as_ref().is_free());
    debug_assert!(block.as_ref().size() >= gross);

    let taken = if block.as_ref().size() - gross < MIN_BLOCK_SIZE {
        // remove() nulls the free list links on the way out.
        freelist::remove(block);
        block.as_mut().set_in_use(true);
        block.as_mut().magic = MAGIC_SPENT;
        block
    } else {
        split(block, gross)
    };

    let mut owner = taken.as_ref().owner;
    owner.as_mut().inc_used();

    if let Some(mut next) = Block::next_adjacent(taken) {
        next.as_mut().set_prev_in_use(true);
    }

    taken
}

/// Returns an in-use block to its span. The block goes back on the free
/// list with a fresh footer, and the physical neighbor above learns that its
/// predecessor is free again. Deliberately does not coalesce; the public
/// free decides whether the whole span goes away first.
unsafe fn block_free(mut block: NonNull<Block>) {
    debug_assert!(!block.as_ref().is_free());

    let mut owner = block.as_ref().owner;
    owner.as_mut().dec_used();

    block.as_mut().set_in_use(false);
    block.as_mut().magic = MAGIC_FRESH;
    Block::write_footer(block);
    freelist::push(block);

    if let Some(mut next) = Block::next_adjacent(block) {
        next.as_mut().set_prev_in_use(false);
    }
}

/// Carves an in-use block of `gross` bytes out of the tail of the free block
/// `block`, which shrinks in place and stays on the free list:
///
/// ```text
/// +-------------------+            +-----------+-------+
/// |       free        |     ->     |   free    | taken |
/// +-------------------+            +-----------+-------+
///                                              ^
///                                  block + size - gross
/// ```
///
/// The caller flags the physical neighbor above the tail.
unsafe fn split(mut block: NonNull<Block>, gross: usize) -> NonNull<Block> {
    debug_assert!(block.as_ref().is_free());
    debug_assert!(block.as_ref().size() > gross);

    let remainder = block.as_ref().size() - gross;
    let tail = block.as_ptr().cast::<u8>().add(remainder);

    assert!(is_aligned(tail), "split off an unaligned block");
    debug_assert!(tail.add(gross) <= Span::end_of(block.as_ref().owner).as_ptr());

    block.as_mut().set_size(remainder);
    Block::write_footer(block);

    let tail = NonNull::new_unchecked(tail).cast::<Block>();
    tail.as_ptr()
        .write(Block::new(gross, true, false, block.as_ref().owner));

    tail
}

/// Folds `upper` into `lower`, which must be physically adjacent free blocks
/// in that order. `upper`'s header stops being a block; `lower` stays where
/// it was, both physically and in the free list.
unsafe fn coalesce_pair(mut lower: NonNull<Block>, upper: NonNull<Block>) {
    debug_assert!(lower.as_ref().is_free() && upper.as_ref().is_free());
    debug_assert_eq!(
        lower.as_ptr().cast::<u8>().add(lower.as_ref().size()),
        upper.as_ptr().cast::<u8>(),
    );

    freelist::remove(upper);

    let total = lower.as_ref().size() + upper.as_ref().size();
    lower.as_mut().set_size(total);
    Block::write_footer(lower);
}

/// Merges a newly freed block with its free physical neighbors in both
/// directions. The neighbor above is reached by walking forward; the one
/// below through its boundary tag, and only when the size word says it is
/// actually free. Returns the merged block, which is the predecessor when a
/// backward merge happened.
unsafe fn coalesce(block: NonNull<Block>) -> NonNull<Block> {
    if let Some(next) = Block::next_adjacent(block) {
        if next.as_ref().is_free() {
            coalesce_pair(block, next);
        }
    }

    if !block.as_ref().prev_in_use() {
        if let Some(prev) = Block::prev_adjacent(block) {
            coalesce_pair(prev, block);
            return prev;
        }
    }

    block
}

/// Shrinks an in-use block to `gross` bytes in place, spawning a free block
/// in the tail it vacates. Remainders too small to stand alone are left
/// attached. Returns the payload address, which never moves.
unsafe fn truncate(mut block: NonNull<Block>, gross: usize) -> NonNull<u8> {
    let current = block.as_ref().size();

    if current - gross < MIN_BLOCK_SIZE {
        return Block::payload_of(block);
    }

    block.as_mut().set_size(gross);

    let tail = NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(gross)).cast::<Block>();
    tail.as_ptr()
        .write(Block::new(current - gross, false, true, block.as_ref().owner));
    Block::write_footer(tail);
    freelist::push(tail);

    if let Some(mut next) = Block::next_adjacent(tail) {
        next.as_mut().set_prev_in_use(false);
        coalesce(tail);
    }

    Block::payload_of(block)
}
