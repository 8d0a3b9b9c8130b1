use std::{mem, ptr::NonNull};

use crate::{
    align::{align_up, ALIGNMENT},
    block::Block,
    platform,
    Pointer,
};

/// Span header size in bytes, padded to [`ALIGNMENT`]. The first block of a
/// span sits at exactly this offset from the mapping base.
pub(crate) const SPAN_HEADER_SIZE: usize = align_up(mem::size_of::<Span>(), ALIGNMENT);

/// Minimum length of a mapping request. Pages are obtained through a system
/// call, so small allocations are batched into one mapping of at least this
/// size and carved up from there.
pub(crate) const MIN_MAP_SIZE: usize = 64 * 1024;

const _: () = assert!(SPAN_HEADER_SIZE == 32);
const _: () = assert!(MIN_MAP_SIZE.is_power_of_two());

/// Header of one contiguous run of pages obtained from the OS. The header
/// occupies the first [`SPAN_HEADER_SIZE`] bytes of the mapping and the rest
/// is wall-to-wall blocks:
///
/// ```text
/// +------------------+     +------------------+     +------------------+
/// | Span             | <-> | Span             | <-> | Span             |
/// +------------------+     +------------------+     +------------------+
/// | Block (in use)   |     | Block (free)     |     | Block (free)     |
/// +------------------+     |                  |     |                  |
/// | Block (free)     |     +------------------+     +------------------+
/// |                  |     | Block (in use)   |
/// +------------------+     +------------------+
/// | Block (in use)   |
/// +------------------+
/// ```
///
/// Mappings land wherever the kernel pleases, so spans are never assumed to
/// be adjacent to each other and are chained in a doubly linked list instead.
/// Each span keeps its own free list; blocks never migrate between spans.
///
/// `size` and `used` are narrow on purpose: together with the three links
/// they keep the padded header at 32 bytes, one cache line shared with the
/// start of the first block header. The price is a 4 GiB cap on a single
/// mapping, which the span allocation path enforces.
#[repr(C)]
pub(crate) struct Span {
    /// Total mapped length in bytes, this header included. Needed again at
    /// unmap time, which wants both the address and the length.
    size: u32,
    /// Number of blocks currently handed out from this span. When it drops
    /// back to zero the span is a candidate for unmapping.
    used: u32,
    /// Previous span in the registry.
    pub prev: Pointer<Span>,
    /// Next span in the registry.
    pub next: Pointer<Span>,
    /// Head of this span's free list, most recently freed block first.
    pub free: Pointer<Block>,
}

impl Span {
    /// A header for a fresh mapping of `length` bytes, not yet linked into
    /// the registry and with no blocks.
    pub fn new(length: usize) -> Self {
        debug_assert!(length <= u32::MAX as usize);
        Self {
            size: length as u32,
            used: 0,
            prev: None,
            next: None,
            free: None,
        }
    }

    /// Total mapped length in bytes, header included.
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Number of blocks currently handed out from this span.
    pub fn used(&self) -> usize {
        self.used as usize
    }

    pub fn inc_used(&mut self) {
        self.used += 1;
    }

    pub fn dec_used(&mut self) {
        debug_assert!(self.used > 0);
        self.used -= 1;
    }

    /// The first block header of the span, right after the padded span
    /// header.
    ///
    /// # Safety
    ///
    /// `span` must point to a live span header. There is always at least one
    /// block in a span.
    #[inline]
    pub unsafe fn first_block(span: NonNull<Span>) -> NonNull<Block> {
        NonNull::new_unchecked(span.as_ptr().cast::<u8>().add(SPAN_HEADER_SIZE)).cast()
    }

    /// One past the last byte of the mapping.
    ///
    /// # Safety
    ///
    /// `span` must point to a live span header.
    #[inline]
    pub unsafe fn end_of(span: NonNull<Span>) -> NonNull<u8> {
        NonNull::new_unchecked(span.as_ptr().cast::<u8>().add(span.as_ref().size()))
    }

    /// Whether `address` could be a block header of this span, meaning it
    /// falls between the end of the span header and the end of the mapping.
    ///
    /// # Safety
    ///
    /// `span` must point to a live span header.
    pub unsafe fn contains(span: NonNull<Span>, address: usize) -> bool {
        let first = span.as_ptr() as usize + SPAN_HEADER_SIZE;
        let end = span.as_ptr() as usize + span.as_ref().size();
        (first..end).contains(&address)
    }
}

/// Length in bytes to request from the page provider for a block of `gross`
/// bytes: room for the span header too, at least [`MIN_MAP_SIZE`], and
/// rounded up to the page size since that is the granularity the kernel
/// hands out anyway.
pub(crate) unsafe fn map_length(gross: usize) -> usize {
    let needed = gross + SPAN_HEADER_SIZE;
    let least = if needed < MIN_MAP_SIZE {
        MIN_MAP_SIZE
    } else {
        needed
    };

    align_up(least, platform::page_size())
}

/// Largest payload a span of [`MIN_MAP_SIZE`] can serve with a single block.
#[cfg(test)]
pub(crate) const MAX_UNSPLIT_PAYLOAD: usize =
    MIN_MAP_SIZE - SPAN_HEADER_SIZE - crate::block::BLOCK_HEADER_SIZE;
