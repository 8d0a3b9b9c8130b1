//! Free list maintenance. Each span chains its free blocks through the
//! `prev`/`next` fields of their headers, head first, in no particular
//! physical order; a freed block simply goes to the front. Only these two
//! functions touch the links, everything else reads them.

use std::ptr::NonNull;

use crate::block::Block;

/// Inserts a free block at the head of its owner's free list.
///
/// # Safety
///
/// `block` must point to a live block header of the span it names as owner
/// and must not already be on the list.
pub(crate) unsafe fn push(mut block: NonNull<Block>) {
    let mut span = block.as_ref().owner;

    block.as_mut().prev = None;
    block.as_mut().next = span.as_ref().free;

    if let Some(mut head) = span.as_ref().free {
        head.as_mut().prev = Some(block);
    }

    span.as_mut().free = Some(block);
}

/// Unlinks a block from its owner's free list, nulling its own links on the
/// way out.
///
/// # Safety
///
/// `block` must currently be on its owner's free list.
pub(crate) unsafe fn remove(mut block: NonNull<Block>) {
    let mut span = block.as_ref().owner;

    match block.as_ref().prev {
        Some(mut prev) => prev.as_mut().next = block.as_ref().next,
        None => span.as_mut().free = block.as_ref().next,
    }

    if let Some(mut next) = block.as_ref().next {
        next.as_mut().prev = block.as_ref().prev;
    }

    block.as_mut().prev = None;
    block.as_mut().next = None;
}
