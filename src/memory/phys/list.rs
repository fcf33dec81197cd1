//! Lock-free list of free frames.
//!
//! The list is threaded through the free frames themselves: the first
//! word of a free frame's direct-map image holds the physical address of
//! the next free frame. The head word packs a generation tag next to the
//! frame number so a pop that races with free/reuse of the same frame
//! cannot be fooled into installing a stale next pointer.

use core::mem;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::memory::addr::{PhysAddr, PhysFrame};
use crate::memory::constants::PAGE_SIZE_BYTES;
use crate::memory::phys_to_virt;

/// Physical address terminating the chain
const END_OF_LIST: u64 = 0;

const FRAME_NUMBER_BITS: u64 = 40;
const FRAME_NUMBER_MASK: u64 = (1 << FRAME_NUMBER_BITS) - 1;

// The link must fit in the smallest frame we manage.
static_assertions::const_assert!(mem::size_of::<u64>() as u64 <= 0x1000);

fn pack(frame_number: u64, generation: u64) -> u64 {
    debug_assert!(frame_number <= FRAME_NUMBER_MASK);
    (generation << FRAME_NUMBER_BITS) | frame_number
}

fn unpack(head: u64) -> (u64, u64) {
    (head & FRAME_NUMBER_MASK, head >> FRAME_NUMBER_BITS)
}

unsafe fn read_link(frame: PhysFrame) -> u64 {
    phys_to_virt(frame.start_address())
        .as_ptr::<u64>()
        .read_volatile()
}

unsafe fn write_link(frame: PhysFrame, next: u64) {
    phys_to_virt(frame.start_address())
        .as_mut_ptr::<u64>()
        .write_volatile(next)
}

/// Intrusive LIFO of free frames. `FRAME_NUMBER_MASK` frame numbers are
/// addressable, i.e. physical memory up to 2^52 bytes.
pub struct FreeFrameList {
    /// Packed `(generation, frame number)` of the top frame, or
    /// `END_OF_LIST` in the number half when empty
    head: AtomicU64,
}

impl FreeFrameList {
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(END_OF_LIST),
        }
    }

    pub fn push(&self, frame: PhysFrame) {
        // Frame zero cannot be distinguished from the list terminator;
        // the boot map never hands it out.
        debug_assert!(frame.number() != 0);

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (top_number, generation) = unpack(head);
            unsafe {
                write_link(frame, top_number * PAGE_SIZE_BYTES);
            }
            let new_head = pack(frame.number(), generation.wrapping_add(1));
            match self.head.compare_exchange_weak(
                head,
                new_head,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    pub fn pop(&self) -> Option<PhysFrame> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (top_number, generation) = unpack(head);
            if top_number == END_OF_LIST {
                return None;
            }
            let frame = PhysFrame::containing_address(PhysAddr::new(top_number * PAGE_SIZE_BYTES));
            // A stale read here is harmless: the generation tag makes the
            // exchange fail and we reload.
            let next_addr = unsafe { read_link(frame) };
            let new_head = pack(next_addr / PAGE_SIZE_BYTES, generation.wrapping_add(1));
            match self.head.compare_exchange_weak(
                head,
                new_head,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(frame),
                Err(current) => head = current,
            }
        }
    }
}
