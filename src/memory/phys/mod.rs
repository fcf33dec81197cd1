//! Physical frame allocator.
//!
//! Fixed-size frames, served from a lock-free free list threaded through
//! the frames' own direct-map images. Every frame in the system is owned
//! by exactly one of: this free list, a page table, an anonymous page, an
//! object chunk, or the bootloader reservation.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Once;

use crate::error::KernelError;
use crate::memory::addr::PhysFrame;
use crate::memory::constants::{FRAME_POISON_BYTE, PAGE_SIZE_BYTES};
use crate::memory::map::RegionTotals;
use crate::memory::phys_to_virt;

mod list;

pub use self::list::FreeFrameList;

/// A pool of standard-size physical frames.
///
/// The kernel has one global pool; standalone pools exist so the
/// exhaustion behavior can be exercised in isolation.
pub struct FramePool {
    free_list: FreeFrameList,
    /// Free frame count; release on update, acquire on read
    free_frames: AtomicU64,
    totals: Once<RegionTotals>,
}

impl FramePool {
    pub const fn new() -> Self {
        Self {
            free_list: FreeFrameList::new(),
            free_frames: AtomicU64::new(0),
            totals: Once::new(),
        }
    }

    /// Hand a frame to the pool during memory map processing.
    ///
    /// # Safety
    /// The frame must be unused, covered by the direct map, and given to
    /// the pool exactly once.
    pub unsafe fn populate_free_frame(&self, frame: PhysFrame) {
        self.free_list.push(frame);
        self.free_frames.fetch_add(1, Ordering::Release);
    }

    pub fn allocate(&self) -> Result<PhysFrame, KernelError> {
        let frame = self.free_list.pop().ok_or(KernelError::OutOfMemory)?;
        self.free_frames.fetch_sub(1, Ordering::Release);

        // Catch use of uninitialized frame contents early.
        if cfg!(debug_assertions) {
            unsafe {
                core::ptr::write_bytes(
                    phys_to_virt(frame.start_address()).as_mut_ptr::<u8>(),
                    FRAME_POISON_BYTE,
                    PAGE_SIZE_BYTES as usize,
                );
            }
        }

        Ok(frame)
    }

    /// Return a frame to the pool. Returning a frame twice is a bug the
    /// pool does not detect.
    pub fn deallocate(&self, frame: PhysFrame) {
        self.free_list.push(frame);
        self.free_frames.fetch_add(1, Ordering::Release);
    }

    pub fn free_frame_count(&self) -> u64 {
        self.free_frames.load(Ordering::Acquire)
    }

    pub fn set_totals(&self, totals: RegionTotals) {
        self.totals.call_once(|| totals);
    }

    pub fn totals(&self) -> RegionTotals {
        self.totals.get().copied().unwrap_or_default()
    }
}

/// The kernel's frame pool, populated in stage-1.
static FRAME_POOL: FramePool = FramePool::new();

pub fn allocate() -> Result<PhysFrame, KernelError> {
    FRAME_POOL.allocate()
}

/// Allocate and zero-fill a frame.
pub fn allocate_zeroed() -> Result<PhysFrame, KernelError> {
    let frame = allocate()?;
    unsafe {
        core::ptr::write_bytes(
            phys_to_virt(frame.start_address()).as_mut_ptr::<u8>(),
            0,
            PAGE_SIZE_BYTES as usize,
        );
    }
    Ok(frame)
}

pub fn deallocate(frame: PhysFrame) {
    FRAME_POOL.deallocate(frame)
}

/// # Safety
/// See [`FramePool::populate_free_frame`].
pub(super) unsafe fn populate_free_frame(frame: PhysFrame) {
    FRAME_POOL.populate_free_frame(frame)
}

pub(super) fn set_totals(totals: RegionTotals) {
    FRAME_POOL.set_totals(totals);
    log::debug!("Physical memory classified: {:?}", totals);
}

/// Observability snapshot of the global pool.
pub fn stats() -> (u64, RegionTotals) {
    (
        FRAME_POOL.free_frame_count() * PAGE_SIZE_BYTES,
        FRAME_POOL.totals(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing;

    #[test]
    fn allocate_deallocate_restores_pool_size() {
        testing::init_test_memory();

        let pool = testing::standalone_pool(8);
        let before = pool.free_frame_count();

        for _ in 0..32 {
            let frame = pool.allocate().unwrap();
            pool.deallocate(frame);
        }

        assert_eq!(pool.free_frame_count(), before);
    }

    #[test]
    fn exhaustion_and_recovery() {
        testing::init_test_memory();

        // Pool with exactly three frames
        let pool = testing::standalone_pool(3);

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        assert_eq!(pool.allocate().unwrap_err(), KernelError::OutOfMemory);

        pool.deallocate(b);
        assert!(pool.allocate().is_ok());

        pool.deallocate(a);
        pool.deallocate(c);
    }

    #[test]
    fn lifo_order() {
        testing::init_test_memory();

        let pool = testing::standalone_pool(2);
        let a = pool.allocate().unwrap();
        pool.deallocate(a);
        assert_eq!(pool.allocate().unwrap(), a);
        pool.deallocate(a);
    }

    #[test]
    fn poison_overwrites_stale_contents() {
        testing::init_test_memory();

        let pool = testing::standalone_pool(1);
        let frame = pool.allocate().unwrap();
        let image: *const u8 = phys_to_virt(frame.start_address()).as_ptr();
        // Skip the link word, it is rewritten on push
        let byte = unsafe { image.add(16).read() };
        assert_eq!(byte, FRAME_POISON_BYTE);
        pool.deallocate(frame);
    }
}
