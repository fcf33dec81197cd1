//! Test support: fake physical memory for the host adapter.
//!
//! The direct map is registered with base zero, so "physical" addresses
//! are host addresses of leaked page-aligned buffers. The frame
//! allocator, CoW, and page-table code then run unmodified.

use std::alloc::{alloc, Layout};
use std::sync::Once as StdOnce;

use super::addr::{PhysAddr, PhysFrame, VirtAddr};
use super::constants::PAGE_SIZE_BYTES;
use super::phys::FramePool;

static DIRECT_MAP_INIT: StdOnce = StdOnce::new();

/// Register the identity direct map. Idempotent; every memory test calls
/// this first.
pub fn init_test_memory() {
    DIRECT_MAP_INIT.call_once(|| {
        super::init_direct_map(VirtAddr::zero());
    });
}

/// Leak a page-aligned buffer and return its frames.
pub fn leak_frames(pages: usize) -> Vec<PhysFrame> {
    let layout = Layout::from_size_align(
        pages * PAGE_SIZE_BYTES as usize,
        PAGE_SIZE_BYTES as usize,
    )
    .unwrap();
    let base = unsafe { alloc(layout) };
    assert!(!base.is_null());

    (0..pages)
        .map(|i| {
            let addr = base as u64 + (i as u64) * PAGE_SIZE_BYTES;
            PhysFrame::containing_address(PhysAddr::new(addr))
        })
        .collect()
}

/// A standalone pool backed by `pages` leaked frames.
pub fn standalone_pool(pages: usize) -> FramePool {
    let pool = FramePool::new();
    for frame in leak_frames(pages) {
        unsafe { pool.populate_free_frame(frame) };
    }
    pool
}

static GLOBAL_POOL_INIT: StdOnce = StdOnce::new();

/// Populate the kernel's global pool once per test process. Tests that
/// allocate through `phys::allocate` (CoW pages, page-table roots,
/// object chunks) share it.
pub fn init_global_pool() {
    init_test_memory();
    GLOBAL_POOL_INIT.call_once(|| {
        for frame in leak_frames(4096) {
            unsafe { super::phys::populate_free_frame(frame) };
        }
    });
}
