//! Bootloader memory map processing.

use crate::boot_info::{MemoryRegion, RegionKind};

use super::constants::PAGE_SIZE_BYTES;
use super::phys;
use super::PhysFrame;

/// Classified byte totals of the whole map, gathered once at boot.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegionTotals {
    pub total: u64,
    pub free: u64,
    pub in_use: u64,
    pub reserved: u64,
    pub reclaimable: u64,
    pub unusable: u64,
}

/// Walk the bootloader memory map once, classify every region, and push
/// every page of every free region into the frame allocator.
///
/// Reclaimable regions are counted but kept out of the pool; the policy
/// for reclaiming them later is still open.
pub(super) fn process_memory_map(regions: &[MemoryRegion]) {
    let mut totals = RegionTotals::default();

    for region in regions {
        log::trace!(
            "region {:>16x}-{:>16x} {:?}",
            region.start.as_u64(),
            region.end().as_u64(),
            region.kind
        );

        totals.total += region.size_bytes;
        match region.kind {
            RegionKind::Free => totals.free += region.size_bytes,
            RegionKind::InUse => totals.in_use += region.size_bytes,
            RegionKind::Reserved => totals.reserved += region.size_bytes,
            RegionKind::BootloaderReclaimable | RegionKind::AcpiReclaimable => {
                totals.reclaimable += region.size_bytes
            }
            RegionKind::Unusable => totals.unusable += region.size_bytes,
        }

        if region.kind != RegionKind::Free {
            continue;
        }

        // Accept only full frames
        let start = region.start.align_up(PAGE_SIZE_BYTES);
        let end = region.end().align_down(PAGE_SIZE_BYTES);
        if start >= end {
            continue;
        }

        let mut frame_addr = start;
        while frame_addr < end {
            unsafe {
                phys::populate_free_frame(PhysFrame::containing_address(frame_addr));
            }
            frame_addr = frame_addr + PAGE_SIZE_BYTES;
        }
    }

    phys::set_totals(totals);

    if totals.free < 1024 * 1024 * 1024 {
        log::info!("Memory size {} MiB free", totals.free / (1024 * 1024));
    } else {
        let full_gibs = totals.free / (1024 * 1024 * 1024);
        let cent_gibs = (totals.free % (1024 * 1024 * 1024)) / 1024_00_000;
        log::info!("Memory size {}.{:02} GiB free", full_gibs, cent_gibs);
    }
}
