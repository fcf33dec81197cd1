//! Memory management: direct map, physical frames, paging, address spaces.

use spin::Once;

pub mod addr;
pub mod address_space;
pub mod constants;
pub mod map;
pub mod paging;
pub mod phys;
#[cfg(test)]
pub mod testing;

pub use self::addr::{Page, PhysAddr, PhysFrame, VirtAddr, VirtRange};

use crate::boot_info::BootInfo;
use crate::error::KernelError;

/// Base of the higher-half linear mapping of physical memory.
/// Written once in stage-1, read on every frame access after that.
static DIRECT_MAP_BASE: Once<u64> = Once::new();

/// Register the bootloader-provided direct map. Must happen before the
/// frame allocator is populated.
pub fn init_direct_map(base: VirtAddr) {
    DIRECT_MAP_BASE.call_once(|| base.as_u64());
}

/// Virtual image of a physical address in the direct map.
///
/// Panics if the direct map has not been registered yet; every caller runs
/// after stage-1.
#[inline]
pub fn phys_to_virt(addr: PhysAddr) -> VirtAddr {
    let base = DIRECT_MAP_BASE
        .get()
        .expect("direct map used before stage1");
    VirtAddr::new(base + addr.as_u64())
}

/// Inverse of `phys_to_virt` for addresses inside the direct map.
pub fn virt_to_phys(addr: VirtAddr) -> Result<PhysAddr, KernelError> {
    let base = *DIRECT_MAP_BASE
        .get()
        .ok_or(KernelError::AddressNotInDirectMap)?;
    addr.as_u64()
        .checked_sub(base)
        .map(PhysAddr::new)
        .ok_or(KernelError::AddressNotInDirectMap)
}

/// Stage-1 memory bring-up: register the direct map, then walk the boot
/// memory map into the frame allocator.
pub fn init(boot_info: &BootInfo) {
    init_direct_map(boot_info.direct_map_base);
    map::process_memory_map(boot_info.memory_map);
}
