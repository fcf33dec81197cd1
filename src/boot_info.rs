//! The contract between the boot shim and the kernel core.
//!
//! The shim (bootloader entry, out of tree) fills one `BootInfo` before
//! calling `init::stage1`. Everything here is plain data; no bootloader
//! protocol specifics leak past this module.

use crate::memory::addr::{PhysAddr, VirtAddr};

/// Classification of one bootloader memory map region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Free for kernel use
    Free,
    /// In use by the kernel image or boot structures
    InUse,
    /// Firmware-reserved, never usable
    Reserved,
    /// Usable once bootloader structures are no longer needed
    BootloaderReclaimable,
    /// Usable once ACPI tables are no longer needed
    AcpiReclaimable,
    /// Defective or otherwise unusable
    Unusable,
}

/// One region of the physical memory map, ordered by start address.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub start: PhysAddr,
    pub size_bytes: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub fn end(&self) -> PhysAddr {
        self.start + self.size_bytes
    }
}

/// Entry the bootloader releases a secondary processor into. The shim
/// passes the executor id assigned to that processor (its index in
/// [`BootInfo::processors`]).
pub type SecondaryEntry = extern "C" fn(executor_id: u32) -> !;

/// Descriptor for one processor the bootloader can start.
#[derive(Clone, Copy)]
pub struct SmpDescriptor {
    /// Firmware processor id
    pub processor_id: u32,
    /// True for the processor that entered the kernel first
    pub bootstrap: bool,
    /// Release the (parked) processor into `entry`
    pub start: fn(entry: SecondaryEntry),
}

impl core::fmt::Debug for SmpDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SmpDescriptor")
            .field("processor_id", &self.processor_id)
            .field("bootstrap", &self.bootstrap)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub base: PhysAddr,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
}

/// Everything the core consumes from the boot shim at stage-1 entry.
#[derive(Debug)]
pub struct BootInfo {
    /// Base of the higher-half linear mapping of all physical memory
    pub direct_map_base: VirtAddr,
    /// Where the kernel image is mapped
    pub kernel_virtual_base: VirtAddr,
    /// Where the kernel image is loaded
    pub kernel_physical_base: PhysAddr,
    /// Memory map, ordered by physical address
    pub memory_map: &'static [MemoryRegion],
    /// Processors available for bring-up, bootstrap first
    pub processors: &'static [SmpDescriptor],
    /// ACPI root pointer, if the firmware provided one
    pub rsdp: Option<PhysAddr>,
    /// Flattened device tree blob, if the firmware provided one
    pub device_tree: Option<PhysAddr>,
    pub framebuffer: Option<FramebufferInfo>,
    /// The kernel file itself, for debug symbolication
    pub kernel_file: Option<&'static [u8]>,
}
