//! Arch-neutral paging contract.
//!
//! The concrete [`PageTable`] comes from the architecture adapter, but its
//! surface is fixed here: create from a zeroed root frame, share the
//! kernel's top-level entries, map/unmap/protect page-aligned ranges with
//! a [`Protection`] + [`CacheMode`] descriptor, translate, and activate.
//! `unmap` invalidates the local TLB only; cross-CPU shootdown is the
//! caller's responsibility.

pub use crate::arch::paging::PageTable;

bitflags! {
    /// Access rights of a mapping.
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Accessible from user mode
        const USER = 1 << 3;
    }
}

impl Protection {
    pub const KERNEL_DATA: Protection =
        Protection::from_bits_truncate(Protection::READ.bits() | Protection::WRITE.bits());

    pub fn without_write(self) -> Self {
        self & !Protection::WRITE
    }

    pub fn allows_write(self) -> bool {
        self.contains(Protection::WRITE)
    }
}

/// Cacheability of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    WriteBack,
    WriteCombining,
    Uncached,
}
