//! Address spaces: ordered, non-overlapping virtual memory entries over
//! a page table, with demand paging and copy-on-write.
//!
//! Lock order: address-space rwlock, then anonymous-map rwlock, then the
//! page reference counts. The scheduler lock is never taken with any of
//! these held.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Once;

use crate::error::KernelError;
use crate::memory::addr::{PhysAddr, VirtAddr, VirtRange};
use crate::memory::constants::PAGE_SIZE_BYTES;
use crate::memory::paging::{CacheMode, PageTable, Protection};
use crate::memory::phys;
use crate::sync::RwLock;

mod anon;
mod entry;
mod object;

pub use self::anon::{AnonymousMap, AnonymousPage};
pub use self::object::Object;

use self::entry::{AnonRef, Entry, ObjectRef};

/// What backs a new mapping.
pub enum Backing {
    /// Zero-filled on demand, private
    Anonymous,
    /// Pages served by an object starting at `offset`
    Object { object: Arc<Object>, offset: u64 },
    /// Private copy-on-write view of an object
    ObjectPrivate { object: Arc<Object>, offset: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// Outcome of a page-fault resolution, consumed by the architecture
/// fault handler.
#[derive(Debug)]
pub enum FaultOutcome {
    /// Retry the access; the mapping is in place now
    Resolved,
    /// The access was invalid; kill the offender
    Segfault,
    /// Resolution failed for an internal reason (usually OutOfMemory)
    InternalError(KernelError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Kernel,
    User,
}

struct SpaceInner {
    entries: Vec<Entry>,
    page_table: PageTable,
}

pub struct AddressSpace {
    name: String,
    range: VirtRange,
    environment: Environment,
    inner: RwLock<SpaceInner>,
}

/// Lower-half range handed to user address spaces. The zero page is
/// never mappable.
const USER_RANGE: VirtRange = VirtRange::new(
    VirtAddr::new(PAGE_SIZE_BYTES),
    0x0000_8000_0000_0000 - PAGE_SIZE_BYTES,
);

/// The kernel's own address space, built in stage 1.
static KERNEL_SPACE: Once<AddressSpace> = Once::new();

pub fn init_kernel_space(range: VirtRange) -> Result<(), KernelError> {
    let root = phys::allocate()?;
    let page_table = PageTable::new(root);
    KERNEL_SPACE.call_once(|| AddressSpace {
        name: String::from("kernel"),
        range,
        environment: Environment::Kernel,
        inner: RwLock::new(SpaceInner {
            entries: Vec::new(),
            page_table,
        }),
    });
    Ok(())
}

pub fn kernel_space() -> Option<&'static AddressSpace> {
    KERNEL_SPACE.get()
}

impl AddressSpace {
    /// Fresh user address space whose page table shares the kernel's
    /// higher half.
    pub fn new_user(name: String) -> Result<Self, KernelError> {
        let root = phys::allocate()?;
        let page_table = PageTable::new(root);
        if let Some(kernel) = kernel_space() {
            page_table.copy_kernel_entries_from(&kernel.inner.read().page_table);
        }
        Ok(Self {
            name,
            range: USER_RANGE,
            environment: Environment::User,
            inner: RwLock::new(SpaceInner {
                entries: Vec::new(),
                page_table,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn range(&self) -> VirtRange {
        self.range
    }

    pub fn entry_count(&self) -> usize {
        self.inner.read().entries.len()
    }

    fn check_range(&self, range: VirtRange) -> Result<(), KernelError> {
        if !range.is_valid() {
            return Err(KernelError::BadArgument);
        }
        if range.start < self.range.start || range.end() > self.range.end() {
            return Err(KernelError::BadArgument);
        }
        Ok(())
    }

    /// Insert a new entry covering `range`. Fails with `AlreadyMapped`
    /// if anything in the range is taken; merges with its neighbors when
    /// attributes line up.
    pub fn map(
        &self,
        range: VirtRange,
        protection: Protection,
        cache: CacheMode,
        backing: Backing,
    ) -> Result<(), KernelError> {
        self.check_range(range)?;

        let (copy_on_write, anon, object) = match backing {
            Backing::Anonymous => (
                false,
                Some(AnonRef {
                    map: AnonymousMap::new(),
                    start_slot: 0,
                }),
                None,
            ),
            Backing::Object { object, offset } => {
                if offset % PAGE_SIZE_BYTES != 0 {
                    return Err(KernelError::BadArgument);
                }
                (
                    false,
                    None,
                    Some(ObjectRef {
                        object,
                        start_offset: offset,
                    }),
                )
            }
            Backing::ObjectPrivate { object, offset } => {
                if offset % PAGE_SIZE_BYTES != 0 {
                    return Err(KernelError::BadArgument);
                }
                // Private views get an anonymous overlay that captures
                // written pages.
                (
                    true,
                    Some(AnonRef {
                        map: AnonymousMap::new(),
                        start_slot: 0,
                    }),
                    Some(ObjectRef {
                        object,
                        start_offset: offset,
                    }),
                )
            }
        };

        let entry = Entry {
            base: range.start,
            page_count: range.page_count(),
            protection,
            cache,
            copy_on_write,
            needs_copy: false,
            wired_count: 0,
            anon,
            object,
        };

        let mut inner = self.inner.write();
        let index = match inner
            .entries
            .binary_search_by(|existing| existing.base.cmp(&range.start))
        {
            // Same base address is an overlap by definition
            Ok(_) => return Err(KernelError::AlreadyMapped),
            Err(index) => index,
        };
        if index > 0 && inner.entries[index - 1].overlaps(range) {
            return Err(KernelError::AlreadyMapped);
        }
        if index < inner.entries.len() && inner.entries[index].overlaps(range) {
            return Err(KernelError::AlreadyMapped);
        }

        inner.entries.insert(index, entry);
        self.merge_around(&mut inner.entries, index);
        Ok(())
    }

    /// Pairwise neighbor merging after an insertion at `index`.
    /// Three-way merges are deliberately left on the table; one boundary
    /// may stay unmerged.
    fn merge_around(&self, entries: &mut Vec<Entry>, index: usize) {
        // Preceding neighbor first
        let mut index = index;
        if index > 0 && entries[index - 1].mergeable_with(&entries[index]) {
            let absorbed = entries.remove(index);
            index -= 1;
            entries[index].merge(absorbed);
            return;
        }
        if index + 1 < entries.len() && entries[index].mergeable_with(&entries[index + 1]) {
            let absorbed = entries.remove(index + 1);
            entries[index].merge(absorbed);
        }
    }

    fn entry_index_containing(entries: &[Entry], addr: VirtAddr) -> Option<usize> {
        let index = match entries.binary_search_by(|entry| entry.base.cmp(&addr)) {
            Ok(index) => index,
            Err(0) => return None,
            Err(index) => index - 1,
        };
        if entries[index].contains(addr) {
            Some(index)
        } else {
            None
        }
    }

    /// Remove or trim every entry covered by `range`: page-out from the
    /// page table and drop page references the removed parts held.
    pub fn unmap(&self, range: VirtRange) -> Result<(), KernelError> {
        self.check_range(range)?;

        let mut inner = self.inner.write();
        let SpaceInner {
            entries,
            page_table,
        } = &mut *inner;

        let mut index = 0;
        while index < entries.len() {
            if !entries[index].overlaps(range) {
                if entries[index].base >= range.end() {
                    break;
                }
                index += 1;
                continue;
            }

            // Trim to the covered part: split off an uncovered head
            // and/or tail first.
            if entries[index].base < range.start {
                let head_pages = entries[index].page_index_of(range.start);
                let tail = entries[index].split_at(head_pages);
                entries.insert(index + 1, tail);
                index += 1;
                continue;
            }
            if entries[index].end() > range.end() {
                let covered_pages =
                    (range.end() - entries[index].base) / PAGE_SIZE_BYTES;
                let tail = entries[index].split_at(covered_pages);
                entries.insert(index + 1, tail);
            }

            let removed = entries.remove(index);
            drop_entry_pages(&removed, page_table);
        }

        Ok(())
    }

    /// Adjust protection over `range`, splitting entries at the
    /// boundaries.
    pub fn protect(&self, range: VirtRange, protection: Protection) -> Result<(), KernelError> {
        self.check_range(range)?;

        let mut inner = self.inner.write();
        let SpaceInner {
            entries,
            page_table,
        } = &mut *inner;

        let mut index = 0;
        while index < entries.len() {
            if !entries[index].overlaps(range) {
                if entries[index].base >= range.end() {
                    break;
                }
                index += 1;
                continue;
            }

            if entries[index].base < range.start {
                let head_pages = entries[index].page_index_of(range.start);
                let tail = entries[index].split_at(head_pages);
                entries.insert(index + 1, tail);
                index += 1;
                continue;
            }
            if entries[index].end() > range.end() {
                let covered_pages =
                    (range.end() - entries[index].base) / PAGE_SIZE_BYTES;
                let tail = entries[index].split_at(covered_pages);
                entries.insert(index + 1, tail);
            }

            let entry = &mut entries[index];
            entry.protection = protection;
            // Already-resident pages get the new (hardware) protection
            // immediately; missing pages pick it up at fault time.
            let hardware = entry.hardware_protection();
            for page in entry.range().pages() {
                let _ = page_table.update_protection(page.start_address(), hardware);
            }
            index += 1;
        }

        Ok(())
    }

    /// Resolve a page fault at `addr`. Called from the architecture
    /// fault handler.
    pub fn fault(&self, addr: VirtAddr, access: AccessKind) -> FaultOutcome {
        if !self.range.contains(addr) {
            return FaultOutcome::Segfault;
        }

        let mut inner = self.inner.write();
        let SpaceInner {
            entries,
            page_table,
        } = &mut *inner;

        let index = match Self::entry_index_containing(entries, addr) {
            Some(index) => index,
            None => return FaultOutcome::Segfault,
        };
        let entry = &mut entries[index];

        let allowed = match access {
            AccessKind::Read => entry.protection.contains(Protection::READ),
            AccessKind::Write => entry.protection.contains(Protection::WRITE),
            AccessKind::Execute => entry.protection.contains(Protection::EXECUTE),
        };
        if !allowed {
            return FaultOutcome::Segfault;
        }

        match resolve_fault(entry, page_table, addr, access) {
            Ok(()) => FaultOutcome::Resolved,
            Err(error) => FaultOutcome::InternalError(error),
        }
    }

    /// Share `range` into `target` copy-on-write. Both sides keep the
    /// same anonymous maps, marked `needs_copy`, so the first anonymous
    /// write on either side clones its map and then its pages.
    pub fn share_cow(&self, range: VirtRange, target: &AddressSpace) -> Result<(), KernelError> {
        self.check_range(range)?;
        target.check_range(range)?;

        let mut inner = self.inner.write();
        let SpaceInner {
            entries,
            page_table,
        } = &mut *inner;
        let mut target_inner = target.inner.write();

        for entry in entries.iter_mut() {
            if !entry.overlaps(range) {
                continue;
            }
            if entry.base < range.start || entry.end() > range.end() {
                // Callers share whole entries; partial sharing would
                // need a split here.
                return Err(KernelError::BadArgument);
            }

            let clone = Entry {
                base: entry.base,
                page_count: entry.page_count,
                protection: entry.protection,
                cache: entry.cache,
                copy_on_write: true,
                needs_copy: entry.anon.is_some(),
                wired_count: 0,
                anon: entry.anon.clone(),
                object: entry.object.clone(),
            };

            // Both sides lose direct write access until the copy
            // machinery has run.
            entry.copy_on_write = true;
            entry.needs_copy = entry.anon.is_some();
            let hardware = entry.hardware_protection();
            for page in entry.range().pages() {
                let _ = page_table.update_protection(page.start_address(), hardware);
            }

            let index = match target_inner
                .entries
                .binary_search_by(|existing| existing.base.cmp(&clone.base))
            {
                Ok(_) => return Err(KernelError::AlreadyMapped),
                Err(index) => index,
            };
            if index > 0 && target_inner.entries[index - 1].overlaps(clone.range()) {
                return Err(KernelError::AlreadyMapped);
            }
            if index < target_inner.entries.len()
                && target_inner.entries[index].overlaps(clone.range())
            {
                return Err(KernelError::AlreadyMapped);
            }
            target_inner.entries.insert(index, clone);
        }

        Ok(())
    }

    /// Tear down every mapping; used at process destruction.
    pub fn reinitialize_and_unmap_all(&self) {
        let mut inner = self.inner.write();
        let SpaceInner {
            entries,
            page_table,
        } = &mut *inner;

        for entry in entries.drain(..) {
            drop_entry_pages(&entry, page_table);
        }
        page_table.release_user_tables();
    }

    /// Physical translation through the page table; resident pages only.
    pub fn translate(&self, addr: VirtAddr) -> Option<(PhysAddr, Protection)> {
        self.inner.read().page_table.translate(addr)
    }

    /// Load this space's page table into the MMU.
    ///
    /// # Safety
    /// The table must map the currently executing code and stack.
    pub unsafe fn activate(&self) {
        self.inner.read().page_table.activate();
    }
}

/// Page-out an entry's covered pages and release the backing references
/// the entry held.
fn drop_entry_pages(entry: &Entry, page_table: &PageTable) {
    page_table.unmap(entry.range());

    if let Some(anon) = &entry.anon {
        // Pages of an unshared map die with their slots; a shared map
        // keeps them alive for the other side.
        if Arc::strong_count(&anon.map) == 1 {
            anon.map.discard_slots(
                anon.start_slot..anon.start_slot + entry.page_count as usize,
            );
        }
    }
    // Object chunks stay with the object; the reference drops with the
    // entry itself.
}

/// The fault resolution ladder: anonymous zero-fill, copy-on-write, or
/// object read.
fn resolve_fault(
    entry: &mut Entry,
    page_table: &PageTable,
    addr: VirtAddr,
    access: AccessKind,
) -> Result<(), KernelError> {
    let page = addr.align_down(PAGE_SIZE_BYTES);
    let page_range = VirtRange::new(page, PAGE_SIZE_BYTES);

    let writing = access == AccessKind::Write;

    if writing && entry.copy_on_write && entry.needs_copy {
        // First anonymous write since the share: privatize the map.
        let anon = entry.anon.as_ref().ok_or(KernelError::Unexpected)?;
        let private = anon.map.clone_shared();
        let start_slot = anon.start_slot;
        entry.anon = Some(AnonRef {
            map: private,
            start_slot,
        });
        entry.needs_copy = false;
    }

    if let Some(anon) = &entry.anon {
        let slot = anon.start_slot + entry.page_index_of(addr) as usize;

        if writing {
            let resolved = match (&entry.object, anon.map.page(slot)) {
                // Private object view, first write: copy the object page
                // into the overlay.
                (Some(object), None) if entry.copy_on_write => {
                    let offset =
                        object.start_offset + entry.page_index_of(addr) * PAGE_SIZE_BYTES;
                    let frame = object.object.page_at(offset)?;
                    let copy = AnonymousPage::new_zeroed()?;
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            crate::memory::phys_to_virt(frame.start_address()).as_ptr::<u8>(),
                            crate::memory::phys_to_virt(copy.frame().start_address())
                                .as_mut_ptr::<u8>(),
                            PAGE_SIZE_BYTES as usize,
                        );
                    }
                    anon.map.install_page(slot, copy.clone());
                    copy
                }
                _ => anon.map.page_for_write(slot)?,
            };

            // The slot now holds an exclusively-owned page; map it
            // writable.
            page_table.unmap(page_range);
            page_table.map(
                page_range,
                resolved.frame().start_address(),
                entry.protection,
                entry.cache,
            )?;
            return Ok(());
        }

        // Read or execute: resident overlay page, else object page, else
        // zero fill.
        if let Some(resident) = anon.map.page(slot) {
            page_table.unmap(page_range);
            page_table.map(
                page_range,
                resident.frame().start_address(),
                entry.hardware_protection(),
                entry.cache,
            )?;
            return Ok(());
        }

        if let Some(object) = &entry.object {
            let offset = object.start_offset + entry.page_index_of(addr) * PAGE_SIZE_BYTES;
            let frame = object.object.page_at(offset)?;
            page_table.unmap(page_range);
            page_table.map(
                page_range,
                frame.start_address(),
                entry.hardware_protection(),
                entry.cache,
            )?;
            return Ok(());
        }

        let zeroed = anon.map.page_for_read(slot)?;
        page_table.unmap(page_range);
        page_table.map(
            page_range,
            zeroed.frame().start_address(),
            entry.hardware_protection(),
            entry.cache,
        )?;
        return Ok(());
    }

    // Pure object mapping (shared): serve the object page directly.
    let object = entry.object.as_ref().ok_or(KernelError::Unexpected)?;
    let offset = object.start_offset + entry.page_index_of(addr) * PAGE_SIZE_BYTES;
    let frame = object.object.page_at(offset)?;
    page_table.unmap(page_range);
    page_table.map(
        page_range,
        frame.start_address(),
        entry.hardware_protection(),
        entry.cache,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing;

    const BASE: u64 = 0x4000_0000;

    fn test_space(name: &str) -> AddressSpace {
        testing::init_global_pool();
        AddressSpace::new_user(String::from(name)).unwrap()
    }

    fn pages(start: u64, count: u64) -> VirtRange {
        VirtRange::new(VirtAddr::new(start), count * PAGE_SIZE_BYTES)
    }

    /// Fault the page in for writing and poke a byte through the direct
    /// map, the way a resolved MMU access would.
    fn write_byte(space: &AddressSpace, addr: u64, value: u8) {
        let addr = VirtAddr::new(addr);
        match space.fault(addr, AccessKind::Write) {
            FaultOutcome::Resolved => {}
            outcome => panic!("write fault not resolved: {:?}", outcome),
        }
        let (phys, protection) = space.translate(addr).unwrap();
        assert!(protection.allows_write());
        unsafe { crate::memory::phys_to_virt(phys).as_mut_ptr::<u8>().write(value) };
    }

    fn read_byte(space: &AddressSpace, addr: u64) -> u8 {
        let addr = VirtAddr::new(addr);
        match space.fault(addr, AccessKind::Read) {
            FaultOutcome::Resolved => {}
            outcome => panic!("read fault not resolved: {:?}", outcome),
        }
        let (phys, _) = space.translate(addr).unwrap();
        unsafe { crate::memory::phys_to_virt(phys).as_ptr::<u8>().read() }
    }

    #[test]
    fn zero_length_and_unaligned_ranges_are_rejected() {
        let space = test_space("bad-args");
        let backing = || Backing::Anonymous;

        let zero = VirtRange::new(VirtAddr::new(BASE), 0);
        assert_eq!(
            space
                .map(zero, Protection::KERNEL_DATA, CacheMode::WriteBack, backing())
                .unwrap_err(),
            KernelError::BadArgument
        );

        let unaligned = VirtRange::new(VirtAddr::new(BASE + 3), PAGE_SIZE_BYTES);
        assert_eq!(
            space
                .map(unaligned, Protection::KERNEL_DATA, CacheMode::WriteBack, backing())
                .unwrap_err(),
            KernelError::BadArgument
        );
        assert_eq!(
            space.unmap(unaligned).unwrap_err(),
            KernelError::BadArgument
        );
    }

    #[test]
    fn overlapping_map_is_rejected() {
        let space = test_space("overlap");
        space
            .map(
                pages(BASE, 4),
                Protection::KERNEL_DATA,
                CacheMode::WriteBack,
                Backing::Anonymous,
            )
            .unwrap();
        assert_eq!(
            space
                .map(
                    pages(BASE + 2 * PAGE_SIZE_BYTES, 4),
                    Protection::KERNEL_DATA,
                    CacheMode::WriteBack,
                    Backing::Anonymous,
                )
                .unwrap_err(),
            KernelError::AlreadyMapped
        );
        assert_eq!(space.entry_count(), 1);
    }

    #[test]
    fn map_then_unmap_leaves_the_entry_list_unchanged() {
        let space = test_space("map-unmap");
        space
            .map(
                pages(BASE, 8),
                Protection::KERNEL_DATA,
                CacheMode::WriteBack,
                Backing::Anonymous,
            )
            .unwrap();
        assert_eq!(space.entry_count(), 1);

        let range = pages(BASE + 16 * PAGE_SIZE_BYTES, 4);
        space
            .map(range, Protection::KERNEL_DATA, CacheMode::WriteBack, Backing::Anonymous)
            .unwrap();
        assert_eq!(space.entry_count(), 2);

        space.unmap(range).unwrap();
        assert_eq!(space.entry_count(), 1);
    }

    #[test]
    fn zero_fill_then_write_round_trips() {
        let space = test_space("zero-fill");
        space
            .map(
                pages(BASE, 2),
                Protection::KERNEL_DATA,
                CacheMode::WriteBack,
                Backing::Anonymous,
            )
            .unwrap();

        // First touch reads zero
        assert_eq!(read_byte(&space, BASE + 100), 0);

        write_byte(&space, BASE + 100, 0x77);
        assert_eq!(read_byte(&space, BASE + 100), 0x77);
    }

    #[test]
    fn faults_outside_mappings_and_against_protection_segfault() {
        let space = test_space("segfault");
        space
            .map(
                pages(BASE, 1),
                Protection::READ,
                CacheMode::WriteBack,
                Backing::Anonymous,
            )
            .unwrap();

        assert!(matches!(
            space.fault(VirtAddr::new(BASE - PAGE_SIZE_BYTES), AccessKind::Read),
            FaultOutcome::Segfault
        ));
        assert!(matches!(
            space.fault(VirtAddr::new(BASE), AccessKind::Write),
            FaultOutcome::Segfault
        ));
        assert!(matches!(
            space.fault(VirtAddr::new(BASE), AccessKind::Execute),
            FaultOutcome::Segfault
        ));
        assert!(matches!(
            space.fault(VirtAddr::new(BASE), AccessKind::Read),
            FaultOutcome::Resolved
        ));
    }

    #[test]
    fn anonymous_copy_on_write_diverges_per_writer() {
        let x = test_space("cow-x");
        let range = pages(BASE, 4);
        x.map(
            range,
            Protection::KERNEL_DATA,
            CacheMode::WriteBack,
            Backing::Anonymous,
        )
        .unwrap();

        write_byte(&x, BASE, 0x11);

        let y = test_space("cow-y");
        x.share_cow(range, &y).unwrap();

        // Shared view: the clone sees what was written before the share.
        assert_eq!(read_byte(&y, BASE), 0x11);

        // Writer copies; reader keeps the original.
        write_byte(&y, BASE, 0x22);
        assert_eq!(read_byte(&x, BASE), 0x11);
        assert_eq!(read_byte(&y, BASE), 0x22);

        // The other direction works symmetrically on another page.
        write_byte(&x, BASE + PAGE_SIZE_BYTES, 0x33);
        assert_eq!(read_byte(&y, BASE + PAGE_SIZE_BYTES), 0);
    }

    #[test]
    fn partial_unmap_trims_and_splits() {
        let space = test_space("partial-unmap");
        space
            .map(
                pages(BASE, 4),
                Protection::KERNEL_DATA,
                CacheMode::WriteBack,
                Backing::Anonymous,
            )
            .unwrap();

        for i in 0..4 {
            write_byte(&space, BASE + i * PAGE_SIZE_BYTES, i as u8 + 1);
        }

        space
            .unmap(pages(BASE + PAGE_SIZE_BYTES, 2))
            .unwrap();
        assert_eq!(space.entry_count(), 2);

        assert!(space.translate(VirtAddr::new(BASE)).is_some());
        assert!(space
            .translate(VirtAddr::new(BASE + PAGE_SIZE_BYTES))
            .is_none());
        assert!(space
            .translate(VirtAddr::new(BASE + 2 * PAGE_SIZE_BYTES))
            .is_none());
        assert_eq!(read_byte(&space, BASE + 3 * PAGE_SIZE_BYTES), 4);
    }

    #[test]
    fn protect_splits_and_write_protects() {
        let space = test_space("protect");
        space
            .map(
                pages(BASE, 4),
                Protection::KERNEL_DATA,
                CacheMode::WriteBack,
                Backing::Anonymous,
            )
            .unwrap();
        write_byte(&space, BASE + PAGE_SIZE_BYTES, 9);

        space
            .protect(pages(BASE + PAGE_SIZE_BYTES, 2), Protection::READ)
            .unwrap();
        assert_eq!(space.entry_count(), 3);

        assert!(matches!(
            space.fault(VirtAddr::new(BASE + PAGE_SIZE_BYTES), AccessKind::Write),
            FaultOutcome::Segfault
        ));
        // Resident page was downgraded in the page table too.
        let (_, protection) = space
            .translate(VirtAddr::new(BASE + PAGE_SIZE_BYTES))
            .unwrap();
        assert!(!protection.allows_write());
        // Outside the protected window writes still work.
        write_byte(&space, BASE, 1);
    }

    #[test]
    fn adjacent_object_views_merge_on_insertion() {
        let space = test_space("merge");
        let object = Object::new();

        space
            .map(
                pages(BASE, 2),
                Protection::READ,
                CacheMode::WriteBack,
                Backing::Object {
                    object: object.clone(),
                    offset: 0,
                },
            )
            .unwrap();
        space
            .map(
                pages(BASE + 2 * PAGE_SIZE_BYTES, 2),
                Protection::READ,
                CacheMode::WriteBack,
                Backing::Object {
                    object: object.clone(),
                    offset: 2 * PAGE_SIZE_BYTES,
                },
            )
            .unwrap();

        // Same object, contiguous offsets, equal attributes: one entry.
        assert_eq!(space.entry_count(), 1);

        // Non-contiguous offset stays separate.
        space
            .map(
                pages(BASE + 4 * PAGE_SIZE_BYTES, 1),
                Protection::READ,
                CacheMode::WriteBack,
                Backing::Object {
                    object,
                    offset: 8 * PAGE_SIZE_BYTES,
                },
            )
            .unwrap();
        assert_eq!(space.entry_count(), 2);
    }

    #[test]
    fn object_reads_and_private_writes() {
        let space = test_space("object");
        let object = Object::new();
        object.populate(0, b"cascade").unwrap();

        space
            .map(
                pages(BASE, 1),
                Protection::READ,
                CacheMode::WriteBack,
                Backing::Object {
                    object: object.clone(),
                    offset: 0,
                },
            )
            .unwrap();
        assert_eq!(read_byte(&space, BASE), b'c');

        // A private view diverges from the object on write.
        let private_base = BASE + 16 * PAGE_SIZE_BYTES;
        space
            .map(
                pages(private_base, 1),
                Protection::KERNEL_DATA,
                CacheMode::WriteBack,
                Backing::ObjectPrivate {
                    object: object.clone(),
                    offset: 0,
                },
            )
            .unwrap();
        assert_eq!(read_byte(&space, private_base), b'c');
        write_byte(&space, private_base, b'X');
        assert_eq!(read_byte(&space, private_base), b'X');
        assert_eq!(read_byte(&space, BASE), b'c');
    }

    #[test]
    fn teardown_unmaps_everything() {
        let space = test_space("teardown");
        space
            .map(
                pages(BASE, 4),
                Protection::KERNEL_DATA,
                CacheMode::WriteBack,
                Backing::Anonymous,
            )
            .unwrap();
        write_byte(&space, BASE, 5);

        space.reinitialize_and_unmap_all();
        assert_eq!(space.entry_count(), 0);
        assert!(space.translate(VirtAddr::new(BASE)).is_none());
    }
}
