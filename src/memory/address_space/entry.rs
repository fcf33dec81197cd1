//! One contiguous mapped range of an address space.

use alloc::sync::Arc;

use crate::memory::addr::{VirtAddr, VirtRange};
use crate::memory::constants::PAGE_SIZE_BYTES;
use crate::memory::paging::{CacheMode, Protection};

use super::anon::AnonymousMap;
use super::object::Object;

/// Reference into an anonymous map, starting at `start_slot`.
#[derive(Clone)]
pub(super) struct AnonRef {
    pub map: Arc<AnonymousMap>,
    pub start_slot: usize,
}

/// Reference into an object, starting at `start_offset` bytes.
#[derive(Clone)]
pub(super) struct ObjectRef {
    pub object: Arc<Object>,
    pub start_offset: u64,
}

pub(super) struct Entry {
    pub base: VirtAddr,
    pub page_count: u64,
    pub protection: Protection,
    pub cache: CacheMode,
    /// Writes must be resolved through the fault path
    pub copy_on_write: bool,
    /// The anonymous map is still shared with the entry this one was
    /// cloned from; it must be cloned before the first anonymous write
    pub needs_copy: bool,
    pub wired_count: u32,
    pub anon: Option<AnonRef>,
    pub object: Option<ObjectRef>,
}

impl Entry {
    pub fn range(&self) -> VirtRange {
        VirtRange::new(self.base, self.page_count * PAGE_SIZE_BYTES)
    }

    pub fn end(&self) -> VirtAddr {
        self.range().end()
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.range().contains(addr)
    }

    pub fn overlaps(&self, range: VirtRange) -> bool {
        self.base < range.end() && range.start < self.end()
    }

    /// Index of the page covering `addr`, relative to this entry.
    pub fn page_index_of(&self, addr: VirtAddr) -> u64 {
        debug_assert!(self.contains(addr));
        (addr.align_down(PAGE_SIZE_BYTES) - self.base) / PAGE_SIZE_BYTES
    }

    /// Anonymous map slot for `addr`.
    pub fn slot_of(&self, addr: VirtAddr) -> Option<usize> {
        let anon = self.anon.as_ref()?;
        Some(anon.start_slot + self.page_index_of(addr) as usize)
    }

    /// The protection to program into the page table: entries with
    /// pending copy-on-write keep the write bit off until resolved.
    pub fn hardware_protection(&self) -> Protection {
        if self.copy_on_write {
            self.protection.without_write()
        } else {
            self.protection
        }
    }

    /// Whether `next` continues this entry with identical attributes and
    /// consistent backing arithmetic. Shared anonymous maps never merge.
    pub fn mergeable_with(&self, next: &Entry) -> bool {
        if self.end() != next.base {
            return false;
        }
        if (
            self.protection,
            self.cache,
            self.copy_on_write,
            self.needs_copy,
            self.wired_count,
        ) != (
            next.protection,
            next.cache,
            next.copy_on_write,
            next.needs_copy,
            next.wired_count,
        ) {
            return false;
        }

        match (&self.anon, &next.anon) {
            (None, None) => {}
            (Some(a), Some(b)) => {
                // Both sides must hold the same map and be its only two
                // references; a third reference means another address
                // space still shares it.
                if !Arc::ptr_eq(&a.map, &b.map) || Arc::strong_count(&a.map) != 2 {
                    return false;
                }
                if a.start_slot + self.page_count as usize != b.start_slot {
                    return false;
                }
            }
            _ => return false,
        }

        match (&self.object, &next.object) {
            (None, None) => {}
            (Some(a), Some(b)) => {
                if !Arc::ptr_eq(&a.object, &b.object) {
                    return false;
                }
                if a.start_offset + self.page_count * PAGE_SIZE_BYTES != b.start_offset {
                    return false;
                }
            }
            _ => return false,
        }

        true
    }

    /// Absorb `next`, which must satisfy `mergeable_with`.
    pub fn merge(&mut self, next: Entry) {
        debug_assert!(self.mergeable_with(&next));
        self.page_count += next.page_count;
    }

    /// Split off the tail starting at page `index`, leaving the head in
    /// place.
    pub fn split_at(&mut self, index: u64) -> Entry {
        debug_assert!(index > 0 && index < self.page_count);

        let tail = Entry {
            base: self.base + index * PAGE_SIZE_BYTES,
            page_count: self.page_count - index,
            protection: self.protection,
            cache: self.cache,
            copy_on_write: self.copy_on_write,
            needs_copy: self.needs_copy,
            wired_count: self.wired_count,
            anon: self.anon.as_ref().map(|anon| AnonRef {
                map: anon.map.clone(),
                start_slot: anon.start_slot + index as usize,
            }),
            object: self.object.as_ref().map(|object| ObjectRef {
                object: object.object.clone(),
                start_offset: object.start_offset + index * PAGE_SIZE_BYTES,
            }),
        };
        self.page_count = index;
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::paging::CacheMode;

    fn anon_entry(base: u64, pages: u64, map: Arc<AnonymousMap>, slot: usize) -> Entry {
        Entry {
            base: VirtAddr::new(base),
            page_count: pages,
            protection: Protection::KERNEL_DATA,
            cache: CacheMode::WriteBack,
            copy_on_write: false,
            needs_copy: false,
            wired_count: 0,
            anon: Some(AnonRef {
                map,
                start_slot: slot,
            }),
            object: None,
        }
    }

    #[test]
    fn split_keeps_slot_arithmetic_consistent() {
        let map = AnonymousMap::new();
        let mut head = anon_entry(0x10000, 4, map, 0);

        let tail = head.split_at(3);
        assert_eq!(head.page_count, 3);
        assert_eq!(tail.page_count, 1);
        assert_eq!(tail.base, VirtAddr::new(0x13000));
        assert_eq!(tail.anon.as_ref().unwrap().start_slot, 3);
        assert_eq!(tail.slot_of(VirtAddr::new(0x13fff)), Some(3));
    }

    #[test]
    fn split_halves_merge_back() {
        let map = AnonymousMap::new();
        let mut head = anon_entry(0x10000, 4, map, 0);
        let tail = head.split_at(2);

        assert!(head.mergeable_with(&tail));
        head.merge(tail);
        assert_eq!(head.page_count, 4);
    }

    #[test]
    fn attribute_mismatch_prevents_merging() {
        let map = AnonymousMap::new();
        let mut head = anon_entry(0x10000, 4, map, 0);
        let mut tail = head.split_at(2);

        tail.protection = Protection::READ;
        assert!(!head.mergeable_with(&tail));
        tail.protection = head.protection;

        tail.needs_copy = true;
        assert!(!head.mergeable_with(&tail));
        tail.needs_copy = false;

        // An extra map reference means someone else shares it.
        let foreign = tail.anon.as_ref().unwrap().map.clone();
        assert!(!head.mergeable_with(&tail));
        drop(foreign);
        assert!(head.mergeable_with(&tail));
    }

    #[test]
    fn non_adjacent_entries_do_not_merge() {
        let a_map = AnonymousMap::new();
        let b_map = AnonymousMap::new();
        let a = anon_entry(0x10000, 2, a_map, 0);
        let b = anon_entry(0x13000, 2, b_map, 2);
        assert!(!a.mergeable_with(&b));
    }
}
