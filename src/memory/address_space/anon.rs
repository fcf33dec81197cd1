//! Anonymous (zero-fill, process-private) memory.
//!
//! An anonymous map is a reference-counted sparse array of anonymous
//! pages. Sharing happens at two levels: whole maps are shared between
//! entries right after a copy-on-write clone, and individual pages stay
//! shared until somebody writes to them.

use alloc::sync::Arc;

use hashbrown::HashMap;

use crate::error::KernelError;
use crate::memory::addr::PhysFrame;
use crate::memory::constants::PAGE_SIZE_BYTES;
use crate::memory::{phys, phys_to_virt};
use crate::sync::RwLock;

/// One page of anonymous memory. The reference count (the `Arc`) is the
/// number of map slots that still see this page; the backing frame goes
/// back to the allocator with the last reference.
pub struct AnonymousPage {
    frame: PhysFrame,
}

impl AnonymousPage {
    pub fn new_zeroed() -> Result<Arc<Self>, KernelError> {
        let frame = phys::allocate_zeroed()?;
        Ok(Arc::new(Self { frame }))
    }

    pub fn frame(&self) -> PhysFrame {
        self.frame
    }

    /// A private copy of this page's current contents.
    pub fn duplicate(&self) -> Result<Arc<Self>, KernelError> {
        let frame = phys::allocate()?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                phys_to_virt(self.frame.start_address()).as_ptr::<u8>(),
                phys_to_virt(frame.start_address()).as_mut_ptr::<u8>(),
                PAGE_SIZE_BYTES as usize,
            );
        }
        Ok(Arc::new(Self { frame }))
    }
}

impl Drop for AnonymousPage {
    fn drop(&mut self) {
        phys::deallocate(self.frame);
    }
}

pub struct AnonymousMap {
    /// Sparse slot index → page. Slots without a page read as zeroes and
    /// materialize on first touch.
    pages: RwLock<HashMap<usize, Arc<AnonymousPage>>>,
}

impl AnonymousMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pages: RwLock::new(HashMap::new()),
        })
    }

    /// Share every current page into a new map. Page reference counts
    /// rise; contents are copied later, page by page, on write.
    pub fn clone_shared(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            pages: RwLock::new(self.pages.read().clone()),
        })
    }

    pub fn page(&self, slot: usize) -> Option<Arc<AnonymousPage>> {
        self.pages.read().get(&slot).cloned()
    }

    /// Resolve a read fault: the existing page, or a fresh zeroed one.
    pub fn page_for_read(&self, slot: usize) -> Result<Arc<AnonymousPage>, KernelError> {
        if let Some(page) = self.page(slot) {
            return Ok(page);
        }
        let mut pages = self.pages.write();
        // Raced with another fault on the same slot
        if let Some(page) = pages.get(&slot) {
            return Ok(page.clone());
        }
        let page = AnonymousPage::new_zeroed()?;
        pages.insert(slot, page.clone());
        Ok(page)
    }

    /// Resolve a write fault: zero-fill an empty slot, privatize a page
    /// that other maps still see, or keep an exclusive page as is.
    pub fn page_for_write(&self, slot: usize) -> Result<Arc<AnonymousPage>, KernelError> {
        let mut pages = self.pages.write();
        match pages.get(&slot) {
            None => {
                let page = AnonymousPage::new_zeroed()?;
                pages.insert(slot, page.clone());
                Ok(page)
            }
            Some(page) if Arc::strong_count(page) > 1 => {
                // Another map still sees this page; copy before letting
                // the write through.
                let copy = page.duplicate()?;
                pages.insert(slot, copy.clone());
                Ok(copy)
            }
            Some(page) => Ok(page.clone()),
        }
    }

    /// Install an already-built page, replacing any current one.
    pub fn install_page(&self, slot: usize, page: Arc<AnonymousPage>) {
        self.pages.write().insert(slot, page);
    }

    /// Drop the pages in `slots`; used when an unshared map loses part of
    /// its range.
    pub fn discard_slots(&self, slots: core::ops::Range<usize>) {
        let mut pages = self.pages.write();
        for slot in slots {
            pages.remove(&slot);
        }
    }

    pub fn resident_page_count(&self) -> usize {
        self.pages.read().len()
    }
}
