//! File- or device-backed page store.
//!
//! An object owns an ordered map of page-sized chunks keyed by byte
//! offset. The core demand-fills missing chunks with zeroes; whatever
//! pager sits above (block cache, device driver) populates real contents
//! through [`Object::populate`].

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::error::KernelError;
use crate::memory::addr::PhysFrame;
use crate::memory::constants::PAGE_SIZE_BYTES;
use crate::memory::{phys, phys_to_virt};
use crate::sync::RwLock;

pub struct Object {
    /// Page-aligned byte offset → backing frame, ordered
    chunks: RwLock<BTreeMap<u64, PhysFrame>>,
}

impl Object {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            chunks: RwLock::new(BTreeMap::new()),
        })
    }

    /// The frame backing `offset`, materializing a zeroed chunk if the
    /// pager has not supplied one.
    pub fn page_at(&self, offset: u64) -> Result<PhysFrame, KernelError> {
        if offset % PAGE_SIZE_BYTES != 0 {
            return Err(KernelError::BadArgument);
        }
        if let Some(frame) = self.chunks.read().get(&offset) {
            return Ok(*frame);
        }

        let mut chunks = self.chunks.write();
        if let Some(frame) = chunks.get(&offset) {
            return Ok(*frame);
        }
        let frame = phys::allocate_zeroed()?;
        chunks.insert(offset, frame);
        Ok(frame)
    }

    /// Copy `bytes` into the object at `offset` (page-aligned), creating
    /// chunks as needed.
    pub fn populate(&self, offset: u64, bytes: &[u8]) -> Result<(), KernelError> {
        if offset % PAGE_SIZE_BYTES != 0 {
            return Err(KernelError::BadArgument);
        }
        let mut written = 0usize;
        while written < bytes.len() {
            let chunk_offset = offset + written as u64;
            let frame = self.page_at(chunk_offset - chunk_offset % PAGE_SIZE_BYTES)?;
            let into_page = (chunk_offset % PAGE_SIZE_BYTES) as usize;
            let count = bytes
                .len()
                .min(written + (PAGE_SIZE_BYTES as usize - into_page))
                - written;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(written),
                    phys_to_virt(frame.start_address() + into_page as u64).as_mut_ptr::<u8>(),
                    count,
                );
            }
            written += count;
        }
        Ok(())
    }

    pub fn resident_page_count(&self) -> usize {
        self.chunks.read().len()
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        for (_, frame) in core::mem::take(&mut *self.chunks.write()) {
            phys::deallocate(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing;

    #[test]
    fn populate_spans_chunk_boundaries() {
        testing::init_global_pool();

        let object = Object::new();
        let data: alloc::vec::Vec<u8> = (0..0x1800u32).map(|i| (i % 251) as u8).collect();
        object.populate(0, &data).unwrap();
        assert_eq!(object.resident_page_count(), 2);

        let first = object.page_at(0).unwrap();
        let second = object.page_at(PAGE_SIZE_BYTES).unwrap();
        unsafe {
            let head = phys_to_virt(first.start_address()).as_ptr::<u8>();
            let tail = phys_to_virt(second.start_address()).as_ptr::<u8>();
            assert_eq!(head.read(), data[0]);
            assert_eq!(head.add(0xfff).read(), data[0xfff]);
            assert_eq!(tail.read(), data[0x1000]);
            assert_eq!(tail.add(0x7ff).read(), data[0x17ff]);
            // Past the populated bytes the chunk stays zero-filled.
            assert_eq!(tail.add(0x900).read(), 0);
        }
    }

    #[test]
    fn unaligned_offsets_are_rejected() {
        testing::init_global_pool();

        let object = Object::new();
        assert_eq!(
            object.page_at(12).unwrap_err(),
            KernelError::BadArgument
        );
        assert_eq!(
            object.populate(12, b"x").unwrap_err(),
            KernelError::BadArgument
        );
    }
}
