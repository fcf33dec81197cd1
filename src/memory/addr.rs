//! Address and frame types shared by every architecture.

use core::fmt;
use core::ops::{Add, AddAssign, Sub};

use crate::memory::constants::PAGE_SIZE_BYTES;

/// A physical memory address.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }

    /// Round down to the given power-of-two alignment
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Round up to the given power-of-two alignment
    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        Self((self.0 + align - 1) & !(align - 1))
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl Add<u64> for PhysAddr {
    type Output = Self;
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = u64;
    fn sub(self, rhs: PhysAddr) -> u64 {
        self.0 - rhs.0
    }
}

/// A virtual memory address.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }

    #[inline]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }

    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        Self((self.0 + align - 1) & !(align - 1))
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl Add<u64> for VirtAddr {
    type Output = Self;
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtAddr {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<VirtAddr> for VirtAddr {
    type Output = u64;
    fn sub(self, rhs: VirtAddr) -> u64 {
        self.0 - rhs.0
    }
}

/// A standard-size physical frame, identified by its frame number.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame {
    number: u64,
}

impl PhysFrame {
    /// Frame containing the given address. The address must be page-aligned.
    pub fn from_start_address(addr: PhysAddr) -> Result<Self, crate::error::KernelError> {
        if !addr.is_aligned(PAGE_SIZE_BYTES) {
            return Err(crate::error::KernelError::BadArgument);
        }
        Ok(Self {
            number: addr.as_u64() / PAGE_SIZE_BYTES,
        })
    }

    pub const fn containing_address(addr: PhysAddr) -> Self {
        Self {
            number: addr.as_u64() / PAGE_SIZE_BYTES,
        }
    }

    pub const fn number(self) -> u64 {
        self.number
    }

    pub const fn start_address(self) -> PhysAddr {
        PhysAddr::new(self.number * PAGE_SIZE_BYTES)
    }

    pub const fn size(self) -> u64 {
        PAGE_SIZE_BYTES
    }
}

impl fmt::Debug for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysFrame({:#x})", self.start_address().as_u64())
    }
}

/// A standard-size virtual page.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Page {
    number: u64,
}

impl Page {
    pub fn from_start_address(addr: VirtAddr) -> Result<Self, crate::error::KernelError> {
        if !addr.is_aligned(PAGE_SIZE_BYTES) {
            return Err(crate::error::KernelError::BadArgument);
        }
        Ok(Self {
            number: addr.as_u64() / PAGE_SIZE_BYTES,
        })
    }

    pub const fn containing_address(addr: VirtAddr) -> Self {
        Self {
            number: addr.as_u64() / PAGE_SIZE_BYTES,
        }
    }

    pub const fn start_address(self) -> VirtAddr {
        VirtAddr::new(self.number * PAGE_SIZE_BYTES)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({:#x})", self.start_address().as_u64())
    }
}

/// A page-aligned virtual address range.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct VirtRange {
    pub start: VirtAddr,
    pub size_bytes: u64,
}

impl VirtRange {
    pub const fn new(start: VirtAddr, size_bytes: u64) -> Self {
        Self { start, size_bytes }
    }

    pub const fn end(self) -> VirtAddr {
        VirtAddr::new(self.start.as_u64() + self.size_bytes)
    }

    pub const fn page_count(self) -> u64 {
        self.size_bytes / PAGE_SIZE_BYTES
    }

    pub fn contains(self, addr: VirtAddr) -> bool {
        self.start <= addr && addr < self.end()
    }

    /// Page-aligned and nonempty
    pub fn is_valid(self) -> bool {
        self.size_bytes != 0
            && self.start.is_aligned(PAGE_SIZE_BYTES)
            && self.size_bytes % PAGE_SIZE_BYTES == 0
    }

    pub fn pages(self) -> impl Iterator<Item = Page> {
        let first = Page::containing_address(self.start);
        (0..self.page_count()).map(move |i| Page {
            number: first.number + i,
        })
    }
}

impl fmt::Debug for VirtRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VirtRange({:#x}..{:#x})",
            self.start.as_u64(),
            self.end().as_u64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        let addr = PhysAddr::new(0x1234);
        assert_eq!(addr.align_down(0x1000), PhysAddr::new(0x1000));
        assert_eq!(addr.align_up(0x1000), PhysAddr::new(0x2000));
        assert!(PhysAddr::new(0x3000).is_aligned(0x1000));
        assert!(!addr.is_aligned(0x1000));

        let aligned = VirtAddr::new(0x8000);
        assert_eq!(aligned.align_down(0x1000), aligned);
        assert_eq!(aligned.align_up(0x1000), aligned);
    }

    #[test]
    fn frames_and_pages_round_to_their_start() {
        let frame = PhysFrame::containing_address(PhysAddr::new(0x5678));
        assert_eq!(frame.start_address(), PhysAddr::new(0x5000));
        assert_eq!(frame.number(), 5);
        assert!(PhysFrame::from_start_address(PhysAddr::new(0x5678)).is_err());

        let page = Page::containing_address(VirtAddr::new(0x7fff));
        assert_eq!(page.start_address(), VirtAddr::new(0x7000));
    }

    #[test]
    fn ranges_validate_and_iterate() {
        let range = VirtRange::new(VirtAddr::new(0x4000), 3 * PAGE_SIZE_BYTES);
        assert!(range.is_valid());
        assert_eq!(range.page_count(), 3);
        assert!(range.contains(VirtAddr::new(0x4000)));
        assert!(range.contains(VirtAddr::new(0x6fff)));
        assert!(!range.contains(VirtAddr::new(0x7000)));

        let starts: Vec<u64> = range.pages().map(|p| p.start_address().as_u64()).collect();
        assert_eq!(starts, [0x4000, 0x5000, 0x6000]);

        assert!(!VirtRange::new(VirtAddr::new(0x4000), 0).is_valid());
        assert!(!VirtRange::new(VirtAddr::new(0x4008), PAGE_SIZE_BYTES).is_valid());
        assert!(!VirtRange::new(VirtAddr::new(0x4000), 17).is_valid());
    }
}
