//! x86-64 adapter.

use core::arch::{asm, global_asm};

use crate::executor::Executor;
use crate::memory::addr::VirtAddr;

const IA32_GS_BASE: u32 = 0xc000_0101;

const RFLAGS_INTERRUPT_FLAG: u64 = 1 << 9;

pub fn interrupts_enabled() -> bool {
    let flags: u64;
    unsafe {
        asm!("pushfq", "pop {}", out(reg) flags, options(preserves_flags));
    }
    flags & RFLAGS_INTERRUPT_FLAG != 0
}

#[inline]
pub fn disable_interrupts() {
    unsafe {
        asm!("cli", options(nomem, nostack));
    }
}

#[inline]
pub fn enable_interrupts() {
    unsafe {
        asm!("sti", options(nomem, nostack));
    }
}

#[inline]
pub fn spin_hint() {
    core::hint::spin_loop();
}

/// Sleep until the next interrupt, with interrupts enabled for the wait.
pub fn wait_for_interrupt() {
    unsafe {
        asm!("sti", "hlt", options(nomem, nostack));
    }
}

pub fn halt() -> ! {
    loop {
        unsafe {
            asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}

/// Current frame pointer, the head of the call-frame chain the panic
/// path walks.
pub fn frame_pointer() -> u64 {
    let rbp: u64;
    unsafe {
        asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack, preserves_flags));
    }
    rbp
}

unsafe fn wrmsr(msr: u32, value: u64) {
    let low = value as u32;
    let high = (value >> 32) as u32;
    asm!("wrmsr", in("ecx") msr, in("eax") low, in("edx") high, options(nomem, nostack));
}

unsafe fn rdmsr(msr: u32) -> u64 {
    let low: u32;
    let high: u32;
    asm!("rdmsr", in("ecx") msr, out("eax") low, out("edx") high, options(nomem, nostack));
    ((high as u64) << 32) | (low as u64)
}

/// Publish this CPU's executor record. Read back on every
/// `current_executor_ptr` call, so this must happen before the CPU touches
/// any lock or the scheduler.
pub fn bind_executor(executor: *const Executor) {
    unsafe { wrmsr(IA32_GS_BASE, executor as u64) }
}

pub fn current_executor_ptr() -> *const Executor {
    unsafe { rdmsr(IA32_GS_BASE) as *const Executor }
}

/// Saved callee context of a suspended task. Only the stack pointer lives
/// here; the callee-saved registers live on the task's stack.
#[derive(Debug)]
#[repr(C)]
pub struct Context {
    rsp: u64,
}

static_assertions::assert_eq_size!(Context, u64);

global_asm!(
    ".global __cascade_context_switch",
    "__cascade_context_switch:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, [rsi]",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

extern "C" {
    fn __cascade_context_switch(prev: *mut Context, next: *mut Context);
}

/// Switch from the context saved into `prev` to the one in `next`.
///
/// # Safety
/// `next` must hold a context produced by `new_task_context` or by an
/// earlier switch away from a running task, and its stack must be live.
pub unsafe fn context_switch(prev: *mut Context, next: *mut Context) {
    __cascade_context_switch(prev, next);
}

/// A context that is only ever switched *from* (the abandoned boot
/// context).
pub fn empty_context() -> Context {
    Context { rsp: 0 }
}

/// Lay out a fresh stack so the first switch into it "returns" to
/// `startup` with all callee-saved registers zeroed.
pub fn new_task_context(stack_top: VirtAddr, startup: extern "C" fn() -> !) -> Context {
    // Keep the platform ABI alignment: rsp % 16 == 8 at function entry.
    let mut top = stack_top.align_down(16).as_u64();

    unsafe {
        top -= 8;
        (top as *mut u64).write(startup as usize as u64);
        for _ in 0..6 {
            top -= 8;
            (top as *mut u64).write(0);
        }
    }

    Context { rsp: top }
}

pub mod paging {
    //! Minimal 4-level page table mapper working through the direct map.

    use bit_field::BitField;

    use crate::error::KernelError;
    use crate::memory::addr::{PhysAddr, PhysFrame, VirtAddr, VirtRange};
    use crate::memory::constants::PAGE_SIZE_BYTES;
    use crate::memory::paging::{CacheMode, Protection};
    use crate::memory::{phys, phys_to_virt};

    const ENTRY_COUNT: usize = 512;
    /// Index of the first higher-half top-level entry
    const KERNEL_FIRST_INDEX: usize = 256;

    const PRESENT: u64 = 1 << 0;
    const WRITABLE: u64 = 1 << 1;
    const USER: u64 = 1 << 2;
    const WRITE_THROUGH: u64 = 1 << 3;
    const NO_CACHE: u64 = 1 << 4;
    const NO_EXECUTE: u64 = 1 << 63;

    fn entry_addr(entry: u64) -> PhysAddr {
        PhysAddr::new(entry.get_bits(12..52) << 12)
    }

    fn leaf_flags(protection: Protection, cache: CacheMode) -> u64 {
        let mut flags = PRESENT;
        if protection.contains(Protection::WRITE) {
            flags |= WRITABLE;
        }
        if protection.contains(Protection::USER) {
            flags |= USER;
        }
        if !protection.contains(Protection::EXECUTE) {
            flags |= NO_EXECUTE;
        }
        match cache {
            CacheMode::WriteBack => {}
            CacheMode::WriteCombining => flags |= WRITE_THROUGH,
            CacheMode::Uncached => flags |= NO_CACHE | WRITE_THROUGH,
        }
        flags
    }

    fn table_index(addr: VirtAddr, level: usize) -> usize {
        ((addr.as_u64() >> 12 >> (9 * level)) & 0x1ff) as usize
    }

    unsafe fn table_slot(table: PhysAddr, index: usize) -> *mut u64 {
        let base: *mut u64 = phys_to_virt(table).as_mut_ptr();
        base.add(index)
    }

    #[inline]
    fn invalidate(addr: VirtAddr) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) addr.as_u64(), options(nostack));
        }
    }

    /// One hardware page table tree. All mutation goes through `&self`;
    /// the owning address space serializes access with its own lock.
    pub struct PageTable {
        root: PhysFrame,
    }

    impl PageTable {
        /// Wrap a zeroed root frame as an empty table.
        pub fn new(root: PhysFrame) -> Self {
            unsafe {
                core::ptr::write_bytes(
                    phys_to_virt(root.start_address()).as_mut_ptr::<u8>(),
                    0,
                    PAGE_SIZE_BYTES as usize,
                );
            }
            Self { root }
        }

        pub fn root_frame(&self) -> PhysFrame {
            self.root
        }

        /// Share the kernel's higher half with this table.
        pub fn copy_kernel_entries_from(&self, kernel: &PageTable) {
            for index in KERNEL_FIRST_INDEX..ENTRY_COUNT {
                unsafe {
                    let value = table_slot(kernel.root.start_address(), index).read();
                    table_slot(self.root.start_address(), index).write(value);
                }
            }
        }

        /// Walk one level down, allocating a new table when `create` is set.
        fn next_table(
            &self,
            table: PhysAddr,
            index: usize,
            create: bool,
        ) -> Result<Option<PhysAddr>, KernelError> {
            let slot = unsafe { table_slot(table, index) };
            let entry = unsafe { slot.read() };
            if entry & PRESENT != 0 {
                return Ok(Some(entry_addr(entry)));
            }
            if !create {
                return Ok(None);
            }

            let frame = phys::allocate()?;
            unsafe {
                core::ptr::write_bytes(
                    phys_to_virt(frame.start_address()).as_mut_ptr::<u8>(),
                    0,
                    PAGE_SIZE_BYTES as usize,
                );
                // Leaf entries restrict; intermediates stay permissive.
                slot.write(frame.start_address().as_u64() | PRESENT | WRITABLE | USER);
            }
            Ok(Some(frame.start_address()))
        }

        fn leaf_slot(&self, addr: VirtAddr, create: bool) -> Result<Option<*mut u64>, KernelError> {
            let mut table = self.root.start_address();
            for level in (1..=3).rev() {
                match self.next_table(table, table_index(addr, level), create)? {
                    Some(next) => table = next,
                    None => return Ok(None),
                }
            }
            Ok(Some(unsafe { table_slot(table, table_index(addr, 0)) }))
        }

        pub fn map(
            &self,
            range: VirtRange,
            phys_start: PhysAddr,
            protection: Protection,
            cache: CacheMode,
        ) -> Result<(), KernelError> {
            let flags = leaf_flags(protection, cache);
            for (i, page) in range.pages().enumerate() {
                let slot = self
                    .leaf_slot(page.start_address(), true)?
                    .ok_or(KernelError::Unexpected)?;
                unsafe {
                    if slot.read() & PRESENT != 0 {
                        return Err(KernelError::AlreadyMapped);
                    }
                    let frame = phys_start + (i as u64) * PAGE_SIZE_BYTES;
                    slot.write(frame.as_u64() | flags);
                }
            }
            Ok(())
        }

        pub fn update_protection(
            &self,
            addr: VirtAddr,
            protection: Protection,
        ) -> Result<(), KernelError> {
            let page = addr.align_down(PAGE_SIZE_BYTES);
            let slot = self
                .leaf_slot(page, false)?
                .ok_or(KernelError::NotInAnyMap)?;
            unsafe {
                let entry = slot.read();
                if entry & PRESENT == 0 {
                    return Err(KernelError::NotInAnyMap);
                }
                let addr_bits = entry_addr(entry).as_u64();
                // Preserve the cache configuration bits
                let cache_bits = entry & (WRITE_THROUGH | NO_CACHE);
                slot.write(
                    addr_bits | (leaf_flags(protection, CacheMode::WriteBack) | cache_bits),
                );
            }
            invalidate(page);
            Ok(())
        }

        /// Unmaps whatever subset of `range` is mapped and invalidates the
        /// local TLB for it. Cross-CPU shootdown is the caller's concern.
        pub fn unmap(&self, range: VirtRange) {
            for page in range.pages() {
                if let Ok(Some(slot)) = self.leaf_slot(page.start_address(), false) {
                    unsafe {
                        if slot.read() & PRESENT != 0 {
                            slot.write(0);
                            invalidate(page.start_address());
                        }
                    }
                }
            }
        }

        pub fn translate(&self, addr: VirtAddr) -> Option<(PhysAddr, Protection)> {
            let slot = self.leaf_slot(addr, false).ok().flatten()?;
            let entry = unsafe { slot.read() };
            if entry & PRESENT == 0 {
                return None;
            }
            let mut protection = Protection::READ;
            if entry & WRITABLE != 0 {
                protection |= Protection::WRITE;
            }
            if entry & NO_EXECUTE == 0 {
                protection |= Protection::EXECUTE;
            }
            if entry & USER != 0 {
                protection |= Protection::USER;
            }
            let offset = addr.as_u64() % PAGE_SIZE_BYTES;
            Some((entry_addr(entry) + offset, protection))
        }

        /// Load this table into the MMU.
        ///
        /// # Safety
        /// The table must map the currently executing code and stack.
        pub unsafe fn activate(&self) {
            core::arch::asm!(
                "mov cr3, {}",
                in(reg) self.root.start_address().as_u64(),
                options(nostack),
            );
        }

        /// Tear down the user half of the tree, returning every
        /// intermediate table frame to the allocator. Mapped leaf frames
        /// are owned by address-space entries and are not touched.
        pub fn release_user_tables(&self) {
            unsafe fn release_level(table: PhysAddr, level: usize) {
                for index in 0..ENTRY_COUNT {
                    let entry = table_slot(table, index).read();
                    if entry & PRESENT == 0 {
                        continue;
                    }
                    if level > 1 {
                        release_level(entry_addr(entry), level - 1);
                    }
                    if level > 0 {
                        phys::deallocate(PhysFrame::containing_address(entry_addr(entry)));
                    }
                }
            }

            for index in 0..KERNEL_FIRST_INDEX {
                unsafe {
                    let slot = table_slot(self.root.start_address(), index);
                    let entry = slot.read();
                    if entry & PRESENT != 0 {
                        release_level(entry_addr(entry), 2);
                        phys::deallocate(PhysFrame::containing_address(entry_addr(entry)));
                        slot.write(0);
                    }
                }
            }
        }
    }
}
