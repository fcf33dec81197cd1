//! Host adapter: runs the kernel core as an ordinary process for tests.
//!
//! Interrupt state and the executor binding are thread locals, so every
//! test thread acts as its own CPU. Context switching is intentionally
//! unavailable here; tests drive the scheduler through its queue and
//! state-machine operations instead.

use core::cell::Cell;
use core::ptr;

use crate::executor::Executor;
use crate::memory::addr::VirtAddr;

std::thread_local! {
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
    static CURRENT_EXECUTOR: Cell<*const Executor> = const { Cell::new(ptr::null()) };
}

pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.with(|c| c.get())
}

pub fn disable_interrupts() {
    INTERRUPTS_ENABLED.with(|c| c.set(false));
}

pub fn enable_interrupts() {
    INTERRUPTS_ENABLED.with(|c| c.set(true));
}

#[inline]
pub fn spin_hint() {
    core::hint::spin_loop();
}

/// On hardware this sleeps until the next interrupt; here it just yields
/// the hosting thread.
pub fn wait_for_interrupt() {
    std::thread::yield_now();
}

pub fn halt() -> ! {
    panic!("halt() called on the host adapter");
}

/// The host panic path belongs to std; nothing walks frames here.
pub fn frame_pointer() -> u64 {
    0
}

pub fn bind_executor(executor: *const Executor) {
    CURRENT_EXECUTOR.with(|c| c.set(executor));
}

pub fn current_executor_ptr() -> *const Executor {
    CURRENT_EXECUTOR.with(|c| c.get())
}

/// Saved callee context. Never actually switched to on the host.
#[derive(Debug)]
pub struct Context {
    #[allow(dead_code)]
    stack_top: u64,
    #[allow(dead_code)]
    startup: extern "C" fn() -> !,
}

pub fn new_task_context(stack_top: VirtAddr, startup: extern "C" fn() -> !) -> Context {
    Context {
        stack_top: stack_top.as_u64(),
        startup,
    }
}

/// A context that is only ever switched *from* (the abandoned boot
/// context).
pub fn empty_context() -> Context {
    extern "C" fn never_started() -> ! {
        unreachable!("empty context started");
    }
    Context {
        stack_top: 0,
        startup: never_started,
    }
}

/// # Safety
/// Not callable on the host; tests exercise scheduling decisions without
/// transferring control.
pub unsafe fn context_switch(_prev: *mut Context, _next: *mut Context) {
    unreachable!("context_switch is not available on the host adapter");
}

pub mod paging {
    //! Mapping recorder standing in for a hardware page table.

    use hashbrown::HashMap;
    use spin::Mutex;

    use crate::error::KernelError;
    use crate::memory::addr::{PhysAddr, PhysFrame, VirtAddr, VirtRange};
    use crate::memory::constants::PAGE_SIZE_BYTES;
    use crate::memory::paging::{CacheMode, Protection};

    #[derive(Debug, Clone, Copy)]
    struct Mapping {
        frame: PhysFrame,
        protection: Protection,
        #[allow(dead_code)]
        cache: CacheMode,
    }

    pub struct PageTable {
        root: PhysFrame,
        mappings: Mutex<HashMap<u64, Mapping>>,
    }

    impl PageTable {
        pub fn new(root: PhysFrame) -> Self {
            Self {
                root,
                mappings: Mutex::new(HashMap::new()),
            }
        }

        pub fn root_frame(&self) -> PhysFrame {
            self.root
        }

        pub fn copy_kernel_entries_from(&self, _kernel: &PageTable) {
            // The recorder has no shared upper half; nothing to copy.
        }

        pub fn map(
            &self,
            range: VirtRange,
            phys_start: PhysAddr,
            protection: Protection,
            cache: CacheMode,
        ) -> Result<(), KernelError> {
            let mut mappings = self.mappings.lock();
            for (i, page) in range.pages().enumerate() {
                let key = page.start_address().as_u64() / PAGE_SIZE_BYTES;
                if mappings.contains_key(&key) {
                    return Err(KernelError::AlreadyMapped);
                }
                mappings.insert(
                    key,
                    Mapping {
                        frame: PhysFrame::containing_address(
                            phys_start + (i as u64) * PAGE_SIZE_BYTES,
                        ),
                        protection,
                        cache,
                    },
                );
            }
            Ok(())
        }

        /// Change protection on an already-mapped page.
        pub fn update_protection(
            &self,
            addr: VirtAddr,
            protection: Protection,
        ) -> Result<(), KernelError> {
            let mut mappings = self.mappings.lock();
            let key = addr.align_down(PAGE_SIZE_BYTES).as_u64() / PAGE_SIZE_BYTES;
            match mappings.get_mut(&key) {
                Some(m) => {
                    m.protection = protection;
                    Ok(())
                }
                None => Err(KernelError::NotInAnyMap),
            }
        }

        /// Unmaps whatever subset of `range` is mapped. TLB invalidation is
        /// a no-op here.
        pub fn unmap(&self, range: VirtRange) {
            let mut mappings = self.mappings.lock();
            for page in range.pages() {
                let key = page.start_address().as_u64() / PAGE_SIZE_BYTES;
                mappings.remove(&key);
            }
        }

        pub fn translate(&self, addr: VirtAddr) -> Option<(PhysAddr, Protection)> {
            let mappings = self.mappings.lock();
            let key = addr.align_down(PAGE_SIZE_BYTES).as_u64() / PAGE_SIZE_BYTES;
            mappings.get(&key).map(|m| {
                let offset = addr.as_u64() % PAGE_SIZE_BYTES;
                (m.frame.start_address() + offset, m.protection)
            })
        }

        pub fn mapped_page_count(&self) -> usize {
            self.mappings.lock().len()
        }

        /// Forget every lower-half mapping; the recorder has no real
        /// table frames to free.
        pub fn release_user_tables(&self) {
            self.mappings.lock().clear();
        }

        /// # Safety
        /// Loading a page table is meaningless on the host.
        pub unsafe fn activate(&self) {}
    }
}
