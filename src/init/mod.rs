//! Staged bring-up.
//!
//! Stage 1 runs once on the boot CPU with the boot shim's data. Stage 2
//! runs on every executor as it comes online. Stage 3 is the rendezvous:
//! the first executor to arrive spawns the `init-stage-4` task, waits for
//! the rest, and releases the barrier; everyone then enters the
//! scheduler. Stage 4 runs as an ordinary kernel task.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch;
use crate::boot_info::BootInfo;
use crate::executor::{self, ExecutorId};
use crate::memory::addr::{VirtAddr, VirtRange};
use crate::multitasking::{self, cleanup, scheduler, Priority};
use crate::{memory, syslog};

/// Top half of the canonical address space; the kernel lives here. The
/// last page is left off so the range end stays representable.
const KERNEL_RANGE: VirtRange = VirtRange::new(
    VirtAddr::new(0xffff_8000_0000_0000),
    0x0000_8000_0000_0000 - crate::memory::constants::PAGE_SIZE_BYTES,
);

/// Rendezvous point at the end of stage 3.
struct StageBarrier {
    expected: AtomicUsize,
    arrived: AtomicUsize,
    released: AtomicBool,
}

impl StageBarrier {
    const fn new() -> Self {
        Self {
            expected: AtomicUsize::new(0),
            arrived: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        }
    }

    fn set_expected(&self, count: usize) {
        self.expected.store(count, Ordering::Release);
    }

    /// Returns whether the caller was first.
    fn arrive(&self) -> bool {
        self.arrived.fetch_add(1, Ordering::AcqRel) == 0
    }

    fn wait_all_arrived(&self) {
        while self.arrived.load(Ordering::Acquire) < self.expected.load(Ordering::Acquire) {
            arch::spin_hint();
        }
    }

    fn release(&self) {
        self.released.store(true, Ordering::Release);
    }

    fn wait_released(&self) {
        while !self.released.load(Ordering::Acquire) {
            arch::spin_hint();
        }
    }
}

static STAGE3_BARRIER: StageBarrier = StageBarrier::new();

/// Boot-CPU entry: run every stage and never return.
pub fn boot_entry(boot_info: &'static BootInfo) -> ! {
    stage1(boot_info);
    start_secondary_executors(boot_info);
    stage2(ExecutorId::BOOTSTRAP);
    stage3()
}

/// Entry for executors started by the bootloader's SMP facility.
pub extern "C" fn secondary_entry(executor_id: u32) -> ! {
    stage2(ExecutorId::new(executor_id));
    stage3()
}

/// Release every parked secondary processor into `secondary_entry`. They
/// meet the boot CPU again at the stage-3 barrier.
fn start_secondary_executors(boot_info: &BootInfo) {
    for (executor_id, descriptor) in boot_info.processors.iter().enumerate() {
        if descriptor.bootstrap {
            continue;
        }
        log::debug!(
            "Waking processor {} as executor {}",
            descriptor.processor_id,
            executor_id
        );
        (descriptor.start)(secondary_entry);
    }
}

/// One-time system construction on the boot CPU.
pub fn stage1(boot_info: &'static BootInfo) {
    executor::bind_bootstrap_early();
    syslog::enable();
    log::info!("CascadeOS core: stage 1");

    memory::init(boot_info);
    memory::address_space::init_kernel_space(KERNEL_RANGE)
        .expect("cannot build the kernel address space");

    let executor_count = boot_info.processors.len().max(1);
    executor::init_executors(executor_count);
    STAGE3_BARRIER.set_expected(executor_count);

    let (free_bytes, totals) = memory::phys::stats();
    log::info!(
        "Stage 1 done: {} executors, {} MiB free of {} MiB",
        executor_count,
        free_bytes / (1024 * 1024),
        totals.total / (1024 * 1024)
    );
}

/// Per-executor bring-up: bind the CPU and load the kernel page table.
pub fn stage2(executor_id: ExecutorId) {
    executor::bind(executor_id);
    if let Some(kernel_space) = memory::address_space::kernel_space() {
        unsafe { kernel_space.activate() };
    }
    log::debug!("Executor {}: stage 2 done", executor_id);
}

/// Rendezvous, then drop into the scheduler. Never returns.
pub fn stage3() -> ! {
    let first = STAGE3_BARRIER.arrive();
    if first {
        multitasking::create_kernel_task("init-stage-4", Priority::NormalKernel, stage4_main, 0)
            .expect("cannot spawn init-stage-4");
        STAGE3_BARRIER.wait_all_arrived();
        STAGE3_BARRIER.release();
    } else {
        STAGE3_BARRIER.wait_released();
    }

    scheduler::start()
}

/// Runs as the first scheduled task: background services and the final
/// boot report.
fn stage4_main(_arg: usize) {
    cleanup::spawn_services();

    let (free_bytes, _) = memory::phys::stats();
    log::info!(
        "Stage 4: services up, {} kernel tasks, {} MiB free",
        multitasking::kernel_task_count(),
        free_bytes / (1024 * 1024)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_releases_only_after_everyone_arrives() {
        static BARRIER: StageBarrier = StageBarrier::new();
        BARRIER.set_expected(3);

        let firsts = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..3 {
                scope.spawn(|| {
                    if BARRIER.arrive() {
                        firsts.fetch_add(1, Ordering::Relaxed);
                        BARRIER.wait_all_arrived();
                        BARRIER.release();
                    } else {
                        BARRIER.wait_released();
                    }
                });
            }
        });

        assert_eq!(firsts.load(Ordering::Relaxed), 1);
        assert!(BARRIER.released.load(Ordering::Acquire));
    }
}
