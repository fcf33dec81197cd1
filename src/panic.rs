//! Kernel panic policy.
//!
//! A panic disables interrupts, prints through the output fanout, walks
//! the frame-pointer chain, and halts this executor. A panic inside the
//! panic path prints one minimal line and halts unconditionally.

use core::fmt::Write;
use core::panic::PanicInfo;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch;
use crate::executor;

/// Panics in flight across all executors; anything past the first takes
/// the minimal path.
static PANIC_DEPTH: AtomicUsize = AtomicUsize::new(0);

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    arch::disable_interrupts();

    if PANIC_DEPTH.fetch_add(1, Ordering::AcqRel) > 0 {
        let mut writer = crate::output::writer();
        let _ = writeln!(writer, "!! nested panic, halting");
        arch::halt();
    }

    let mut writer = crate::output::writer();
    let _ = writeln!(writer, "");
    crate::output::splat(b'=', 72);
    let _ = writeln!(writer, "");
    match executor::current() {
        Some(executor) => {
            let _ = writeln!(writer, "KERNEL PANIC on executor {}:", executor.id());
        }
        None => {
            let _ = writeln!(writer, "KERNEL PANIC during early boot:");
        }
    }
    let _ = writeln!(writer, "  {}", info);

    let _ = writeln!(writer, "call stack (frame pointers):");
    let mut frame = arch::frame_pointer();
    for depth in 0..32 {
        // A frame is [saved rbp][return address]; stop at the boot
        // sentinel or anything implausible.
        if frame == 0 || frame % 8 != 0 {
            break;
        }
        let return_address = unsafe { ((frame + 8) as *const u64).read_volatile() };
        if return_address == 0 {
            break;
        }
        let _ = writeln!(writer, "  #{:02} {:#018x}", depth, return_address);
        frame = unsafe { (frame as *const u64).read_volatile() };
    }

    arch::halt()
}
