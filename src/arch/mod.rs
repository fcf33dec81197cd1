//! Architecture adapters.
//!
//! Everything the rest of the kernel needs from the hardware goes through
//! this module, and nothing else in the tree names an instruction or a
//! register. Each adapter exports the same surface:
//!
//! - interrupt control: `interrupts_enabled`, `disable_interrupts`,
//!   `enable_interrupts`
//! - CPU hints: `spin_hint`, `wait_for_interrupt`, `halt`
//! - per-CPU executor binding: `bind_executor`, `current_executor_ptr`
//! - context switching: `Context`, `context_switch`, `new_task_context`
//! - paging: `paging::PageTable` (see `memory::paging` for the contract)
//!
//! Selection is a compile-time choice. Test builds always use the host
//! adapter so the core is exercised without hardware.

cfg_if::cfg_if! {
    if #[cfg(test)] {
        mod host;
        pub use self::host::*;
    } else if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::*;
    } else {
        compile_error!("no architecture adapter for this target");
    }
}
