//! Output sink registry and fanout writer.
//!
//! Drivers (UART, framebuffer console) implement [`Output`] and register
//! themselves; the core only ever writes through the fanout, under a
//! ticket spinlock so concurrent log lines do not interleave.

use arrayvec::ArrayVec;
use core::fmt;

use crate::error::KernelError;
use crate::memory::addr::VirtAddr;
use crate::sync::TicketLock;

/// Upper bound on registered sinks
pub const MAX_OUTPUTS: usize = 8;

/// One output device. Implementations keep their own state and must be
/// callable with interrupts disabled.
pub trait Output: Send + Sync {
    fn write(&self, s: &str);

    /// Write `byte` `count` times; devices with hardware repeat can
    /// shortcut this.
    fn splat(&self, byte: u8, count: usize) {
        for _ in 0..count {
            self.write(core::str::from_utf8(core::slice::from_ref(&byte)).unwrap_or("?"));
        }
    }

    /// The direct map moved; re-derive any MMIO pointers from the new
    /// base.
    fn remap(&self, new_direct_map_base: VirtAddr) {
        let _ = new_direct_map_base;
    }
}

static SINKS: TicketLock<ArrayVec<&'static dyn Output, MAX_OUTPUTS>> =
    TicketLock::new(ArrayVec::new_const());

pub fn register(sink: &'static dyn Output) -> Result<(), KernelError> {
    let mut sinks = SINKS.lock();
    if sinks.is_full() {
        return Err(KernelError::BadArgument);
    }
    sinks.push(sink);
    Ok(())
}

/// Tell every sink the direct map moved.
pub fn remap_all(new_direct_map_base: VirtAddr) {
    for sink in SINKS.lock().iter() {
        sink.remap(new_direct_map_base);
    }
}

/// A `core::fmt::Write` that fans out to every registered sink.
pub struct Writer;

pub fn writer() -> Writer {
    Writer
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for sink in SINKS.lock().iter() {
            sink.write(s);
        }
        Ok(())
    }
}

/// Repeat `byte` across every sink (separator lines, padding).
pub fn splat(byte: u8, count: usize) {
    for sink in SINKS.lock().iter() {
        sink.splat(byte, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt::Write as _;

    struct CaptureSink {
        captured: spin::Mutex<alloc::string::String>,
    }

    impl Output for CaptureSink {
        fn write(&self, s: &str) {
            self.captured.lock().push_str(s);
        }
    }

    #[test]
    fn fanout_reaches_registered_sinks() {
        static SINK: CaptureSink = CaptureSink {
            captured: spin::Mutex::new(alloc::string::String::new()),
        };
        register(&SINK).unwrap();

        write!(writer(), "hello {}", 7).unwrap();
        splat(b'-', 3);

        let captured = SINK.captured.lock();
        assert!(captured.contains("hello 7"));
        assert!(captured.contains("---"));
    }
}
