//! Kernel logger: `log` crate front end over the output fanout.

use core::fmt::Write;

use log::{Metadata, Record};

struct SystemLogger;

/// Everything at or above this level reaches the output sinks.
pub const LEVEL_OUTPUT: log::Level = log::Level::Debug;

impl log::Log for SystemLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= LEVEL_OUTPUT
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut writer = crate::output::writer();
        let _ = writeln!(
            writer,
            "{:40} {:5}  {}",
            record.target(),
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: SystemLogger = SystemLogger;

pub fn enable() {
    log::set_logger(&LOGGER).expect("logger installed twice");
    log::set_max_level(log::LevelFilter::Trace);
}
