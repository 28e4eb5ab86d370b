//! Logging backend usable inside the sandbox.
//!
//! Messages are formatted on the stack and written straight to file descriptor 2 with a single `write` syscall per
//! fragment: no allocation and no stdio buffering, so logging works before and after seccomp strict mode and from
//! within the allocator itself.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Metadata, Record};
use rustix::{io, stdio};

// ———————————————————————————————— Stderr —————————————————————————————————— //

/// Unbuffered standard error stream.
pub struct Stderr;

impl fmt::Write for Stderr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let stderr = unsafe { stdio::stderr() };
        let mut bytes = s.as_bytes();
        while !bytes.is_empty() {
            match io::write(stderr, bytes) {
                Ok(0) | Err(_) => return Err(fmt::Error),
                Ok(n) => bytes = &bytes[n..],
            }
        }
        Ok(())
    }
}

// ————————————————————————————————— Logger ————————————————————————————————— //

struct Logger;

static LOGGER: Logger = Logger;
static IS_INITIALIZED: AtomicBool = AtomicBool::new(false);

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        use fmt::Write;
        let _ = writeln!(Stderr, "[strictbox] [{}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

/// Initializes the global logger with a given [`LevelFilter`].
pub fn init(level: LevelFilter) {
    match IS_INITIALIZED.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(_) => {
            if log::set_logger(&LOGGER).is_ok() {
                log::set_max_level(level);
            }
        }
        Err(_) => {
            log::warn!("Logger is already initialized, skipping init");
        }
    };
}
