//! # Configuration
//!
//! The sandbox is configured through the environment only, as it is injected into programs it knows nothing about.
//! Variables are read with `getenv`, which neither allocates nor performs syscalls.

use core::ffi::CStr;
use core::str::FromStr;

use log::LevelFilter;

/// Size of the heap region, in bytes.
pub const HEAP_SIZE_VAR: &CStr = c"STRICTBOX_HEAPSIZE";
/// Maximum level of the sandbox's own log messages.
pub const LOG_VAR: &CStr = c"STRICTBOX_LOG";

pub const DEFAULT_HEAP_SIZE: usize = 8 * 1024 * 1024;
pub const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Warn;

/// Heap size requested through the environment.
pub fn heap_size() -> usize {
    let Some(raw) = var(HEAP_SIZE_VAR) else {
        return DEFAULT_HEAP_SIZE;
    };

    parse_heap_size(raw).unwrap_or_else(|| {
        log::warn!("Invalid {HEAP_SIZE_VAR:?} {raw:?}, using {DEFAULT_HEAP_SIZE} bytes");
        DEFAULT_HEAP_SIZE
    })
}

/// Log level requested through the environment.
pub fn log_level() -> LevelFilter {
    var(LOG_VAR)
        .and_then(parse_log_level)
        .unwrap_or(DEFAULT_LOG_LEVEL)
}

/// Parses a decimal byte count.
pub fn parse_heap_size(raw: &CStr) -> Option<usize> {
    raw.to_str().ok()?.trim().parse().ok()
}

/// Parses a level name such as `warn` or `TRACE`.
pub fn parse_log_level(raw: &CStr) -> Option<LevelFilter> {
    LevelFilter::from_str(raw.to_str().ok()?.trim()).ok()
}

fn var(name: &CStr) -> Option<&'static CStr> {
    // SAFETY: `name` is nul-terminated. The returned string lives in the environment block, which is never modified
    // by the sandbox.
    unsafe {
        let value = libc::getenv(name.as_ptr());
        (!value.is_null()).then(|| CStr::from_ptr(value))
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
