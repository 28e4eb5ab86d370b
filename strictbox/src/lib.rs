//! # strictbox
//!
//! A library injected with `LD_PRELOAD` that runs unmodified, dynamically linked programs in seccomp strict mode.
//!
//! Strict mode only allows `read`, `write`, `exit` and `rt_sigreturn`. The library takes over the program's startup
//! to enter it right before the program's own code runs, and replaces glibc's allocator by one working from a region
//! reserved beforehand.

#![cfg_attr(not(test), no_std)]

mod allocator;
mod config;
mod context;
mod error;
mod exit;
#[cfg(not(test))]
mod ffi;
mod heap;
mod init_array;
mod intercept;
mod logging;
mod platform;
mod sequence;
mod stdio;

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use core::fmt::Write;

    let _ = writeln!(logging::Stderr, "[strictbox] {info}");
    // The program may already run in strict mode, where `exit_group` is fatal.
    exit::restricted_exit(exit::Exit::Unreachable.status());
}

/// `core` is built with unwinding and references the personality routine even when panics abort.
#[cfg(not(test))]
#[no_mangle]
extern "C" fn rust_eh_personality() {}
