//! C standard streams, as seen by the sandboxed program.
//!
//! glibc sets up a stream lazily: the first read or write calls `fstat` on the underlying descriptor, which seccomp
//! strict mode forbids. The functions of this module force that setup while syscalls are still allowed.

use core::ffi::CStr;

use libc::FILE;
use rustix::fs::{self, OFlags};

extern "C" {
    static mut stdin: *mut FILE;
    static mut stdout: *mut FILE;
    static mut stderr: *mut FILE;
}

/// Line written to both `stdout` and `stderr` right before entering strict mode.
///
/// Tools comparing the output of a sandboxed program with its expected output must strip it.
pub const SENTINEL: &CStr = c"<<entering SECCOMP mode>>\n";

/// Prints [`SENTINEL`] on `stdout` then `stderr`, flushing each stream.
///
/// An empty write does not reach the lazy setup, hence the visible output.
pub fn emit_sentinels() {
    unsafe {
        for stream in [stdout, stderr] {
            libc::fputs(SENTINEL.as_ptr(), stream);
            libc::fflush(stream);
        }
    }
}

/// Reads one character from `stdin` without blocking and pushes it back.
///
/// The program later reads its input from the same position as if nothing happened.
pub fn prime_stdin() {
    let fd = unsafe { rustix::stdio::stdin() };
    let flags = match fs::fcntl_getfl(fd) {
        Ok(flags) => flags,
        Err(err) => {
            log::warn!("Could not read stdin flags ({err:?}), not priming stdin");
            return;
        }
    };
    if let Err(err) = fs::fcntl_setfl(fd, flags | OFlags::NONBLOCK) {
        log::warn!("Could not make stdin non-blocking ({err:?}), not priming stdin");
        return;
    }

    unsafe {
        let c = libc::fgetc(stdin);
        if c == libc::EOF {
            // Either the end of input or a read that would have blocked, which leaves the error indicator set.
            libc::clearerr(stdin);
        } else {
            libc::ungetc(c, stdin);
        }
    }

    if let Err(err) = fs::fcntl_setfl(fd, flags) {
        log::warn!("Could not restore stdin flags: {err:?}");
    }
}

/// Flushes the buffered content of `stdout` and `stderr`.
pub fn flush() {
    unsafe {
        libc::fflush(stdout);
        libc::fflush(stderr);
    }
}
