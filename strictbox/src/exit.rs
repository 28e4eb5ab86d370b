use core::ffi::c_int;

use rustix::runtime;
use syscalls::{syscall, Sysno};

use crate::stdio;

/// Exit statuses reserved for failures of the sandbox itself. See also [`exit`].
///
/// They are chosen outside of the range commonly used by programs so that a test harness can tell a sandbox failure
/// from the program's own status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Exit {
    /// The real `__libc_start_main` could not be resolved.
    SymbolResolution = 120,
    /// The kernel refused to enter seccomp strict mode.
    RestrictedMode = 121,
    /// A path that should never be taken was taken.
    Unreachable = 122,
    /// The heap region could not be reserved.
    HeapReservation = 123,
}

impl Exit {
    pub const fn status(self) -> c_int {
        self as c_int
    }
}

/// Exit immediately with the given status, using `exit_group`.
///
/// Only usable before seccomp strict mode is entered: afterwards the kernel kills the process on `exit_group`.
pub fn exit(status: Exit) -> ! {
    runtime::exit_group(status.status());
}

/// Flush `stdout` and `stderr`, then exit with the `exit` syscall, the only exit seccomp strict mode allows.
pub fn restricted_exit(status: c_int) -> ! {
    stdio::flush();

    loop {
        // The syscall only returns if it failed, in which case there is nothing better to do than trying again.
        let _ = unsafe { syscall!(Sysno::exit, status) };
    }
}
