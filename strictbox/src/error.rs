use core::ffi::CStr;

use crate::exit::Exit;

#[derive(Debug)]
/// Unrecoverable failures while setting up the sandbox, before the program's code runs.
pub enum SetupError {
    HeapReservation(rustix::io::Errno),
    LibraryNotFound(&'static CStr),
    SymbolNotFound(&'static CStr),
    RestrictedMode(syscalls::Errno),
}

impl SetupError {
    /// The exit status reserved for this failure site.
    pub fn exit(&self) -> Exit {
        match self {
            SetupError::HeapReservation(_) => Exit::HeapReservation,
            SetupError::LibraryNotFound(_) | SetupError::SymbolNotFound(_) => Exit::SymbolResolution,
            SetupError::RestrictedMode(_) => Exit::RestrictedMode,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Errors reported by the allocator. None of them are fatal.
pub enum AllocError {
    /// The heap region is exhausted.
    OutOfMemory,
    /// The address does not designate a live allocation.
    InvalidPointer(usize),
    /// The requested alignment is not a power of two.
    InvalidAlignment(usize),
}
