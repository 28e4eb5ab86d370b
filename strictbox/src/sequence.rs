//! Switch into seccomp strict mode, right before the program's first own instruction.

use core::ffi::{c_char, c_int};

use crate::error::SetupError;
use crate::init_array::Constructors;
use crate::intercept::InitFn;
use crate::platform::Platform;

/// What the program runs before `main`.
#[derive(Debug, Clone, Copy)]
pub enum PreInit {
    /// The init function handed to `__libc_start_main` by older C runtimes.
    Legacy(InitFn),
    /// The executable's own constructors, which glibc skips when given an init function.
    Constructors(Constructors),
}

impl PreInit {
    /// Picks the program's pre-init hook.
    ///
    /// Without a legacy init function the constructors are located right away, as that may take locks.
    pub fn locate<P: Platform>(init: Option<InitFn>) -> Self {
        match init {
            Some(init) => PreInit::Legacy(init),
            None => PreInit::Constructors(P::constructors()),
        }
    }

    /// # Safety
    /// Runs arbitrary program code, with the arguments glibc would pass.
    pub unsafe fn call(self, argc: c_int, argv: *mut *mut c_char, envp: *mut *mut c_char) {
        match self {
            PreInit::Legacy(init) => init(argc, argv, envp),
            PreInit::Constructors(ctors) => ctors.run(argc, argv, envp),
        }
    }
}

/// Prepares the standard streams, then enters strict mode.
///
/// Each step must complete before the next one: stdio setup needs syscalls that strict mode forbids.
pub fn enter_restricted_mode<P: Platform>() -> Result<(), SetupError> {
    P::emit_sentinels();
    P::prime_stdin();
    P::enter_restricted_mode()?;

    log::debug!("Running in seccomp strict mode");
    Ok(())
}

// ————————————————————————————————— Tests —————————————————————————————————— //
