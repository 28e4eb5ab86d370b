//! Replacement of glibc's process startup routine.
//!
//! glibc's `__libc_start_main` runs the program's initializers then `main`. The replacement hands the real routine
//! two wrappers instead, so that strict mode is entered after glibc's own setup but before any program code.

use core::ffi::{c_char, c_int, c_void};

use crate::config;
use crate::context;
use crate::exit::Exit;
use crate::logging;
use crate::platform::Platform;
use crate::sequence::{self, PreInit};

pub type MainFn = unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char) -> c_int;
pub type InitFn = unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char);
pub type FiniFn = unsafe extern "C" fn();

/// Signature of glibc's `__libc_start_main`.
pub type StartMainFn = unsafe extern "C" fn(
    MainFn,
    c_int,
    *mut *mut c_char,
    Option<InitFn>,
    Option<FiniFn>,
    Option<FiniFn>,
    *mut c_void,
) -> c_int;

/// Takes over the program's startup, then hands control to the real `__libc_start_main`.
///
/// # Safety
/// Must be called with the arguments the loader passes to `__libc_start_main`, once.
pub unsafe fn start_main<P: Platform>(
    main: MainFn,
    argc: c_int,
    argv: *mut *mut c_char,
    init: Option<InitFn>,
    fini: Option<FiniFn>,
    rtld_fini: Option<FiniFn>,
    stack_end: *mut c_void,
) -> c_int {
    logging::init(config::log_level());

    context::with(|ctx| {
        ctx.entry_points.init = init;
        ctx.entry_points.main = Some(main);
    });
    context::provision::<P>();

    let real_start_main = match P::resolve_start_main() {
        Ok(start_main) => start_main,
        Err(err) => P::fatal(err),
    };

    log::debug!("Starting program with {argc} argument(s)");
    real_start_main(
        wrapper_main::<P>,
        argc,
        argv,
        Some(wrapper_init::<P>),
        fini,
        rtld_fini,
        stack_end,
    )
}

/// Pre-init hook given to glibc: enters strict mode, then runs the program's initializers.
unsafe extern "C" fn wrapper_init<P: Platform>(argc: c_int, argv: *mut *mut c_char, envp: *mut *mut c_char) {
    let (init, restricted) = context::with(|ctx| (ctx.entry_points.init.take(), ctx.restricted));
    if restricted {
        log::warn!("Pre-init hook called twice, ignoring");
        return;
    }

    let pre_init = PreInit::locate::<P>(init);
    if let Err(err) = sequence::enter_restricted_mode::<P>() {
        P::fatal(err);
    }
    context::with(|ctx| ctx.restricted = true);

    pre_init.call(argc, argv, envp);
}

/// `main` given to glibc: runs the program's `main` and exits with its status.
unsafe extern "C" fn wrapper_main<P: Platform>(
    argc: c_int,
    argv: *mut *mut c_char,
    envp: *mut *mut c_char,
) -> c_int {
    match run_main(argc, argv, envp) {
        Some(status) => {
            context::log_heap_usage();
            P::exit(status)
        }
        None => {
            log::error!("No main function to run");
            P::exit(Exit::Unreachable.status())
        }
    }
}

/// Runs the saved `main`, which can only happen once.
unsafe fn run_main(argc: c_int, argv: *mut *mut c_char, envp: *mut *mut c_char) -> Option<c_int> {
    let main = context::with(|ctx| ctx.entry_points.main.take())?;
    Some(main(argc, argv, envp))
}

// ————————————————————————————————— Tests —————————————————————————————————— //
