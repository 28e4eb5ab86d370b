//! The operating system and C runtime, as far as the sandbox is concerned.
//!
//! The startup sequence in [`intercept`][crate::intercept] and [`sequence`][crate::sequence] only talks to the
//! outside world through [`Platform`], whose functions are associated functions: they are reached from C callbacks
//! that carry no state.

use core::ffi::{c_int, c_void, CStr};
use core::mem;

use syscalls::{syscall, Sysno};

use crate::error::SetupError;
use crate::exit;
use crate::heap::Heap;
use crate::init_array::{self, Constructors};
use crate::intercept::StartMainFn;
use crate::stdio;

/// Shared object of the C runtime whose startup routine is wrapped.
pub const RUNTIME_LIBRARY: &CStr = c"libc.so.6";
/// The C runtime's process startup routine.
pub const START_MAIN: &CStr = c"__libc_start_main";

/// `SECCOMP_SET_MODE_STRICT`: only `read`, `write`, `exit` and `rt_sigreturn` remain allowed.
const SECCOMP_SET_MODE_STRICT: usize = 0;

pub trait Platform {
    /// Reserves the heap region.
    fn reserve_heap(size: usize) -> Result<Heap, SetupError>;

    /// Looks up the real `__libc_start_main`.
    fn resolve_start_main() -> Result<StartMainFn, SetupError>;

    /// Locates the constructors of the main executable.
    fn constructors() -> Constructors;

    /// Forces the lazy setup of `stdout` and `stderr`.
    fn emit_sentinels();

    /// Forces the lazy setup of `stdin`.
    fn prime_stdin();

    /// Irrevocably enters seccomp strict mode.
    fn enter_restricted_mode() -> Result<(), SetupError>;

    /// Terminates the process after a setup failure.
    fn fatal(err: SetupError) -> !;

    /// Terminates the process once restricted.
    fn exit(status: c_int) -> !;
}

/// Linux with glibc.
pub struct Glibc;

impl Platform for Glibc {
    fn reserve_heap(size: usize) -> Result<Heap, SetupError> {
        Heap::reserve(size).map_err(SetupError::HeapReservation)
    }

    fn resolve_start_main() -> Result<StartMainFn, SetupError> {
        // The library is opened explicitly, the lookup must not find the wrapper exported by this library.
        let handle = unsafe { libc::dlopen(RUNTIME_LIBRARY.as_ptr(), libc::RTLD_LOCAL | libc::RTLD_LAZY) };
        if handle.is_null() {
            return Err(SetupError::LibraryNotFound(RUNTIME_LIBRARY));
        }

        let symbol = unsafe { libc::dlsym(handle, START_MAIN.as_ptr()) };
        if symbol.is_null() {
            return Err(SetupError::SymbolNotFound(START_MAIN));
        }

        log::debug!("Resolved {START_MAIN:?} at {symbol:p}");
        // SAFETY: the symbol is glibc's `__libc_start_main`, whose signature is `StartMainFn`.
        Ok(unsafe { mem::transmute::<*mut c_void, StartMainFn>(symbol) })
    }

    fn constructors() -> Constructors {
        init_array::main_program()
    }

    fn emit_sentinels() {
        stdio::emit_sentinels();
    }

    fn prime_stdin() {
        stdio::prime_stdin();
    }

    fn enter_restricted_mode() -> Result<(), SetupError> {
        unsafe {
            syscall!(Sysno::seccomp, SECCOMP_SET_MODE_STRICT, 0, 0)
                .map(|_| ())
                .map_err(SetupError::RestrictedMode)
        }
    }

    fn fatal(err: SetupError) -> ! {
        log::error!("Failed to set up the sandbox: {err:?}");
        exit::exit(err.exit());
    }

    fn exit(status: c_int) -> ! {
        exit::restricted_exit(status);
    }
}

// —————————————————————————————— Test platform ————————————————————————————— //

/// A platform that records what the sandbox asks of it instead of doing it.
#[cfg(test)]
pub mod mock {
    use core::cell::{Cell, RefCell};
    use core::ffi::{c_char, c_int, c_void};
    use std::sync::mpsc::Sender;
    use std::thread;
    use std::vec::Vec;

    use super::*;
    use crate::intercept::{FiniFn, InitFn, MainFn};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Event {
        ReserveHeap,
        ResolveStartMain,
        Constructors,
        Sentinels,
        PrimeStdin,
        RestrictedMode,
        StartMain,
        ProgramInit,
        ProgramMain,
        Exit(c_int),
    }

    thread_local! {
        static EVENTS: RefCell<Vec<Event>> = const { RefCell::new(Vec::new()) };
        static REFUSE_RESTRICTED_MODE: Cell<bool> = const { Cell::new(false) };
        static EXIT_REPORT: RefCell<Option<Sender<Vec<Event>>>> = const { RefCell::new(None) };
    }

    pub fn record(event: Event) {
        EVENTS.with(|events| events.borrow_mut().push(event));
    }

    /// Returns the events recorded on this thread so far, and forgets them.
    pub fn take_events() -> Vec<Event> {
        EVENTS.with(|events| events.take())
    }

    /// Makes the next attempts to enter strict mode on this thread fail.
    pub fn refuse_restricted_mode(refuse: bool) {
        REFUSE_RESTRICTED_MODE.with(|refused| refused.set(refuse));
    }

    /// Sends the events of this thread to `report` when the program exits.
    ///
    /// Exiting parks the thread for good: the caller must run the program on a thread of its own.
    pub fn report_exit_to(report: Sender<Vec<Event>>) {
        EXIT_REPORT.with(|slot| *slot.borrow_mut() = Some(report));
    }

    pub struct Mock;

    impl Platform for Mock {
        fn reserve_heap(size: usize) -> Result<Heap, SetupError> {
            record(Event::ReserveHeap);
            Heap::reserve(size).map_err(SetupError::HeapReservation)
        }

        fn resolve_start_main() -> Result<StartMainFn, SetupError> {
            record(Event::ResolveStartMain);
            Ok(start_main)
        }

        fn constructors() -> Constructors {
            record(Event::Constructors);
            Constructors::NONE
        }

        fn emit_sentinels() {
            record(Event::Sentinels);
        }

        fn prime_stdin() {
            record(Event::PrimeStdin);
        }

        fn enter_restricted_mode() -> Result<(), SetupError> {
            if REFUSE_RESTRICTED_MODE.with(Cell::get) {
                return Err(SetupError::RestrictedMode(syscalls::Errno::EINVAL));
            }
            record(Event::RestrictedMode);
            Ok(())
        }

        fn fatal(err: SetupError) -> ! {
            panic!("Fatal setup error: {err:?}");
        }

        fn exit(status: c_int) -> ! {
            record(Event::Exit(status));
            if let Some(report) = EXIT_REPORT.with(|slot| slot.borrow_mut().take()) {
                let _ = report.send(take_events());
            }
            loop {
                thread::park();
            }
        }
    }

    /// Stands for glibc's `__libc_start_main`: runs the pre-init hook, then `main`.
    unsafe extern "C" fn start_main(
        main: MainFn,
        argc: c_int,
        argv: *mut *mut c_char,
        init: Option<InitFn>,
        _fini: Option<FiniFn>,
        _rtld_fini: Option<FiniFn>,
        _stack_end: *mut c_void,
    ) -> c_int {
        record(Event::StartMain);
        let envp = argv.wrapping_add(argc as usize + 1);
        if let Some(init) = init {
            init(argc, argv, envp);
        }
        main(argc, argv, envp)
    }

    pub unsafe extern "C" fn program_init(_: c_int, _: *mut *mut c_char, _: *mut *mut c_char) {
        record(Event::ProgramInit);
    }

    pub unsafe extern "C" fn program_main(argc: c_int, _: *mut *mut c_char, _: *mut *mut c_char) -> c_int {
        record(Event::ProgramMain);
        argc + 40
    }
}
