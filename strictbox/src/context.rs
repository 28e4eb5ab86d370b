//! Process-wide state of the sandbox.
//!
//! All of it lives in a single [`Context`], reached through [`with`]. The sandbox never runs on more than one thread,
//! so there is no lock; a re-entrant access is a bug and panics.

use core::cell::{Cell, UnsafeCell};

use crate::allocator::Allocator;
use crate::config;
use crate::intercept::{InitFn, MainFn};
use crate::platform::Platform;

/// The program's own entry points, as handed to `__libc_start_main`.
#[derive(Default)]
pub struct EntryPoints {
    pub init: Option<InitFn>,
    pub main: Option<MainFn>,
}

pub struct Context {
    /// The allocator, once the heap is provisioned.
    allocator: Option<Allocator>,
    pub entry_points: EntryPoints,
    /// Whether seccomp strict mode has been entered.
    pub restricted: bool,
}

impl Context {
    const fn new() -> Self {
        Context {
            allocator: None,
            entry_points: EntryPoints {
                init: None,
                main: None,
            },
            restricted: false,
        }
    }

    /// Returns the allocator, reserving the heap on first use.
    pub fn allocator<P: Platform>(&mut self) -> &mut Allocator {
        self.allocator.get_or_insert_with(|| {
            let size = config::heap_size();
            match P::reserve_heap(size) {
                Ok(heap) => Allocator::new(heap),
                Err(err) => P::fatal(err),
            }
        })
    }

    /// Returns the allocator, if the heap was already provisioned.
    pub fn provisioned(&self) -> Option<&Allocator> {
        self.allocator.as_ref()
    }
}

// ————————————————————————————————— Global ————————————————————————————————— //

/// A cell for state shared by the whole process.
struct Global<T> {
    value: UnsafeCell<T>,
    busy: Cell<bool>,
}

// SAFETY: the sandbox only supports single-threaded programs, the cell is never accessed concurrently.
unsafe impl<T> Sync for Global<T> {}

impl<T> Global<T> {
    const fn new(value: T) -> Self {
        Global {
            value: UnsafeCell::new(value),
            busy: Cell::new(false),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        assert!(!self.busy.replace(true), "Re-entrant access to the sandbox context");
        // SAFETY: the busy flag guarantees this is the only live reference.
        let result = f(unsafe { &mut *self.value.get() });
        self.busy.set(false);
        result
    }
}

static CONTEXT: Global<Context> = Global::new(Context::new());

/// Runs `f` with exclusive access to the process-wide context.
///
/// `f` must not call back into the sandbox: no allocation through the C allocator and no program code.
pub fn with<R>(f: impl FnOnce(&mut Context) -> R) -> R {
    CONTEXT.with(f)
}

/// Runs `f` with the allocator, provisioning the heap first if needed.
pub fn with_allocator<P: Platform, R>(f: impl FnOnce(&mut Allocator) -> R) -> R {
    with(|ctx| f(ctx.allocator::<P>()))
}

/// Reserves the heap now, if it was not already.
pub fn provision<P: Platform>() {
    with(|ctx| {
        ctx.allocator::<P>();
    });
}

/// Logs how much of the heap the program used.
pub fn log_heap_usage() {
    if log::max_level() < log::LevelFilter::Debug {
        return;
    }

    with(|ctx| {
        let Some(allocator) = ctx.provisioned() else {
            return;
        };
        let (live, count) = allocator
            .blocks()
            .filter(|block| block.allocated)
            .fold((0, 0), |(live, count), block| (live + block.size, count + 1));
        let heap = allocator.heap();
        log::debug!(
            "Heap break at {} of {} bytes, {live} bytes in {count} live block(s)",
            heap.brk(),
            heap.capacity()
        );
    });
}

/// Forgets all state, as in a fresh process. The heap, if any, is leaked.
#[cfg(test)]
pub fn reset() {
    with(|ctx| *ctx = Context::new());
}
