//! C symbols interposed on glibc.
//!
//! Every allocation of the sandboxed program, and of glibc itself, goes through these: once in strict mode glibc's
//! allocator would need `brk` or `mmap`.

use core::ffi::{c_char, c_int, c_void};
use core::fmt::Write;
use core::ptr::{self, NonNull};

use crate::allocator::Allocator;
use crate::context;
use crate::error::AllocError;
use crate::exit;
use crate::intercept::{self, FiniFn, InitFn, MainFn};
use crate::logging::Stderr;
use crate::platform::Glibc;

fn with_allocator<R>(f: impl FnOnce(&mut Allocator) -> R) -> R {
    context::with_allocator::<Glibc, R>(f)
}

fn set_errno(code: c_int) {
    unsafe { *libc::__errno_location() = code };
}

/// Converts an allocation result to what C callers expect: a pointer, or null with `errno` set.
fn into_raw(result: Result<NonNull<u8>, AllocError>) -> *mut c_void {
    match result {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(err) => {
            log::debug!("Allocation failed: {err:?}");
            set_errno(libc::ENOMEM);
            ptr::null_mut()
        }
    }
}

// ——————————————————————————————— Allocation ——————————————————————————————— //

#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    into_raw(with_allocator(|alloc| alloc.allocate(size)))
}

#[no_mangle]
pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    into_raw(with_allocator(|alloc| alloc.zero_allocate(count, size)))
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    match with_allocator(|alloc| alloc.resize(ptr, size)) {
        Ok(Some(new)) => new.as_ptr().cast(),
        Ok(None) => ptr::null_mut(),
        Err(AllocError::InvalidPointer(_)) => {
            let _ = writeln!(Stderr, "Invalid realloc at {ptr:p}");
            ptr::null_mut()
        }
        Err(err) => into_raw(Err(err)),
    }
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    // Always reported, whatever the log level.
    if with_allocator(|alloc| alloc.free(ptr)).is_err() {
        let _ = writeln!(Stderr, "Invalid free at {ptr:p}");
    }
}

#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    with_allocator(|alloc| alloc.usable_size(ptr)).unwrap_or(0)
}

#[no_mangle]
pub unsafe extern "C" fn posix_memalign(out: *mut *mut c_void, align: usize, size: usize) -> c_int {
    if !align.is_power_of_two() || align % core::mem::size_of::<*mut c_void>() != 0 {
        return libc::EINVAL;
    }

    match with_allocator(|alloc| alloc.allocate_aligned(align, size)) {
        Ok(ptr) => {
            *out = ptr.as_ptr().cast();
            0
        }
        Err(AllocError::InvalidAlignment(_)) => libc::EINVAL,
        Err(_) => libc::ENOMEM,
    }
}

#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(align: usize, size: usize) -> *mut c_void {
    match with_allocator(|alloc| alloc.allocate_aligned(align, size)) {
        Err(AllocError::InvalidAlignment(_)) => {
            set_errno(libc::EINVAL);
            ptr::null_mut()
        }
        result => into_raw(result),
    }
}

#[no_mangle]
pub unsafe extern "C" fn memalign(align: usize, size: usize) -> *mut c_void {
    aligned_alloc(align, size)
}

#[no_mangle]
pub unsafe extern "C" fn sbrk(increment: isize) -> *mut c_void {
    match with_allocator(|alloc| alloc.sbrk(increment)) {
        Ok(brk) => brk.as_ptr().cast(),
        Err(_) => {
            set_errno(libc::ENOMEM);
            usize::MAX as *mut c_void
        }
    }
}

// ————————————————————————————————— Startup ———————————————————————————————— //

#[no_mangle]
pub unsafe extern "C" fn exit(status: c_int) -> ! {
    context::log_heap_usage();
    exit::restricted_exit(status)
}

#[no_mangle]
pub unsafe extern "C" fn __libc_start_main(
    main: MainFn,
    argc: c_int,
    argv: *mut *mut c_char,
    init: Option<InitFn>,
    fini: Option<FiniFn>,
    rtld_fini: Option<FiniFn>,
    stack_end: *mut c_void,
) -> c_int {
    intercept::start_main::<Glibc>(main, argc, argv, init, fini, rtld_fini, stack_end)
}
