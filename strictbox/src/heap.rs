//! Fixed-size heap region and its break pointer.
//!
//! The whole heap is a single anonymous mapping reserved once at startup. After that, growing the heap is pure
//! address arithmetic: [`Heap::extend`] moves a break offset inside the already-owned region and never issues a
//! syscall, which is what makes allocation possible once seccomp strict mode is active.
//!
//! Everything living in the heap is addressed by its byte offset from the base of the region. Typed reads and
//! writes go through [`Heap::read`] and [`Heap::write`], which refuse out-of-bounds or misaligned offsets instead of
//! dereferencing whatever address they are handed.

use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

use rustix::io;
use rustix::mm::{self, MapFlags, ProtFlags};

use crate::error::AllocError;

// ————————————————————————————————— Heap —————————————————————————————————— //

/// A reserved memory region with a break pointer.
pub struct Heap {
    base: NonNull<u8>,
    capacity: usize,
    brk: usize,
}

impl Heap {
    /// Reserves a private, anonymous, read-write region of `capacity` bytes.
    ///
    /// This is the only syscall the heap ever performs.
    pub fn reserve(capacity: usize) -> io::Result<Heap> {
        let prot = ProtFlags::READ | ProtFlags::WRITE;
        let flags = MapFlags::PRIVATE;
        let base = unsafe { mm::mmap_anonymous(ptr::null_mut(), capacity, prot, flags)? };
        let base = NonNull::new(base.cast::<u8>()).ok_or(io::Errno::NOMEM)?;

        log::debug!("Reserved {capacity} bytes of heap at {base:p}");

        Ok(Heap {
            base,
            capacity,
            brk: 0,
        })
    }

    /// Total size of the region, in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes the break has been advanced by.
    pub fn brk(&self) -> usize {
        self.brk
    }

    /// Moves the break by `increment` bytes and returns the previous break offset.
    ///
    /// Fails without changing anything if the new break would fall outside of the region.
    pub fn extend(&mut self, increment: isize) -> Result<usize, AllocError> {
        let new_brk = if increment >= 0 {
            self.brk.checked_add(increment.unsigned_abs())
        } else {
            self.brk.checked_sub(increment.unsigned_abs())
        };

        match new_brk {
            Some(new_brk) if new_brk <= self.capacity => {
                let previous = self.brk;
                self.brk = new_brk;
                Ok(previous)
            }
            _ => Err(AllocError::OutOfMemory),
        }
    }

    /// Address of the byte at `offset`. `offset` may be one past the break.
    pub fn addr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.capacity);
        self.base.as_ptr().wrapping_add(offset)
    }

    /// Offset of `addr` within the used part of the heap, if it lies there.
    pub fn offset_of(&self, addr: *const u8) -> Option<usize> {
        let offset = (addr as usize).checked_sub(self.base.as_ptr() as usize)?;
        (offset < self.brk).then_some(offset)
    }

    /// Reads a `T` stored at `offset`.
    ///
    /// Returns `None` if the value would not lie entirely below the break or if `offset` is not suitably aligned.
    pub fn read<T: Copy>(&self, offset: usize) -> Option<T> {
        self.check::<T>(offset)?;
        // SAFETY: `check` ensures the value lies inside the mapping, below the break, and is aligned. Any bit pattern
        // is accepted by the plain integer structs stored in the heap.
        Some(unsafe { ptr::read(self.addr(offset).cast::<T>()) })
    }

    /// Writes a `T` at `offset`. Same bounds as [`Heap::read`].
    pub fn write<T: Copy>(&mut self, offset: usize, value: T) -> Option<()> {
        self.check::<T>(offset)?;
        // SAFETY: see `read`.
        unsafe { ptr::write(self.addr(offset).cast::<T>(), value) };
        Some(())
    }

    fn check<T>(&self, offset: usize) -> Option<()> {
        let end = offset.checked_add(size_of::<T>())?;
        let aligned = (self.base.as_ptr() as usize + offset) % align_of::<T>() == 0;
        (end <= self.brk && aligned).then_some(())
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
