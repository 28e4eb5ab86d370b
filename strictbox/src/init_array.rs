//! Constructors of the main executable.
//!
//! Since glibc 2.34, `crt1.o` no longer passes an init function to `__libc_start_main`: glibc runs the executable's
//! `DT_INIT` and `DT_INIT_ARRAY` itself, but only when no init function is given. The sandbox always gives one, so
//! it must run them in glibc's place.

use core::ffi::{c_char, c_int, c_void};
use core::{mem, slice};

use goblin::elf64::dynamic::{Dyn, DT_INIT, DT_INIT_ARRAY, DT_INIT_ARRAYSZ, DT_NULL};
use goblin::elf64::program_header::PT_DYNAMIC;

/// Signature glibc calls constructors with.
pub type Constructor = unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char);

/// Addresses of the constructors of an object, relocated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Constructors {
    init: Option<usize>,
    array: usize,
    len: usize,
}

impl Constructors {
    pub const NONE: Self = Constructors {
        init: None,
        array: 0,
        len: 0,
    };

    /// Collects the constructors listed in a dynamic section. `bias` is the load address of the object.
    pub fn from_dynamic(entries: &[Dyn], bias: usize) -> Self {
        let mut ctors = Self::NONE;

        for entry in entries.iter().take_while(|entry| entry.d_tag != DT_NULL) {
            let value = entry.d_val as usize;
            match entry.d_tag {
                DT_INIT => ctors.init = Some(bias + value),
                DT_INIT_ARRAY => ctors.array = bias + value,
                DT_INIT_ARRAYSZ => ctors.len = value / mem::size_of::<usize>(),
                _ => {}
            }
        }
        if ctors.array == 0 {
            ctors.len = 0;
        }

        ctors
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.init.is_none() && self.len == 0
    }

    /// Calls `DT_INIT`, then every `DT_INIT_ARRAY` entry in order.
    ///
    /// # Safety
    /// The addresses must be those of functions of type [`Constructor`], in a loaded object.
    pub unsafe fn run(&self, argc: c_int, argv: *mut *mut c_char, envp: *mut *mut c_char) {
        if let Some(init) = self.init {
            log::trace!("Calling DT_INIT at 0x{init:x}");
            let init: Constructor = mem::transmute(init);
            init(argc, argv, envp);
        }

        if self.len == 0 {
            return;
        }
        for &addr in slice::from_raw_parts(self.array as *const usize, self.len) {
            // Placeholders left by some toolchains.
            if addr == 0 || addr == usize::MAX {
                continue;
            }

            log::trace!("Calling constructor at 0x{addr:x}");
            let ctor: Constructor = mem::transmute(addr);
            ctor(argc, argv, envp);
        }
    }
}

/// Locates the constructors of the main executable.
///
/// `dl_iterate_phdr` takes the loader's lock: this must run before entering strict mode.
pub fn main_program() -> Constructors {
    let mut ctors = Constructors::NONE;
    unsafe {
        libc::dl_iterate_phdr(Some(visit_main_program), &mut ctors as *mut Constructors as *mut c_void);
    }
    ctors
}

unsafe extern "C" fn visit_main_program(
    info: *mut libc::dl_phdr_info,
    _size: usize,
    data: *mut c_void,
) -> c_int {
    let info = &*info;
    let ctors = &mut *(data as *mut Constructors);
    let bias = info.dlpi_addr as usize;
    let phdrs = slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);

    if let Some(dynamic) = phdrs.iter().find(|phdr| phdr.p_type == PT_DYNAMIC) {
        let start = (bias + dynamic.p_vaddr as usize) as *const Dyn;
        let mut len = 0;
        while (*start.add(len)).d_tag != DT_NULL {
            len += 1;
        }
        *ctors = Constructors::from_dynamic(slice::from_raw_parts(start, len), bias);
    }

    // The main executable is always reported first.
    1
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::vec::Vec;

    use super::*;

    static CALLS: Mutex<Vec<u32>> = Mutex::new(Vec::new());

    unsafe extern "C" fn first(argc: c_int, _: *mut *mut c_char, _: *mut *mut c_char) {
        CALLS.lock().unwrap().push(argc as u32);
    }

    unsafe extern "C" fn second(argc: c_int, _: *mut *mut c_char, _: *mut *mut c_char) {
        CALLS.lock().unwrap().push(argc as u32 + 1);
    }

    unsafe extern "C" fn third(argc: c_int, _: *mut *mut c_char, _: *mut *mut c_char) {
        CALLS.lock().unwrap().push(argc as u32 + 2);
    }

    fn dyn_entry(d_tag: u64, d_val: u64) -> Dyn {
        Dyn { d_tag, d_val }
    }

    #[test]
    fn dynamic_section_is_relocated() {
        let entries = [
            dyn_entry(DT_INIT, 0x1000),
            dyn_entry(DT_INIT_ARRAY, 0x3df0),
            dyn_entry(DT_INIT_ARRAYSZ, 16),
            dyn_entry(DT_NULL, 0),
            dyn_entry(DT_INIT, 0xdead),
        ];

        let ctors = Constructors::from_dynamic(&entries, 0x5555_0000);
        assert_eq!(ctors.init, Some(0x5555_1000));
        assert_eq!(ctors.array, 0x5555_3df0);
        assert_eq!(ctors.len, 2);
    }

    #[test]
    fn missing_entries_mean_no_constructors() {
        let ctors = Constructors::from_dynamic(&[dyn_entry(DT_INIT_ARRAYSZ, 8)], 0x400000);
        assert!(ctors.is_empty());
        assert_eq!(ctors, Constructors::NONE);
    }

    #[test]
    fn init_runs_before_the_array_in_order() {
        let array = [second as usize, 0, third as usize];
        let entries = [
            dyn_entry(DT_INIT, first as usize as u64),
            dyn_entry(DT_INIT_ARRAY, array.as_ptr() as u64),
            dyn_entry(DT_INIT_ARRAYSZ, mem::size_of_val(&array) as u64),
        ];

        let ctors = Constructors::from_dynamic(&entries, 0);
        unsafe { ctors.run(10, core::ptr::null_mut(), core::ptr::null_mut()) };

        assert_eq!(*CALLS.lock().unwrap(), [10, 11, 12]);
    }

    #[test]
    fn main_program_is_found() {
        // The test harness is an executable of its own; whatever it holds, the lookup must not fail.
        let ctors = main_program();
        assert!(ctors.len < 1 << 16);
    }
}
