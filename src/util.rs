// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Some basic utilities used throughout the allocator code.

pub mod mmap {
    //! A thin wrapper around the system's page-mapping primitive.
    //!
    //! The rest of the crate goes through `map`/`unmap` exclusively. `map`
    //! aborts the process on failure: there is no recoverable error path for
    //! running out of address space in this design.
    use std::ptr::{self, NonNull};

    /// The smallest granularity at which the OS hands out mappings.
    pub const PAGE_SIZE: usize = 4096;

    pub fn map(size: usize) -> NonNull<u8> {
        fallible_map(size).expect("mmap should not fail")
    }

    pub fn fallible_map(size: usize) -> Option<NonNull<u8>> {
        unsafe {
            let mem = libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if mem == libc::MAP_FAILED {
                None
            } else {
                NonNull::new(mem as *mut u8)
            }
        }
    }

    pub unsafe fn unmap(p: NonNull<u8>, len: usize) {
        let _res = libc::munmap(p.as_ptr() as *mut libc::c_void, len);
        debug_assert_eq!(_res, 0, "munmap failed");
    }
}

/// Round `n` up to the next multiple of `align`. `align` must be a power of
/// two.
#[inline]
pub fn round_up(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_basic() {
        assert_eq!(round_up(0, 64), 0);
        assert_eq!(round_up(1, 64), 64);
        assert_eq!(round_up(64, 64), 64);
        assert_eq!(round_up(65, 64), 128);
        assert_eq!(round_up(56, 8192), 8192);
    }

    #[test]
    fn map_unmap() {
        let p = mmap::map(mmap::PAGE_SIZE * 4);
        unsafe {
            // fresh anonymous pages read as zero
            assert_eq!(*p.as_ptr(), 0);
            *p.as_ptr() = 0xAB;
            assert_eq!(*p.as_ptr(), 0xAB);
            mmap::unmap(p, mmap::PAGE_SIZE * 4);
        }
    }
}
