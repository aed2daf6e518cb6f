// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Low-level data-structures for getting more memory from the system.

use std::ptr::{self, NonNull};

use log::trace;

use crate::util::mmap;

/// One OS mapping owned by a cache, recorded for teardown.
///
/// `base` and `len` describe the mapping exactly as the OS returned it, so
/// teardown can hand the whole thing back even when the slabs inside it were
/// realigned.
#[derive(Debug)]
pub struct Mapping {
    pub base: NonNull<u8>,
    pub len: usize,
}

/// A chunk of slab-aligned memory carved from a fresh mapping.
pub struct Chunk {
    /// Base of the first slab; aligned to the slab size.
    pub slabs: NonNull<u8>,
    /// Number of whole slabs the chunk holds.
    pub count: usize,
    /// Whether the mapping itself came back slab-aligned.
    pub perfectly_aligned: bool,
    /// The raw mapping, for the cache's teardown record.
    pub mapping: Mapping,
}

/// A generator of chunks of slab-sized memory.
pub trait MemorySource {
    fn new(slab_bytes: usize) -> Self;
    /// The unit of memory this source carves.
    fn slab_bytes(&self) -> usize;
    /// Map a fresh chunk holding at least `nslabs` slabs, each aligned to
    /// `slab_bytes`. Aborts the process if the OS refuses.
    fn carve(&self, nslabs: usize) -> Chunk;
}

/// A `MemorySource` that calls mmap.
///
/// mmap only promises page alignment, so for slab sizes above a page the
/// source over-allocates by one slab and rounds the base up to the next slab
/// boundary, wasting the prefix. The original base is recorded in the
/// returned `Mapping` and additionally stashed in the word just below the
/// first slab's header.
#[derive(Copy, Clone)]
pub struct MmapSource {
    slab_bytes: usize,
}

impl MemorySource for MmapSource {
    fn new(slab_bytes: usize) -> MmapSource {
        assert!(slab_bytes.is_power_of_two());
        assert!(slab_bytes >= mmap::PAGE_SIZE);
        MmapSource { slab_bytes }
    }

    fn slab_bytes(&self) -> usize {
        self.slab_bytes
    }

    fn carve(&self, nslabs: usize) -> Chunk {
        trace!("carve({}) of {} byte slabs", nslabs, self.slab_bytes);
        debug_assert!(nslabs > 0);
        let target = nslabs * self.slab_bytes;
        // one extra slab of slack guarantees `nslabs` whole slabs survive
        // realignment
        let req = if self.slab_bytes > mmap::PAGE_SIZE {
            target + self.slab_bytes
        } else {
            target
        };
        let base = mmap::map(req);
        let base_num = base.as_ptr() as usize;
        let aligned_num = (base_num + self.slab_bytes - 1) & !(self.slab_bytes - 1);
        let perfectly_aligned = aligned_num == base_num;
        // cap at the request so every chunk contributes the same number of
        // slabs; an aligned over-allocation just leaves its tail unused
        let count = ((req - (aligned_num - base_num)) / self.slab_bytes).min(nslabs);
        debug_assert_eq!(count, nslabs);
        let slabs = unsafe { NonNull::new_unchecked(aligned_num as *mut u8) };
        if !perfectly_aligned {
            // the wasted prefix is at least a word; remember the raw base
            // just below the first header as well as in the mapping record
            unsafe {
                ptr::write(
                    slabs.as_ptr().cast::<*mut u8>().sub(1),
                    base.as_ptr(),
                );
            }
        }
        Chunk {
            slabs,
            count,
            perfectly_aligned,
            mapping: Mapping { base, len: req },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carve_page_sized_slabs() {
        let source = MmapSource::new(4096);
        assert_eq!(source.slab_bytes(), 4096);
        let chunk = source.carve(16);
        assert_eq!(chunk.count, 16);
        assert!(chunk.perfectly_aligned);
        assert_eq!(chunk.slabs.as_ptr() as usize % 4096, 0);
        unsafe {
            mmap::unmap(chunk.mapping.base, chunk.mapping.len);
        }
    }

    #[test]
    fn carve_large_slabs_realigns() {
        let source = MmapSource::new(1 << 16);
        let chunk = source.carve(4);
        assert_eq!(chunk.count, 4);
        assert_eq!(chunk.slabs.as_ptr() as usize % (1 << 16), 0);
        // every slab fits inside the raw mapping
        let end = chunk.mapping.base.as_ptr() as usize + chunk.mapping.len;
        let last = chunk.slabs.as_ptr() as usize + chunk.count * (1 << 16);
        assert!(last <= end);
        unsafe {
            mmap::unmap(chunk.mapping.base, chunk.mapping.len);
        }
    }
}
