// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-size-class cache.
//!
//! A `Cache` hands out and reclaims aligned blocks of one fixed size. The
//! handle itself is a cheap clone over shared state: the size-class layout,
//! the mutex-guarded global reservoir of empty slabs, the record of OS
//! mappings for teardown, and the optional constructor/destructor
//! callbacks. The fast paths never touch the shared state; each calling
//! thread is lazily attached a [`Magazine`] that fronts the cache, and the
//! mutex is taken only when a thread's local lists run dry, when a thread
//! flushes hoarded empty slabs, and at teardown.
//!
//! Frees dispatch on the owner tag of the enclosing slab: the owning thread
//! pushes to the slab's local list, any other thread pushes to the slab's
//! lock-free remote inbox and returns immediately. A freeing thread may race
//! with the owner handing the slab back to the reservoir; the push still
//! lands on the inbox, and whoever adopts the slab next drains it before
//! allocating from it.
//!
//! The mappings a cache accumulates are returned to the OS when the last
//! handle drops. Thread magazines hold a handle, so a thread-exit flush
//! never touches unmapped memory; in exchange, a destroyed cache's memory
//! lingers until every thread that touched it has exited.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::info;

use crate::frontends::{AllocStats, Magazine};
use crate::slab::{SizeClass, Slab, SlabFlags, SlabList};
use crate::sources::{Mapping, MemorySource, MmapSource};
use crate::util::mmap;

/// A constructor or destructor callback, invoked with a pointer to one
/// object's storage.
pub type ObjectCallback = fn(NonNull<u8>);

/// Configuration for a [`Cache`].
///
/// Callback dispatch follows the original contract: with only a constructor
/// set, it runs once over every object when a slab is initialized
/// (batch-construct mode); with both set, the constructor runs at each
/// allocation and the destructor at each free; with only a destructor set,
/// it runs at each free.
pub struct CacheBuilder {
    object_size: usize,
    ctor: Option<ObjectCallback>,
    dtor: Option<ObjectCallback>,
}

impl CacheBuilder {
    /// Start configuring a cache for objects of `object_size` bytes.
    ///
    /// The size is rounded up to a power of two of at least 16 bytes; the
    /// rounded size is also the alignment of every block the cache issues.
    pub fn new(object_size: usize) -> CacheBuilder {
        assert!(object_size > 0, "object size must be positive");
        CacheBuilder {
            object_size,
            ctor: None,
            dtor: None,
        }
    }

    /// Install a constructor callback.
    ///
    /// With no destructor installed, the cache runs in batch-construct
    /// mode: the constructor is applied once to every object when a slab is
    /// initialized, not on each allocation. The free list is then threaded
    /// through the objects themselves, which overwrites the first
    /// pointer-sized word of each constructed object with a free-list link
    /// that allocation does not restore. Batch-constructed state is
    /// therefore guaranteed only past the first word; a constructor that
    /// needs the full object width on every allocation must be paired with
    /// a destructor (per-op mode), where construction runs after the slot
    /// is popped.
    pub fn ctor(mut self, f: ObjectCallback) -> CacheBuilder {
        self.ctor = Some(f);
        self
    }

    pub fn dtor(mut self, f: ObjectCallback) -> CacheBuilder {
        self.dtor = Some(f);
        self
    }

    pub fn build(self) -> Cache {
        let class = SizeClass::compute(self.object_size);
        info!(
            "created cache: {} byte objects, {} per {} byte slab, {} colors",
            class.object_size, class.object_count, class.slab_bytes, class.colors
        );
        Cache {
            shared: Arc::new(CacheShared {
                class,
                source: MmapSource::new(class.slab_bytes),
                ctor: self.ctor,
                dtor: self.dtor,
                color_next: AtomicUsize::new(0),
                pool: Mutex::new(GlobalPool {
                    empty: SlabList::new(),
                    mappings: Vec::new(),
                }),
            }),
        }
    }
}

/// The reservoir of empty slabs available to any thread, plus the mappings
/// owned by this cache. One mutex guards both.
pub(crate) struct GlobalPool {
    pub(crate) empty: SlabList,
    pub(crate) mappings: Vec<Mapping>,
}

/// State shared by every handle and magazine of one cache.
pub(crate) struct CacheShared {
    pub(crate) class: SizeClass,
    source: MmapSource,
    ctor: Option<ObjectCallback>,
    dtor: Option<ObjectCallback>,
    color_next: AtomicUsize,
    pub(crate) pool: Mutex<GlobalPool>,
}

// The raw pointers inside the pool are only touched under its mutex or by
// the owning thread.
unsafe impl Send for CacheShared {}
unsafe impl Sync for CacheShared {}

impl CacheShared {
    /// Take one slab from the reservoir, mapping a fresh chunk first if it
    /// is dry, and tag it with `owner`. One mutex acquisition.
    pub(crate) fn adopt_from_global(&self, owner: *mut ()) -> NonNull<Slab> {
        let mut pool = self.pool.lock().unwrap();
        let slab = match pool.empty.pop_front() {
            Some(slab) => slab,
            None => {
                self.carve_chunk(&mut pool);
                pool.empty
                    .pop_front()
                    .expect("freshly mapped chunk produced no slabs")
            }
        };
        unsafe {
            slab.as_ref().set_owner(owner);
        }
        slab
    }

    /// Map one chunk, initialize every slab in it, and push them all onto
    /// the reservoir. Called with the pool lock held.
    fn carve_chunk(&self, pool: &mut GlobalPool) {
        let chunk = self.source.carve(self.class.slabs_per_chunk);
        for i in 0..chunk.count {
            let base = unsafe {
                NonNull::new_unchecked(chunk.slabs.as_ptr().add(i * self.class.slab_bytes))
            };
            let color = self.color_next.fetch_add(1, Ordering::Relaxed) % self.class.colors;
            let flags = SlabFlags {
                perfectly_aligned: chunk.perfectly_aligned,
                is_mmap_front: i == 0,
            };
            unsafe {
                let slab = Slab::init_header(base, &self.class, color, flags);
                if let (Some(ctor), None) = (self.ctor, self.dtor) {
                    // batch-construct mode; threading the free list below
                    // overwrites the first word of every constructed object
                    // (see CacheBuilder::ctor)
                    let mem = slab.as_ref().mem();
                    for j in 0..self.class.object_count {
                        ctor(NonNull::new_unchecked(mem.add(j * self.class.object_size)));
                    }
                }
                Slab::thread_free_list(slab, &self.class);
                pool.empty.push_front(slab);
            }
        }
        pool.mappings.push(chunk.mapping);
    }
}

impl Drop for CacheShared {
    fn drop(&mut self) {
        let pool = self.pool.get_mut().unwrap_or_else(|p| p.into_inner());
        info!(
            "tearing down cache of {} byte objects: {} mappings",
            self.class.object_size,
            pool.mappings.len()
        );
        for mapping in pool.mappings.drain(..) {
            unsafe {
                mmap::unmap(mapping.base, mapping.len);
            }
        }
    }
}

/// A cache of fixed-size objects.
///
/// Cloning is cheap and every clone refers to the same cache. `Cache` is
/// `Send + Sync`; any number of threads may allocate and free
/// simultaneously.
#[derive(Clone)]
pub struct Cache {
    shared: Arc<CacheShared>,
}

impl Cache {
    /// A cache for `object_size` byte objects with no callbacks.
    pub fn new(object_size: usize) -> Cache {
        CacheBuilder::new(object_size).build()
    }

    pub fn builder(object_size: usize) -> CacheBuilder {
        CacheBuilder::new(object_size)
    }

    /// The rounded object size. Every block the cache issues is this many
    /// bytes and aligned to it.
    pub fn object_size(&self) -> usize {
        self.shared.class.object_size
    }

    /// Objects carved from each slab.
    pub fn objects_per_slab(&self) -> usize {
        self.shared.class.object_count
    }

    pub fn slab_bytes(&self) -> usize {
        self.shared.class.slab_bytes
    }

    /// Slabs requested from the OS per chunk.
    pub fn slabs_per_chunk(&self) -> usize {
        self.shared.class.slabs_per_chunk
    }

    /// Number of chunks this cache has mapped so far.
    pub fn mapped_chunks(&self) -> usize {
        self.shared.pool.lock().unwrap().mappings.len()
    }

    /// Empty slabs currently hoarded by the calling thread; test support.
    #[cfg(test)]
    pub(crate) fn thread_empty_slabs(&self) -> usize {
        self.with_magazine(|mag| mag.empty_len())
    }

    /// Slabs currently in the global reservoir; test support.
    #[cfg(test)]
    pub(crate) fn global_empty_slabs(&self) -> usize {
        self.shared.pool.lock().unwrap().empty.len()
    }

    /// Allocate one block of `object_size` bytes.
    ///
    /// The content is undefined unless a constructor ran. In
    /// batch-construct mode the first pointer-sized word carries a
    /// free-list link rather than constructed state (see
    /// [`CacheBuilder::ctor`]). In per-op mode a panicking constructor
    /// returns the slot to the free list and decrements the slab's
    /// outstanding count before the panic resumes.
    pub fn alloc(&self) -> NonNull<u8> {
        let obj = self.with_magazine(|mag| mag.alloc());
        if let (Some(ctor), Some(_)) = (self.shared.ctor, self.shared.dtor) {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| ctor(obj))) {
                let slab = Slab::find(obj, self.shared.class.slab_bytes);
                self.with_magazine(|mag| unsafe { mag.free_local(slab, obj) });
                panic::resume_unwind(payload);
            }
        }
        obj
    }

    /// Return a block to the cache.
    ///
    /// If the calling thread owns the enclosing slab this is a local push;
    /// otherwise the block lands on the slab's remote inbox and the call
    /// returns without blocking.
    ///
    /// # Safety
    /// `obj` must have been produced by `alloc` on this cache and not
    /// already freed.
    pub unsafe fn free(&self, obj: NonNull<u8>) {
        if let Some(dtor) = self.shared.dtor {
            dtor(obj);
        }
        let slab = Slab::find(obj, self.shared.class.slab_bytes);
        self.with_magazine(|mag| unsafe {
            if slab.as_ref().owner() == mag.tag() {
                mag.free_local(slab, obj);
            } else {
                mag.stats.remote_frees += 1;
                slab.as_ref().push_remote(obj);
            }
        })
    }

    /// A snapshot of the calling thread's event counters for this cache.
    pub fn thread_stats(&self) -> AllocStats {
        self.with_magazine(|mag| mag.stats)
    }

    /// Run `f` with the calling thread's magazine, attaching one on first
    /// use. User callbacks are never invoked under the table borrow.
    fn with_magazine<R>(&self, f: impl FnOnce(&mut Magazine) -> R) -> R {
        MAGAZINES.with(|table| {
            let mut table = table.borrow_mut();
            f(table.get_or_attach(&self.shared))
        })
    }
}

/// The calling thread's magazines, one per cache it has touched, keyed by
/// cache identity. Dropped at thread exit, which flushes every magazine
/// back to its cache's reservoir.
struct MagazineTable {
    entries: Vec<(usize, Box<Magazine>)>,
}

impl MagazineTable {
    fn get_or_attach(&mut self, shared: &Arc<CacheShared>) -> &mut Magazine {
        let key = Arc::as_ptr(shared) as usize;
        if let Some(pos) = self.entries.iter().position(|&(k, _)| k == key) {
            return &mut self.entries[pos].1;
        }
        self.entries.push((key, Box::new(Magazine::new(shared.clone()))));
        &mut self.entries.last_mut().unwrap().1
    }
}

thread_local! {
    static MAGAZINES: RefCell<MagazineTable> = RefCell::new(MagazineTable {
        entries: Vec::new(),
    });
}
