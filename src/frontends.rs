// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-thread frontends over the shared slab infrastructure.
//!
//! A `Magazine` is the thread-specific state a cache attaches to every
//! thread that touches it: one *active* slab that services the fast path,
//! plus partial, full, and empty lists that partition every other slab the
//! thread owns. All of it is strictly thread-local; the only synchronized
//! operations a magazine performs are draining remote-free inboxes and
//! taking the cache-wide mutex when its local lists run dry.
//!
//! An allocation walks the states in order: pop from the active slab; park
//! an exhausted active slab on the full list and promote an empty slab; then
//! a partial slab; then scavenge the full list for slabs whose remote inbox
//! has refilled them; and finally fall back to the global reservoir, mapping
//! a fresh chunk if the reservoir is dry too. Scavenging is rate-limited:
//! after a sweep finds nothing, the next `SCAVENGE_COOLDOWN` allocations
//! that reach the scavenge stage skip it.
//!
//! Frees from the owning thread push onto the slab's local list and migrate
//! the slab between lists as its population changes. A thread that
//! accumulates more than `MAX_LOCAL_EMPTY_SLABS` empty slabs returns the
//! oldest half to the global reservoir, which is the only way memory leaves
//! a running thread.
//!
//! When the thread exits, the magazine's destructor hands every owned slab
//! back to the global reservoir with its owner tag cleared. Inboxes are not
//! drained at that point; whoever adopts the slab next drains them.

use std::ptr::{self, NonNull};
use std::sync::Arc;

use log::trace;

use crate::cache::CacheShared;
use crate::slab::{Slab, SlabList};

/// Empty slabs a thread may hoard before flushing half to the global pool.
pub const MAX_LOCAL_EMPTY_SLABS: usize = 16;

/// How many full-list entries one scavenge sweep inspects.
pub const SCAVENGE_WINDOW: usize = 64;

/// Allocations that skip scavenging after a failed sweep.
pub const SCAVENGE_COOLDOWN: u32 = 64;

/// Per-thread event counters, in the spirit of a tracing build but cheap
/// enough to keep on unconditionally.
#[derive(Copy, Clone, Debug, Default)]
pub struct AllocStats {
    pub local_frees: u64,
    pub remote_frees: u64,
    pub scavenge_attempts: u64,
    pub scavenge_hits: u64,
    pub global_fetches: u64,
}

/// The thread-local front end of one cache.
pub struct Magazine {
    shared: Arc<CacheShared>,
    active: Option<NonNull<Slab>>,
    partial: SlabList,
    full: SlabList,
    empty: SlabList,
    scavenge_cooldown: u32,
    pub stats: AllocStats,
}

impl Magazine {
    pub fn new(shared: Arc<CacheShared>) -> Magazine {
        Magazine {
            shared,
            active: None,
            partial: SlabList::new(),
            full: SlabList::new(),
            empty: SlabList::new(),
            scavenge_cooldown: 0,
            stats: AllocStats::default(),
        }
    }

    /// The tag written into the `owner` field of every slab this magazine
    /// holds. Magazines live in a box for exactly this reason: the address
    /// is stable for the life of the thread.
    #[inline]
    pub fn tag(&self) -> *mut () {
        self as *const Magazine as *mut ()
    }

    /// Allocate one object.
    ///
    /// Never fails: the terminal state maps a fresh chunk, and mapping
    /// failure aborts the process.
    pub fn alloc(&mut self) -> NonNull<u8> {
        unsafe {
            if let Some(mut active) = self.active {
                if let Some(obj) = active.as_mut().pop_local() {
                    return obj;
                }
                // exhausted; park it where scavenging can find it
                self.active = None;
                self.full.push_front(active);
            }

            if let Some(mut slab) = self.empty.pop_front() {
                self.active = Some(slab);
                return slab
                    .as_mut()
                    .pop_local()
                    .expect("empty slab with no free objects");
            }

            while let Some(mut slab) = self.partial.pop_front() {
                if slab.as_ref().has_local() || slab.as_mut().reclaim_remote() > 0 {
                    self.active = Some(slab);
                    return slab
                        .as_mut()
                        .pop_local()
                        .expect("partial slab with no free objects");
                }
                self.full.push_front(slab);
            }

            if let Some(obj) = self.scavenge() {
                return obj;
            }

            loop {
                let mut slab = self.shared.adopt_from_global(self.tag());
                self.stats.global_fetches += 1;
                slab.as_mut().reclaim_remote();
                if let Some(obj) = slab.as_mut().pop_local() {
                    self.active = Some(slab);
                    return obj;
                }
                // an orphaned slab whose objects are all still outstanding;
                // keep it and ask the reservoir again
                self.full.push_front(slab);
            }
        }
    }

    /// Sweep the full list for a slab whose remote inbox has refilled it.
    unsafe fn scavenge(&mut self) -> Option<NonNull<u8>> {
        if self.scavenge_cooldown > 0 {
            self.scavenge_cooldown -= 1;
            return None;
        }
        if self.full.is_empty() {
            return None;
        }
        self.stats.scavenge_attempts += 1;
        // walk from the back: the oldest parked slabs have had the longest
        // to accumulate remote frees, and freshly exhausted slabs pile up at
        // the front
        let mut found = None;
        for slab in self.full.iter_rev().take(SCAVENGE_WINDOW) {
            if slab.as_ref().has_remote() {
                found = Some(slab);
                break;
            }
        }
        match found {
            Some(mut slab) => {
                self.full.remove(slab);
                let reclaimed = slab.as_mut().reclaim_remote();
                debug_assert!(reclaimed > 0);
                self.stats.scavenge_hits += 1;
                self.active = Some(slab);
                Some(
                    slab.as_mut()
                        .pop_local()
                        .expect("scavenged slab with no free objects"),
                )
            }
            None => {
                self.scavenge_cooldown = SCAVENGE_COOLDOWN;
                None
            }
        }
    }

    /// Free an object belonging to a slab this magazine owns.
    ///
    /// # Safety
    /// `slab` must be owned by this magazine and `obj` must be an
    /// outstanding object of `slab`.
    pub unsafe fn free_local(&mut self, mut slab: NonNull<Slab>, obj: NonNull<u8>) {
        self.stats.local_frees += 1;
        let object_count = self.shared.class.object_count;
        let was_full = slab.as_ref().active_objects() as usize == object_count;
        slab.as_mut().push_local(obj);
        if self.active == Some(slab) {
            return;
        }
        if was_full {
            self.full.remove(slab);
            self.partial.push_front(slab);
        } else if slab.as_ref().active_objects() == 0 {
            self.partial.remove(slab);
            self.empty.push_front(slab);
            if self.empty.len() > MAX_LOCAL_EMPTY_SLABS {
                self.flush_empty_half();
            }
        }
    }

    #[cfg(test)]
    pub fn empty_len(&self) -> usize {
        self.empty.len()
    }

    /// Return the oldest half of the hoarded empty slabs to the global pool.
    fn flush_empty_half(&mut self) {
        let n = self.empty.len() / 2;
        trace!("flushing {} empty slabs to the global pool", n);
        let mut pool = self.shared.pool.lock().unwrap();
        for _ in 0..n {
            let slab = self
                .empty
                .pop_back()
                .expect("flushing more empty slabs than owned");
            unsafe {
                slab.as_ref().set_owner(ptr::null_mut());
            }
            pool.empty.push_front(slab);
        }
    }
}

impl Drop for Magazine {
    fn drop(&mut self) {
        // thread exit (or table teardown): everything goes back to the
        // global reservoir, inboxes intact
        let mut pool = match self.shared.pool.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut returned = 0usize;
        let give = |slab: NonNull<Slab>, pool: &mut crate::cache::GlobalPool| {
            unsafe {
                slab.as_ref().set_owner(ptr::null_mut());
            }
            pool.empty.push_front(slab);
        };
        if let Some(slab) = self.active.take() {
            give(slab, &mut *pool);
            returned += 1;
        }
        while let Some(slab) = self.partial.pop_front() {
            give(slab, &mut *pool);
            returned += 1;
        }
        while let Some(slab) = self.full.pop_front() {
            give(slab, &mut *pool);
            returned += 1;
        }
        while let Some(slab) = self.empty.pop_front() {
            give(slab, &mut *pool);
            returned += 1;
        }
        trace!("magazine flushed {} slabs at thread exit", returned);
    }
}
