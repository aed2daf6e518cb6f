// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The slab data structure.
//!
//! A slab is one contiguous region of `SizeClass::slab_bytes` bytes, aligned
//! to its own size and carved into `SizeClass::object_count` equal objects. A
//! `Slab` header lives at the base of the region; everything else about the
//! slab is described by the cache-wide `SizeClass` rather than stored
//! per-slab. Because the region is aligned to its size, any object pointer
//! resolves to its header with a single mask (see [`Slab::find`]), the same
//! trick aligned slabs use to avoid a global pointer map.
//!
//! Free objects are threaded into singly-linked lists through their own
//! storage: the first pointer-sized word of a free object holds the address
//! of the next free object. There are two such lists per slab. `local_head`
//! is owned by the slab's owner thread and accessed without synchronization.
//! `atomic_head` is the remote-free inbox: any other thread may push to it
//! with a compare-exchange, and the owner drains it wholesale with a
//! swap-to-null. Release on push and acquire on drain are what make the
//! payload writes of a remote free visible to the owner before the object is
//! handed out again.
//!
//! Slabs are also nodes in sentinel-based intrusive doubly-linked lists
//! (`prev`/`next`). List edits are O(1) and unsynchronized; they are only
//! performed by a thread that has exclusive access to both the sentinel and
//! the node, either because both are thread-local or because the cache-wide
//! mutex is held.

use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use log::debug;

use crate::util::round_up;

/// Assumed size of a CPU cache line, used for coloring and header padding.
pub const CACHE_LINE: usize = 64;

/// Smallest object size a cache will manage.
pub const MIN_OBJECT_SIZE: usize = 16;

/// Every slab holds at least this many objects.
pub const MIN_OBJECTS_PER_SLAB: usize = 8;

/// Target number of bytes requested from the OS per chunk.
const CHUNK_TARGET_BYTES: usize = 2 << 20;

/// The layout of one size class: how big a slab is, how many objects it
/// holds, and where they start.
///
/// Immutable after construction; every slab of a cache shares one of these.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SizeClass {
    /// The size of an individual object (in bytes), rounded up to a power of
    /// two no smaller than `MIN_OBJECT_SIZE`. Doubles as the object
    /// alignment.
    pub object_size: usize,
    /// Number of objects carved from each slab.
    pub object_count: usize,
    /// Total bytes for one slab. A power of two; every slab base is aligned
    /// to this.
    pub slab_bytes: usize,
    /// Number of slabs requested from the OS per chunk.
    pub slabs_per_chunk: usize,
    /// Offset (in bytes) from the slab base to the first object, before the
    /// color shift is applied.
    pub objects_offset: usize,
    /// Granularity of the color shift. `max(CACHE_LINE, object_size)` so
    /// that coloring never disturbs object alignment.
    pub color_stride: usize,
    /// Number of distinct color offsets the cache rotates through.
    pub colors: usize,
}

impl SizeClass {
    /// Compute the layout for objects of `requested` bytes.
    ///
    /// The slab size is the smallest power of two that is at least a page
    /// and holds `MIN_OBJECTS_PER_SLAB` objects plus the header. Leftover
    /// bytes after the header and objects become coloring slack.
    pub fn compute(requested: usize) -> SizeClass {
        assert!(requested > 0, "object size must be positive");
        let object_size = requested
            .max(MIN_OBJECT_SIZE)
            .max(mem::size_of::<usize>())
            .next_power_of_two();
        let color_stride = object_size.max(CACHE_LINE);
        let objects_offset = round_up(mem::size_of::<Slab>(), color_stride);

        let mut slab_bytes = (object_size * MIN_OBJECTS_PER_SLAB + CACHE_LINE)
            .next_power_of_two()
            .max(crate::util::mmap::PAGE_SIZE);
        while objects_offset + object_size * MIN_OBJECTS_PER_SLAB > slab_bytes {
            slab_bytes *= 2;
        }

        let object_count = (slab_bytes - objects_offset) / object_size;
        let size_left = slab_bytes - objects_offset - object_count * object_size;
        let colors = size_left / color_stride + 1;
        let slabs_per_chunk = (CHUNK_TARGET_BYTES / slab_bytes).max(1);

        let class = SizeClass {
            object_size,
            object_count,
            slab_bytes,
            slabs_per_chunk,
            objects_offset,
            color_stride,
            colors,
        };
        debug!("computed {:?} for requested size {}", class, requested);
        class
    }
}

/// Flags recorded at slab initialization.
///
/// `perfectly_aligned` records whether the slab's chunk came back from the
/// OS already aligned to the slab size; `is_mmap_front` marks the first slab
/// of a chunk. Only chunk fronts correspond to an OS mapping that teardown
/// returns.
#[derive(Copy, Clone, Debug, Default)]
pub struct SlabFlags {
    pub perfectly_aligned: bool,
    pub is_mmap_front: bool,
}

/// The header at the base of every slab.
///
/// `prev`/`next` are intrusive list links; a slab that is on no list is
/// self-linked. `owner` is a tag identifying the thread context the slab
/// currently belongs to (null when the slab is held by the global
/// reservoir); it is only ever compared against, never dereferenced, and it
/// transitions only under the cache-wide mutex. `active_obj_cnt` counts the
/// objects handed out from this slab as seen by the owner: a remote free
/// does not decrement it until the owner reclaims the inbox.
#[repr(C)]
pub struct Slab {
    prev: *mut Slab,
    next: *mut Slab,
    local_head: *mut u8,
    atomic_head: AtomicPtr<u8>,
    owner: AtomicPtr<()>,
    active_obj_cnt: u32,
    flags: SlabFlags,
    mem: *mut u8,
}

impl Slab {
    /// Place a header at `base` and compute where its objects start.
    ///
    /// The local free list is left empty; call [`Slab::thread_free_list`]
    /// after any batch construction has run over the object area.
    ///
    /// # Safety
    /// `base` must point to `class.slab_bytes` writable bytes aligned to
    /// `class.slab_bytes`.
    pub unsafe fn init_header(
        base: NonNull<u8>,
        class: &SizeClass,
        color: usize,
        flags: SlabFlags,
    ) -> NonNull<Slab> {
        debug_assert_eq!(base.as_ptr() as usize & (class.slab_bytes - 1), 0);
        debug_assert!(color < class.colors);
        let slab = base.cast::<Slab>().as_ptr();
        let mem = base
            .as_ptr()
            .add(class.objects_offset + color * class.color_stride);
        ptr::write(
            slab,
            Slab {
                prev: slab,
                next: slab,
                local_head: ptr::null_mut(),
                atomic_head: AtomicPtr::new(ptr::null_mut()),
                owner: AtomicPtr::new(ptr::null_mut()),
                active_obj_cnt: 0,
                flags,
                mem,
            },
        );
        NonNull::new_unchecked(slab)
    }

    /// Thread all `class.object_count` objects into the local free list.
    ///
    /// Each object's first word is overwritten with the address of the next
    /// object; the last object links to null.
    ///
    /// # Safety
    /// The header must have been initialized by `init_header` with the same
    /// `class`, and no object may be outstanding.
    pub unsafe fn thread_free_list(mut slab: NonNull<Slab>, class: &SizeClass) {
        let s = slab.as_mut();
        debug_assert_eq!(s.active_obj_cnt, 0);
        let mem = s.mem;
        for i in 0..class.object_count {
            let obj = mem.add(i * class.object_size);
            let next = if i + 1 < class.object_count {
                mem.add((i + 1) * class.object_size)
            } else {
                ptr::null_mut()
            };
            ptr::write(obj as *mut *mut u8, next);
        }
        s.local_head = mem;
    }

    /// Recover the slab header for any pointer into a slab's region.
    #[inline]
    pub fn find(item: NonNull<u8>, slab_bytes: usize) -> NonNull<Slab> {
        debug_assert!(slab_bytes.is_power_of_two());
        unsafe {
            NonNull::new_unchecked((item.as_ptr() as usize & !(slab_bytes - 1)) as *mut Slab)
        }
    }

    /// Base address of the first object.
    #[inline]
    pub fn mem(&self) -> *mut u8 {
        self.mem
    }

    #[inline]
    pub fn flags(&self) -> SlabFlags {
        self.flags
    }

    #[inline]
    pub fn active_objects(&self) -> u32 {
        self.active_obj_cnt
    }

    #[inline]
    pub fn has_local(&self) -> bool {
        !self.local_head.is_null()
    }

    /// Whether the remote inbox has pending frees. Advisory: a remote push
    /// may land immediately after the load.
    #[inline]
    pub fn has_remote(&self) -> bool {
        !self.atomic_head.load(Ordering::Relaxed).is_null()
    }

    /// The owner tag. Only compared against, never dereferenced; a reader
    /// racing with an ownership transition sees either the old or the new
    /// tag, both of which route the free correctly (see the cache module).
    #[inline]
    pub fn owner(&self) -> *mut () {
        self.owner.load(Ordering::Relaxed)
    }

    /// Set the owner tag. Called only under the cache-wide mutex (adopt and
    /// return transitions).
    #[inline]
    pub fn set_owner(&self, owner: *mut ()) {
        self.owner.store(owner, Ordering::Relaxed);
    }

    /// Pop one object off the local free list.
    ///
    /// # Safety
    /// Caller must be the owner thread.
    #[inline]
    pub unsafe fn pop_local(&mut self) -> Option<NonNull<u8>> {
        let head = self.local_head;
        if head.is_null() {
            return None;
        }
        self.local_head = ptr::read(head as *const *mut u8);
        self.active_obj_cnt += 1;
        Some(NonNull::new_unchecked(head))
    }

    /// Push an object onto the local free list.
    ///
    /// # Safety
    /// Caller must be the owner thread; `obj` must be an object of this slab
    /// that is currently handed out.
    #[inline]
    pub unsafe fn push_local(&mut self, obj: NonNull<u8>) {
        debug_assert!(self.active_obj_cnt > 0);
        ptr::write(obj.as_ptr() as *mut *mut u8, self.local_head);
        self.local_head = obj.as_ptr();
        self.active_obj_cnt -= 1;
    }

    /// Push an object onto the remote-free inbox.
    ///
    /// Lock-free; may be called by any thread. The release ordering on the
    /// successful exchange publishes the link write (and everything the
    /// freeing thread did to the payload) to the owner's eventual drain.
    ///
    /// # Safety
    /// `obj` must be an object of this slab that is currently handed out.
    pub unsafe fn push_remote(&self, obj: NonNull<u8>) {
        let mut head = self.atomic_head.load(Ordering::Relaxed);
        loop {
            ptr::write(obj.as_ptr() as *mut *mut u8, head);
            match self.atomic_head.compare_exchange_weak(
                head,
                obj.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Drain the remote-free inbox into the local free list.
    ///
    /// Swaps `atomic_head` with null (acquire), walks the recovered chain to
    /// its tail, splices the current local list after it, and installs the
    /// recovered head as the new local head. Returns the number of objects
    /// reclaimed; zero means the inbox was empty.
    ///
    /// # Safety
    /// Caller must be the owner thread.
    pub unsafe fn reclaim_remote(&mut self) -> usize {
        let head = self.atomic_head.swap(ptr::null_mut(), Ordering::Acquire);
        if head.is_null() {
            return 0;
        }
        let mut tail = head;
        let mut count = 1;
        loop {
            let next = ptr::read(tail as *const *mut u8);
            if next.is_null() {
                break;
            }
            tail = next;
            count += 1;
        }
        ptr::write(tail as *mut *mut u8, self.local_head);
        self.local_head = head;
        debug_assert!(self.active_obj_cnt as usize >= count);
        self.active_obj_cnt -= count as u32;
        count
    }

    /// Length of the local free list. Owner-thread only; test support.
    #[cfg(test)]
    pub unsafe fn local_len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.local_head;
        while !cur.is_null() {
            n += 1;
            cur = ptr::read(cur as *const *mut u8);
        }
        n
    }

    /// Length of the remote inbox. Only meaningful while no remote pushes
    /// are in flight; test support.
    #[cfg(test)]
    pub unsafe fn remote_len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.atomic_head.load(Ordering::Acquire);
        while !cur.is_null() {
            n += 1;
            cur = ptr::read(cur as *const *mut u8);
        }
        n
    }

    /// Splice this slab out of whatever list it is on, leaving it
    /// self-linked.
    ///
    /// # Safety
    /// Caller must have exclusive access to the list.
    pub unsafe fn unlink(slab: NonNull<Slab>) {
        let s = slab.as_ptr();
        (*(*s).next).prev = (*s).prev;
        (*(*s).prev).next = (*s).next;
        (*s).next = s;
        (*s).prev = s;
    }

    /// Insert this slab immediately after `sentinel` (at the list head).
    ///
    /// # Safety
    /// Caller must have exclusive access to the list, and `slab` must be
    /// self-linked.
    pub unsafe fn link_after(slab: NonNull<Slab>, sentinel: NonNull<Slab>) {
        let s = slab.as_ptr();
        let sent = sentinel.as_ptr();
        debug_assert_eq!((*s).next, s);
        (*s).next = (*sent).next;
        (*s).prev = sent;
        (*(*sent).next).prev = s;
        (*sent).next = s;
    }
}

/// A sentinel-based intrusive list of slabs.
///
/// The sentinel is an embedded `Slab` header whose `prev`/`next` point back
/// at itself when the list is empty. Only the link fields of the sentinel
/// are meaningful.
pub struct SlabList {
    sentinel: Box<Slab>,
    len: usize,
}

impl SlabList {
    pub fn new() -> SlabList {
        let mut sentinel = Box::new(Slab {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            local_head: ptr::null_mut(),
            atomic_head: AtomicPtr::new(ptr::null_mut()),
            owner: AtomicPtr::new(ptr::null_mut()),
            active_obj_cnt: 0,
            flags: SlabFlags::default(),
            mem: ptr::null_mut(),
        });
        let p = &mut *sentinel as *mut Slab;
        sentinel.prev = p;
        sentinel.next = p;
        SlabList { sentinel, len: 0 }
    }

    fn sentinel_ptr(&self) -> NonNull<Slab> {
        NonNull::from(&*self.sentinel)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_front(&mut self, slab: NonNull<Slab>) {
        unsafe {
            Slab::link_after(slab, self.sentinel_ptr());
        }
        self.len += 1;
    }

    pub fn pop_front(&mut self) -> Option<NonNull<Slab>> {
        if self.is_empty() {
            return None;
        }
        unsafe {
            let slab = NonNull::new_unchecked(self.sentinel.next);
            Slab::unlink(slab);
            self.len -= 1;
            Some(slab)
        }
    }

    pub fn pop_back(&mut self) -> Option<NonNull<Slab>> {
        if self.is_empty() {
            return None;
        }
        unsafe {
            let slab = NonNull::new_unchecked(self.sentinel.prev);
            Slab::unlink(slab);
            self.len -= 1;
            Some(slab)
        }
    }

    /// Remove a slab known to be on this list.
    pub fn remove(&mut self, slab: NonNull<Slab>) {
        debug_assert!(self.len > 0);
        unsafe {
            Slab::unlink(slab);
        }
        self.len -= 1;
    }

    /// Iterate front to back without removing.
    pub fn iter(&self) -> SlabIter<'_> {
        SlabIter {
            cur: self.sentinel.next,
            sentinel: &*self.sentinel,
            forward: true,
        }
    }

    /// Iterate back to front without removing.
    pub fn iter_rev(&self) -> SlabIter<'_> {
        SlabIter {
            cur: self.sentinel.prev,
            sentinel: &*self.sentinel,
            forward: false,
        }
    }
}

pub struct SlabIter<'a> {
    cur: *mut Slab,
    sentinel: &'a Slab,
    forward: bool,
}

impl<'a> Iterator for SlabIter<'a> {
    type Item = NonNull<Slab>;

    fn next(&mut self) -> Option<NonNull<Slab>> {
        if ptr::eq(self.cur, self.sentinel) {
            return None;
        }
        unsafe {
            let slab = NonNull::new_unchecked(self.cur);
            self.cur = if self.forward {
                (*self.cur).next
            } else {
                (*self.cur).prev
            };
            Some(slab)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::mmap;

    #[test]
    fn size_class_basic() {
        let _ = env_logger::builder().is_test(true).try_init();
        for requested in [1, 8, 15, 16, 17, 63, 64, 73, 100, 1023, 8192] {
            let class = SizeClass::compute(requested);
            assert!(class.object_size >= requested);
            assert!(class.object_size >= MIN_OBJECT_SIZE);
            assert!(class.object_size.is_power_of_two());
            assert!(class.slab_bytes.is_power_of_two());
            assert!(class.slab_bytes >= mmap::PAGE_SIZE);
            assert!(class.object_count >= MIN_OBJECTS_PER_SLAB);
            assert!(class.colors >= 1);
            // the deepest color shift still leaves room for every object
            let worst = class.objects_offset
                + (class.colors - 1) * class.color_stride
                + class.object_count * class.object_size;
            assert!(worst <= class.slab_bytes);
        }
    }

    #[test]
    fn size_class_object_counts() {
        let class = SizeClass::compute(64);
        assert_eq!(class.slab_bytes, 4096);
        assert_eq!(class.object_count, (4096 - 64) / 64);
        assert_eq!(class.slabs_per_chunk, (2 << 20) / 4096);
    }

    fn fresh_slab(class: &SizeClass) -> (NonNull<Slab>, NonNull<u8>) {
        // map one extra slab so we can align manually
        let raw = mmap::map(class.slab_bytes * 2);
        let base = (raw.as_ptr() as usize + class.slab_bytes - 1) & !(class.slab_bytes - 1);
        let base = NonNull::new(base as *mut u8).unwrap();
        let slab = unsafe {
            let s = Slab::init_header(base, class, 0, SlabFlags::default());
            Slab::thread_free_list(s, class);
            s
        };
        (slab, raw)
    }

    #[test]
    fn local_list_round_trip() {
        let class = SizeClass::compute(32);
        let (mut slab, raw) = fresh_slab(&class);
        unsafe {
            let s = slab.as_mut();
            let a = s.pop_local().unwrap();
            let b = s.pop_local().unwrap();
            assert_ne!(a, b);
            assert_eq!(s.active_objects(), 2);
            assert_eq!(Slab::find(a, class.slab_bytes), slab);
            assert_eq!(Slab::find(b, class.slab_bytes), slab);
            s.push_local(b);
            s.push_local(a);
            assert_eq!(s.active_objects(), 0);
            // LIFO: a comes back first
            assert_eq!(s.pop_local().unwrap(), a);
            mmap::unmap(raw, class.slab_bytes * 2);
        }
    }

    #[test]
    fn remote_inbox_reclaim() {
        let class = SizeClass::compute(32);
        let (mut slab, raw) = fresh_slab(&class);
        unsafe {
            let s = slab.as_mut();
            let a = s.pop_local().unwrap();
            let b = s.pop_local().unwrap();
            let c = s.pop_local().unwrap();
            s.push_remote(a);
            s.push_remote(b);
            assert!(s.has_remote());
            assert_eq!(s.active_objects(), 3);
            assert_eq!(s.reclaim_remote(), 2);
            assert_eq!(s.active_objects(), 1);
            assert!(!s.has_remote());
            assert_eq!(s.reclaim_remote(), 0);
            // reclaimed objects are allocatable again
            let x = s.pop_local().unwrap();
            let y = s.pop_local().unwrap();
            assert!(x == a || x == b);
            assert!(y == a || y == b);
            assert_ne!(x, y);
            s.push_local(c);
            mmap::unmap(raw, class.slab_bytes * 2);
        }
    }

    #[test]
    fn exhaust_and_refill() {
        let class = SizeClass::compute(512);
        let (mut slab, raw) = fresh_slab(&class);
        unsafe {
            let s = slab.as_mut();
            let mut objs = Vec::new();
            while let Some(p) = s.pop_local() {
                objs.push(p);
            }
            assert_eq!(objs.len(), class.object_count);
            assert_eq!(s.active_objects() as usize, class.object_count);
            // all objects distinct and inside the object area
            for w in objs.windows(2) {
                assert_ne!(w[0], w[1]);
            }
            for p in objs.drain(..) {
                assert_eq!(p.as_ptr() as usize % class.object_size, 0);
                s.push_local(p);
            }
            assert_eq!(s.active_objects(), 0);
            mmap::unmap(raw, class.slab_bytes * 2);
        }
    }

    #[test]
    fn sentinel_list_ops() {
        let class = SizeClass::compute(64);
        let (a, raw_a) = fresh_slab(&class);
        let (b, raw_b) = fresh_slab(&class);
        let mut list = SlabList::new();
        assert!(list.is_empty());
        list.push_front(a);
        list.push_front(b);
        assert_eq!(list.len(), 2);
        let fronts: Vec<_> = list.iter().collect();
        assert_eq!(fronts, vec![b, a]);
        assert_eq!(list.pop_back(), Some(a));
        assert_eq!(list.pop_front(), Some(b));
        assert!(list.pop_front().is_none());
        unsafe {
            mmap::unmap(raw_a, class.slab_bytes * 2);
            mmap::unmap(raw_b, class.slab_bytes * 2);
        }
    }
}
