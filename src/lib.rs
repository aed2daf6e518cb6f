// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A slab-style object cache for fixed-size, multi-threaded allocation
//! workloads.
//!
//! # Design
//!
//! `slabcache` is aimed at programs that repeatedly allocate and release
//! objects of one (or a few) known sizes: network packets, sequence buffer
//! entries, components, tuples. Each [`Cache`] services a single size class.
//! The broad shape follows the slab allocator introduced in the SunOS 5.4
//! kernel and described in [The Slab Allocator: An Object-Caching Kernel
//! Memory Allocator][1]: memory is acquired from the OS in coarse chunks,
//! subdivided into size-aligned *slabs*, and each slab is carved into
//! equal-size objects recycled through free lists threaded into the objects
//! themselves. Slab coloring spreads the first object of successive slabs
//! across distinct cache lines.
//!
//! On top of that, the cache is built for parallel callers. Every thread
//! that touches a cache gets a private magazine: an active slab plus
//! partial, full, and empty slab lists, all operated on without any
//! synchronization. Frees from the owning thread are a pointer push; frees
//! from any other thread land on the slab's lock-free remote inbox via a
//! single compare-exchange and are drained in bulk by the owner later. The
//! one lock in the system is a per-cache mutex guarding the global reservoir
//! of empty slabs, taken only when a thread's local lists run dry or
//! overflow.
//!
//! Clients are trusted: double frees, foreign pointers, and use after free
//! are not detected, matching the usual contract of an allocator fast path.
//!
//! [1]: http://www.usenix.org/publications/library/proceedings/bos94/full_papers/bonwick.ps
//!
//! # Example
//!
//! ```
//! use slabcache::Cache;
//!
//! let cache = Cache::new(64);
//! let a = cache.alloc();
//! let b = cache.alloc();
//! assert_ne!(a, b);
//! unsafe {
//!     cache.free(a);
//!     cache.free(b);
//! }
//! ```
//!
//! Typed use goes through [`TypedCache`]:
//!
//! ```
//! use slabcache::TypedCache;
//!
//! let pool = TypedCache::<[u8; 48]>::new();
//! let val = pool.acquire_unique([0u8; 48]);
//! assert_eq!(val[0], 0);
//! ```

mod cache;
mod frontends;
mod registry;
mod slab;
mod sources;
mod typed;
mod util;


pub use cache::{Cache, CacheBuilder, ObjectCallback};
pub use frontends::{AllocStats, MAX_LOCAL_EMPTY_SLABS, SCAVENGE_COOLDOWN, SCAVENGE_WINDOW};
pub use registry::{cache_create, cache_destroy, cache_get};
pub use typed::{PoolBox, TypedCache};
