// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A process-wide registry of named caches.
//!
//! The registry is a thin facade: it guarantees that every call for a given
//! name observes the same cache handle, and nothing else. Destroying a name
//! removes the registry's handle; the cache's memory is returned once the
//! remaining handles (user clones and thread magazines) are gone.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;

use lazy_static::lazy_static;

use crate::cache::{Cache, CacheBuilder};

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<String, Cache>> = Mutex::new(HashMap::new());
}

/// Build and register a cache under `name`.
///
/// Returns `None` if the name is already taken; the builder is discarded in
/// that case.
pub fn cache_create(name: &str, builder: CacheBuilder) -> Option<Cache> {
    let mut registry = REGISTRY.lock().unwrap();
    match registry.entry(name.to_owned()) {
        Entry::Occupied(_) => None,
        Entry::Vacant(entry) => Some(entry.insert(builder.build()).clone()),
    }
}

/// Look up the cache registered under `name`.
pub fn cache_get(name: &str) -> Option<Cache> {
    REGISTRY.lock().unwrap().get(name).cloned()
}

/// Remove the cache registered under `name`. Returns whether a cache was
/// registered.
pub fn cache_destroy(name: &str) -> bool {
    REGISTRY.lock().unwrap().remove(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_get_destroy() {
        let cache = cache_create("registry_basic", CacheBuilder::new(64)).unwrap();
        // all calls for a name see the same cache
        let again = cache_get("registry_basic").unwrap();
        assert_eq!(cache.object_size(), again.object_size());
        let p = again.alloc();
        unsafe {
            cache.free(p);
        }
        assert!(cache_destroy("registry_basic"));
        assert!(cache_get("registry_basic").is_none());
        assert!(!cache_destroy("registry_basic"));
    }

    #[test]
    fn duplicate_name_rejected() {
        cache_create("registry_dup", CacheBuilder::new(32)).unwrap();
        assert!(cache_create("registry_dup", CacheBuilder::new(128)).is_none());
        assert!(cache_destroy("registry_dup"));
    }
}
