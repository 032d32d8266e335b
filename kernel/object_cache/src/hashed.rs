//! Slabs of large objects, found through a hash table.
//!
//! An embedded header would waste too much of a chunk holding only a handful of large objects,
//! so the slabs of these caches are looked up in a table keyed by their chunk's address.

use crate::{backing::SlabBacking, slab::SlabId};
use hashbrown::HashMap;
use kernel_config::slab::{HASHED_CACHE_LARGE_SLAB_OBJECTS, HASHED_CACHE_SLAB_OBJECTS};
use slab_memory_manager::MemoryManager;
use slab_structs::{CacheFlags, VirtualAddress};

#[derive(Default)]
pub(crate) struct HashedObjectCache {
    table: HashMap<VirtualAddress, SlabId>,
}

impl HashedObjectCache {
    /// Returns the slab size for objects of `object_size` bytes.
    pub fn slab_size(object_size: usize, flags: CacheFlags) -> usize {
        let objects = if flags.contains(CacheFlags::LARGE_SLAB) {
            HASHED_CACHE_LARGE_SLAB_OBJECTS
        } else {
            HASHED_CACHE_SLAB_OBJECTS
        };
        MemoryManager::acceptable_chunk_size(objects * object_size)
    }
}

impl SlabBacking for HashedObjectCache {
    fn usable_bytes(&self, slab_size: usize) -> usize {
        slab_size
    }

    fn attach(&mut self, pages: VirtualAddress, slab: SlabId) {
        if let Some(old) = self.table.insert(pages, slab) {
            panic!("HashedObjectCache: chunk {:?} already backs {}", pages, old);
        }
    }

    fn detach(&mut self, pages: VirtualAddress) {
        self.table.remove(&pages);
    }

    fn lookup(&self, pages: VirtualAddress) -> Option<SlabId> {
        self.table.get(&pages).copied()
    }
}
