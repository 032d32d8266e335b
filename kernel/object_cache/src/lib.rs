//! Object caches and the slab allocator context that owns them.
//!
//! A [`SlabAllocator`] ties together one [`MemoryManager`], the CPUs of the system,
//! a registry of every [`ObjectCache`] it created, and the queue of caches waiting
//! for maintenance. Nothing here is a global: several allocators can coexist,
//! e.g., in tests, each over its own VM backend.
//!
//! The public entry points mirror the classic object cache interface:
//! [`SlabAllocator::create_object_cache_etc()`], [`SlabAllocator::delete_object_cache()`],
//! [`object_cache_alloc()`], [`object_cache_free()`], [`object_cache_reserve()`],
//! [`object_cache_set_minimum_reserve()`] and [`object_cache_get_usage()`].
//!
//! Background work is driven from outside: whoever runs the maintainer calls
//! [`SlabAllocator::perform_maintenance()`] after the VM backend's
//! [`wake_maintainer()`](VmBackend::wake_maintainer) fired, and the low resource
//! notifier calls [`SlabAllocator::handle_low_memory()`].

#![no_std]

#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;
extern crate alloc;
extern crate hashbrown;
extern crate kernel_config;
extern crate object_depot;
extern crate slab_memory_manager;
extern crate slab_structs;
extern crate slab_vm;
extern crate spin;

mod backing;
mod cache;
mod hashed;
mod maintenance;
mod slab;
mod small;
#[cfg(test)]
mod test;

pub use cache::{CacheStats, ConstructorFn, DestructorFn, ObjectCache, ObjectCacheConfig, ReclaimerFn};
pub use slab::{SlabId, SlabInfo};
pub use slab_structs::{CacheFlags, CacheId, ResourceLevel, SlabError, VirtualAddress};

use alloc::{sync::Arc, vec::Vec};
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};
use maintenance::MaintenanceQueue;
use slab_memory_manager::MemoryManager;
use slab_structs::CpuTopology;
use slab_vm::VmBackend;
use spin::Mutex;


/// The slab allocator subsystem. See the crate documentation.
pub struct SlabAllocator {
    memory: Arc<MemoryManager>,
    cpus: Arc<dyn CpuTopology>,
    caches: Mutex<Vec<Arc<ObjectCache>>>,
    maintenance: Arc<MaintenanceQueue>,
    next_cache_id: AtomicU32,
}

impl SlabAllocator {
    /// Creates an allocator whose areas are regular VM areas of `platform`.
    pub fn new<P: VmBackend + CpuTopology + 'static>(platform: Arc<P>) -> SlabAllocator {
        let memory = MemoryManager::new(platform.clone());
        Self::with_memory_manager(memory, platform)
    }

    /// Creates an allocator for use before the VM can create areas.
    /// Call [`SlabAllocator::init_post_area()`] once it can.
    pub fn init_early<P: VmBackend + CpuTopology + 'static>(platform: Arc<P>) -> SlabAllocator {
        let memory = MemoryManager::init_early(platform.clone());
        Self::with_memory_manager(memory, platform)
    }

    fn with_memory_manager<P: VmBackend + CpuTopology + 'static>(memory: MemoryManager, platform: Arc<P>) -> SlabAllocator {
        let vm: Arc<dyn VmBackend> = platform.clone();
        let cpus: Arc<dyn CpuTopology> = platform;
        SlabAllocator {
            memory: Arc::new(memory),
            cpus,
            caches: Mutex::new(Vec::new()),
            maintenance: Arc::new(MaintenanceQueue::new(vm)),
            next_cache_id: AtomicU32::new(1),
        }
    }

    /// Turns the boot-time areas into proper VM areas.
    pub fn init_post_area(&self) -> Result<(), SlabError> {
        self.memory.init_post_area()
    }

    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Creates a new object cache and registers it with this allocator.
    pub fn create_object_cache_etc(&self, config: ObjectCacheConfig) -> Result<Arc<ObjectCache>, SlabError> {
        let id = CacheId::new(self.next_cache_id.fetch_add(1, Ordering::Relaxed));
        let cache = ObjectCache::create(id, config, self.memory.clone(), &self.cpus, self.maintenance.clone())?;
        self.caches.lock().push(cache.clone());
        Ok(cache)
    }

    /// Creates a new object cache with default limits and flags.
    pub fn create_object_cache(
        &self,
        name: &str,
        object_size: usize,
        alignment: usize,
        constructor: Option<ConstructorFn>,
        destructor: Option<DestructorFn>,
    ) -> Result<Arc<ObjectCache>, SlabError> {
        let mut config = ObjectCacheConfig::new(name, object_size).alignment(alignment);
        config.constructor = constructor;
        config.destructor = destructor;
        self.create_object_cache_etc(config)
    }

    /// Deletes an object cache, giving all of its memory back.
    ///
    /// If the maintainer or the low memory handler is working on the cache right now,
    /// the deletion is completed by them once they are done.
    ///
    /// # Panics
    /// If any object of the cache is still in use.
    pub fn delete_object_cache(&self, cache: Arc<ObjectCache>) {
        {
            let mut caches = self.caches.lock();
            let before = caches.len();
            caches.retain(|c| !Arc::ptr_eq(c, &cache));
            if caches.len() == before {
                warn!("SlabAllocator: deleting cache {}, which is not registered", cache.name());
            }
        }
        if let Some(cache) = self.maintenance.request_delete(cache) {
            cache.destroy();
        }
    }

    /// Returns all registered object caches.
    pub fn caches(&self) -> Vec<Arc<ObjectCache>> {
        self.caches.lock().clone()
    }

    /// Returns the object cache whose slab contains `address`, if any.
    pub fn cache_for_address(&self, address: VirtualAddress) -> Option<Arc<ObjectCache>> {
        let id = self.memory.cache_for_address(address)?;
        self.caches.lock().iter().find(|c| c.id() == id).cloned()
    }

    /// Returns `true` if [`SlabAllocator::perform_maintenance()`] has anything to do.
    pub fn maintenance_pending(&self) -> bool {
        self.maintenance.len() > 0 || self.memory.maintenance_needed()
    }

    /// Runs the maintainer until its queue is empty: grows caches to their
    /// minimum reserve, completes deferred deletions, and then restores the
    /// memory manager's spare areas.
    ///
    /// Returns the number of caches that were worked on.
    pub fn perform_maintenance(&self) -> usize {
        let mut processed = 0;
        while let Some(cache) = self.maintenance.pop() {
            processed += 1;
            loop {
                let work = self.maintenance.claim(cache.id());
                if work.delete {
                    cache.destroy();
                    break;
                }
                if !work.resize {
                    break;
                }
                cache.maintain_reserve();
            }
        }
        if self.memory.maintenance_needed() {
            self.memory.perform_maintenance();
        }
        processed
    }

    /// Shrinks every cache in response to a low memory notification of the given level.
    ///
    /// Caches are visited round robin, each starting one cache further than the last call.
    /// A cache the maintainer is working on is skipped. Returns the number of slabs given back.
    pub fn handle_low_memory(&self, level: ResourceLevel) -> usize {
        if level == ResourceLevel::None {
            return 0;
        }
        let caches = {
            let mut caches = self.caches.lock();
            if caches.is_empty() {
                return 0;
            }
            caches.rotate_left(1);
            caches.clone()
        };

        let mut released = 0;
        for cache in caches {
            if !self.maintenance.begin(cache.id()) {
                continue;
            }
            released += cache.reclaim(level);
            if self.maintenance.finish(&cache) {
                cache.destroy();
            }
        }
        info!("SlabAllocator: low memory ({:?}) released {} slabs", level, released);
        released
    }
}

impl Drop for SlabAllocator {
    fn drop(&mut self) {
        // Queued caches hold on to the queue.
        self.maintenance.clear();
    }
}


/// Allocates an object from `cache`.
pub fn object_cache_alloc(cache: &ObjectCache, flags: CacheFlags) -> Result<NonNull<u8>, SlabError> {
    cache.alloc(flags)
}

/// Frees an object previously allocated from `cache`.
pub fn object_cache_free(cache: &ObjectCache, object: NonNull<u8>, flags: CacheFlags) {
    cache.free(object, flags)
}

/// Makes sure at least `object_count` objects can be allocated from `cache` without growing it.
pub fn object_cache_reserve(cache: &ObjectCache, object_count: usize, flags: CacheFlags) -> Result<(), SlabError> {
    cache.reserve(object_count, flags)
}

/// Sets how many free objects the maintainer keeps available in `cache`.
pub fn object_cache_set_minimum_reserve(cache: &ObjectCache, object_count: usize) -> Result<(), SlabError> {
    cache.set_minimum_reserve(object_count)
}

/// Returns the bytes of memory currently held by `cache`.
pub fn object_cache_get_usage(cache: &ObjectCache) -> usize {
    cache.usage()
}
