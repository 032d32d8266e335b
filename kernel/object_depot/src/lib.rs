//! A depot of per-CPU magazines that sits in front of an object cache.
//!
//! Every CPU owns a "loaded" and a "previous" magazine, i.e., two small stacks of
//! ready-to-use objects. Freed objects are pushed onto the loaded magazine and
//! allocations pop from it, so the common case only touches the current CPU's slot.
//! When both of a CPU's magazines are exhausted (or full), they are exchanged
//! against the depot-wide lists of full and empty magazines.
//! This is the magazine layer of Bonwick's "Magazines and Vmem" (USENIX 2001).
//!
//! Objects that the depot cannot buffer are handed back to the owning cache
//! through the callback given to [`ObjectDepot::new()`].
//!
//! # Locking
//! The per-CPU slots live behind the outer reader-writer lock:
//! [`obtain()`](ObjectDepot::obtain) and [`store()`](ObjectDepot::store) only take it
//! for reading (plus the current CPU's slot lock), whereas
//! [`make_empty()`](ObjectDepot::make_empty) takes it for writing.
//! The shared full and empty lists are protected by an inner spinlock that is only held
//! while moving magazines between lists. No lock is held while the callback runs.

#![no_std]

#[macro_use] extern crate log;
extern crate alloc;
extern crate slab_structs;
extern crate spin;

#[cfg(test)]
mod test;

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{mem, ptr::NonNull};
use slab_structs::{CacheFlags, CpuTopology, SlabError};
use spin::{Mutex, RwLock};

/// The callback through which the depot hands objects back to their owner.
pub type ReturnObjectFn = Box<dyn Fn(NonNull<u8>, CacheFlags) + Send + Sync>;

/// A fixed-capacity stack of objects ("rounds").
pub struct DepotMagazine {
    rounds: Vec<NonNull<u8>>,
    capacity: usize,
}

// SAFETY: a magazine only stores the addresses of free objects, it never dereferences them.
unsafe impl Send for DepotMagazine {}

impl DepotMagazine {
    /// Allocates an empty magazine, returning `None` if there is not enough memory.
    fn try_new(capacity: usize) -> Option<DepotMagazine> {
        let mut rounds = Vec::new();
        rounds.try_reserve_exact(capacity).ok()?;
        Some(DepotMagazine { rounds, capacity })
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rounds.len() == self.capacity
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    fn push(&mut self, object: NonNull<u8>) -> bool {
        if self.is_full() {
            return false;
        }
        self.rounds.push(object);
        true
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        self.rounds.pop()
    }
}

#[derive(Default)]
struct CpuStore {
    loaded: Option<DepotMagazine>,
    previous: Option<DepotMagazine>,
}

impl CpuStore {
    fn swap(&mut self) {
        mem::swap(&mut self.loaded, &mut self.previous);
    }
}

#[derive(Default)]
struct MagazineLists {
    full: Vec<DepotMagazine>,
    empty: Vec<DepotMagazine>,
}

/// What [`ObjectDepot::store()`] has to do after dropping its locks.
enum StoreStep {
    Stored,
    Retry,
    /// A full magazine that did not fit into the full list; its objects go back to the owner.
    Release(DepotMagazine),
    /// No empty magazine is available anywhere, a new one must be allocated.
    NeedMagazine,
}

/// A per-CPU magazine depot.
pub struct ObjectDepot {
    /// The outer lock.
    stores: RwLock<Box<[Mutex<CpuStore>]>>,
    /// The inner lock.
    lists: Mutex<MagazineLists>,
    /// The most full magazines kept in the shared full list.
    max_count: usize,
    magazine_capacity: usize,
    cpus: Arc<dyn CpuTopology>,
    return_object: ReturnObjectFn,
}

impl ObjectDepot {
    /// Creates a depot whose magazines hold `capacity` objects each,
    /// and which keeps at most `max_count` full magazines in its shared list.
    ///
    /// Returns `BadValue` for a zero `capacity`, and `NoMemory` if the per-CPU slots
    /// cannot be allocated.
    pub fn new(
        capacity: usize,
        max_count: usize,
        cpus: Arc<dyn CpuTopology>,
        return_object: ReturnObjectFn,
    ) -> Result<ObjectDepot, SlabError> {
        if capacity == 0 {
            return Err(SlabError::BadValue);
        }
        let cpu_count = cpus.cpu_count().max(1);
        let mut stores = Vec::new();
        stores.try_reserve_exact(cpu_count).map_err(|_| SlabError::NoMemory)?;
        stores.extend((0 .. cpu_count).map(|_| Mutex::new(CpuStore::default())));

        Ok(ObjectDepot {
            stores: RwLock::new(stores.into_boxed_slice()),
            lists: Mutex::new(MagazineLists::default()),
            max_count,
            magazine_capacity: capacity,
            cpus,
            return_object,
        })
    }

    pub fn magazine_capacity(&self) -> usize {
        self.magazine_capacity
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    /// Returns an object from the current CPU's magazines, if there is one in its reach.
    ///
    /// The loaded magazine is used first, then the previous one if it is full,
    /// then a full magazine from the shared list. Returns `None` if all of these are
    /// exhausted, in which case the caller falls back to the slab layer.
    pub fn obtain(&self) -> Option<NonNull<u8>> {
        let stores = self.stores.read();
        let mut store = self.current_store(&stores).lock();
        loop {
            if let Some(object) = store.loaded.as_mut()?.pop() {
                return Some(object);
            }
            let previous_full = store.previous.as_ref()?.is_full();
            if previous_full || self.exchange_with_full(&mut store.previous) {
                store.swap();
            } else {
                return None;
            }
        }
    }

    /// Buffers a freed object in the current CPU's magazines.
    ///
    /// If no magazine can take the object and no new magazine can be allocated,
    /// the object is given back to the owner right away.
    pub fn store(&self, object: NonNull<u8>, flags: CacheFlags) {
        loop {
            let step = {
                let stores = self.stores.read();
                let mut store = self.current_store(&stores).lock();
                self.store_locked(&mut store, object)
            };

            match step {
                StoreStep::Stored => return,
                StoreStep::Retry => {}
                StoreStep::Release(magazine) => self.empty_magazine(magazine, flags),
                StoreStep::NeedMagazine => match DepotMagazine::try_new(self.magazine_capacity) {
                    Some(magazine) => {
                        let _stores = self.stores.read();
                        self.lists.lock().empty.push(magazine);
                    }
                    None => {
                        warn!("ObjectDepot: couldn't allocate a magazine, returning {:p} to its cache", object);
                        (self.return_object)(object, flags);
                        return;
                    }
                },
            }
        }
    }

    fn store_locked(&self, store: &mut CpuStore, object: NonNull<u8>) -> StoreStep {
        if let Some(loaded) = store.loaded.as_mut() {
            if loaded.push(object) {
                return StoreStep::Stored;
            }
        }
        if store.previous.as_ref().map_or(false, DepotMagazine::is_empty) {
            store.swap();
            return StoreStep::Retry;
        }
        match self.exchange_with_empty(&mut store.previous) {
            Some(released) => {
                store.swap();
                match released {
                    Some(magazine) => StoreStep::Release(magazine),
                    None => StoreStep::Retry,
                }
            }
            None => StoreStep::NeedMagazine,
        }
    }

    /// Returns every buffered object to the owner and frees all magazines.
    pub fn make_empty(&self, flags: CacheFlags) {
        let (store_magazines, full, empty) = {
            let mut stores = self.stores.write();
            let mut store_magazines = Vec::new();
            for store in stores.iter_mut() {
                let store = store.get_mut();
                store_magazines.extend(store.loaded.take());
                store_magazines.extend(store.previous.take());
            }
            let mut lists = self.lists.lock();
            (store_magazines, mem::take(&mut lists.full), mem::take(&mut lists.empty))
        };

        let mut returned = 0;
        for magazine in store_magazines.into_iter().chain(full) {
            returned += magazine.len();
            self.empty_magazine(magazine, flags);
        }
        drop(empty);
        trace!("ObjectDepot: emptied, returned {} objects", returned);
    }

    /// Empties the depot and tears it down.
    pub fn destroy(self, flags: CacheFlags) {
        self.make_empty(flags);
    }

    /// Returns the number of objects currently buffered in all magazines.
    pub fn cached_objects(&self) -> usize {
        let stores = self.stores.read();
        let in_stores: usize = stores.iter()
            .map(|store| {
                let store = store.lock();
                store.loaded.as_ref().map_or(0, DepotMagazine::len)
                    + store.previous.as_ref().map_or(0, DepotMagazine::len)
            })
            .sum();
        let lists = self.lists.lock();
        in_stores + lists.full.iter().map(DepotMagazine::len).sum::<usize>()
    }

    /// Returns the number of magazines in the shared full and empty lists.
    pub fn shared_magazines(&self) -> (usize, usize) {
        let lists = self.lists.lock();
        (lists.full.len(), lists.empty.len())
    }

    fn current_store<'s>(&self, stores: &'s [Mutex<CpuStore>]) -> &'s Mutex<CpuStore> {
        &stores[self.cpus.current_cpu() % stores.len()]
    }

    /// Exchanges the given empty magazine for a full one from the shared list.
    fn exchange_with_full(&self, magazine: &mut Option<DepotMagazine>) -> bool {
        let mut lists = self.lists.lock();
        let full = match lists.full.pop() {
            Some(full) => full,
            None => return false,
        };
        if let Some(empty) = magazine.replace(full) {
            debug_assert!(empty.is_empty());
            lists.empty.push(empty);
        }
        true
    }

    /// Exchanges the given full magazine (if any) for an empty one from the shared list.
    ///
    /// Returns `None` if the shared empty list is exhausted. Otherwise returns the
    /// full magazine if the shared full list had no room for it.
    fn exchange_with_empty(&self, magazine: &mut Option<DepotMagazine>) -> Option<Option<DepotMagazine>> {
        let mut lists = self.lists.lock();
        let empty = lists.empty.pop()?;
        let released = match magazine.replace(empty) {
            Some(full) if lists.full.len() < self.max_count => {
                lists.full.push(full);
                None
            }
            other => other,
        };
        Some(released)
    }

    fn empty_magazine(&self, mut magazine: DepotMagazine, flags: CacheFlags) {
        while let Some(object) = magazine.pop() {
            (self.return_object)(object, flags);
        }
    }
}
