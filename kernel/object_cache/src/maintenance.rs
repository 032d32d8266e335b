//! The queue of object caches waiting for the maintainer.
//!
//! A cache is queued when it wants its minimum reserve topped up. The maintainer
//! takes caches off the queue and works on them one at a time; the low memory
//! handler also claims caches while it shrinks them. Each cache with pending or
//! running maintenance has a [`MaintenanceState`]; a cache without one is idle.

use crate::cache::ObjectCache;
use alloc::{collections::VecDeque, sync::Arc};
use hashbrown::HashMap;
use slab_structs::CacheId;
use slab_vm::VmBackend;
use spin::Mutex;

/// The work requested for a cache.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub(crate) struct Work {
    pub resize: bool,
    pub delete: bool,
}

impl Work {
    fn is_empty(&self) -> bool {
        !self.resize && !self.delete
    }
}

enum MaintenanceState {
    /// On the queue, waiting for the maintainer.
    Queued(Work),
    /// Off the queue, being worked on by the maintainer or the low memory handler.
    InProgress(Work),
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Arc<ObjectCache>>,
    caches: HashMap<CacheId, MaintenanceState>,
}

pub(crate) struct MaintenanceQueue {
    state: Mutex<QueueState>,
    vm: Arc<dyn VmBackend>,
}

impl MaintenanceQueue {
    pub fn new(vm: Arc<dyn VmBackend>) -> MaintenanceQueue {
        MaintenanceQueue { state: Mutex::new(QueueState::default()), vm }
    }

    /// Asks the maintainer to grow `cache` to its minimum reserve.
    pub fn request_resize(&self, cache: Arc<ObjectCache>) {
        let mut state = self.state.lock();
        match state.caches.get_mut(&cache.id()) {
            Some(MaintenanceState::Queued(work)) | Some(MaintenanceState::InProgress(work)) => {
                work.resize = true;
                return;
            }
            None => {}
        }
        trace!("MaintenanceQueue: queueing {} for a resize", cache.name());
        state.caches.insert(cache.id(), MaintenanceState::Queued(Work { resize: true, delete: false }));
        state.queue.push_back(cache);
        drop(state);
        self.vm.wake_maintainer();
    }

    /// Asks for `cache` to be deleted.
    ///
    /// Returns the cache if the caller should delete it right away. Otherwise someone is
    /// working on it, and whoever that is deletes it when done.
    pub fn request_delete(&self, cache: Arc<ObjectCache>) -> Option<Arc<ObjectCache>> {
        let id = cache.id();
        let mut state = self.state.lock();
        let queued = match state.caches.get_mut(&id) {
            Some(MaintenanceState::InProgress(work)) => {
                debug!("MaintenanceQueue: deferring the deletion of busy cache {}", cache.name());
                work.delete = true;
                return None;
            }
            Some(MaintenanceState::Queued(_)) => true,
            None => false,
        };
        if queued {
            state.caches.remove(&id);
            state.queue.retain(|c| c.id() != id);
        }
        Some(cache)
    }

    /// Takes the next cache off the queue and marks it in progress.
    pub fn pop(&self) -> Option<Arc<ObjectCache>> {
        let mut state = self.state.lock();
        let cache = state.queue.pop_front()?;
        let work = match state.caches.remove(&cache.id()) {
            Some(MaintenanceState::Queued(work)) | Some(MaintenanceState::InProgress(work)) => work,
            None => Work::default(),
        };
        state.caches.insert(cache.id(), MaintenanceState::InProgress(work));
        Some(cache)
    }

    /// Takes the work requested for a cache in progress.
    ///
    /// The cache becomes idle again if nothing is left to do, or if it is to be deleted.
    /// Otherwise it stays in progress, and further requests accumulate until the next claim.
    pub fn claim(&self, id: CacheId) -> Work {
        let mut state = self.state.lock();
        let work = match state.caches.get_mut(&id) {
            Some(MaintenanceState::InProgress(work)) => core::mem::take(work),
            _ => Work::default(),
        };
        if work.is_empty() || work.delete {
            state.caches.remove(&id);
        }
        work
    }

    /// Marks an idle cache in progress for the low memory handler.
    /// Returns `false` if the cache is queued or in progress already.
    pub fn begin(&self, id: CacheId) -> bool {
        let mut state = self.state.lock();
        if state.caches.contains_key(&id) {
            return false;
        }
        state.caches.insert(id, MaintenanceState::InProgress(Work::default()));
        true
    }

    /// Ends the work started with [`MaintenanceQueue::begin()`].
    ///
    /// Returns `true` if the cache was asked to be deleted in the meantime,
    /// in which case the caller must delete it. A resize requested in the meantime
    /// queues the cache for the maintainer.
    pub fn finish(&self, cache: &Arc<ObjectCache>) -> bool {
        let id = cache.id();
        let mut state = self.state.lock();
        let work = match state.caches.remove(&id) {
            Some(MaintenanceState::InProgress(work)) => work,
            Some(queued) => {
                state.caches.insert(id, queued);
                return false;
            }
            None => Work::default(),
        };
        if work.delete {
            return true;
        }
        if work.resize {
            state.caches.insert(id, MaintenanceState::Queued(Work { resize: true, delete: false }));
            state.queue.push_back(cache.clone());
            drop(state);
            self.vm.wake_maintainer();
        }
        false
    }

    /// Forgets every queued cache.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.queue.clear();
        state.caches.clear();
    }

    /// Returns the number of caches waiting for the maintainer.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }
}
