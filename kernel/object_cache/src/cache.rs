//! Object caches: pools of equally sized objects, carved out of slabs.
//!
//! A cache keeps its slabs on three lists: empty (no object in use), partial, and full.
//! Allocations are served from the partial list first, then from the empty list,
//! and only then is a new slab created from a chunk of the memory manager.
//! Constructors run once for every object when its slab is created,
//! destructors once when the slab is given back; objects keep their constructed
//! state while they travel between the cache, its depot, and its users.
//!
//! Unless a cache opts out with [`CacheFlags::NO_DEPOT`] (or runs on a single CPU),
//! a per-CPU [`ObjectDepot`] sits in front of the slabs.

use crate::{
    backing::SlabBacking,
    hashed::HashedObjectCache,
    maintenance::MaintenanceQueue,
    slab::{Slab, SlabId, SlabInfo},
    small::SmallObjectCache,
};
use alloc::{
    boxed::Box,
    collections::VecDeque,
    string::{String, ToString},
    sync::{Arc, Weak},
    vec::Vec,
};
use core::ptr::NonNull;
use kernel_config::{
    memory::CACHE_LINE_SIZE,
    slab::{default_magazine_capacity, HASHED_CACHE_THRESHOLD, MIN_OBJECT_ALIGNMENT, MIN_OBJECT_SIZE},
};
use object_depot::{ObjectDepot, ReturnObjectFn};
use slab_memory_manager::MemoryManager;
use slab_structs::{CacheFlags, CacheId, Completion, CpuTopology, ResourceLevel, SlabError, VirtualAddress};
use spin::{Mutex, MutexGuard};

/// Initializes an object when its slab is created.
pub type ConstructorFn = Box<dyn Fn(NonNull<u8>) -> Result<(), SlabError> + Send + Sync>;
/// Tears down an object when its slab is given back.
pub type DestructorFn = Box<dyn Fn(NonNull<u8>) + Send + Sync>;
/// Asked to give cached objects back when memory runs low.
pub type ReclaimerFn = Box<dyn Fn(ResourceLevel) + Send + Sync>;

#[cfg(feature = "paranoia")]
const ALLOCATED_PATTERN: u32 = 0xcccc_cccc;
#[cfg(feature = "paranoia")]
const FREED_PATTERN: u32 = 0xdead_beef;


/// The parameters of a new object cache.
///
/// Zero means "use the default" for `alignment`, `maximum` (unlimited),
/// `magazine_capacity` and `max_magazine_count`.
/// State the callbacks need is captured by the closures themselves.
pub struct ObjectCacheConfig {
    pub name: String,
    pub object_size: usize,
    pub alignment: usize,
    /// The most bytes of slabs the cache may hold.
    pub maximum: usize,
    pub magazine_capacity: usize,
    pub max_magazine_count: usize,
    pub flags: CacheFlags,
    pub constructor: Option<ConstructorFn>,
    pub destructor: Option<DestructorFn>,
    pub reclaimer: Option<ReclaimerFn>,
}

impl ObjectCacheConfig {
    pub fn new(name: &str, object_size: usize) -> ObjectCacheConfig {
        ObjectCacheConfig {
            name: name.to_string(),
            object_size,
            alignment: 0,
            maximum: 0,
            magazine_capacity: 0,
            max_magazine_count: 0,
            flags: CacheFlags::empty(),
            constructor: None,
            destructor: None,
            reclaimer: None,
        }
    }

    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn maximum(mut self, maximum: usize) -> Self {
        self.maximum = maximum;
        self
    }

    pub fn magazines(mut self, capacity: usize, max_count: usize) -> Self {
        self.magazine_capacity = capacity;
        self.max_magazine_count = max_count;
        self
    }

    pub fn flags(mut self, flags: CacheFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn constructor(mut self, constructor: ConstructorFn) -> Self {
        self.constructor = Some(constructor);
        self
    }

    pub fn destructor(mut self, destructor: DestructorFn) -> Self {
        self.destructor = Some(destructor);
        self
    }

    pub fn reclaimer(mut self, reclaimer: ReclaimerFn) -> Self {
        self.reclaimer = Some(reclaimer);
        self
    }
}


/// A snapshot of an object cache's counters.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct CacheStats {
    pub total_objects: usize,
    pub used_count: usize,
    pub empty_count: usize,
    pub pressure: usize,
    pub min_object_reserve: usize,
    /// Bytes of slabs held by the cache.
    pub usage: usize,
    pub empty_slabs: usize,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    /// Objects buffered in the depot's magazines.
    pub depot_objects: usize,
}


#[derive(Default)]
struct SlabList(VecDeque<SlabId>);

impl SlabList {
    fn head(&self) -> Option<SlabId> {
        self.0.front().copied()
    }

    fn pop_head(&mut self) -> Option<SlabId> {
        self.0.pop_front()
    }

    fn add(&mut self, slab: SlabId) {
        self.0.push_back(slab);
    }

    fn remove(&mut self, slab: SlabId) {
        if let Some(i) = self.0.iter().position(|s| *s == slab) {
            self.0.remove(i);
        }
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = SlabId> + '_ {
        self.0.iter().copied()
    }
}


pub(crate) struct CacheInner {
    /// Slab arena indexed by `SlabId`.
    slabs: Vec<Option<Slab>>,
    free_slab_ids: Vec<SlabId>,
    backing: Box<dyn SlabBacking>,
    empty: SlabList,
    partial: SlabList,
    full: SlabList,
    total_objects: usize,
    used_count: usize,
    empty_count: usize,
    pressure: usize,
    min_object_reserve: usize,
    usage: usize,
    color_cycle: usize,
    /// Growth in progress on behalf of a caller that may wait for memory.
    pub(crate) resize_can_wait: Option<Arc<Completion>>,
    /// Growth in progress on behalf of a caller that must not wait for memory.
    pub(crate) resize_dont_wait: Option<Arc<Completion>>,
}

impl CacheInner {
    fn new(backing: Box<dyn SlabBacking>) -> CacheInner {
        CacheInner {
            slabs: Vec::new(),
            free_slab_ids: Vec::new(),
            backing,
            empty: SlabList::default(),
            partial: SlabList::default(),
            full: SlabList::default(),
            total_objects: 0,
            used_count: 0,
            empty_count: 0,
            pressure: 0,
            min_object_reserve: 0,
            usage: 0,
            color_cycle: 0,
            resize_can_wait: None,
            resize_dont_wait: None,
        }
    }

    fn free_objects(&self) -> usize {
        self.total_objects - self.used_count
    }

    fn get_slab(&self, id: SlabId) -> Option<&Slab> {
        self.slabs.get(id.0 as usize).and_then(Option::as_ref)
    }

    fn slab(&self, id: SlabId) -> &Slab {
        match self.get_slab(id) {
            Some(slab) => slab,
            None => panic!("ObjectCache: {} does not exist", id),
        }
    }

    fn slab_mut(&mut self, id: SlabId) -> &mut Slab {
        match self.slabs.get_mut(id.0 as usize).and_then(Option::as_mut) {
            Some(slab) => slab,
            None => panic!("ObjectCache: {} does not exist", id),
        }
    }

    fn insert_slab(&mut self, slab: Slab) -> SlabId {
        let pages = slab.pages;
        let id = match self.free_slab_ids.pop() {
            Some(id) => {
                self.slabs[id.0 as usize] = Some(slab);
                id
            }
            None => {
                self.slabs.push(Some(slab));
                SlabId((self.slabs.len() - 1) as u32)
            }
        };
        self.backing.attach(pages, id);
        id
    }

    /// Removes an empty slab that is on no list, updating the counters.
    fn take_slab(&mut self, id: SlabId, slab_size: usize) -> Slab {
        let slab = match self.slabs.get_mut(id.0 as usize).and_then(Option::take) {
            Some(slab) => slab,
            None => panic!("ObjectCache: {} does not exist", id),
        };
        if !slab.is_empty() {
            panic!("ObjectCache: destroying {} which still has {} objects in use", id, slab.size - slab.count);
        }
        self.free_slab_ids.push(id);
        self.backing.detach(slab.pages);
        self.usage -= slab_size;
        self.total_objects -= slab.size;
        slab
    }

    /// Returns the color offset for the next slab, and advances the color cycle.
    fn next_color(&mut self, step: usize, spare_bytes: usize) -> usize {
        let offset = self.color_cycle;
        self.color_cycle += step;
        if self.color_cycle > spare_bytes {
            self.color_cycle = 0;
        }
        offset
    }
}


/// A pool of equally sized objects. See the module documentation.
pub struct ObjectCache {
    id: CacheId,
    name: String,
    object_size: usize,
    alignment: usize,
    slab_size: usize,
    objects_per_slab: usize,
    /// Bytes of a slab's chunk left over after its objects, used for coloring.
    spare_bytes: usize,
    maximum: usize,
    flags: CacheFlags,
    pub(crate) inner: Mutex<CacheInner>,
    pub(crate) depot: Option<ObjectDepot>,
    constructor: Option<ConstructorFn>,
    destructor: Option<DestructorFn>,
    reclaimer: Option<ReclaimerFn>,
    memory: Arc<MemoryManager>,
    maintenance: Arc<MaintenanceQueue>,
    this: Weak<ObjectCache>,
}

impl ObjectCache {
    /// Creates a new cache. Objects of up to [`HASHED_CACHE_THRESHOLD`] bytes get
    /// a small object cache, bigger ones a hashed object cache.
    pub(crate) fn create(
        id: CacheId,
        config: ObjectCacheConfig,
        memory: Arc<MemoryManager>,
        cpus: &Arc<dyn CpuTopology>,
        maintenance: Arc<MaintenanceQueue>,
    ) -> Result<Arc<ObjectCache>, SlabError> {
        if config.object_size == 0 {
            return Err(SlabError::BadValue);
        }
        if config.alignment != 0 && !config.alignment.is_power_of_two() {
            return Err(SlabError::BadValue);
        }

        let alignment = config.alignment.max(MIN_OBJECT_ALIGNMENT);
        let object_size = VirtualAddress::new(config.object_size.max(MIN_OBJECT_SIZE))
            .align_up(alignment)
            .value();

        let (slab_size, backing): (usize, Box<dyn SlabBacking>) = if config.object_size <= HASHED_CACHE_THRESHOLD {
            let slab_size = SmallObjectCache::slab_size(object_size, config.flags);
            (slab_size, Box::new(SmallObjectCache::new(id, slab_size)) as Box<dyn SlabBacking>)
        } else {
            let slab_size = HashedObjectCache::slab_size(object_size, config.flags);
            (slab_size, Box::new(HashedObjectCache::default()) as Box<dyn SlabBacking>)
        };
        let usable = backing.usable_bytes(slab_size);
        let objects_per_slab = usable / object_size;
        if objects_per_slab == 0 || alignment > slab_size {
            return Err(SlabError::BadValue);
        }

        let mut flags = config.flags;
        if cpus.cpu_count() <= 1 {
            flags |= CacheFlags::NO_DEPOT;
        }
        let magazine_capacity = match config.magazine_capacity {
            0 => default_magazine_capacity(object_size),
            capacity => capacity,
        };
        let max_magazine_count = match config.max_magazine_count {
            0 => magazine_capacity / 2,
            count => count,
        };

        let ObjectCacheConfig { name, maximum, constructor, destructor, reclaimer, .. } = config;
        let mut depot_error = None;
        let cache = Arc::new_cyclic(|this: &Weak<ObjectCache>| {
            let depot = if flags.contains(CacheFlags::NO_DEPOT) {
                None
            } else {
                let owner = this.clone();
                let return_object: ReturnObjectFn = Box::new(move |object, flags| match owner.upgrade() {
                    Some(cache) => cache.return_object(object, flags),
                    None => error!("ObjectCache: {:p} returned to a cache that no longer exists", object),
                });
                match ObjectDepot::new(magazine_capacity, max_magazine_count, cpus.clone(), return_object) {
                    Ok(depot) => Some(depot),
                    Err(e) => {
                        depot_error = Some(e);
                        None
                    }
                }
            };
            ObjectCache {
                id,
                name,
                object_size,
                alignment,
                slab_size,
                objects_per_slab,
                spare_bytes: usable - objects_per_slab * object_size,
                maximum,
                flags,
                inner: Mutex::new(CacheInner::new(backing)),
                depot,
                constructor,
                destructor,
                reclaimer,
                memory,
                maintenance,
                this: this.clone(),
            }
        });
        if let Some(e) = depot_error {
            error!("ObjectCache {}: couldn't create its depot: {}", cache.name, e);
            return Err(e);
        }

        debug!("ObjectCache {} ({}): object size {}, alignment {}, slab size {:#X}, {} objects per slab{}",
            cache.name, id, object_size, alignment, slab_size, objects_per_slab,
            if cache.depot.is_some() { "" } else { ", no depot" },
        );
        Ok(cache)
    }

    pub fn id(&self) -> CacheId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The size of the objects, after rounding up to the alignment.
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// The size of the chunk backing each slab.
    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    pub fn objects_per_slab(&self) -> usize {
        self.objects_per_slab
    }

    pub fn flags(&self) -> CacheFlags {
        self.flags
    }

    pub fn maximum(&self) -> usize {
        self.maximum
    }

    /// Returns the bytes of slabs currently held by this cache.
    pub fn usage(&self) -> usize {
        self.inner.lock().usage
    }

    pub fn stats(&self) -> CacheStats {
        let depot_objects = self.depot.as_ref().map_or(0, ObjectDepot::cached_objects);
        let inner = self.inner.lock();
        CacheStats {
            total_objects: inner.total_objects,
            used_count: inner.used_count,
            empty_count: inner.empty_count,
            pressure: inner.pressure,
            min_object_reserve: inner.min_object_reserve,
            usage: inner.usage,
            empty_slabs: inner.empty.len(),
            partial_slabs: inner.partial.len(),
            full_slabs: inner.full.len(),
            depot_objects,
        }
    }

    /// Allocates an object.
    ///
    /// The depot is tried first. Otherwise the object comes from a partial slab,
    /// or from an empty one, or from a newly created slab.
    pub fn alloc(&self, flags: CacheFlags) -> Result<NonNull<u8>, SlabError> {
        let flags = self.call_flags(flags);
        if let Some(depot) = &self.depot {
            if let Some(object) = depot.obtain() {
                self.fill(object, Fill::Allocated);
                return Ok(object);
            }
        }

        let mut inner = self.inner.lock();
        let slab_id = loop {
            if let Some(id) = inner.partial.head() {
                break id;
            }
            if let Some(id) = inner.empty.pop_head() {
                inner.empty_count -= 1;
                inner.partial.add(id);
                break id;
            }
            let (guard, result) = self.reserve_internal(inner, 1, flags);
            inner = guard;
            if let Err(e) = result {
                trace!("ObjectCache {}: allocation failed: {}", self.name, e);
                return Err(e);
            }
            inner.pressure += 1;
        };

        let object_size = self.object_size;
        let slab = inner.slab_mut(slab_id);
        let index = match slab.pop() {
            Some(index) => index,
            None => panic!("ObjectCache {}: {} is on the partial list but has no free object", self.name, slab_id),
        };
        let object = slab.object_ptr(index, object_size);
        let now_full = slab.count == 0;

        inner.used_count += 1;
        if now_full {
            inner.partial.remove(slab_id);
            inner.full.add(slab_id);
        }
        let below_reserve = inner.free_objects() < inner.min_object_reserve;
        drop(inner);

        if below_reserve {
            self.increase_object_reserve();
        }
        self.fill(object, Fill::Allocated);
        Ok(object)
    }

    /// Frees an object, through the depot if this cache has one.
    pub fn free(&self, object: NonNull<u8>, flags: CacheFlags) {
        let flags = self.call_flags(flags);
        self.fill(object, Fill::Freed);
        match &self.depot {
            Some(depot) => depot.store(object, flags),
            None => self.return_object(object, flags),
        }
    }

    /// Makes sure at least `object_count` free objects are available,
    /// creating new slabs if necessary.
    pub fn reserve(&self, object_count: usize, flags: CacheFlags) -> Result<(), SlabError> {
        if object_count == 0 {
            return Ok(());
        }
        let flags = self.call_flags(flags);
        let inner = self.inner.lock();
        let (_inner, result) = self.reserve_internal(inner, object_count, flags);
        result
    }

    /// Sets the number of free objects that the maintenance keeps available.
    pub fn set_minimum_reserve(&self, object_count: usize) -> Result<(), SlabError> {
        {
            let mut inner = self.inner.lock();
            if inner.min_object_reserve == object_count {
                return Ok(());
            }
            inner.min_object_reserve = object_count;
        }
        self.increase_object_reserve();
        Ok(())
    }

    /// Returns the slab that `object` belongs to.
    ///
    /// # Panics
    /// If `object` is not an object of this cache.
    pub fn object_slab(&self, object: NonNull<u8>) -> SlabId {
        let address = VirtualAddress::from_ptr(object);
        let inner = self.inner.lock();
        let id = self.find_slab(&inner, address);
        inner.slab(id).index_of(address, self.object_size);
        id
    }

    pub fn slab_info(&self, slab: SlabId) -> Option<SlabInfo> {
        self.inner.lock().get_slab(slab).map(Slab::info)
    }

    /// Returns the ids of the slabs on the empty, partial and full lists.
    pub fn slabs(&self) -> (Vec<SlabId>, Vec<SlabId>, Vec<SlabId>) {
        let inner = self.inner.lock();
        (inner.empty.iter().collect(), inner.partial.iter().collect(), inner.full.iter().collect())
    }

    fn find_slab(&self, inner: &CacheInner, address: VirtualAddress) -> SlabId {
        match inner.backing.lookup(address.align_down(self.slab_size)) {
            Some(id) if inner.get_slab(id).is_some() => id,
            _ => panic!("ObjectCache {}: {:?} is not one of its objects", self.name, address),
        }
    }

    /// Puts an object back into its slab.
    pub(crate) fn return_object(&self, object: NonNull<u8>, flags: CacheFlags) {
        let flags = self.call_flags(flags);
        let address = VirtualAddress::from_ptr(object);
        let mut inner = self.inner.lock();
        let slab_id = self.find_slab(&inner, address);
        let released = self.return_object_to_slab(&mut inner, slab_id, address);
        drop(inner);
        if let Some(slab) = released {
            self.release_slab(slab, flags);
        }
    }

    /// Returns the slab if it became empty and is not worth keeping.
    fn return_object_to_slab(&self, inner: &mut CacheInner, id: SlabId, object: VirtualAddress) -> Option<Slab> {
        let object_size = self.object_size;
        let slab = inner.slab_mut(id);
        let index = slab.index_of(object, object_size);
        slab.push(index);
        let (count, size) = (slab.count, slab.size);
        inner.used_count -= 1;

        if count == size {
            if count == 1 {
                inner.full.remove(id);
            } else {
                inner.partial.remove(id);
            }
            if inner.empty_count < inner.pressure
                || inner.free_objects() - size < inner.min_object_reserve
            {
                inner.empty_count += 1;
                inner.empty.add(id);
                return None;
            }
            return Some(inner.take_slab(id, self.slab_size));
        }
        if count == 1 {
            inner.full.remove(id);
            inner.partial.add(id);
        }
        None
    }

    /// Adds the per-call flags this cache was created with to those of a call.
    fn call_flags(&self, flags: CacheFlags) -> CacheFlags {
        flags | self.flags.call_flags()
    }

    /// Grows the cache until `object_count` objects are free.
    ///
    /// Only one caller that may wait for memory, and one that may not, grow the cache at a time.
    /// Callers that may wait wait for them and then check again; callers passing
    /// [`CacheFlags::DONT_WAIT_FOR_MEMORY`] get [`SlabError::WouldBlock`] instead.
    fn reserve_internal<'c>(
        &'c self,
        mut inner: MutexGuard<'c, CacheInner>,
        object_count: usize,
        flags: CacheFlags,
    ) -> (MutexGuard<'c, CacheInner>, Result<(), SlabError>) {
        let dont_wait = flags.contains(CacheFlags::DONT_WAIT_FOR_MEMORY);
        loop {
            if inner.free_objects() >= object_count {
                return (inner, Ok(()));
            }
            let resize = inner.resize_dont_wait.clone().or_else(|| inner.resize_can_wait.clone());
            let in_flight = match resize {
                Some(_) if dont_wait => return (inner, Err(SlabError::WouldBlock)),
                Some(resize) => resize,
                None => break,
            };
            drop(inner);
            in_flight.wait();
            inner = self.inner.lock();
        }

        let done = Arc::new(Completion::new());
        if dont_wait {
            inner.resize_dont_wait = Some(done.clone());
        } else {
            inner.resize_can_wait = Some(done.clone());
        }

        let mut result = Ok(());
        while inner.free_objects() < object_count {
            let (guard, created) = self.create_slab(inner, flags);
            inner = guard;
            match created {
                Ok(id) => {
                    let size = inner.slab(id).size;
                    inner.usage += self.slab_size;
                    inner.total_objects += size;
                    inner.empty.add(id);
                    inner.empty_count += 1;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        if dont_wait {
            inner.resize_dont_wait = None;
        } else {
            inner.resize_can_wait = None;
        }
        done.complete();
        (inner, result)
    }

    /// Creates a new slab, which is on no list yet.
    fn create_slab<'c>(
        &'c self,
        mut inner: MutexGuard<'c, CacheInner>,
        flags: CacheFlags,
    ) -> (MutexGuard<'c, CacheInner>, Result<SlabId, SlabError>) {
        if self.maximum != 0 && inner.usage + self.slab_size > self.maximum {
            debug!("ObjectCache {}: reached its maximum of {} bytes", self.name, self.maximum);
            return (inner, Err(SlabError::NoMemory));
        }
        let offset = inner.next_color(self.alignment.max(CACHE_LINE_SIZE), self.spare_bytes);
        drop(inner);

        let slab = self.allocate_slab(offset, flags);

        let mut inner = self.inner.lock();
        let slab = match slab {
            Ok(slab) => slab,
            Err(e) => return (inner, Err(e)),
        };
        let pages = slab.pages;
        let id = inner.insert_slab(slab);
        trace!("ObjectCache {}: created {} at {:?}, color offset {}", self.name, id, pages, offset);
        (inner, Ok(id))
    }

    /// Allocates a chunk for a new slab and constructs its objects, without holding the lock.
    fn allocate_slab(&self, offset: usize, flags: CacheFlags) -> Result<Slab, SlabError> {
        let pages = self.memory.allocate(self.id, self.slab_size, flags)?;
        let slab = match Slab::try_new(pages, self.objects_per_slab, offset) {
            Ok(slab) => slab,
            Err(e) => {
                self.memory.free(pages, flags);
                return Err(e);
            }
        };

        if let Some(constructor) = &self.constructor {
            for index in 0 .. slab.size {
                if let Err(e) = constructor(slab.object_ptr(index, self.object_size)) {
                    warn!("ObjectCache {}: constructor failed for object {} of a new slab: {}", self.name, index, e);
                    if let Some(destructor) = &self.destructor {
                        for constructed in 0 .. index {
                            destructor(slab.object_ptr(constructed, self.object_size));
                        }
                    }
                    self.memory.free(pages, flags);
                    return Err(e);
                }
            }
        }
        Ok(slab)
    }

    /// Destructs the objects of a slab taken off the cache and frees its chunk.
    fn release_slab(&self, slab: Slab, flags: CacheFlags) {
        if let Some(destructor) = &self.destructor {
            for index in 0 .. slab.size {
                destructor(slab.object_ptr(index, self.object_size));
            }
        }
        self.memory.free(slab.pages, flags);
        trace!("ObjectCache {}: released slab at {:?}", self.name, slab.pages);
    }

    fn increase_object_reserve(&self) {
        if let Some(cache) = self.this.upgrade() {
            self.maintenance.request_resize(cache);
        }
    }

    /// Tops up the free objects to the minimum reserve, on behalf of the maintenance.
    pub(crate) fn maintain_reserve(&self) {
        let inner = self.inner.lock();
        let reserve = inner.min_object_reserve;
        let (_inner, result) = self.reserve_internal(inner, reserve, self.call_flags(CacheFlags::empty()));
        if let Err(e) = result {
            error!("ObjectCache {}: maintenance failed to reserve {} objects: {}", self.name, reserve, e);
        }
    }

    /// Gives memory back in response to a low memory notification.
    ///
    /// Runs the reclaimer, empties the depot, lowers the pressure, and returns empty slabs
    /// down to a floor that depends on `level`, never dipping below the minimum reserve.
    /// Returns the number of slabs given back.
    pub(crate) fn reclaim(&self, level: ResourceLevel) -> usize {
        if let Some(reclaimer) = &self.reclaimer {
            reclaimer(level);
        }
        if let Some(depot) = &self.depot {
            depot.make_empty(self.call_flags(CacheFlags::empty()));
        }

        let mut inner = self.inner.lock();
        let minimum_allowed = match level {
            ResourceLevel::None => return 0,
            ResourceLevel::Note => {
                let pressure = inner.pressure;
                inner.pressure = pressure - pressure / 8;
                pressure / 2 + 1
            }
            ResourceLevel::Warning => {
                inner.pressure /= 2;
                0
            }
            ResourceLevel::Critical => {
                inner.pressure = 0;
                0
            }
        };

        let mut released = 0;
        while inner.empty_count > minimum_allowed {
            let head = match inner.empty.head() {
                Some(head) => head,
                None => break,
            };
            let objects_per_slab = inner.slab(head).size;
            if inner.free_objects() < inner.min_object_reserve + objects_per_slab {
                break;
            }
            inner.empty.pop_head();
            inner.empty_count -= 1;
            let slab = inner.take_slab(head, self.slab_size);
            drop(inner);
            self.release_slab(slab, self.call_flags(CacheFlags::empty()));
            released += 1;
            inner = self.inner.lock();
        }
        if released > 0 {
            debug!("ObjectCache {}: gave back {} slabs on {:?} memory pressure", self.name, released, level);
        }
        released
    }

    /// Tears the cache down: empties the depot and gives back all slabs.
    ///
    /// # Panics
    /// If any object of the cache is still in use.
    pub(crate) fn destroy(&self) {
        if let Some(depot) = &self.depot {
            depot.make_empty(self.call_flags(CacheFlags::empty()));
        }
        let slabs = {
            let mut inner = self.inner.lock();
            if !inner.full.is_empty() {
                panic!("ObjectCache {}: deleted while {} slabs are full", self.name, inner.full.len());
            }
            if !inner.partial.is_empty() {
                panic!("ObjectCache {}: deleted while {} slabs are partially used", self.name, inner.partial.len());
            }
            let mut slabs = Vec::with_capacity(inner.empty.len());
            while let Some(id) = inner.empty.pop_head() {
                inner.empty_count -= 1;
                slabs.push(inner.take_slab(id, self.slab_size));
            }
            slabs
        };
        for slab in slabs {
            self.release_slab(slab, self.call_flags(CacheFlags::empty()));
        }
        debug!("ObjectCache {}: deleted", self.name);
    }

    #[cfg(feature = "paranoia")]
    fn fill(&self, object: NonNull<u8>, pattern: Fill) {
        if self.constructor.is_some() {
            return;
        }
        let pattern = match pattern {
            Fill::Allocated => ALLOCATED_PATTERN,
            Fill::Freed => FREED_PATTERN,
        };
        let words = object.as_ptr() as *mut u32;
        for i in 0 .. self.object_size / core::mem::size_of::<u32>() {
            // SAFETY: the object is `object_size` bytes long and aligned to at least 8 bytes.
            unsafe { words.add(i).write(pattern) };
        }
    }

    #[cfg(not(feature = "paranoia"))]
    #[inline(always)]
    fn fill(&self, _object: NonNull<u8>, _pattern: Fill) {}
}

#[derive(Clone, Copy)]
enum Fill {
    Allocated,
    Freed,
}
