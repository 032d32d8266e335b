//! The slab memory manager, the lowest layer of the slab allocator.
//!
//! It owns every [`SLAB_AREA_SIZE`] sized area of address space used by the object caches.
//! An area is split into [`SLAB_META_CHUNKS_PER_AREA`] meta chunks, and each meta chunk,
//! once it is needed, is assigned one of three chunk size classes (small, medium, large)
//! and split into chunks of that size. A chunk is the unit handed out to callers:
//! either a single chunk that backs one slab of an object cache ([`MemoryManager::allocate()`]),
//! or a run of contiguous chunks for a raw allocation ([`MemoryManager::allocate_raw()`]).
//!
//! Pages are mapped when a chunk is handed out and unmapped when it is freed.
//! Mapping and unmapping happen without holding the manager's lock;
//! the chunks involved are marked as used beforehand, so no one else can take them.
//!
//! The chunk references of every area in use are also reachable from the area table,
//! which has a read/write lock of its own. Frees and address lookups go through it
//! and only take the manager's lock to put chunks back on the lists.
//!
//! Unused meta chunks sit on one of two free lists: "free short" for the first meta chunk
//! of each area, which is shorter because of the area's administrative page,
//! and "free complete" for all others. Areas whose meta chunks are all unused are kept
//! as spares (one or two of them) or given back to the VM.
//! The background maintenance restores that reserve via [`MemoryManager::perform_maintenance()`].
//!
//! # Boot
//! A manager created with [`MemoryManager::init_early()`] takes its areas from boot-time
//! memory that is fully mapped. [`MemoryManager::init_post_area()`] later turns them
//! into proper VM areas and unmaps everything in them that is not in use.

#![no_std]

#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;
extern crate alloc;
extern crate hashbrown;
extern crate kernel_config;
extern crate slab_structs;
extern crate slab_vm;
extern crate spin;

mod area;

pub use area::{ChunkReference, ChunkSizeClass};

use alloc::{sync::Arc, vec::Vec};
use area::{Area, AreaHeader, AreaLookup, ChunkTable, MetaChunk, MetaChunkList, MetaChunkRef};
use core::sync::atomic::{AtomicBool, Ordering};
use hashbrown::HashMap;
use kernel_config::{memory::*, slab::FREE_AREA_RESERVE};
use slab_structs::{CacheFlags, CacheId, Completion, SlabError, VirtualAddress};
use slab_vm::{VmAreaId, VmBackend};
use spin::{Mutex, MutexGuard, RwLock};

const_assert!(FREE_AREA_RESERVE >= 1);


/// What an address handed out by the memory manager belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocationInfo {
    /// A chunk that backs a slab of the given cache.
    Cache { cache: CacheId, chunk: VirtualAddress, chunk_size: usize },
    /// A raw allocation of `size` bytes starting at `base`.
    Raw { base: VirtualAddress, size: usize },
}

/// A snapshot of the memory manager's lists.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MemoryManagerStats {
    pub areas: usize,
    pub free_areas: usize,
    pub free_short_meta_chunks: usize,
    pub free_complete_meta_chunks: usize,
    pub partial_small_meta_chunks: usize,
    pub partial_medium_meta_chunks: usize,
}

/// A snapshot of the meta chunk covering some address.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MetaChunkInfo {
    pub chunk_base: VirtualAddress,
    /// Zero for an unassigned meta chunk.
    pub chunk_size: usize,
    pub chunk_count: usize,
    pub used_chunk_count: usize,
    pub free_chunk_count: usize,
    pub free_range: Option<(usize, usize)>,
    /// Whether the meta chunk is on a partial list.
    pub partial: bool,
    /// Whether the meta chunk is on the free short or free complete list.
    pub free: bool,
}

/// A range of chunks taken from one meta chunk, not yet mapped.
struct ChunkGrant {
    meta: MetaChunkRef,
    first: usize,
    count: usize,
    address: VirtualAddress,
    vm_area: Option<VmAreaId>,
}

/// An area allocation that is in progress; callers needing an area wait for it
/// instead of allocating another one.
struct InFlightArea {
    class: ChunkSizeClass,
    done: Arc<Completion>,
}

/// What the chunk handed to a free belongs to.
enum ChunkOwner {
    Cache(CacheId),
    /// A raw allocation of the given size.
    Raw(ChunkGrant, usize),
}

type AreaTable = RwLock<HashMap<VirtualAddress, AreaLookup>>;

#[derive(Default)]
struct ManagerState {
    /// Areas in use, keyed by base address.
    areas: HashMap<VirtualAddress, Area>,
    /// Spare areas. Their meta chunks are on no list.
    free_areas: Vec<Area>,
    free_short: MetaChunkList,
    free_complete: MetaChunkList,
    partial_small: MetaChunkList,
    partial_medium: MetaChunkList,
    in_flight: Vec<InFlightArea>,
}

impl ManagerState {
    fn partial_list(&mut self, class: ChunkSizeClass) -> Option<&mut MetaChunkList> {
        match class {
            ChunkSizeClass::Small => Some(&mut self.partial_small),
            ChunkSizeClass::Medium => Some(&mut self.partial_medium),
            ChunkSizeClass::Large => None,
        }
    }

    fn partial_list_ref(&self, class: ChunkSizeClass) -> Option<&MetaChunkList> {
        match class {
            ChunkSizeClass::Small => Some(&self.partial_small),
            ChunkSizeClass::Medium => Some(&self.partial_medium),
            ChunkSizeClass::Large => None,
        }
    }

    fn area_mut(&mut self, base: VirtualAddress) -> &mut Area {
        match self.areas.get_mut(&base) {
            Some(area) => area,
            None => panic!("MemoryManager: no area at {:?}", base),
        }
    }

    fn meta_chunk(&self, meta: MetaChunkRef) -> Option<&MetaChunk> {
        self.areas.get(&meta.area).map(|area| &area.meta_chunks[meta.index])
    }

    fn meta_chunk_mut(&mut self, meta: MetaChunkRef) -> &mut MetaChunk {
        &mut self.area_mut(meta.area).meta_chunks[meta.index]
    }

    /// Takes an unassigned meta chunk that can hold `count` chunks of the given class
    /// and assigns it to that class.
    fn take_free_meta_chunk(&mut self, class: ChunkSizeClass, count: usize) -> Option<MetaChunkRef> {
        let meta = if class != ChunkSizeClass::Large && class.short_meta_chunk_capacity() >= count {
            self.free_short.pop_head().or_else(|| self.free_complete.pop_head())
        } else {
            self.free_complete.pop_head()
        }?;
        if let Some(list) = self.partial_list(class) {
            list.add(meta);
        }
        let area = self.area_mut(meta.area);
        area.used_meta_chunk_count += 1;
        let base = area.base;
        area.meta_chunks[meta.index].prepare(base, meta.index, class);
        Some(meta)
    }

    /// Takes a single free chunk of the given class.
    fn get_chunk(&mut self, class: ChunkSizeClass) -> Option<ChunkGrant> {
        let existing = self.partial_list(class).and_then(|list| list.head());
        let meta = match existing {
            Some(meta) => meta,
            None => self.take_free_meta_chunk(class, 1)?,
        };

        let meta_chunk = self.meta_chunk_mut(meta);
        let index = match meta_chunk.free_chunks.pop() {
            Some(index) => index as usize,
            None => panic!("MemoryManager: meta chunk {:?} is listed as partial but has no free chunk", meta),
        };
        meta_chunk.used_chunk_count += 1;
        meta_chunk.set_references(index, 1, ChunkReference::Pending);
        meta_chunk.shrink_free_range(index);
        let now_full = meta_chunk.used_chunk_count == meta_chunk.chunk_count();
        let address = meta_chunk.chunk_address(index);

        if now_full {
            if let Some(list) = self.partial_list(class) {
                list.remove(meta);
            }
        }
        Some(ChunkGrant { meta, first: index, count: 1, address, vm_area: self.area_mut(meta.area).vm_area })
    }

    /// Takes `count` contiguous free chunks of the given class.
    fn get_chunks(&mut self, class: ChunkSizeClass, count: usize) -> Option<ChunkGrant> {
        if count == 1 {
            return self.get_chunk(class);
        }
        let fits = |meta_chunk: &MetaChunk| meta_chunk.free_range
            .map_or(false, |(first, last)| last + 1 - first >= count);

        let existing = self.partial_list_ref(class).and_then(|list| {
            list.iter().find(|meta| self.meta_chunk(*meta).map_or(false, |m| fits(m)))
        });
        let meta = match existing {
            Some(meta) => meta,
            None => self.take_free_meta_chunk(class, count)?,
        };

        let meta_chunk = self.meta_chunk_mut(meta);
        let (first, last) = match meta_chunk.free_range {
            Some(range) if range.1 + 1 - range.0 >= count => range,
            _ => panic!("MemoryManager: meta chunk {:?} has no room for {} chunks", meta, count),
        };
        meta_chunk.free_chunks.retain(|i| (*i as usize) < first || (*i as usize) >= first + count);
        meta_chunk.set_references(first, count, ChunkReference::Pending);
        meta_chunk.used_chunk_count += count;
        meta_chunk.free_range = if first + count <= last { Some((first + count, last)) } else { None };
        let now_full = meta_chunk.used_chunk_count == meta_chunk.chunk_count();
        let address = meta_chunk.chunk_address(first);

        if now_full {
            if let Some(list) = self.partial_list(class) {
                list.remove(meta);
            }
        }
        Some(ChunkGrant { meta, first, count, address, vm_area: self.area_mut(meta.area).vm_area })
    }

    /// Publishes an area: its meta chunks become available for allocation.
    fn add_area(&mut self, area: Area, area_table: &AreaTable) {
        area_table.write().insert(area.base, area.lookup());
        self.free_short.add(area.meta_chunk_ref(0));
        for index in 1 .. SLAB_META_CHUNKS_PER_AREA {
            self.free_complete.add(area.meta_chunk_ref(index));
        }
        debug!("MemoryManager: added area at {:?}", area.base);
        self.areas.insert(area.base, area);
    }

    /// Withdraws a completely unused area from allocation.
    fn remove_area(&mut self, base: VirtualAddress, area_table: &AreaTable) -> Area {
        let area = match self.areas.remove(&base) {
            Some(area) => area,
            None => panic!("MemoryManager: removing unknown area {:?}", base),
        };
        assert!(area.used_meta_chunk_count == 0, "MemoryManager: removing area {:?} which is still in use", base);
        for index in 0 .. SLAB_META_CHUNKS_PER_AREA {
            let meta = area.meta_chunk_ref(index);
            if !self.free_short.remove(meta) {
                self.free_complete.remove(meta);
            }
        }
        area_table.write().remove(&base);
        area
    }
}


/// The memory manager. See the crate documentation.
pub struct MemoryManager {
    vm: Arc<dyn VmBackend>,
    state: Mutex<ManagerState>,
    /// Every area in use by base address, with its VM area and chunk tables.
    /// Frees look up chunks here without taking `state`.
    area_table: AreaTable,
    maintenance_needed: AtomicBool,
    /// Set until [`MemoryManager::init_post_area()`] ran on a manager created with `init_early()`.
    early: AtomicBool,
}

impl MemoryManager {
    /// Creates a memory manager that creates its areas through the given VM backend.
    pub fn new<V: VmBackend + 'static>(vm: Arc<V>) -> MemoryManager {
        Self::with_backend(vm, false)
    }

    /// Creates a memory manager that carves its areas out of boot-time memory
    /// until [`init_post_area()`](MemoryManager::init_post_area) is called.
    pub fn init_early<V: VmBackend + 'static>(vm: Arc<V>) -> MemoryManager {
        Self::with_backend(vm, true)
    }

    fn with_backend(vm: Arc<dyn VmBackend>, early: bool) -> MemoryManager {
        MemoryManager {
            vm,
            state: Mutex::new(ManagerState::default()),
            area_table: RwLock::new(HashMap::new()),
            maintenance_needed: AtomicBool::new(false),
            early: AtomicBool::new(early),
        }
    }

    /// Rounds `size` up to the size of the smallest chunk size class that can hold it.
    /// Sizes beyond a large chunk are clamped to a large chunk.
    pub fn acceptable_chunk_size(size: usize) -> usize {
        if size <= SLAB_CHUNK_SIZE_SMALL {
            SLAB_CHUNK_SIZE_SMALL
        } else if size <= SLAB_CHUNK_SIZE_MEDIUM {
            SLAB_CHUNK_SIZE_MEDIUM
        } else {
            SLAB_CHUNK_SIZE_LARGE
        }
    }

    /// Allocates and maps one chunk of `chunk_size` bytes that backs a slab of the given cache.
    ///
    /// `chunk_size` must be one of the chunk size classes,
    /// see [`acceptable_chunk_size()`](MemoryManager::acceptable_chunk_size).
    pub fn allocate(&self, cache: CacheId, chunk_size: usize, flags: CacheFlags) -> Result<VirtualAddress, SlabError> {
        let class = ChunkSizeClass::from_size(chunk_size).ok_or(SlabError::BadValue)?;
        let flags = flags.call_flags();

        let (state, grant) = self.allocate_chunks(self.state.lock(), class, 1, flags);
        let grant = grant?;
        drop(state);

        let mapped = self.map_chunk(grant.vm_area, grant.address, chunk_size, flags);

        let mut state = self.state.lock();
        if let Err(e) = mapped {
            let doomed = self.free_chunks(&mut state, &grant, flags);
            drop(state);
            self.delete_areas(doomed);
            return Err(e);
        }
        state.meta_chunk_mut(grant.meta).set_references(grant.first, 1, ChunkReference::Cache(cache));
        trace!("MemoryManager: allocated chunk {:?} ({:#X} bytes) for {}", grant.address, chunk_size, cache);
        Ok(grant.address)
    }

    /// Unmaps and frees a chunk previously returned by [`allocate()`](MemoryManager::allocate).
    ///
    /// # Panics
    /// If `pages` is not the start of a chunk that backs a slab.
    pub fn free(&self, pages: VirtualAddress, flags: CacheFlags) {
        let flags = flags.call_flags();
        let found = self.with_chunk_table(pages, |vm_area, table| {
            let index = match table.chunk_index(pages) {
                Some(index) if table.chunk_address(index) == pages => index,
                _ => panic!("MemoryManager::free(): {:?} is not a chunk", pages),
            };
            if !matches!(table.chunks[index], ChunkReference::Cache(_)) {
                panic!("MemoryManager::free(): chunk {:?} is {:?}", pages, table.chunks[index]);
            }
            let meta = MetaChunkRef::containing(pages);
            (ChunkGrant { meta, first: index, count: 1, address: pages, vm_area }, table.chunk_size)
        });
        let (grant, chunk_size) = match found {
            Some(found) => found,
            None => panic!("MemoryManager::free(): {:?} is not a chunk", pages),
        };

        self.unmap_chunk(grant.vm_area, pages, chunk_size);

        let mut state = self.state.lock();
        let doomed = self.free_chunks(&mut state, &grant, flags);
        drop(state);
        self.delete_areas(doomed);
        trace!("MemoryManager: freed chunk {:?}", pages);
    }

    /// Allocates `size` bytes of raw memory, rounded up to whole pages.
    ///
    /// Sizes up to a large chunk are served from contiguous small or medium chunks.
    /// Bigger sizes, and allocations with [`CacheFlags::ALIGN_ON_SIZE`],
    /// get a dedicated VM area of their own.
    pub fn allocate_raw(&self, size: usize, flags: CacheFlags) -> Result<VirtualAddress, SlabError> {
        if size == 0 {
            return Err(SlabError::BadValue);
        }
        let flags = flags.call_flags();
        let size = VirtualAddress::new(size).align_up(SLAB_CHUNK_SIZE_SMALL).value();

        if size > SLAB_CHUNK_SIZE_LARGE || flags.contains(CacheFlags::ALIGN_ON_SIZE) {
            if flags.contains(CacheFlags::DONT_LOCK_KERNEL_SPACE) {
                return Err(SlabError::WouldBlock);
            }
            let alignment = if flags.contains(CacheFlags::ALIGN_ON_SIZE) {
                if !size.is_power_of_two() {
                    return Err(SlabError::BadValue);
                }
                size
            } else {
                0
            };
            let area = self.vm.create_area(size, alignment, flags)?;
            debug!("MemoryManager: allocated raw area {:?} at {:?}, {:#X} bytes", area.id, area.base, size);
            return Ok(area.base);
        }

        let (class, count) = if size % SLAB_CHUNK_SIZE_MEDIUM == 0 {
            (ChunkSizeClass::Medium, size / SLAB_CHUNK_SIZE_MEDIUM)
        } else {
            (ChunkSizeClass::Small, size / SLAB_CHUNK_SIZE_SMALL)
        };

        let (state, grant) = self.allocate_chunks(self.state.lock(), class, count, flags);
        let grant = grant?;
        drop(state);

        let mapped = self.map_chunk(grant.vm_area, grant.address, size, flags);

        let mut state = self.state.lock();
        if let Err(e) = mapped {
            let doomed = self.free_chunks(&mut state, &grant, flags);
            drop(state);
            self.delete_areas(doomed);
            return Err(e);
        }
        let mut table = state.meta_chunk_mut(grant.meta).table.write();
        let chunks = &mut table.chunks[grant.first .. grant.first + count];
        chunks[0] = ChunkReference::RawExtent(grant.address + size);
        for reference in &mut chunks[1 ..] {
            *reference = ChunkReference::RawTail;
        }
        drop(table);
        trace!("MemoryManager: allocated raw {:?}, {} {:?} chunks", grant.address, count, class);
        Ok(grant.address)
    }

    /// Frees the raw allocation at `pages`, or, if `pages` is a chunk backing a slab,
    /// returns the owning cache so that the caller can free the object through it.
    ///
    /// # Panics
    /// If `pages` is neither the start of a raw allocation nor within a slab chunk.
    pub fn free_raw_or_return_cache(&self, pages: VirtualAddress, flags: CacheFlags) -> Result<Option<CacheId>, SlabError> {
        let flags = flags.call_flags();
        let owner = self.with_chunk_table(pages, |vm_area, table| {
            let index = match table.chunk_index(pages) {
                Some(index) => index,
                None => panic!("MemoryManager: freeing {:?} from an unused meta chunk", pages),
            };
            match table.chunks[index] {
                ChunkReference::Cache(cache) => ChunkOwner::Cache(cache),
                ChunkReference::RawExtent(end) if table.chunk_address(index) == pages => {
                    let size = end - pages;
                    let meta = MetaChunkRef::containing(pages);
                    let grant = ChunkGrant { meta, first: index, count: size / table.chunk_size, address: pages, vm_area };
                    ChunkOwner::Raw(grant, size)
                }
                other => panic!("MemoryManager: freeing {:?}, which is not a raw allocation but {:?}", pages, other),
            }
        });
        let (grant, size) = match owner {
            Some(ChunkOwner::Cache(cache)) => return Ok(Some(cache)),
            Some(ChunkOwner::Raw(grant, size)) => (grant, size),
            None => return self.free_raw_area(pages, flags).map(|()| None),
        };

        self.unmap_chunk(grant.vm_area, pages, size);

        let mut state = self.state.lock();
        let doomed = self.free_chunks(&mut state, &grant, flags);
        drop(state);
        self.delete_areas(doomed);
        trace!("MemoryManager: freed raw {:?}, {} chunks", pages, grant.count);
        Ok(None)
    }

    /// Frees a raw allocation that got a VM area of its own.
    fn free_raw_area(&self, pages: VirtualAddress, flags: CacheFlags) -> Result<(), SlabError> {
        match self.vm.area_for_address(pages) {
            Some(area) if area.base == pages => {
                if flags.contains(CacheFlags::DONT_LOCK_KERNEL_SPACE) {
                    return Err(SlabError::WouldBlock);
                }
                self.vm.delete_area(area.id)?;
                debug!("MemoryManager: freed raw area {:?} at {:?}", area.id, pages);
                Ok(())
            }
            other => panic!("MemoryManager: freeing unknown block {:?} from area {:?}", pages, other),
        }
    }

    /// Returns the cache whose slab lives in the chunk containing `address`.
    pub fn cache_for_address(&self, address: VirtualAddress) -> Option<CacheId> {
        self.with_chunk_table(address, |_, table| {
            match table.chunk_index(address).map(|index| table.chunks[index]) {
                Some(ChunkReference::Cache(cache)) => Some(cache),
                _ => None,
            }
        })
        .flatten()
    }

    /// Returns what the allocation containing `address` is.
    pub fn allocation_info(&self, address: VirtualAddress) -> Option<AllocationInfo> {
        let info = self.with_chunk_table(address, |_, table| {
            let mut index = table.chunk_index(address)?;
            loop {
                match table.chunks[index] {
                    ChunkReference::Cache(cache) => return Some(AllocationInfo::Cache {
                        cache,
                        chunk: table.chunk_address(index),
                        chunk_size: table.chunk_size,
                    }),
                    ChunkReference::RawExtent(end) => {
                        let base = table.chunk_address(index);
                        return Some(AllocationInfo::Raw { base, size: end - base });
                    }
                    ChunkReference::RawTail if index > 0 => index -= 1,
                    _ => return None,
                }
            }
        });
        match info {
            Some(info) => info,
            None => self.vm.area_for_address(address)
                .map(|area| AllocationInfo::Raw { base: area.base, size: area.size }),
        }
    }

    /// Runs `f` on the chunk table covering `address` and the VM area it lives in,
    /// or returns `None` if no area of this manager holds `address`.
    ///
    /// Only takes the area table's read lock and the chunk table's read lock.
    fn with_chunk_table<R>(&self, address: VirtualAddress, f: impl FnOnce(Option<VmAreaId>, &ChunkTable) -> R) -> Option<R> {
        let area_table = self.area_table.read();
        let area = area_table.get(&address.align_down(SLAB_AREA_SIZE))?;
        let table = area.meta_chunks[MetaChunkRef::containing(address).index].read();
        Some(f(area.vm_area, &table))
    }

    /// Returns `true` if background maintenance was requested.
    pub fn maintenance_needed(&self) -> bool {
        self.maintenance_needed.load(Ordering::Acquire)
    }

    /// Brings the number of spare areas back to the reserve: allocates one if there is none,
    /// and gives back to the VM all but [`FREE_AREA_RESERVE`] of them.
    pub fn perform_maintenance(&self) {
        let mut state = self.state.lock();
        while self.maintenance_needed.swap(false, Ordering::AcqRel) {
            let free_count = state.free_areas.len();
            if free_count > 0 && free_count <= FREE_AREA_RESERVE {
                return;
            }

            if free_count == 0 {
                drop(state);
                let area = self.allocate_area(CacheFlags::empty());
                state = self.state.lock();
                match area {
                    Ok(area) => {
                        state.free_areas.push(area);
                        if state.free_areas.len() > FREE_AREA_RESERVE {
                            self.maintenance_needed.store(true, Ordering::Release);
                        }
                    }
                    Err(e) => {
                        warn!("MemoryManager: maintenance couldn't allocate a spare area: {}", e);
                        return;
                    }
                }
            } else {
                let mut doomed = Vec::new();
                let mut kept = Vec::new();
                while state.free_areas.len() + kept.len() > FREE_AREA_RESERVE {
                    match state.free_areas.pop() {
                        // Boot-time memory cannot be given back.
                        Some(area) if area.vm_area.is_none() => kept.push(area),
                        Some(area) => doomed.push(area),
                        None => break,
                    }
                }
                state.free_areas.append(&mut kept);
                drop(state);
                debug!("MemoryManager: maintenance releases {} spare areas", doomed.len());
                self.delete_areas(doomed);
                state = self.state.lock();
                if state.free_areas.is_empty() {
                    self.maintenance_needed.store(true, Ordering::Release);
                }
            }
        }
    }

    /// Turns all areas carved from boot-time memory into VM areas,
    /// unmapping every part of them that holds no allocation.
    pub fn init_post_area(&self) -> Result<(), SlabError> {
        if !self.early.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let early_bases: Vec<VirtualAddress> = {
            let state = self.state.lock();
            state.areas.values().chain(state.free_areas.iter())
                .filter(|area| area.vm_area.is_none())
                .map(|area| area.base)
                .collect()
        };

        let mut adopted = Vec::with_capacity(early_bases.len());
        for base in early_bases {
            let vm_area = self.vm.adopt_early_area(base, SLAB_AREA_SIZE)?;
            adopted.push((base, vm_area.id));
        }

        let mut unused = Vec::new();
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            let mut table = self.area_table.write();
            for (base, id) in adopted {
                let area = match state.areas.get_mut(&base) {
                    Some(area) => {
                        if let Some(entry) = table.get_mut(&base) {
                            entry.vm_area = Some(id);
                        }
                        area
                    }
                    None => match state.free_areas.iter_mut().find(|area| area.base == base) {
                        Some(area) => area,
                        None => continue,
                    },
                };
                area.vm_area = Some(id);
                area.reserved_memory_for_mapping = SLAB_AREA_ADMIN_SIZE;
                unused.extend(area.unused_ranges().into_iter().map(|(start, size)| (id, start, size)));
            }
        }

        for (id, start, size) in unused {
            self.unmap_chunk(Some(id), start, size);
        }
        self.maintenance_needed.store(true, Ordering::Release);
        self.vm.wake_maintainer();
        debug!("MemoryManager: converted boot-time areas");
        Ok(())
    }

    /// Returns a snapshot of the manager's lists.
    pub fn stats(&self) -> MemoryManagerStats {
        let state = self.state.lock();
        MemoryManagerStats {
            areas: state.areas.len(),
            free_areas: state.free_areas.len(),
            free_short_meta_chunks: state.free_short.len(),
            free_complete_meta_chunks: state.free_complete.len(),
            partial_small_meta_chunks: state.partial_small.len(),
            partial_medium_meta_chunks: state.partial_medium.len(),
        }
    }

    /// Returns a snapshot of the meta chunk covering `address`.
    pub fn meta_chunk_info(&self, address: VirtualAddress) -> Option<MetaChunkInfo> {
        let state = self.state.lock();
        let meta = MetaChunkRef::containing(address);
        let meta_chunk = state.meta_chunk(meta)?;
        Some(MetaChunkInfo {
            chunk_base: meta_chunk.chunk_base,
            chunk_size: meta_chunk.chunk_size,
            chunk_count: meta_chunk.chunk_count(),
            used_chunk_count: meta_chunk.used_chunk_count,
            free_chunk_count: meta_chunk.free_chunks.len(),
            free_range: meta_chunk.free_range,
            partial: state.partial_small.contains(meta) || state.partial_medium.contains(meta),
            free: state.free_short.contains(meta) || state.free_complete.contains(meta),
        })
    }

    /// Finds `count` contiguous chunks of the given class, adding a new area if needed.
    ///
    /// The lock is dropped while a new area is being allocated; concurrent callers that
    /// need an area wait for that allocation instead of starting their own.
    /// Callers passing [`CacheFlags::DONT_WAIT_FOR_MEMORY`] get [`SlabError::WouldBlock`] instead.
    fn allocate_chunks<'m>(
        &'m self,
        mut state: MutexGuard<'m, ManagerState>,
        class: ChunkSizeClass,
        count: usize,
        flags: CacheFlags,
    ) -> (MutexGuard<'m, ManagerState>, Result<ChunkGrant, SlabError>) {
        if let Some(grant) = state.get_chunks(class, count) {
            return (state, Ok(grant));
        }

        if let Some(area) = state.free_areas.pop() {
            state.add_area(area, &self.area_table);
            self.request_maintenance(&state);
            let grant = state.get_chunks(class, count).ok_or(SlabError::NoMemory);
            return (state, grant);
        }

        if flags.contains(CacheFlags::DONT_LOCK_KERNEL_SPACE) {
            return (state, Err(SlabError::WouldBlock));
        }

        let dont_wait = flags.contains(CacheFlags::DONT_WAIT_FOR_MEMORY);
        loop {
            let done = match state.in_flight.iter().find(|f| f.class == class) {
                Some(_) if dont_wait => return (state, Err(SlabError::WouldBlock)),
                Some(in_flight) => in_flight.done.clone(),
                None => break,
            };
            drop(state);
            done.wait();
            state = self.state.lock();
            if let Some(grant) = state.get_chunks(class, count) {
                return (state, Ok(grant));
            }
            if let Some(area) = state.free_areas.pop() {
                state.add_area(area, &self.area_table);
                let grant = state.get_chunks(class, count).ok_or(SlabError::NoMemory);
                return (state, grant);
            }
        }

        let done = Arc::new(Completion::new());
        state.in_flight.push(InFlightArea { class, done: done.clone() });
        drop(state);

        let area = self.allocate_area(flags);

        state = self.state.lock();
        state.in_flight.retain(|f| !Arc::ptr_eq(&f.done, &done));
        done.complete();
        let area = match area {
            Ok(area) => area,
            Err(e) => return (state, Err(e)),
        };

        // Someone may have freed chunks in the meantime; the new area then becomes a spare.
        if let Some(grant) = state.get_chunks(class, count) {
            state.free_areas.push(area);
            self.request_maintenance(&state);
            return (state, Ok(grant));
        }
        state.add_area(area, &self.area_table);
        let grant = state.get_chunks(class, count).ok_or(SlabError::NoMemory);
        (state, grant)
    }

    /// Frees the chunks of a grant, in ascending order, without unmapping them.
    ///
    /// Returns the areas that became unused and have to be deleted once the lock is dropped.
    fn free_chunks(&self, state: &mut ManagerState, grant: &ChunkGrant, flags: CacheFlags) -> Vec<Area> {
        let mut doomed = Vec::new();
        for index in grant.first .. grant.first + grant.count {
            if let Some(area) = self.free_chunk(state, grant.meta, index, flags) {
                doomed.push(area);
            }
        }
        doomed
    }

    fn free_chunk(&self, state: &mut ManagerState, meta: MetaChunkRef, index: usize, flags: CacheFlags) -> Option<Area> {
        let meta_chunk = state.meta_chunk_mut(meta);
        if meta_chunk.reference(index) == ChunkReference::Free {
            panic!("MemoryManager: chunk {} of meta chunk {:?} freed twice", index, meta);
        }
        assert!(meta_chunk.used_chunk_count > 0);
        meta_chunk.set_references(index, 1, ChunkReference::Free);
        meta_chunk.free_chunks.push(index as u16);
        meta_chunk.used_chunk_count -= 1;
        let class = ChunkSizeClass::from_size(meta_chunk.chunk_size);

        if meta_chunk.used_chunk_count > 0 {
            meta_chunk.extend_free_range(index);
            let was_full = meta_chunk.used_chunk_count == meta_chunk.chunk_count() - 1;
            if was_full {
                if let Some(list) = class.and_then(|class| state.partial_list(class)) {
                    list.add(meta);
                }
            }
            return None;
        }

        // The meta chunk is unused now.
        meta_chunk.reset();
        if let Some(list) = class.and_then(|class| state.partial_list(class)) {
            list.remove(meta);
        }
        if meta.index == 0 {
            state.free_short.add_front(meta);
        } else {
            state.free_complete.add_front(meta);
        }

        let area = state.area_mut(meta.area);
        assert!(area.used_meta_chunk_count > 0);
        area.used_meta_chunk_count -= 1;
        if area.used_meta_chunk_count > 0 {
            return None;
        }
        let area = state.remove_area(meta.area, &self.area_table);
        self.free_area(state, area, flags)
    }

    /// Keeps an unused area as a spare if the reserve has room for it,
    /// otherwise returns it to be deleted.
    fn free_area(&self, state: &mut ManagerState, area: Area, flags: CacheFlags) -> Option<Area> {
        if state.free_areas.len() < FREE_AREA_RESERVE {
            state.free_areas.push(area);
            return None;
        }
        if area.vm_area.is_none() || flags.contains(CacheFlags::DONT_LOCK_KERNEL_SPACE) {
            state.free_areas.push(area);
            self.request_maintenance(state);
            return None;
        }
        Some(area)
    }

    fn request_maintenance(&self, state: &ManagerState) {
        let free_count = state.free_areas.len();
        if (free_count > 0 && free_count <= FREE_AREA_RESERVE) || self.maintenance_needed() {
            return;
        }
        self.maintenance_needed.store(true, Ordering::Release);
        self.vm.wake_maintainer();
    }

    /// Creates a new area, without holding the lock.
    fn allocate_area(&self, flags: CacheFlags) -> Result<Area, SlabError> {
        let area = if self.early.load(Ordering::Acquire) {
            let base = self.vm.allocate_early(SLAB_AREA_SIZE, SLAB_AREA_SIZE).ok_or(SlabError::NoMemory)?;
            Area::new(base, None, 0)
        } else {
            let vm_area = self.vm.create_null_area(SLAB_AREA_SIZE, flags)?;
            if let Err(e) = self.map_chunk(Some(vm_area.id), vm_area.base, SLAB_AREA_ADMIN_SIZE, flags) {
                if let Err(e) = self.vm.delete_area(vm_area.id) {
                    error!("MemoryManager: couldn't delete area {:?} after failing to map it: {}", vm_area.id, e);
                }
                return Err(e);
            }
            Area::new(vm_area.base, Some(vm_area.id), SLAB_AREA_ADMIN_SIZE)
        };
        // SAFETY: the administrative page of the new area was just mapped.
        unsafe { AreaHeader::write(area.base) };
        debug!("MemoryManager: allocated area at {:?}", area.base);
        Ok(area)
    }

    fn delete_areas(&self, areas: Vec<Area>) {
        for area in areas {
            self.delete_area(area);
        }
    }

    fn delete_area(&self, area: Area) {
        // SAFETY: the administrative page stays mapped for the area's whole life.
        debug_assert!(unsafe { AreaHeader::is_valid(area.base) });
        let id = match area.vm_area {
            Some(id) => id,
            None => {
                error!("MemoryManager: cannot delete boot-time area {:?}", area.base);
                return;
            }
        };
        match self.vm.delete_area(id) {
            Ok(()) => {
                self.vm.unreserve_memory(area.reserved_memory_for_mapping);
                debug!("MemoryManager: deleted area at {:?}", area.base);
            }
            Err(e) => error!("MemoryManager: couldn't delete area {:?}: {}", id, e),
        }
    }

    fn map_chunk(&self, vm_area: Option<VmAreaId>, address: VirtualAddress, size: usize, flags: CacheFlags) -> Result<(), SlabError> {
        // Boot-time memory is mapped already.
        let vm_area = match vm_area {
            Some(vm_area) => vm_area,
            None => return Ok(()),
        };
        self.vm.reserve_memory(size, flags)?;
        if let Err(e) = self.vm.map_pages(vm_area, address, size, flags) {
            self.vm.unreserve_memory(size);
            error!("MemoryManager: failed to map {:#X} bytes at {:?}: {}", size, address, e);
            return Err(e);
        }
        Ok(())
    }

    fn unmap_chunk(&self, vm_area: Option<VmAreaId>, address: VirtualAddress, size: usize) {
        if let Some(vm_area) = vm_area {
            self.vm.unmap_pages(vm_area, address, size);
            self.vm.unreserve_memory(size);
        }
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let areas: Vec<Area> = state.areas.drain().map(|(_, area)| area)
            .chain(state.free_areas.drain(..))
            .collect();
        for area in areas {
            if let Some(id) = area.vm_area {
                if let Err(e) = self.vm.delete_area(id) {
                    error!("MemoryManager: couldn't delete area {:?} on teardown: {}", id, e);
                }
            }
        }
    }
}
