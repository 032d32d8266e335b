//! The bookkeeping structures of the memory manager: areas, meta chunks and chunks.
//!
//! None of these live inside the memory they describe, except for the small
//! [`AreaHeader`] that marks the start of every area.

use alloc::{collections::VecDeque, sync::Arc, vec, vec::Vec};
use core::ptr;
use kernel_config::memory::*;
use slab_structs::{CacheId, VirtualAddress};
use slab_vm::VmAreaId;
use spin::RwLock;

/// The value of [`AreaHeader::magic`].
const AREA_MAGIC: u64 = 0x5A5A_A8EA_5AB0_0001;

/// Written into the first bytes of the administrative page of every area.
#[repr(C)]
pub(crate) struct AreaHeader {
    magic: u64,
    base: usize,
}

const_assert!(core::mem::size_of::<AreaHeader>() <= SLAB_AREA_ADMIN_SIZE);

impl AreaHeader {
    /// Writes the header of the area starting at `base`.
    ///
    /// # Safety
    /// The first [`SLAB_AREA_ADMIN_SIZE`] bytes at `base` must be mapped and writable.
    pub(crate) unsafe fn write(base: VirtualAddress) {
        let header = AreaHeader { magic: AREA_MAGIC, base: base.value() };
        // SAFETY: guaranteed by the caller; areas are aligned far beyond the header's alignment.
        unsafe { ptr::write(base.value() as *mut AreaHeader, header) };
    }

    /// Returns `true` if a valid header for the area starting at `base` is present.
    ///
    /// # Safety
    /// Same as [`AreaHeader::write()`].
    pub(crate) unsafe fn is_valid(base: VirtualAddress) -> bool {
        // SAFETY: guaranteed by the caller.
        let header = unsafe { &*(base.value() as *const AreaHeader) };
        header.magic == AREA_MAGIC && header.base == base.value()
    }
}


/// The three chunk size classes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChunkSizeClass {
    Small,
    Medium,
    Large,
}

impl ChunkSizeClass {
    pub fn from_size(size: usize) -> Option<ChunkSizeClass> {
        match size {
            SLAB_CHUNK_SIZE_SMALL => Some(ChunkSizeClass::Small),
            SLAB_CHUNK_SIZE_MEDIUM => Some(ChunkSizeClass::Medium),
            SLAB_CHUNK_SIZE_LARGE => Some(ChunkSizeClass::Large),
            _ => None,
        }
    }

    pub fn size(self) -> usize {
        match self {
            ChunkSizeClass::Small => SLAB_CHUNK_SIZE_SMALL,
            ChunkSizeClass::Medium => SLAB_CHUNK_SIZE_MEDIUM,
            ChunkSizeClass::Large => SLAB_CHUNK_SIZE_LARGE,
        }
    }

    /// Returns how many chunks of this class the shorter first meta chunk of an area holds.
    pub fn short_meta_chunk_capacity(self) -> usize {
        let unusable = VirtualAddress::new(SLAB_AREA_ADMIN_SIZE).align_up(self.size()).value();
        (SLAB_CHUNK_SIZE_LARGE - unusable) / self.size()
    }
}


/// What a chunk is currently used for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChunkReference {
    Free,
    /// Taken by an allocation whose pages are being mapped.
    Pending,
    /// Backs a slab of the given object cache.
    Cache(CacheId),
    /// The first chunk of a raw allocation that ends (exclusively) at the given address.
    RawExtent(VirtualAddress),
    /// Any further chunk of a raw allocation.
    RawTail,
}


/// Identifies a meta chunk by the base address of its area and its index in that area.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct MetaChunkRef {
    pub area: VirtualAddress,
    pub index: usize,
}

impl MetaChunkRef {
    /// Returns the meta chunk that covers `address`.
    pub fn containing(address: VirtualAddress) -> MetaChunkRef {
        let area = address.align_down(SLAB_AREA_SIZE);
        MetaChunkRef { area, index: (address - area) / SLAB_CHUNK_SIZE_LARGE }
    }
}


/// A list of meta chunks, e.g., all partially used meta chunks of one size class.
#[derive(Default)]
pub(crate) struct MetaChunkList(VecDeque<MetaChunkRef>);

impl MetaChunkList {
    pub fn head(&self) -> Option<MetaChunkRef> {
        self.0.front().copied()
    }

    pub fn pop_head(&mut self) -> Option<MetaChunkRef> {
        self.0.pop_front()
    }

    pub fn add(&mut self, meta: MetaChunkRef) {
        self.0.push_back(meta);
    }

    pub fn add_front(&mut self, meta: MetaChunkRef) {
        self.0.push_front(meta);
    }

    pub fn remove(&mut self, meta: MetaChunkRef) -> bool {
        match self.0.iter().position(|m| *m == meta) {
            Some(i) => {
                self.0.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, meta: MetaChunkRef) -> bool {
        self.0.contains(&meta)
    }

    pub fn iter(&self) -> impl Iterator<Item = MetaChunkRef> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}


/// The chunk references of one meta chunk.
///
/// Reachable from the area table, so that the free path can find out what a chunk
/// is used for without the manager's lock. Only written with that lock held.
pub(crate) struct ChunkTable {
    pub chunk_base: VirtualAddress,
    /// Zero while the meta chunk is unassigned.
    pub chunk_size: usize,
    /// One reference per chunk.
    pub chunks: Vec<ChunkReference>,
}

impl ChunkTable {
    pub fn chunk_address(&self, index: usize) -> VirtualAddress {
        self.chunk_base + index * self.chunk_size
    }

    /// Returns the index of the chunk containing `address`.
    pub fn chunk_index(&self, address: VirtualAddress) -> Option<usize> {
        if self.chunk_size == 0 || address < self.chunk_base {
            return None;
        }
        let index = (address - self.chunk_base) / self.chunk_size;
        if index < self.chunks.len() { Some(index) } else { None }
    }
}


/// A fixed subdivision of an area, split into chunks of a single size class.
pub(crate) struct MetaChunk {
    pub chunk_base: VirtualAddress,
    pub total_size: usize,
    /// Zero while the meta chunk is unassigned.
    pub chunk_size: usize,
    chunk_count: usize,
    pub used_chunk_count: usize,
    pub table: Arc<RwLock<ChunkTable>>,
    /// Indices of the free chunks, the next one to hand out last.
    pub free_chunks: Vec<u16>,
    /// A run of free chunks `(first, last)`, used to find contiguous chunks quickly.
    pub free_range: Option<(usize, usize)>,
}

impl MetaChunk {
    fn new(area_base: VirtualAddress, index: usize) -> MetaChunk {
        let chunk_base = area_base + index * SLAB_CHUNK_SIZE_LARGE;
        MetaChunk {
            chunk_base,
            total_size: SLAB_CHUNK_SIZE_LARGE,
            chunk_size: 0,
            chunk_count: 0,
            used_chunk_count: 0,
            table: Arc::new(RwLock::new(ChunkTable { chunk_base, chunk_size: 0, chunks: Vec::new() })),
            free_chunks: Vec::new(),
            free_range: None,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.chunk_size != 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn chunk_address(&self, index: usize) -> VirtualAddress {
        self.chunk_base + index * self.chunk_size
    }

    /// Assigns this unassigned meta chunk to the given size class.
    ///
    /// The first meta chunk of an area skips its area's administrative bytes,
    /// rounded up to the chunk size so that every chunk stays aligned to its size.
    pub fn prepare(&mut self, area_base: VirtualAddress, index: usize, class: ChunkSizeClass) {
        debug_assert!(!self.is_assigned());
        let chunk_size = class.size();
        if index == 0 {
            let unusable = VirtualAddress::new(SLAB_AREA_ADMIN_SIZE).align_up(chunk_size).value();
            self.chunk_base = area_base + unusable;
            self.total_size = SLAB_CHUNK_SIZE_LARGE - unusable;
        }
        let chunk_count = self.total_size / chunk_size;
        self.chunk_size = chunk_size;
        self.chunk_count = chunk_count;
        self.used_chunk_count = 0;
        *self.table.write() = ChunkTable {
            chunk_base: self.chunk_base,
            chunk_size,
            chunks: vec![ChunkReference::Free; chunk_count],
        };
        self.free_chunks = (0 .. chunk_count as u16).rev().collect();
        self.free_range = if chunk_count > 0 { Some((0, chunk_count - 1)) } else { None };
    }

    /// Returns this meta chunk to the unassigned state.
    pub fn reset(&mut self) {
        self.chunk_size = 0;
        self.chunk_count = 0;
        let mut table = self.table.write();
        table.chunk_size = 0;
        table.chunks = Vec::new();
        drop(table);
        self.free_chunks = Vec::new();
        self.free_range = None;
    }

    pub fn reference(&self, index: usize) -> ChunkReference {
        self.table.read().chunks[index]
    }

    pub fn set_references(&self, first: usize, count: usize, reference: ChunkReference) {
        for chunk in &mut self.table.write().chunks[first .. first + count] {
            *chunk = reference;
        }
    }

    /// Excludes a just allocated chunk from the free range, keeping the bigger side.
    pub fn shrink_free_range(&mut self, index: usize) {
        if let Some((first, last)) = self.free_range {
            if index < first || index > last {
                return;
            }
            self.free_range = if index - first <= last - index {
                if index + 1 <= last { Some((index + 1, last)) } else { None }
            } else {
                Some((first, index - 1))
            };
        }
    }

    /// Extends the free range by a just freed chunk, if it adjoins the range.
    /// If there is no free range, the run of free chunks around `index` becomes the range.
    pub fn extend_free_range(&mut self, index: usize) {
        let table = self.table.read();
        let chunks = &table.chunks;
        let free_range = match self.free_range {
            None => Some((free_run_start(chunks, index), free_run_end(chunks, index))),
            Some((first, last)) if index + 1 == first => Some((free_run_start(chunks, index), last)),
            Some((first, last)) if index == last + 1 => Some((first, free_run_end(chunks, index))),
            other => other,
        };
        drop(table);
        self.free_range = free_range;
    }
}

fn free_run_start(chunks: &[ChunkReference], mut index: usize) -> usize {
    while index > 0 && chunks[index - 1] == ChunkReference::Free {
        index -= 1;
    }
    index
}

fn free_run_end(chunks: &[ChunkReference], mut index: usize) -> usize {
    while index + 1 < chunks.len() && chunks[index + 1] == ChunkReference::Free {
        index += 1;
    }
    index
}


/// What the area table knows about an area in use.
pub(crate) struct AreaLookup {
    pub vm_area: Option<VmAreaId>,
    /// The chunk table of each meta chunk, shared with the area itself.
    pub meta_chunks: Vec<Arc<RwLock<ChunkTable>>>,
}


/// A [`SLAB_AREA_SIZE`] sized VM area owned by the memory manager.
pub(crate) struct Area {
    pub base: VirtualAddress,
    /// `None` for boot-time memory that has not been adopted by the VM yet.
    pub vm_area: Option<VmAreaId>,
    /// Budget reserved for the administrative page, released when the area is deleted.
    pub reserved_memory_for_mapping: usize,
    pub used_meta_chunk_count: usize,
    pub meta_chunks: Vec<MetaChunk>,
}

impl Area {
    pub fn new(base: VirtualAddress, vm_area: Option<VmAreaId>, reserved_memory_for_mapping: usize) -> Area {
        Area {
            base,
            vm_area,
            reserved_memory_for_mapping,
            used_meta_chunk_count: 0,
            meta_chunks: (0 .. SLAB_META_CHUNKS_PER_AREA).map(|i| MetaChunk::new(base, i)).collect(),
        }
    }

    pub fn meta_chunk_ref(&self, index: usize) -> MetaChunkRef {
        MetaChunkRef { area: self.base, index }
    }

    /// Returns the entry of this area in the area table.
    pub fn lookup(&self) -> AreaLookup {
        AreaLookup {
            vm_area: self.vm_area,
            meta_chunks: self.meta_chunks.iter().map(|meta| meta.table.clone()).collect(),
        }
    }

    /// Returns the ranges of this area that are mapped but hold no allocation,
    /// leaving out the administrative page.
    pub fn unused_ranges(&self) -> Vec<(VirtualAddress, usize)> {
        let mut ranges = Vec::new();
        let admin_end = self.base + SLAB_AREA_ADMIN_SIZE;
        for (i, meta) in self.meta_chunks.iter().enumerate() {
            let meta_start = self.base + i * SLAB_CHUNK_SIZE_LARGE;
            if !meta.is_assigned() {
                let start = if i == 0 { admin_end } else { meta_start };
                ranges.push((start, meta_start + SLAB_CHUNK_SIZE_LARGE - start));
                continue;
            }
            if i == 0 && admin_end < meta.chunk_base {
                ranges.push((admin_end, meta.chunk_base - admin_end));
            }
            let table = meta.table.read();
            for (index, chunk) in table.chunks.iter().enumerate() {
                if *chunk == ChunkReference::Free {
                    ranges.push((table.chunk_address(index), table.chunk_size));
                }
            }
        }
        ranges
    }
}
