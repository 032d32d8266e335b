//! Slabs of small objects, whose header sits in the last bytes of their own chunk.
//!
//! Looking up the slab of an object is then pure address arithmetic:
//! round the object down to the slab size and read the header at the end of that chunk.
//! The header is only a few bytes, which is negligible next to a chunk full of small objects.

use crate::{backing::SlabBacking, slab::SlabId};
use core::{mem, ptr};
use kernel_config::slab::SMALL_CACHE_LARGE_SLAB_OBJECTS;
use kernel_config::memory::SLAB_CHUNK_SIZE_SMALL;
use slab_memory_manager::MemoryManager;
use slab_structs::{CacheFlags, CacheId, VirtualAddress};

const SLAB_HEADER_MAGIC: u32 = 0x51AB_C0DE;

/// The header at the end of a small object cache's chunk.
#[repr(C)]
struct SlabHeader {
    magic: u32,
    cache: u32,
    slab: u32,
    reserved: u32,
}

const_assert_eq!(mem::size_of::<SlabHeader>(), 16);

pub(crate) struct SmallObjectCache {
    cache: CacheId,
    slab_size: usize,
}

impl SmallObjectCache {
    pub fn new(cache: CacheId, slab_size: usize) -> SmallObjectCache {
        SmallObjectCache { cache, slab_size }
    }

    /// Returns the slab size for objects of `object_size` bytes.
    pub fn slab_size(object_size: usize, flags: CacheFlags) -> usize {
        let wanted = if flags.contains(CacheFlags::LARGE_SLAB) {
            SMALL_CACHE_LARGE_SLAB_OBJECTS * object_size
        } else {
            SLAB_CHUNK_SIZE_SMALL
        };
        MemoryManager::acceptable_chunk_size(wanted)
    }

    fn header(&self, pages: VirtualAddress) -> *mut SlabHeader {
        (pages + self.slab_size - mem::size_of::<SlabHeader>()).value() as *mut SlabHeader
    }
}

impl SlabBacking for SmallObjectCache {
    fn usable_bytes(&self, slab_size: usize) -> usize {
        slab_size - mem::size_of::<SlabHeader>()
    }

    fn attach(&mut self, pages: VirtualAddress, slab: SlabId) {
        let header = SlabHeader { magic: SLAB_HEADER_MAGIC, cache: self.cache.value(), slab: slab.0, reserved: 0 };
        // SAFETY: the chunk at `pages` was just mapped for this slab, and the header
        // lies beyond the bytes handed out as objects.
        unsafe { ptr::write(self.header(pages), header) };
    }

    fn detach(&mut self, pages: VirtualAddress) {
        // SAFETY: the chunk is still mapped, it is freed only after being detached.
        unsafe { (*self.header(pages)).magic = 0 };
    }

    fn lookup(&self, pages: VirtualAddress) -> Option<SlabId> {
        // SAFETY: `pages` is the chunk of an object handed out by this cache,
        // which stays mapped for as long as the object is in use.
        let header = unsafe { ptr::read(self.header(pages)) };
        if header.magic == SLAB_HEADER_MAGIC && header.cache == self.cache.value() {
            Some(SlabId(header.slab))
        } else {
            None
        }
    }
}
