//! How an object cache finds the slab an object belongs to.

use crate::slab::SlabId;
use slab_structs::VirtualAddress;

/// Maps the chunks backing a cache's slabs to those slabs.
///
/// Every slab occupies exactly one chunk of the cache's slab size,
/// and chunks are aligned to their size, so the chunk of an object is
/// its address rounded down to the slab size.
pub(crate) trait SlabBacking: Send {
    /// Returns how many bytes of a chunk of `slab_size` bytes can hold objects.
    fn usable_bytes(&self, slab_size: usize) -> usize;

    /// Records that the chunk at `pages` now backs the given slab.
    fn attach(&mut self, pages: VirtualAddress, slab: SlabId);

    /// Forgets the slab backed by the chunk at `pages`.
    fn detach(&mut self, pages: VirtualAddress);

    /// Returns the slab backed by the chunk at `pages`, if there is one.
    fn lookup(&self, pages: VirtualAddress) -> Option<SlabId>;
}
