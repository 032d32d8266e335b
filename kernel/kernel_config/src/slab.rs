//! Tunables of the object caches, their slabs and magazine depots.

/// Objects larger than this are served by a hashed object cache,
/// whose slab headers live outside of the slab's own pages.
pub const HASHED_CACHE_THRESHOLD: usize = 256;

/// The smallest alignment an object cache hands out objects with.
pub const MIN_OBJECT_ALIGNMENT: usize = 8;

/// The smallest size of an object, any smaller request is rounded up.
pub const MIN_OBJECT_SIZE: usize = super::memory::BYTES_PER_ADDR;

/// A small object cache with `CACHE_LARGE_SLAB` wants slabs of this many objects.
pub const SMALL_CACHE_LARGE_SLAB_OBJECTS: usize = 1024;
/// A hashed object cache wants slabs of this many objects.
pub const HASHED_CACHE_SLAB_OBJECTS: usize = 8;
/// A hashed object cache with `CACHE_LARGE_SLAB` wants slabs of this many objects.
pub const HASHED_CACHE_LARGE_SLAB_OBJECTS: usize = 128;

/// Returns the default number of objects per depot magazine for the given object size.
pub const fn default_magazine_capacity(object_size: usize) -> usize {
    if object_size < 256 {
        32
    } else if object_size < 512 {
        16
    } else {
        8
    }
}

/// The memory manager keeps this many spare areas around,
/// once at least one has been freed.
pub const FREE_AREA_RESERVE: usize = 2;
