//! The virtual memory geometry that the slab memory manager assumes.
//!
//! An area is carved into [`SLAB_META_CHUNKS_PER_AREA`] meta chunks of
//! [`SLAB_CHUNK_SIZE_LARGE`] bytes each. A meta chunk, once assigned a size class,
//! is split into chunks of one of the three chunk sizes below.
//! The first meta chunk of every area is shorter, because the area's
//! administrative header occupies its first [`SLAB_AREA_ADMIN_SIZE`] bytes.

/// 64-bit architecture results in 8 bytes per address.
pub const BYTES_PER_ADDR: usize = core::mem::size_of::<usize>();

/// The lower 12 bits of a virtual address correspond to the page offset.
pub const PAGE_SHIFT: usize = 12;
/// Page size is 4096 bytes, 4KiB pages.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Value: 4 KiB. The small chunk size class, a single page.
pub const SLAB_CHUNK_SIZE_SMALL: usize = PAGE_SIZE;
/// Value: 64 KiB. The medium chunk size class.
pub const SLAB_CHUNK_SIZE_MEDIUM: usize = 16 * PAGE_SIZE;
/// Value: 512 KiB. The large chunk size class, which is also the size of a meta chunk.
pub const SLAB_CHUNK_SIZE_LARGE: usize = 128 * PAGE_SIZE;

/// Value: 8 MiB. The size of an area. Areas are always aligned to their size.
pub const SLAB_AREA_SIZE: usize = 2048 * PAGE_SIZE;
/// Value: 16.
pub const SLAB_META_CHUNKS_PER_AREA: usize = SLAB_AREA_SIZE / SLAB_CHUNK_SIZE_LARGE;
/// Value: 128. The most chunks a single meta chunk can be split into.
pub const SLAB_SMALL_CHUNKS_PER_META_CHUNK: usize = SLAB_CHUNK_SIZE_LARGE / SLAB_CHUNK_SIZE_SMALL;

/// The bytes at the start of every area that hold its administrative header.
/// These bytes are mapped for as long as the area exists.
pub const SLAB_AREA_ADMIN_SIZE: usize = PAGE_SIZE;

cfg_if::cfg_if! {
if #[cfg(target_arch = "aarch64")] {
    /// The cache line size used to color slabs.
    pub const CACHE_LINE_SIZE: usize = 128;
} else {
    /// The cache line size used to color slabs.
    pub const CACHE_LINE_SIZE: usize = 64;
}
}

const_assert!(SLAB_CHUNK_SIZE_MEDIUM % SLAB_CHUNK_SIZE_SMALL == 0);
const_assert!(SLAB_CHUNK_SIZE_LARGE % SLAB_CHUNK_SIZE_MEDIUM == 0);
const_assert!(SLAB_AREA_SIZE.is_power_of_two());
const_assert!(SLAB_AREA_ADMIN_SIZE < SLAB_CHUNK_SIZE_MEDIUM);
const_assert!(SLAB_SMALL_CHUNKS_PER_META_CHUNK <= u16::MAX as usize);
