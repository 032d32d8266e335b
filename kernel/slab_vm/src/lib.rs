//! The interface between the slab allocator and the virtual memory subsystem.
//!
//! The slab memory manager never touches page tables itself.
//! It asks a [`VmBackend`] to create address space regions ("VM areas"),
//! to map and unmap page ranges within them, and to account for the memory it maps.
//!
//! With the `hosted` feature, [`hosted::HostedVm`] implements this interface
//! on top of the host's heap, which is what the tests of the slab allocator run against.

#![no_std]

#[macro_use] extern crate log;
extern crate alloc;
extern crate kernel_config;
extern crate slab_structs;
extern crate spin;

#[cfg(any(test, feature = "hosted"))]
pub mod hosted;

use slab_structs::{CacheFlags, SlabError, VirtualAddress};

/// The identity of a VM area created by a [`VmBackend`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct VmAreaId(pub usize);

/// A contiguous region of the kernel address space created by a [`VmBackend`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VmArea {
    pub id: VmAreaId,
    pub base: VirtualAddress,
    pub size: usize,
}

impl VmArea {
    /// Returns `true` if `address` lies within this area.
    pub fn contains(&self, address: VirtualAddress) -> bool {
        address >= self.base && address - self.base < self.size
    }
}

/// The operations the slab allocator needs from the virtual memory subsystem.
///
/// A backend distinguishes two kinds of VM areas:
/// * "null" areas, created by [`create_null_area()`], which reserve address space only.
///   Their pages are mapped on demand with [`map_pages()`] after the matching amount of
///   memory was reserved with [`reserve_memory()`].
/// * "full" areas, created by [`create_area()`], which are reserved and mapped in full
///   and released in full by [`delete_area()`].
///
/// [`create_null_area()`]: VmBackend::create_null_area
/// [`create_area()`]: VmBackend::create_area
/// [`delete_area()`]: VmBackend::delete_area
/// [`map_pages()`]: VmBackend::map_pages
/// [`reserve_memory()`]: VmBackend::reserve_memory
pub trait VmBackend: Send + Sync {
    /// Creates a VM area of `size` bytes without mapping any of it.
    /// The area's base is aligned to `size`, which must be a power of two.
    fn create_null_area(&self, size: usize, flags: CacheFlags) -> Result<VmArea, SlabError>;

    /// Creates a fully mapped VM area of `size` bytes whose base is aligned to `alignment`.
    /// The backend reserves the memory for it on its own.
    fn create_area(&self, size: usize, alignment: usize, flags: CacheFlags) -> Result<VmArea, SlabError>;

    /// Deletes the given VM area, unmapping whatever is still mapped in it.
    fn delete_area(&self, area: VmAreaId) -> Result<(), SlabError>;

    /// Returns the VM area that contains `address`, if any.
    fn area_for_address(&self, address: VirtualAddress) -> Option<VmArea>;

    /// Maps fresh pages at `[address, address + size)` within the given null area.
    ///
    /// The mapping is all-or-nothing: on failure, no page of the range is left mapped.
    fn map_pages(&self, area: VmAreaId, address: VirtualAddress, size: usize, flags: CacheFlags) -> Result<(), SlabError>;

    /// Unmaps and frees the pages at `[address, address + size)` within the given area.
    fn unmap_pages(&self, area: VmAreaId, address: VirtualAddress, size: usize);

    /// Reserves `size` bytes of the system's memory budget.
    fn reserve_memory(&self, size: usize, flags: CacheFlags) -> Result<(), SlabError>;

    /// Returns `size` bytes to the system's memory budget.
    fn unreserve_memory(&self, size: usize);

    /// Carves `size` bytes aligned to `alignment` out of the boot-time memory pool.
    /// Such memory is fully mapped and is not part of any VM area.
    fn allocate_early(&self, size: usize, alignment: usize) -> Option<VirtualAddress>;

    /// Turns memory previously returned by [`allocate_early()`](VmBackend::allocate_early)
    /// into a regular VM area whose pages are all mapped and reserved.
    fn adopt_early_area(&self, base: VirtualAddress, size: usize) -> Result<VmArea, SlabError>;

    /// Notifies the allocator's maintenance task that it has work to do.
    fn wake_maintainer(&self) {
        trace!("slab_vm: maintenance requested, but no maintainer is registered");
    }
}
