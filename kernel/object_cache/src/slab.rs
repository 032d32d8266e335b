//! Slabs: runs of equally sized objects carved out of a single chunk.
//!
//! A slab does not keep its free list inside the objects themselves.
//! It keeps the indices of its free objects in a stack, next to a bitfield
//! that tells which objects are allocated, so that a double free is caught.

use alloc::vec::Vec;
use core::{fmt, ptr::NonNull};
use slab_structs::{SlabError, VirtualAddress};

/// Identifies a slab within its object cache.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SlabId(pub(crate) u32);

impl fmt::Display for SlabId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "slab#{}", self.0)
    }
}

/// A snapshot of a slab, see [`ObjectCache::slab_info()`](crate::ObjectCache::slab_info).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SlabInfo {
    /// The chunk backing the slab.
    pub pages: VirtualAddress,
    /// The address of the first object, i.e., `pages` plus the slab's color offset.
    pub first_object: VirtualAddress,
    /// The number of objects in the slab.
    pub size: usize,
    /// The number of free objects in the slab.
    pub count: usize,
}


/// Bit operations for tracking the allocated objects of a slab.
pub(crate) trait Bitfield {
    fn initialize(&mut self, capacity: usize);
    fn is_allocated(&self, idx: usize) -> bool;
    fn set_bit(&mut self, idx: usize);
    fn clear_bit(&mut self, idx: usize);
    fn all_free(&self, relevant_bits: usize) -> bool;
}

impl Bitfield for [u64] {
    /// Marks the first `capacity` slots free and everything beyond allocated,
    /// so that only real slots can ever be found free.
    fn initialize(&mut self, capacity: usize) {
        for bitmap in self.iter_mut() {
            *bitmap = u64::MAX;
        }
        for idx in 0 .. core::cmp::min(capacity, self.len() * 64) {
            self.clear_bit(idx);
        }
    }

    #[inline(always)]
    fn is_allocated(&self, idx: usize) -> bool {
        self[idx / 64] & (1 << (idx % 64)) != 0
    }

    #[inline(always)]
    fn set_bit(&mut self, idx: usize) {
        self[idx / 64] |= 1 << (idx % 64);
    }

    #[inline(always)]
    fn clear_bit(&mut self, idx: usize) {
        self[idx / 64] &= !(1 << (idx % 64));
    }

    /// Checks if none of the first `relevant_bits` slots is allocated.
    fn all_free(&self, relevant_bits: usize) -> bool {
        (0 .. relevant_bits).all(|idx| !self.is_allocated(idx))
    }
}


pub(crate) struct Slab {
    pub pages: VirtualAddress,
    /// Number of objects.
    pub size: usize,
    /// Number of free objects.
    pub count: usize,
    /// The color offset of the first object within `pages`.
    pub offset: usize,
    /// Indices of the free objects, the next one to hand out last.
    free: Vec<u32>,
    allocated: Vec<u64>,
}

impl Slab {
    /// Creates the bookkeeping for a slab of `size` objects, all of them free.
    pub fn try_new(pages: VirtualAddress, size: usize, offset: usize) -> Result<Slab, SlabError> {
        let mut free = Vec::new();
        free.try_reserve_exact(size).map_err(|_| SlabError::NoMemory)?;
        free.extend((0 .. size as u32).rev());

        let words = (size + 63) / 64;
        let mut allocated = Vec::new();
        allocated.try_reserve_exact(words).map_err(|_| SlabError::NoMemory)?;
        allocated.resize(words, 0);
        allocated.initialize(size);

        Ok(Slab { pages, size, count: size, offset, free, allocated })
    }

    pub fn first_object(&self) -> VirtualAddress {
        self.pages + self.offset
    }

    pub fn object_at(&self, index: usize, object_size: usize) -> VirtualAddress {
        self.first_object() + index * object_size
    }

    pub fn object_ptr(&self, index: usize, object_size: usize) -> NonNull<u8> {
        // SAFETY: slabs live in chunks handed out by the memory manager, never at address zero.
        unsafe { NonNull::new_unchecked(self.object_at(index, object_size).value() as *mut u8) }
    }

    /// Returns the index of `object` within this slab.
    ///
    /// # Panics
    /// If `object` is not the start of one of this slab's objects.
    pub fn index_of(&self, object: VirtualAddress, object_size: usize) -> usize {
        let first = self.first_object();
        if object < first {
            panic!("slab {:?}: {:?} lies before the first object", self.pages, object);
        }
        let offset = object - first;
        let index = offset / object_size;
        if offset % object_size != 0 || index >= self.size {
            panic!("slab {:?}: {:?} is not an object of this slab", self.pages, object);
        }
        index
    }

    /// Takes a free object, returning its index.
    pub fn pop(&mut self) -> Option<usize> {
        let index = self.free.pop()? as usize;
        debug_assert!(!self.allocated.is_allocated(index));
        self.allocated.set_bit(index);
        self.count -= 1;
        Some(index)
    }

    /// Puts the object at `index` back.
    ///
    /// # Panics
    /// If the object is free already.
    pub fn push(&mut self, index: usize) {
        if !self.allocated.is_allocated(index) {
            panic!("slab {:?}: object {} freed twice", self.pages, index);
        }
        self.allocated.clear_bit(index);
        self.free.push(index as u32);
        self.count += 1;
    }

    /// Returns `true` if none of the objects is in use.
    pub fn is_empty(&self) -> bool {
        debug_assert!(self.count != self.size || self.allocated.all_free(self.size));
        self.count == self.size
    }

    pub fn info(&self) -> SlabInfo {
        SlabInfo { pages: self.pages, first_object: self.first_object(), size: self.size, count: self.count }
    }
}
