//! Compile-time configuration shared by the slab allocator crates.
//!
//! * [`memory`]: page size and the geometry of areas, meta chunks and chunks.
//! * [`slab`]: tunables of the object caches and their magazine depots.

#![no_std]

extern crate cfg_if;
#[macro_use] extern crate static_assertions;

pub mod memory;
pub mod slab;
