//! Basic types shared by every layer of the slab allocator.
//!
//! * [`VirtualAddress`]: an address handed out or consumed by the allocator.
//! * [`CacheFlags`]: the flags accepted at cache creation and on every allocation call.
//! * [`SlabError`]: the error type of every fallible operation.
//! * [`CacheId`]: the identity of an object cache, recorded in the chunks that back its slabs.
//! * [`CpuTopology`]: how the per-CPU layers learn about the CPUs they run on.
//! * [`Completion`]: a one-shot signal that waiters of an in-flight operation spin on.

#![no_std]

#[macro_use] extern crate bitflags;
extern crate alloc;
extern crate derive_more;

mod completion;
#[cfg(test)]
mod test;

pub use completion::Completion;

use core::{
    fmt,
    ops::{Add, Sub},
    ptr::NonNull,
};
use derive_more::*;

/// A virtual memory address, which is a `usize` under the hood.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    Binary, LowerHex, UpperHex,
)]
#[repr(transparent)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    /// Creates a new `VirtualAddress` with the given value.
    pub const fn new(addr: usize) -> VirtualAddress {
        VirtualAddress(addr)
    }

    /// Returns the address of the given pointer.
    pub fn from_ptr<T>(ptr: NonNull<T>) -> VirtualAddress {
        VirtualAddress(ptr.as_ptr() as usize)
    }

    /// Returns the underlying `usize` value for this `VirtualAddress`.
    #[inline]
    pub const fn value(&self) -> usize {
        self.0
    }

    /// Rounds this address down to a multiple of `align`, which must be a power of two.
    ///
    /// For an address inside a block that is naturally aligned to its size,
    /// this is the block's start, i.e., its "lower boundary".
    #[inline]
    pub const fn align_down(&self, align: usize) -> VirtualAddress {
        VirtualAddress(self.0 & !(align - 1))
    }

    /// Rounds this address up to a multiple of `align`, which must be a power of two.
    #[inline]
    pub const fn align_up(&self, align: usize) -> VirtualAddress {
        VirtualAddress((self.0 + align - 1) & !(align - 1))
    }

    /// Returns `true` if this address is a multiple of `align`, which must be a power of two.
    #[inline]
    pub const fn is_aligned(&self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{:#X}", self.0)
    }
}
impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
impl Add<usize> for VirtualAddress {
    type Output = VirtualAddress;
    fn add(self, rhs: usize) -> VirtualAddress {
        VirtualAddress(self.0 + rhs)
    }
}
impl Sub<usize> for VirtualAddress {
    type Output = VirtualAddress;
    fn sub(self, rhs: usize) -> VirtualAddress {
        VirtualAddress(self.0 - rhs)
    }
}
impl Sub<VirtualAddress> for VirtualAddress {
    type Output = usize;
    fn sub(self, rhs: VirtualAddress) -> usize {
        self.0 - rhs.0
    }
}


bitflags! {
    /// Flags that configure an object cache at creation time,
    /// or that restrict how a single allocation or free call may behave.
    pub struct CacheFlags: u32 {
        /// The call must not block waiting for memory to become available.
        const DONT_WAIT_FOR_MEMORY    = 0x0000_0001;
        /// The call must not create or delete VM areas, e.g., because the caller
        /// already holds the kernel address space lock.
        const DONT_LOCK_KERNEL_SPACE  = 0x0000_0002;
        /// Memory reservations made on behalf of this call use the elevated VIP priority.
        const PRIORITY_VIP            = 0x0000_0004;
        /// A raw allocation must be aligned to its (power of two) size.
        const ALIGN_ON_SIZE           = 0x0000_0008;
        /// The cache does not use a per-CPU magazine depot.
        const NO_DEPOT                = 0x4000_0000;
        /// The cache prefers a bigger chunk size class for its slabs.
        const LARGE_SLAB              = 0x8000_0000;
    }
}

impl CacheFlags {
    /// Returns only the flags that restrict a single call,
    /// i.e., the ones that are meaningful when passed down to the memory manager.
    pub fn call_flags(self) -> CacheFlags {
        self & (CacheFlags::DONT_WAIT_FOR_MEMORY
            | CacheFlags::DONT_LOCK_KERNEL_SPACE
            | CacheFlags::PRIORITY_VIP
            | CacheFlags::ALIGN_ON_SIZE)
    }
}


/// The possible errors of the slab allocator's operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabError {
    /// There was not enough memory, or a configured maximum was reached.
    NoMemory,
    /// The caller asked not to wait and the request could not be satisfied without waiting.
    WouldBlock,
    /// An argument was invalid, e.g., a zero object size or a non power of two alignment.
    BadValue,
}

impl From<SlabError> for &'static str {
    fn from(err: SlabError) -> &'static str {
        match err {
            SlabError::NoMemory => "out of memory",
            SlabError::WouldBlock => "operation would block",
            SlabError::BadValue => "invalid argument",
        }
    }
}

impl fmt::Display for SlabError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str((*self).into())
    }
}


/// The identity of an object cache.
///
/// Chunks that back a slab record the id of the cache owning that slab.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[display(fmt = "cache#{}", _0)]
pub struct CacheId(u32);

impl CacheId {
    pub const fn new(id: u32) -> CacheId {
        CacheId(id)
    }

    pub const fn value(&self) -> u32 {
        self.0
    }
}


/// The level of a low resource notification, in increasing severity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum ResourceLevel {
    None,
    Note,
    Warning,
    Critical,
}


/// Information about the CPUs of the system.
///
/// The per-CPU layers of the allocator size their per-CPU state with [`cpu_count()`]
/// and index it with [`current_cpu()`].
///
/// [`cpu_count()`]: CpuTopology::cpu_count
/// [`current_cpu()`]: CpuTopology::current_cpu
pub trait CpuTopology: Send + Sync {
    /// Returns the number of CPUs in the system, which never changes.
    fn cpu_count(&self) -> usize;

    /// Returns the index of the CPU the caller is running on,
    /// which is always less than [`cpu_count()`](CpuTopology::cpu_count).
    fn current_cpu(&self) -> usize;
}
