//! A [`VmBackend`] and [`CpuTopology`] for running the slab allocator on a host.
//!
//! VM areas are aligned blocks of the host heap. Page mappings are only tracked,
//! the memory of an area stays accessible for as long as the area exists.
//! The backend enforces a memory budget and can be told to fail upcoming calls,
//! which is how out-of-memory paths are exercised.
//!
//! Each host thread is assigned a CPU the first time it asks for one,
//! round-robin over all host threads; [`pin_current_thread()`] overrides that.

extern crate std;

use alloc::{collections::BTreeMap, vec, vec::Vec};
use core::{
    cell::Cell,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};
use kernel_config::memory::PAGE_SIZE;
use slab_structs::{CacheFlags, CpuTopology, SlabError, VirtualAddress};
use spin::Mutex;
use self::std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    thread_local,
};
use super::{VmArea, VmAreaId, VmBackend};

thread_local! {
    static THREAD_CPU: Cell<Option<usize>> = Cell::new(None);
}

static NEXT_THREAD_CPU: AtomicUsize = AtomicUsize::new(0);

/// Makes the calling host thread run on the given CPU from now on.
///
/// The CPU index is taken modulo the CPU count of whichever backend is asked.
pub fn pin_current_thread(cpu: usize) {
    THREAD_CPU.with(|c| c.set(Some(cpu)));
}

fn thread_cpu() -> usize {
    THREAD_CPU.with(|c| match c.get() {
        Some(cpu) => cpu,
        None => {
            let cpu = NEXT_THREAD_CPU.fetch_add(1, Ordering::Relaxed);
            c.set(Some(cpu));
            cpu
        }
    })
}

struct HostedArea {
    area: VmArea,
    layout: Layout,
    /// One entry per page of the area.
    mapped: Vec<bool>,
    /// Budget released when the area is deleted.
    reserved: usize,
}

impl HostedArea {
    fn page_range(&self, address: VirtualAddress, size: usize) -> Option<core::ops::Range<usize>> {
        if !address.is_aligned(PAGE_SIZE) || size % PAGE_SIZE != 0 || size == 0 {
            return None;
        }
        if address < self.area.base || (address - self.area.base) + size > self.area.size {
            return None;
        }
        let first = (address - self.area.base) / PAGE_SIZE;
        Some(first .. first + size / PAGE_SIZE)
    }
}

#[derive(Default)]
struct HostedState {
    /// Keyed by the base address of each area.
    areas: BTreeMap<usize, HostedArea>,
    /// Boot-time memory that has not been adopted yet, keyed by base address.
    early: BTreeMap<usize, Layout>,
    next_id: usize,
}

impl HostedState {
    fn area_mut(&mut self, id: VmAreaId) -> Option<&mut HostedArea> {
        self.areas.values_mut().find(|a| a.area.id == id)
    }

    fn insert(&mut self, base: VirtualAddress, size: usize, layout: Layout, mapped: bool, reserved: usize) -> VmArea {
        let area = VmArea { id: VmAreaId(self.next_id), base, size };
        self.next_id += 1;
        self.areas.insert(base.value(), HostedArea {
            area,
            layout,
            mapped: vec![mapped; size / PAGE_SIZE],
            reserved,
        });
        area
    }
}

/// A VM backend and CPU topology backed by the host.
pub struct HostedVm {
    cpu_count: usize,
    memory_limit: AtomicUsize,
    /// Bytes of the budget only `PRIORITY_VIP` reservations may use.
    vip_reserve: AtomicUsize,
    reserved: AtomicUsize,
    failing_maps: AtomicUsize,
    failing_area_creations: AtomicUsize,
    maintainer_wakeups: AtomicUsize,
    state: Mutex<HostedState>,
}

impl HostedVm {
    /// Creates a backend that pretends to run on `cpu_count` CPUs
    /// and has an unlimited memory budget.
    pub fn new(cpu_count: usize) -> HostedVm {
        HostedVm {
            cpu_count: cpu_count.max(1),
            memory_limit: AtomicUsize::new(usize::MAX),
            vip_reserve: AtomicUsize::new(0),
            reserved: AtomicUsize::new(0),
            failing_maps: AtomicUsize::new(0),
            failing_area_creations: AtomicUsize::new(0),
            maintainer_wakeups: AtomicUsize::new(0),
            state: Mutex::new(HostedState::default()),
        }
    }

    /// Sets the memory budget in bytes.
    pub fn set_memory_limit(&self, bytes: usize) {
        self.memory_limit.store(bytes, Ordering::SeqCst);
    }

    /// Keeps the last `bytes` of the budget for `PRIORITY_VIP` reservations.
    pub fn set_vip_reserve(&self, bytes: usize) {
        self.vip_reserve.store(bytes, Ordering::SeqCst);
    }

    /// Makes the next `count` calls to [`VmBackend::map_pages()`] fail.
    pub fn fail_next_maps(&self, count: usize) {
        self.failing_maps.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` area creations fail.
    pub fn fail_next_area_creations(&self, count: usize) {
        self.failing_area_creations.store(count, Ordering::SeqCst);
    }

    /// Returns the number of bytes currently reserved from the budget.
    pub fn reserved_memory(&self) -> usize {
        self.reserved.load(Ordering::SeqCst)
    }

    /// Returns the number of VM areas that currently exist.
    pub fn area_count(&self) -> usize {
        self.state.lock().areas.len()
    }

    /// Returns the number of bytes currently mapped across all VM areas.
    pub fn mapped_bytes(&self) -> usize {
        self.state.lock().areas.values()
            .map(|a| a.mapped.iter().filter(|m| **m).count() * PAGE_SIZE)
            .sum()
    }

    /// Returns `true` if the page containing `address` is mapped.
    /// Boot-time memory that was not adopted yet counts as mapped.
    pub fn is_mapped(&self, address: VirtualAddress) -> bool {
        let state = self.state.lock();
        if let Some((base, layout)) = state.early.range(..=address.value()).next_back() {
            if address.value() - base < layout.size() {
                return true;
            }
        }
        state.areas.values()
            .find(|a| a.area.contains(address))
            .map_or(false, |a| a.mapped[(address - a.area.base) / PAGE_SIZE])
    }

    /// Returns how often the maintainer was woken up.
    pub fn maintainer_wakeups(&self) -> usize {
        self.maintainer_wakeups.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }

    fn allocate_block(size: usize, alignment: usize) -> Option<(VirtualAddress, Layout)> {
        let layout = Layout::from_size_align(size, alignment.max(PAGE_SIZE)).ok()?;
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            None
        } else {
            Some((VirtualAddress::new(ptr as usize), layout))
        }
    }
}

impl VmBackend for HostedVm {
    fn create_null_area(&self, size: usize, _flags: CacheFlags) -> Result<VmArea, SlabError> {
        if Self::take_failure(&self.failing_area_creations) {
            warn!("HostedVm: injected failure creating a null area of {} bytes", size);
            return Err(SlabError::NoMemory);
        }
        if !size.is_power_of_two() || size < PAGE_SIZE {
            return Err(SlabError::BadValue);
        }
        let (base, layout) = Self::allocate_block(size, size).ok_or(SlabError::NoMemory)?;
        let area = self.state.lock().insert(base, size, layout, false, 0);
        trace!("HostedVm: created null area {:?} at {:?}", area.id, base);
        Ok(area)
    }

    fn create_area(&self, size: usize, alignment: usize, flags: CacheFlags) -> Result<VmArea, SlabError> {
        if Self::take_failure(&self.failing_area_creations) {
            warn!("HostedVm: injected failure creating an area of {} bytes", size);
            return Err(SlabError::NoMemory);
        }
        let size = VirtualAddress::new(size).align_up(PAGE_SIZE).value();
        if size == 0 || (alignment != 0 && !alignment.is_power_of_two()) {
            return Err(SlabError::BadValue);
        }
        self.reserve_memory(size, flags)?;
        let (base, layout) = match Self::allocate_block(size, alignment) {
            Some(block) => block,
            None => {
                self.unreserve_memory(size);
                return Err(SlabError::NoMemory);
            }
        };
        let area = self.state.lock().insert(base, size, layout, true, size);
        trace!("HostedVm: created area {:?} at {:?}, {} bytes", area.id, base, size);
        Ok(area)
    }

    fn delete_area(&self, id: VmAreaId) -> Result<(), SlabError> {
        let removed = {
            let mut state = self.state.lock();
            let base = state.areas.values().find(|a| a.area.id == id).map(|a| a.area.base.value());
            base.and_then(|base| state.areas.remove(&base))
        };
        let area = removed.ok_or(SlabError::BadValue)?;
        if area.reserved > 0 {
            self.unreserve_memory(area.reserved);
        }
        // SAFETY: the block was allocated with this layout and is no longer tracked.
        unsafe { dealloc(area.area.base.value() as *mut u8, area.layout) };
        trace!("HostedVm: deleted area {:?}", id);
        Ok(())
    }

    fn area_for_address(&self, address: VirtualAddress) -> Option<VmArea> {
        let state = self.state.lock();
        let (_, area) = state.areas.range(..=address.value()).next_back()?;
        if area.area.contains(address) { Some(area.area) } else { None }
    }

    fn map_pages(&self, id: VmAreaId, address: VirtualAddress, size: usize, _flags: CacheFlags) -> Result<(), SlabError> {
        if Self::take_failure(&self.failing_maps) {
            warn!("HostedVm: injected failure mapping {} bytes at {:?}", size, address);
            return Err(SlabError::NoMemory);
        }
        let mut state = self.state.lock();
        let area = state.area_mut(id).ok_or(SlabError::BadValue)?;
        let pages = area.page_range(address, size).ok_or(SlabError::BadValue)?;
        if area.mapped[pages.clone()].iter().any(|m| *m) {
            error!("HostedVm: mapping {} bytes at {:?} over already mapped pages", size, address);
            return Err(SlabError::BadValue);
        }
        for mapped in &mut area.mapped[pages] {
            *mapped = true;
        }
        // Freshly mapped pages are zeroed.
        // SAFETY: the range lies within the area's block, which is owned by this backend.
        unsafe { ptr::write_bytes(address.value() as *mut u8, 0, size) };
        Ok(())
    }

    fn unmap_pages(&self, id: VmAreaId, address: VirtualAddress, size: usize) {
        let mut state = self.state.lock();
        let area = match state.area_mut(id) {
            Some(area) => area,
            None => {
                error!("HostedVm: unmapping {:?} from unknown area {:?}", address, id);
                return;
            }
        };
        match area.page_range(address, size) {
            Some(pages) => for mapped in &mut area.mapped[pages] {
                *mapped = false;
            },
            None => error!("HostedVm: unmapping invalid range {:?} + {:#X} from {:?}", address, size, id),
        }
    }

    fn reserve_memory(&self, size: usize, flags: CacheFlags) -> Result<(), SlabError> {
        let limit = self.memory_limit.load(Ordering::SeqCst);
        let limit = if flags.contains(CacheFlags::PRIORITY_VIP) {
            limit
        } else {
            limit.saturating_sub(self.vip_reserve.load(Ordering::SeqCst))
        };
        self.reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |reserved| {
                reserved.checked_add(size).filter(|total| *total <= limit)
            })
            .map(|_| ())
            .map_err(|_| SlabError::NoMemory)
    }

    fn unreserve_memory(&self, size: usize) {
        let _ = self.reserved.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |reserved| {
            Some(reserved.saturating_sub(size))
        });
    }

    fn allocate_early(&self, size: usize, alignment: usize) -> Option<VirtualAddress> {
        let (base, layout) = Self::allocate_block(size, alignment)?;
        // Boot-time memory is wired right away and counts against the budget regardless of its limit.
        self.reserved.fetch_add(size, Ordering::SeqCst);
        self.state.lock().early.insert(base.value(), layout);
        Some(base)
    }

    fn adopt_early_area(&self, base: VirtualAddress, size: usize) -> Result<VmArea, SlabError> {
        let mut state = self.state.lock();
        let layout = state.early.remove(&base.value()).ok_or(SlabError::BadValue)?;
        if layout.size() != size {
            state.early.insert(base.value(), layout);
            return Err(SlabError::BadValue);
        }
        Ok(state.insert(base, size, layout, true, 0))
    }

    fn wake_maintainer(&self) {
        self.maintainer_wakeups.fetch_add(1, Ordering::SeqCst);
    }
}

impl CpuTopology for HostedVm {
    fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    fn current_cpu(&self) -> usize {
        thread_cpu() % self.cpu_count
    }
}

impl Drop for HostedVm {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (base, area) in core::mem::take(&mut state.areas) {
            // SAFETY: every tracked block was allocated with its recorded layout.
            unsafe { dealloc(base as *mut u8, area.layout) };
        }
        for (base, layout) in core::mem::take(&mut state.early) {
            // SAFETY: as above.
            unsafe { dealloc(base as *mut u8, layout) };
        }
    }
}
