//! Tests for object caches and the slab allocator, run against the hosted VM backend.

extern crate std;

use super::*;
use alloc::{boxed::Box, format, vec};
use core::sync::atomic::{AtomicBool, AtomicUsize};
use kernel_config::memory::{CACHE_LINE_SIZE, SLAB_CHUNK_SIZE_MEDIUM, SLAB_CHUNK_SIZE_SMALL};
use slab_structs::Completion;
use slab_vm::hosted::{pin_current_thread, HostedVm};
use self::std::{collections::BTreeSet, sync::Mutex as StdMutex, thread, time::Duration};

const NONE: CacheFlags = CacheFlags::empty();

fn allocator(cpus: usize) -> (Arc<HostedVm>, SlabAllocator) {
    let vm = Arc::new(HostedVm::new(cpus));
    let allocator = SlabAllocator::new(vm.clone());
    (vm, allocator)
}

fn addr(object: NonNull<u8>) -> usize {
    object.as_ptr() as usize
}

fn cache(allocator: &SlabAllocator, name: &str, object_size: usize) -> Arc<ObjectCache> {
    allocator.create_object_cache(name, object_size, 0, None, None).unwrap()
}

/// Checks that `object` lies on an object boundary within the slab `cache` says it belongs to.
fn assert_in_own_slab(cache: &ObjectCache, object: NonNull<u8>) {
    let slab = cache.object_slab(object);
    let info = cache.slab_info(slab).unwrap();
    let first = info.first_object.value();
    let end = first + info.size * cache.object_size();
    assert!(addr(object) >= first && addr(object) < end, "{:#x} outside of {:?}", addr(object), info);
    assert_eq!((addr(object) - first) % cache.object_size(), 0);
    assert_eq!(info.pages.value(), addr(object) & !(cache.slab_size() - 1));
}

#[test]
fn bad_values_are_rejected() {
    let (_vm, a) = allocator(1);
    assert_eq!(a.create_object_cache("zero", 0, 0, None, None).err(), Some(SlabError::BadValue));
    assert_eq!(a.create_object_cache("odd alignment", 64, 24, None, None).err(), Some(SlabError::BadValue));
    assert_eq!(a.create_object_cache("huge", 1024 * 1024, 0, None, None).err(), Some(SlabError::BadValue));
    assert!(a.caches().is_empty());
}

#[test]
fn object_sizes_are_normalized() {
    let (_vm, a) = allocator(1);
    let tiny = cache(&a, "tiny", 1);
    assert_eq!(tiny.object_size(), 8);
    assert_eq!(tiny.alignment(), 8);

    let odd = cache(&a, "odd", 20);
    assert_eq!(odd.object_size(), 24);

    let aligned = a.create_object_cache("aligned", 20, 32, None, None).unwrap();
    assert_eq!(aligned.object_size(), 32);
    assert_eq!(aligned.alignment(), 32);
    assert_eq!(aligned.slab_size(), SLAB_CHUNK_SIZE_SMALL);
    assert_eq!(aligned.objects_per_slab(), (SLAB_CHUNK_SIZE_SMALL - 16) / 32);

    let large = a.create_object_cache_etc(
        ObjectCacheConfig::new("large slab", 64).flags(CacheFlags::LARGE_SLAB)
    ).unwrap();
    assert_eq!(large.slab_size(), SLAB_CHUNK_SIZE_MEDIUM);

    let hashed = cache(&a, "hashed", 1000);
    assert_eq!(hashed.slab_size(), SLAB_CHUNK_SIZE_MEDIUM);
    assert_eq!(hashed.objects_per_slab(), SLAB_CHUNK_SIZE_MEDIUM / 1000);
    assert_eq!(a.caches().len(), 5);
}

#[test]
fn single_cpu_caches_have_no_depot() {
    let (_vm, a) = allocator(1);
    let c = cache(&a, "uniprocessor", 64);
    assert!(c.depot.is_none());
    assert!(c.flags().contains(CacheFlags::NO_DEPOT));

    let (_vm, a) = allocator(4);
    let c = cache(&a, "multiprocessor", 64);
    let depot = c.depot.as_ref().unwrap();
    assert_eq!(depot.magazine_capacity(), 32);
    assert_eq!(depot.max_count(), 16);
    let c = a.create_object_cache_etc(ObjectCacheConfig::new("opted out", 64).flags(CacheFlags::NO_DEPOT)).unwrap();
    assert!(c.depot.is_none());
}

#[test]
fn allocate_and_free_many() {
    let (_vm, a) = allocator(1);
    let c = a.create_object_cache("scenario a", 64, 64, None, None).unwrap();
    let mut seen = BTreeSet::new();
    let mut objects = Vec::new();
    for _ in 0 .. 1000 {
        let object = object_cache_alloc(&c, NONE).unwrap();
        assert!(seen.insert(addr(object)), "{:#x} handed out twice", addr(object));
        assert_eq!(addr(object) % c.alignment(), 0);
        objects.push(object);
    }
    let stats = c.stats();
    assert_eq!(stats.used_count, 1000);
    assert_eq!(stats.total_objects, stats.empty_slabs * c.objects_per_slab()
        + stats.partial_slabs * c.objects_per_slab() + stats.full_slabs * c.objects_per_slab());
    let usage = object_cache_get_usage(&c);

    for object in objects.drain(..) {
        object_cache_free(&c, object, NONE);
    }
    let stats = c.stats();
    assert_eq!(stats.used_count, 0);
    assert!(stats.empty_count > 0);
    assert_eq!(stats.empty_count, stats.empty_slabs);
    assert_eq!(stats.partial_slabs + stats.full_slabs, 0);

    // Everything fits into the slabs kept around.
    for _ in 0 .. 1000 {
        objects.push(object_cache_alloc(&c, NONE).unwrap());
    }
    assert_eq!(object_cache_get_usage(&c), usage);
    for object in objects {
        object_cache_free(&c, object, NONE);
    }

    a.delete_object_cache(c);
    assert!(a.caches().is_empty());
    assert_eq!(a.memory_manager().stats().areas, 0);
}

#[test]
fn maximum_limits_growth() {
    let (_vm, a) = allocator(1);
    let c = a.create_object_cache_etc(ObjectCacheConfig::new("scenario b", 64).maximum(SLAB_CHUNK_SIZE_SMALL)).unwrap();
    let mut objects = Vec::new();
    let error = loop {
        match c.alloc(NONE) {
            Ok(object) => objects.push(object),
            Err(e) => break e,
        }
    };
    assert_eq!(error, SlabError::NoMemory);
    assert_eq!(objects.len(), c.objects_per_slab());
    assert_eq!(c.usage(), SLAB_CHUNK_SIZE_SMALL);
    assert_eq!(c.stats().full_slabs, 1);

    // Freeing one makes room for exactly one more.
    let object = objects.pop().unwrap();
    c.free(object, NONE);
    objects.push(c.alloc(NONE).unwrap());
    assert_eq!(c.alloc(NONE), Err(SlabError::NoMemory));

    for object in objects {
        c.free(object, NONE);
    }
    a.delete_object_cache(c);
}

#[test]
fn slabs_are_colored() {
    let (_vm, a) = allocator(1);
    // 20 objects of 200 bytes leave 80 spare bytes per slab.
    let c = cache(&a, "colored", 200);
    assert_eq!(c.objects_per_slab(), 20);
    let objects: Vec<_> = (0 .. 60).map(|_| c.alloc(NONE).unwrap()).collect();
    let offsets: BTreeSet<usize> = objects.iter()
        .map(|o| c.slab_info(c.object_slab(*o)).unwrap())
        .map(|info| info.first_object - info.pages)
        .collect();
    let expected: BTreeSet<usize> = if CACHE_LINE_SIZE <= 80 {
        [0, CACHE_LINE_SIZE].iter().copied().collect()
    } else {
        [0].iter().copied().collect()
    };
    assert_eq!(offsets, expected);
    for object in objects {
        assert_in_own_slab(&c, object);
        c.free(object, NONE);
    }
}

#[test]
fn low_memory_returns_empty_slabs() {
    let (_vm, a) = allocator(1);
    let c = cache(&a, "scenario c", 64);
    let objects: Vec<_> = (0 .. 200).map(|_| c.alloc(NONE).unwrap()).collect();
    for object in objects {
        c.free(object, NONE);
    }
    // 200 objects took four slabs, all of which are kept because of the pressure.
    let stats = c.stats();
    assert_eq!(stats.pressure, 4);
    assert_eq!(stats.empty_count, 4);

    assert_eq!(a.handle_low_memory(ResourceLevel::None), 0);
    assert_eq!(c.stats().empty_count, 4);

    // A note keeps half the pressure plus one.
    assert_eq!(a.handle_low_memory(ResourceLevel::Note), 1);
    assert_eq!(c.stats().empty_count, 3);

    assert_eq!(a.handle_low_memory(ResourceLevel::Critical), 3);
    let stats = c.stats();
    assert_eq!(stats.empty_count, 0);
    assert_eq!(stats.pressure, 0);
    assert_eq!(stats.total_objects, 0);
    assert_eq!(c.usage(), 0);
}

#[test]
fn low_memory_empties_depots() {
    let (_vm, a) = allocator(4);
    pin_current_thread(0);
    let c = cache(&a, "scenario c with depot", 64);
    let objects: Vec<_> = (0 .. 200).map(|_| c.alloc(NONE).unwrap()).collect();
    for object in objects {
        c.free(object, NONE);
    }
    let stats = c.stats();
    assert!(stats.depot_objects > 0);
    let empty_before = stats.empty_count;

    let released = a.handle_low_memory(ResourceLevel::Critical);
    let stats = c.stats();
    assert_eq!(stats.depot_objects, 0);
    assert_eq!(stats.used_count, 0);
    assert_eq!(stats.empty_count, 0);
    assert!(released >= empty_before);
    assert_eq!(c.usage(), 0);
}

#[test]
fn low_memory_keeps_minimum_reserve() {
    let (vm, a) = allocator(1);
    let c = cache(&a, "reserved", 64);
    c.set_minimum_reserve(100).unwrap();
    assert_eq!(vm.maintainer_wakeups(), 1);
    assert!(a.maintenance_pending());
    assert_eq!(a.perform_maintenance(), 1);
    assert!(!a.maintenance_pending());

    let stats = c.stats();
    assert_eq!(stats.min_object_reserve, 100);
    assert_eq!(stats.total_objects, 2 * c.objects_per_slab());
    assert_eq!(stats.empty_count, 2);

    // Giving back either slab would dip below the reserve.
    assert_eq!(a.handle_low_memory(ResourceLevel::Critical), 0);
    assert_eq!(c.stats().empty_count, 2);
}

#[test]
fn allocations_below_reserve_queue_a_resize() {
    let (vm, a) = allocator(1);
    let c = cache(&a, "refilled", 64);
    object_cache_set_minimum_reserve(&c, 100).unwrap();
    a.perform_maintenance();
    let total = c.stats().total_objects;

    let objects: Vec<_> = (0 .. 30).map(|_| c.alloc(NONE).unwrap()).collect();
    assert_eq!(a.maintenance.len(), 1);
    assert_eq!(vm.maintainer_wakeups(), 2);
    assert_eq!(a.perform_maintenance(), 1);
    let stats = c.stats();
    assert!(stats.total_objects > total);
    assert!(stats.total_objects - stats.used_count >= 100);

    // Setting the same reserve again changes nothing.
    c.set_minimum_reserve(100).unwrap();
    assert_eq!(a.maintenance.len(), 0);
    for object in objects {
        c.free(object, NONE);
    }
}

#[test]
fn reserve_grows_ahead_of_time() {
    let (_vm, a) = allocator(1);
    let c = cache(&a, "reserve", 64);
    object_cache_reserve(&c, 0, NONE).unwrap();
    assert_eq!(c.usage(), 0);
    object_cache_reserve(&c, 100, NONE).unwrap();
    let stats = c.stats();
    assert_eq!(stats.total_objects, 2 * c.objects_per_slab());
    assert_eq!(stats.empty_count, 2);
    assert_eq!(c.usage(), 2 * SLAB_CHUNK_SIZE_SMALL);

    // Already satisfied.
    object_cache_reserve(&c, 50, CacheFlags::DONT_WAIT_FOR_MEMORY).unwrap();
    assert_eq!(c.usage(), 2 * SLAB_CHUNK_SIZE_SMALL);
}

#[test]
fn reserve_fails_without_memory() {
    let (vm, a) = allocator(1);
    let c = cache(&a, "starved", 64);
    vm.set_memory_limit(0);
    assert_eq!(c.reserve(1, NONE), Err(SlabError::NoMemory));
    assert_eq!(c.alloc(CacheFlags::DONT_WAIT_FOR_MEMORY).err(), Some(SlabError::NoMemory));
    assert_eq!(c.stats(), CacheStats::default());
}

#[test]
fn small_and_hashed_slab_lookup() {
    let (_vm, a) = allocator(1);
    let small = cache(&a, "small", 200);
    let hashed = cache(&a, "hashed", 300);
    let big = cache(&a, "big", 1000);
    let unrelated = cache(&a, "unrelated", 64);
    let caches = [&small, &hashed, &big];

    let mut objects = vec![Vec::new(), Vec::new(), Vec::new()];
    let mut noise = Vec::new();
    for i in 0 .. 150 {
        for (c, list) in caches.iter().zip(objects.iter_mut()) {
            list.push(c.alloc(NONE).unwrap());
        }
        noise.push(unrelated.alloc(NONE).unwrap());
        if i % 3 == 0 {
            unrelated.free(noise.remove(0), NONE);
        }
    }

    for (c, list) in caches.iter().zip(objects.iter()) {
        for object in list {
            assert_in_own_slab(c, *object);
            let owner = a.cache_for_address(VirtualAddress::from_ptr(*object)).unwrap();
            assert_eq!(owner.id(), c.id());
        }
    }
    for (c, list) in caches.iter().zip(objects) {
        for object in list {
            c.free(object, NONE);
        }
        let stats = c.stats();
        assert_eq!(stats.used_count, 0);
        assert_eq!(stats.partial_slabs + stats.full_slabs, 0);
    }
    for object in noise {
        unrelated.free(object, NONE);
    }
}

#[test]
#[should_panic(expected = "is not one of its objects")]
fn foreign_object_of_small_cache() {
    let (_vm, a) = allocator(1);
    let mine = cache(&a, "mine", 64);
    let theirs = cache(&a, "theirs", 64);
    mine.alloc(NONE).unwrap();
    let object = theirs.alloc(NONE).unwrap();
    mine.object_slab(object);
}

#[test]
#[should_panic(expected = "is not one of its objects")]
fn foreign_object_of_hashed_cache() {
    let (_vm, a) = allocator(1);
    let mine = cache(&a, "mine", 512);
    let theirs = cache(&a, "theirs", 512);
    mine.alloc(NONE).unwrap();
    let object = theirs.alloc(NONE).unwrap();
    mine.free(object, NONE);
}

#[test]
#[should_panic(expected = "freed twice")]
fn double_free_panics() {
    let (_vm, a) = allocator(1);
    let c = cache(&a, "double free", 64);
    let object = c.alloc(NONE).unwrap();
    let _other = c.alloc(NONE).unwrap();
    c.free(object, NONE);
    c.free(object, NONE);
}

#[test]
#[should_panic(expected = "deleted while")]
fn delete_with_live_objects_panics() {
    let (_vm, a) = allocator(1);
    let c = cache(&a, "leaky", 64);
    c.alloc(NONE).unwrap();
    a.delete_object_cache(c);
}

#[test]
fn depot_and_no_depot_agree() {
    let (_vm, a) = allocator(4);
    pin_current_thread(0);
    let with_depot = cache(&a, "with depot", 64);
    let without = a.create_object_cache_etc(ObjectCacheConfig::new("without depot", 64).flags(CacheFlags::NO_DEPOT)).unwrap();

    let run = |c: &ObjectCache| {
        let mut objects: Vec<_> = (0 .. 100).map(|_| c.alloc(NONE).unwrap()).collect();
        let mut kept = Vec::new();
        for (i, object) in objects.drain(..).enumerate() {
            if i % 2 == 1 {
                c.free(object, NONE);
            } else {
                kept.push(object);
            }
        }
        kept.extend((0 .. 20).map(|_| c.alloc(NONE).unwrap()));
        for object in kept {
            c.free(object, NONE);
        }
    };
    run(&with_depot);
    run(&without);
    with_depot.depot.as_ref().unwrap().make_empty(NONE);

    let a_stats = with_depot.stats();
    let b_stats = without.stats();
    assert_eq!(a_stats.depot_objects, 0);
    assert_eq!(a_stats.used_count, b_stats.used_count);
    assert_eq!(a_stats.total_objects, b_stats.total_objects);
    assert_eq!(a_stats.usage, b_stats.usage);
    assert_eq!(
        (a_stats.empty_slabs, a_stats.partial_slabs, a_stats.full_slabs),
        (b_stats.empty_slabs, b_stats.partial_slabs, b_stats.full_slabs),
    );
}

#[test]
fn concurrent_objects_are_unique() {
    const THREADS: usize = 4;
    let (_vm, a) = allocator(THREADS);
    let c = cache(&a, "contended", 64);
    let live = Arc::new(StdMutex::new(BTreeSet::new()));

    let handles: Vec<_> = (0 .. THREADS).map(|t| {
        let c = c.clone();
        let live = live.clone();
        thread::spawn(move || {
            pin_current_thread(t);
            let mut mine = Vec::new();
            for round in 0 .. 3000usize {
                let object = c.alloc(NONE).unwrap();
                assert!(live.lock().unwrap().insert(addr(object)), "{:#x} handed out twice", addr(object));
                let token = ((t as u64) << 32) | round as u64;
                // SAFETY: objects are 64 bytes long and 8-byte aligned.
                unsafe { (object.as_ptr() as *mut u64).write(token) };
                mine.push((object, token));

                if mine.len() > 40 || round % 7 == 0 {
                    let count = mine.len() / 2;
                    for (object, token) in mine.drain(.. count) {
                        assert_eq!(unsafe { (object.as_ptr() as *const u64).read() }, token);
                        live.lock().unwrap().remove(&addr(object));
                        c.free(object, NONE);
                    }
                }
            }
            for (object, token) in mine {
                assert_eq!(unsafe { (object.as_ptr() as *const u64).read() }, token);
                live.lock().unwrap().remove(&addr(object));
                c.free(object, NONE);
            }
        })
    }).collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(live.lock().unwrap().is_empty());
    c.depot.as_ref().unwrap().make_empty(NONE);
    assert_eq!(c.stats().used_count, 0);
    a.delete_object_cache(c);
}

#[test]
fn failing_constructor_rolls_back_the_slab() {
    let (_vm, a) = allocator(1);
    let constructed = Arc::new(AtomicUsize::new(0));
    let destructed = Arc::new(AtomicUsize::new(0));
    let config = {
        let constructed = constructed.clone();
        let destructed = destructed.clone();
        ObjectCacheConfig::new("fragile", 64)
            .constructor(Box::new(move |_: NonNull<u8>| {
                if constructed.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
                    Err(SlabError::NoMemory)
                } else {
                    Ok(())
                }
            }))
            .destructor(Box::new(move |_: NonNull<u8>| {
                destructed.fetch_add(1, Ordering::SeqCst);
            }))
    };
    let c = a.create_object_cache_etc(config).unwrap();
    let per_slab = c.objects_per_slab();

    assert_eq!(c.alloc(NONE).err(), Some(SlabError::NoMemory));
    assert_eq!(constructed.load(Ordering::SeqCst), 5);
    assert_eq!(destructed.load(Ordering::SeqCst), 4);
    assert_eq!(c.stats(), CacheStats::default());
    assert_eq!(a.memory_manager().stats().areas, 0);

    let object = c.alloc(NONE).unwrap();
    assert_eq!(constructed.load(Ordering::SeqCst), 5 + per_slab);
    c.free(object, NONE);
    assert_eq!(destructed.load(Ordering::SeqCst), 4);

    a.delete_object_cache(c);
    assert_eq!(destructed.load(Ordering::SeqCst), 4 + per_slab);
}

#[test]
fn reclaimer_runs_on_low_memory() {
    let (_vm, a) = allocator(1);
    let levels = Arc::new(StdMutex::new(Vec::new()));
    let sink = levels.clone();
    let _c = a.create_object_cache_etc(
        ObjectCacheConfig::new("reclaimable", 64)
            .reclaimer(Box::new(move |level: ResourceLevel| sink.lock().unwrap().push(level)))
    ).unwrap();
    a.handle_low_memory(ResourceLevel::Warning);
    a.handle_low_memory(ResourceLevel::None);
    a.handle_low_memory(ResourceLevel::Critical);
    assert_eq!(*levels.lock().unwrap(), vec![ResourceLevel::Warning, ResourceLevel::Critical]);
}

#[test]
fn busy_cache_is_deleted_when_done() {
    let (_vm, a) = allocator(1);
    let c = cache(&a, "busy", 64);
    c.reserve(1, NONE).unwrap();

    assert!(a.maintenance.begin(c.id()));
    assert!(!a.maintenance.begin(c.id()));
    assert!(a.maintenance.request_delete(c.clone()).is_none());
    assert!(a.maintenance.finish(&c));
    c.destroy();
    assert_eq!(c.usage(), 0);
}

#[test]
fn queued_cache_is_deleted_right_away() {
    let (_vm, a) = allocator(1);
    let c = cache(&a, "queued", 64);
    c.set_minimum_reserve(10).unwrap();
    assert_eq!(a.maintenance.len(), 1);

    a.delete_object_cache(c.clone());
    assert_eq!(a.maintenance.len(), 0);
    assert!(a.caches().is_empty());
    assert_eq!(a.perform_maintenance(), 0);
    assert_eq!(c.usage(), 0);
}

#[test]
fn resize_requested_during_low_memory_is_queued() {
    let (_vm, a) = allocator(1);
    let c = cache(&a, "resized later", 64);
    assert!(a.maintenance.begin(c.id()));
    c.set_minimum_reserve(10).unwrap();
    assert_eq!(a.maintenance.len(), 0);
    assert!(!a.maintenance.finish(&c));
    assert_eq!(a.maintenance.len(), 1);
    assert_eq!(a.perform_maintenance(), 1);
    assert!(c.stats().total_objects >= 10);
}

#[test]
fn early_allocator_moves_to_areas() {
    let vm = Arc::new(HostedVm::new(1));
    let a = SlabAllocator::init_early(vm.clone());
    let c = cache(&a, "early", 64);
    let object = c.alloc(NONE).unwrap();
    assert!(vm.is_mapped(VirtualAddress::from_ptr(object)));

    a.init_post_area().unwrap();
    assert!(vm.area_count() > 0);
    assert!(vm.is_mapped(VirtualAddress::from_ptr(object)));
    assert_in_own_slab(&c, object);
    c.free(object, NONE);
}

#[test]
fn cache_flags_apply_to_every_call() {
    let (vm, a) = allocator(1);
    let c = a.create_object_cache_etc(
        ObjectCacheConfig::new("no kernel space", 64).flags(CacheFlags::DONT_LOCK_KERNEL_SPACE)
    ).unwrap();
    assert_eq!(c.alloc(NONE).err(), Some(SlabError::WouldBlock));
    assert_eq!(c.reserve(1, NONE), Err(SlabError::WouldBlock));
    assert_eq!(vm.area_count(), 0);

    // Once another cache brought in an area, the chunks in it can be used.
    let other = cache(&a, "other", 64);
    let keeper = other.alloc(NONE).unwrap();
    let object = c.alloc(NONE).unwrap();
    assert_in_own_slab(&c, object);
    assert_eq!(vm.area_count(), 1);
    c.free(object, NONE);
    other.free(keeper, NONE);
    a.delete_object_cache(c);
    a.delete_object_cache(other);
}

#[test]
fn dont_wait_fails_while_the_cache_grows() {
    let (vm, a) = allocator(1);
    let c = cache(&a, "growing", 64);
    let dont_wait = CacheFlags::DONT_WAIT_FOR_MEMORY;
    let done = Arc::new(Completion::new());

    c.inner.lock().resize_can_wait = Some(done.clone());
    assert_eq!(c.alloc(dont_wait).err(), Some(SlabError::WouldBlock));
    assert_eq!(c.reserve(4, dont_wait), Err(SlabError::WouldBlock));
    {
        let mut inner = c.inner.lock();
        inner.resize_can_wait = None;
        inner.resize_dont_wait = Some(done.clone());
    }
    assert_eq!(c.alloc(dont_wait).err(), Some(SlabError::WouldBlock));
    assert_eq!(vm.area_count(), 0);

    // A caller that may wait does so until the growth in flight is done.
    let waiter = {
        let c = c.clone();
        thread::spawn(move || c.alloc(NONE).map(addr))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());
    c.inner.lock().resize_dont_wait = None;
    done.complete();

    let object = waiter.join().unwrap().unwrap();
    c.free(NonNull::new(object as *mut u8).unwrap(), NONE);
    a.delete_object_cache(c);
}

#[test]
fn maintenance_races_with_cache_users() {
    const WORKERS: usize = 3;
    let (_vm, a) = allocator(WORKERS + 1);
    let a = Arc::new(a);
    let stop = Arc::new(AtomicBool::new(false));

    let maintainer = {
        let a = a.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            pin_current_thread(WORKERS);
            let levels = [ResourceLevel::Note, ResourceLevel::Warning, ResourceLevel::Critical];
            let mut round = 0;
            while !stop.load(Ordering::Acquire) {
                a.perform_maintenance();
                a.handle_low_memory(levels[round % levels.len()]);
                round += 1;
                thread::yield_now();
            }
        })
    };

    let workers: Vec<_> = (0 .. WORKERS).map(|t| {
        let a = a.clone();
        thread::spawn(move || {
            pin_current_thread(t);
            for round in 0 .. 40usize {
                let c = cache(&a, &format!("stress {}/{}", t, round), 32 + 48 * t);
                c.set_minimum_reserve(round % 3 * c.objects_per_slab()).unwrap();
                let mut objects = Vec::new();
                for i in 0 .. 200usize {
                    objects.push(c.alloc(NONE).unwrap());
                    if i % 3 == 0 {
                        let victim = objects.swap_remove(i % objects.len());
                        c.free(victim, NONE);
                    }
                }
                c.set_minimum_reserve(0).unwrap();
                for object in objects {
                    c.free(object, NONE);
                }
                a.delete_object_cache(c);
            }
        })
    }).collect();

    for worker in workers {
        worker.join().unwrap();
    }
    stop.store(true, Ordering::Release);
    maintainer.join().unwrap();
    a.perform_maintenance();

    assert!(a.caches().is_empty());
    assert_eq!(a.maintenance.len(), 0);
    assert_eq!(a.memory_manager().stats().areas, 0);
}
