//! Tests for the magazine depot, driven by a fake CPU topology.

extern crate std;

use super::*;
use alloc::vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use self::std::{cell::Cell, collections::BTreeSet, sync::Mutex as StdMutex, thread, thread_local};

thread_local! {
    static CPU: Cell<usize> = Cell::new(0);
}

/// Every thread runs on the CPU it last set with `run_on`, CPU 0 by default.
struct TestCpus(usize);

impl CpuTopology for TestCpus {
    fn cpu_count(&self) -> usize { self.0 }
    fn current_cpu(&self) -> usize { CPU.with(|c| c.get()) % self.0 }
}

fn run_on(cpu: usize) {
    CPU.with(|c| c.set(cpu));
}

/// Objects are fake, the depot never dereferences them.
fn object(n: usize) -> NonNull<u8> {
    NonNull::new((0x1000 + n * 64) as *mut u8).unwrap()
}

fn addr(object: NonNull<u8>) -> usize {
    object.as_ptr() as usize
}

fn depot(capacity: usize, max_count: usize, cpus: usize) -> (ObjectDepot, Arc<StdMutex<Vec<usize>>>) {
    let returned = Arc::new(StdMutex::new(Vec::new()));
    let sink = returned.clone();
    let depot = ObjectDepot::new(
        capacity,
        max_count,
        Arc::new(TestCpus(cpus)),
        Box::new(move |object, _flags| sink.lock().unwrap().push(addr(object))),
    ).unwrap();
    (depot, returned)
}

#[test]
fn zero_capacity_is_rejected() {
    let result = ObjectDepot::new(0, 1, Arc::new(TestCpus(1)), Box::new(|_, _| {}));
    assert_eq!(result.err(), Some(SlabError::BadValue));
}

#[test]
fn fresh_depot_has_nothing_to_obtain() {
    let (depot, _) = depot(4, 2, 1);
    assert_eq!(depot.obtain(), None);
}

#[test]
fn obtain_returns_last_stored_object() {
    run_on(0);
    let (depot, returned) = depot(4, 2, 1);
    depot.store(object(1), CacheFlags::empty());
    depot.store(object(2), CacheFlags::empty());
    assert_eq!(depot.obtain(), Some(object(2)));
    assert_eq!(depot.obtain(), Some(object(1)));
    assert_eq!(depot.obtain(), None);
    assert!(returned.lock().unwrap().is_empty());
}

#[test]
fn full_magazines_go_to_the_shared_list() {
    run_on(0);
    let (depot, returned) = depot(2, 10, 1);
    for n in 0 .. 6 {
        depot.store(object(n), CacheFlags::empty());
    }
    // Loaded and previous hold four objects, the first full magazine went to the shared list.
    assert_eq!(depot.shared_magazines(), (1, 0));
    assert_eq!(depot.cached_objects(), 6);
    assert!(returned.lock().unwrap().is_empty());
}

#[test]
fn excess_full_magazine_is_returned_to_the_owner() {
    run_on(0);
    let (depot, returned) = depot(2, 0, 1);
    for n in 0 .. 5 {
        depot.store(object(n), CacheFlags::empty());
    }
    // With no room in the full list, the first full magazine was emptied into the callback.
    let returned = returned.lock().unwrap();
    assert_eq!(returned.len(), 2);
    assert_eq!(depot.cached_objects(), 3);
    let returned: BTreeSet<_> = returned.iter().copied().collect();
    assert_eq!(returned, [addr(object(0)), addr(object(1))].into_iter().collect());
}

#[test]
fn other_cpus_pull_full_magazines() {
    let (depot, _) = depot(2, 10, 2);
    run_on(0);
    for n in 0 .. 6 {
        depot.store(object(n), CacheFlags::empty());
    }
    run_on(1);
    for n in 100 .. 103 {
        depot.store(object(n), CacheFlags::empty());
    }
    let mut obtained = BTreeSet::new();
    while let Some(object) = depot.obtain() {
        assert!(obtained.insert(object), "object {:p} handed out twice", object);
    }
    let expected: BTreeSet<_> = [100, 101, 102, 0, 1].iter().map(|n| object(*n)).collect();
    assert_eq!(obtained, expected);
    run_on(0);
}

#[test]
fn make_empty_returns_every_object_once() {
    let (depot, returned) = depot(3, 1, 2);
    run_on(0);
    for n in 0 .. 10 {
        depot.store(object(n), CacheFlags::empty());
    }
    run_on(1);
    for n in 10 .. 14 {
        depot.store(object(n), CacheFlags::empty());
    }
    run_on(0);
    let buffered = depot.cached_objects();
    let returned_before = returned.lock().unwrap().len();
    assert_eq!(buffered + returned_before, 14);

    depot.make_empty(CacheFlags::empty());
    assert_eq!(depot.cached_objects(), 0);
    assert_eq!(depot.shared_magazines(), (0, 0));
    assert_eq!(depot.obtain(), None);

    let returned = returned.lock().unwrap();
    let unique: BTreeSet<_> = returned.iter().copied().collect();
    assert_eq!(returned.len(), 14);
    assert_eq!(unique.len(), 14);
}

#[test]
fn concurrent_store_and_obtain_never_duplicate() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 500;
    let (depot, returned) = depot(8, 4, THREADS);
    let depot = Arc::new(depot);
    let handed_out = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0 .. THREADS).map(|t| {
        let depot = depot.clone();
        let handed_out = handed_out.clone();
        thread::spawn(move || {
            run_on(t);
            let mut mine = vec![];
            for n in 0 .. PER_THREAD {
                depot.store(object(t * PER_THREAD + n), CacheFlags::empty());
                if n % 3 == 0 {
                    if let Some(object) = depot.obtain() {
                        mine.push(addr(object));
                    }
                }
            }
            handed_out.fetch_add(mine.len(), Ordering::SeqCst);
            mine
        })
    }).collect();

    let mut seen = BTreeSet::new();
    for handle in handles {
        for object in handle.join().unwrap() {
            assert!(seen.insert(object), "object {:#X} handed out twice", object);
        }
    }
    depot.make_empty(CacheFlags::empty());
    for object in returned.lock().unwrap().iter() {
        assert!(seen.insert(*object), "object {:#X} both handed out and returned", object);
    }
    assert_eq!(seen.len(), THREADS * PER_THREAD);
    assert_eq!(handed_out.load(Ordering::SeqCst) + returned.lock().unwrap().len(), THREADS * PER_THREAD);
}
