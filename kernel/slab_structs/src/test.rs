//! Tests for the address helpers and the error conversions.

extern crate std;

use super::*;
use alloc::sync::Arc;
use self::std::thread;

#[test]
fn align_down_finds_lower_boundary() {
    let addr = VirtualAddress::new(0x4275_1234);
    assert_eq!(addr.align_down(0x1000), VirtualAddress::new(0x4275_1000));
    assert_eq!(addr.align_down(0x10_0000), VirtualAddress::new(0x4270_0000));
    assert!(VirtualAddress::new(0x4270_0000).is_aligned(0x10_0000));
    assert!(!addr.is_aligned(8));
}

#[test]
fn align_up_rounds_to_next_multiple() {
    assert_eq!(VirtualAddress::new(0x1001).align_up(0x1000), VirtualAddress::new(0x2000));
    assert_eq!(VirtualAddress::new(0x2000).align_up(0x1000), VirtualAddress::new(0x2000));
}

#[test]
fn address_difference() {
    let start = VirtualAddress::new(0x8000);
    let end = start + 0x3000;
    assert_eq!(end - start, 0x3000);
    assert_eq!(end - 0x1000, VirtualAddress::new(0xA000));
}

#[test]
fn call_flags_strip_cache_configuration() {
    let flags = CacheFlags::NO_DEPOT | CacheFlags::LARGE_SLAB | CacheFlags::DONT_WAIT_FOR_MEMORY;
    assert_eq!(flags.call_flags(), CacheFlags::DONT_WAIT_FOR_MEMORY);
}

#[test]
fn error_converts_to_str() {
    let msg: &'static str = SlabError::NoMemory.into();
    assert_eq!(msg, "out of memory");
    assert_eq!(std::format!("{}", SlabError::WouldBlock), "operation would block");
}

#[test]
fn completion_releases_waiter() {
    let completion = Arc::new(Completion::new());
    let waiter = {
        let completion = completion.clone();
        thread::spawn(move || completion.wait())
    };
    assert!(!completion.is_complete());
    completion.complete();
    waiter.join().unwrap();
    assert!(completion.is_complete());
}
