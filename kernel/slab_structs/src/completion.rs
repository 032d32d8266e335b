use core::{
    hint::spin_loop,
    sync::atomic::{AtomicBool, Ordering},
};

/// A one-shot signal that an in-flight operation has finished.
///
/// The thread that starts an operation publishes an `Arc<Completion>` while holding
/// the relevant lock. Other threads that need the operation's result clone that `Arc`,
/// release every lock, and [`wait()`](Completion::wait) on it before retrying.
/// The initiator calls [`complete()`](Completion::complete) when it is done,
/// whether it succeeded or not.
#[derive(Debug, Default)]
pub struct Completion {
    done: AtomicBool,
}

impl Completion {
    pub const fn new() -> Completion {
        Completion { done: AtomicBool::new(false) }
    }

    /// Marks the operation as finished and releases all waiters.
    pub fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Spins until the operation has finished.
    ///
    /// This stands in for blocking on a kernel wait queue: the waiter burns its CPU
    /// instead of being descheduled until `complete()` wakes it. Operations waited on
    /// this way are area and slab allocations, which finish without needing the waiter.
    ///
    /// Must not be called while holding a lock the initiator needs.
    pub fn wait(&self) {
        while !self.is_complete() {
            spin_loop();
        }
    }
}
