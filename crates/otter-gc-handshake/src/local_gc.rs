//! Thread-local collection requests
//!
//! A mutator asks for a collection of its own private objects, then blocks
//! until a collector thread has parked it, scanned it and cleared the request.
//! Other mutators keep running throughout.

use crate::closure::{RootsSink, scan_roots};
use crate::mutator::{LocalGcStatus, MutatorHandle};
use crate::vm::VmRuntime;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Queue of pending thread-local collections
pub struct ThreadLocalGcBlocker {
    pending: Mutex<VecDeque<MutatorHandle>>,
    available: Condvar,
}

impl ThreadLocalGcBlocker {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// Mark `mutator` as needing a thread-local collection and queue it.
    ///
    /// Panics if a request for the mutator is already outstanding.
    pub fn request(&self, mutator: &MutatorHandle) {
        {
            let mut status = mutator.lock_local_gc();
            assert_eq!(
                *status,
                LocalGcStatus::Inactive,
                "thread-local collection already requested for {:?}",
                mutator.id()
            );
            *status = LocalGcStatus::Active;
        }

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "otter::gc",
            mutator = mutator.id().0,
            "thread-local collection requested"
        );

        self.pending.lock().push_back(Arc::clone(mutator));
        self.available.notify_one();
    }

    /// Block the calling mutator until its thread-local collection is done.
    /// Returns at once if none is outstanding.
    pub fn block(&self, mutator: &MutatorHandle) {
        let mut status = mutator.lock_local_gc();
        while *status == LocalGcStatus::Active {
            mutator.wait_local_gc(&mut status);
        }

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "otter::gc",
            mutator = mutator.id().0,
            "resumed after thread-local collection"
        );
    }

    /// Number of queued requests
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Pop the next request without blocking
    pub fn try_next_request(&self) -> Option<MutatorHandle> {
        self.pending.lock().pop_front()
    }

    /// Wait up to `timeout` for the next request
    pub fn next_request_timeout(&self, timeout: Duration) -> Option<MutatorHandle> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            let _ = self.available.wait_for(&mut pending, timeout);
        }
        pending.pop_front()
    }

    /// Wait for the next request
    pub fn next_request(&self) -> MutatorHandle {
        let mut pending = self.pending.lock();
        loop {
            if let Some(mutator) = pending.pop_front() {
                return mutator;
            }
            self.available.wait(&mut pending);
        }
    }

    /// Run the thread-local collection of `mutator`: park it, hand its roots
    /// to `sink`, clear the request and wake it. Returns the root count.
    pub fn collect<S: RootsSink + ?Sized>(
        &self,
        runtime: &dyn VmRuntime,
        mutator: &MutatorHandle,
        sink: &mut S,
    ) -> usize {
        assert_eq!(
            mutator.local_gc_status(),
            LocalGcStatus::Active,
            "no thread-local collection requested for {:?}",
            mutator.id()
        );

        let mut roots = 0;
        runtime.suspend_one_mutator(mutator, &mut |parked| {
            roots += scan_roots(runtime, parked, &mut *sink);
        });

        {
            let mut status = mutator.lock_local_gc();
            *status = LocalGcStatus::Inactive;
            mutator.notify_local_gc();
        }
        runtime.resume_one_mutator(mutator);

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "otter::gc",
            mutator = mutator.id().0,
            roots,
            "thread-local collection finished"
        );

        roots
    }
}

impl Default for ThreadLocalGcBlocker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, ObjectReference};
    use crate::mutator::test_support::mutator;
    use crate::vm::GcThreadContext;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    struct RootsRuntime {
        roots: usize,
        suspended: AtomicUsize,
        resumed: AtomicUsize,
    }

    impl VmRuntime for RootsRuntime {
        fn suspend_all_mutators(&self, _report: Option<&mut dyn FnMut(&MutatorHandle)>) {}

        fn resume_all_mutators(&self) {}

        fn suspend_one_mutator(&self, mutator: &MutatorHandle, visitor: &mut dyn FnMut(&MutatorHandle)) {
            self.suspended.fetch_add(1, Ordering::SeqCst);
            visitor(mutator);
        }

        fn resume_one_mutator(&self, _mutator: &MutatorHandle) {
            self.resumed.fetch_add(1, Ordering::SeqCst);
        }

        fn scan_mutator_roots(&self, _mutator: &MutatorHandle, visitor: &mut dyn FnMut(Address)) {
            for i in 0..self.roots {
                visitor(Address::from_usize(0x8000 + i * 8));
            }
        }

        fn spawn_collector_thread(&self, _context: GcThreadContext) {}

        fn enqueue_references(&self, _references: &[ObjectReference]) {}
    }

    struct CountingSink(usize);

    impl RootsSink for CountingSink {
        fn acquire_buffer(&mut self) -> Vec<Address> {
            Vec::with_capacity(8)
        }

        fn report_roots(&mut self, roots: Vec<Address>) -> Vec<Address> {
            self.0 += roots.len();
            Vec::with_capacity(8)
        }
    }

    #[test]
    fn test_request_then_collect_releases_blocked_mutator() {
        let blocker = Arc::new(ThreadLocalGcBlocker::new());
        let runtime = RootsRuntime {
            roots: 20,
            suspended: AtomicUsize::new(0),
            resumed: AtomicUsize::new(0),
        };
        let m = mutator(0);

        blocker.request(&m);
        assert_eq!(m.local_gc_status(), LocalGcStatus::Active);
        assert_eq!(blocker.pending(), 1);

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let blocker = Arc::clone(&blocker);
            let m = Arc::clone(&m);
            std::thread::spawn(move || {
                blocker.block(&m);
                tx.send(m.local_gc_status()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        let queued = blocker.next_request();
        assert_eq!(queued.id(), m.id());
        let mut sink = CountingSink(0);
        assert_eq!(blocker.collect(&runtime, &queued, &mut sink), 20);
        assert_eq!(sink.0, 20);

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            LocalGcStatus::Inactive
        );
        waiter.join().unwrap();
        assert_eq!(runtime.suspended.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.resumed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_block_without_request_returns() {
        let blocker = ThreadLocalGcBlocker::new();
        let m = mutator(1);
        blocker.block(&m);
        assert!(blocker.try_next_request().is_none());
    }

    #[test]
    fn test_next_request_timeout_when_idle() {
        let blocker = ThreadLocalGcBlocker::new();
        assert!(blocker.next_request_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    #[should_panic(expected = "already requested")]
    fn test_double_request_panics() {
        let blocker = ThreadLocalGcBlocker::new();
        let m = mutator(2);
        blocker.request(&m);
        blocker.request(&m);
    }

    #[test]
    #[should_panic(expected = "no thread-local collection requested")]
    fn test_collect_without_request_panics() {
        let blocker = ThreadLocalGcBlocker::new();
        let runtime = RootsRuntime {
            roots: 0,
            suspended: AtomicUsize::new(0),
            resumed: AtomicUsize::new(0),
        };
        blocker.collect(&runtime, &mutator(3), &mut CountingSink(0));
    }
}
