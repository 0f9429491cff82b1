//! Roots embedded in compiled code
//!
//! Compiled code blobs hold object references as immediates. The runtime
//! reports a blob's reference slots once, when the blob is installed, and the
//! collector scans them as roots until the blob is unregistered.
//!
//! Blobs installed since the last scan are nursery blobs. Every scan visits
//! them and then moves them to the mature set; mature blobs are only visited
//! by full-heap scans.

use crate::address::Address;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

type CodeRoots = FxHashMap<Address, Vec<Address>>;

/// Root slots of installed code blobs, keyed by blob address
///
/// Lock order is mature before nursery.
pub struct CodeRootRegistry {
    nursery: Mutex<CodeRoots>,
    mature: Mutex<CodeRoots>,
    /// Slots across both sets
    slots: AtomicUsize,
}

impl CodeRootRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            nursery: Mutex::new(FxHashMap::default()),
            mature: Mutex::new(FxHashMap::default()),
            slots: AtomicUsize::new(0),
        }
    }

    /// Record the reference slots of a newly installed blob.
    ///
    /// A blob with no slots is not recorded. Registering a blob again
    /// replaces its previous slots.
    pub fn register(&self, code: Address, slots: Vec<Address>) {
        if slots.is_empty() {
            return;
        }
        let mut mature = self.mature.lock();
        let mut nursery = self.nursery.lock();
        let stale = Self::take(&mut mature, &mut nursery, code);
        // Both locks are held, so plain load/store cannot race another update
        let count = self.slots.load(Ordering::Relaxed) - stale + slots.len();
        self.slots.store(count, Ordering::Relaxed);
        nursery.insert(code, slots);
    }

    /// Forget a blob the runtime has freed. Returns the number of slots
    /// dropped; 0 if the blob was never registered.
    pub fn unregister(&self, code: Address) -> usize {
        let mut mature = self.mature.lock();
        let mut nursery = self.nursery.lock();
        let removed = Self::take(&mut mature, &mut nursery, code);
        let count = self.slots.load(Ordering::Relaxed) - removed;
        self.slots.store(count, Ordering::Relaxed);
        removed
    }

    fn take(mature: &mut CodeRoots, nursery: &mut CodeRoots, code: Address) -> usize {
        mature.remove(&code).map_or(0, |s| s.len()) + nursery.remove(&code).map_or(0, |s| s.len())
    }

    /// Report root slots to `visitor`: nursery blobs always, mature blobs
    /// unless `nursery_only`. Nursery blobs are mature afterwards.
    /// Returns the number of slots visited.
    pub fn scan(&self, nursery_only: bool, visitor: &mut dyn FnMut(Address)) -> usize {
        let mut mature = self.mature.lock();
        let mut mature_slots = 0;
        if !nursery_only {
            for slot in mature.values().flatten() {
                visitor(*slot);
                mature_slots += 1;
            }
        }

        let mut nursery = self.nursery.lock();
        let mut nursery_slots = 0;
        for (code, slots) in nursery.drain() {
            for slot in &slots {
                visitor(*slot);
            }
            nursery_slots += slots.len();
            mature.insert(code, slots);
        }

        #[cfg(feature = "gc_logging")]
        tracing::trace!(
            target: "otter::gc",
            nursery_slots,
            mature_slots,
            "scanned code roots"
        );

        nursery_slots + mature_slots
    }

    /// Registered blobs
    pub fn len(&self) -> usize {
        let mature = self.mature.lock();
        mature.len() + self.nursery.lock().len()
    }

    /// Whether no blob is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered slots across every blob
    pub fn slot_count(&self) -> usize {
        self.slots.load(Ordering::Relaxed)
    }
}

impl Default for CodeRootRegistry {
    fn default() -> Self {
        Self::new()
    }
}
