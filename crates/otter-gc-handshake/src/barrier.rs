//! Publication write barrier
//!
//! Every store of a reference into a heap slot goes through
//! [`PublicObjectBarrier::object_reference_write`]. The barrier tells the
//! collector when a write may make a private object reachable from a public
//! one:
//!
//! - Null stores publish nothing
//! - Stores into a private object publish nothing (the hot case: fresh,
//!   unescaped objects)
//! - Stores of an already public target need no further bookkeeping
//! - Anything else goes to the [`BarrierRecorder`]
//!
//! Two call-site strategies exist. [`BarrierMode::FastPath`] runs the bitmap
//! checks inline; [`BarrierMode::AlwaysSlow`] always enters the out-of-line
//! full path, which performs the very same checks. The choice never changes
//! what gets recorded.

use crate::address::{Address, MutatorId, ObjectReference};
use crate::side_metadata::PublicBitmap;
use crate::vm::ObjectModel;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bytes per reference slot
pub const BYTES_IN_SLOT: usize = std::mem::size_of::<usize>();

/// Barrier call-site strategy, fixed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierMode {
    /// Bitmap checks inline, recorder only on the rare path
    FastPath,
    /// Every barrier enters the out-of-line full path
    AlwaysSlow,
}

/// Collector-side sink for barrier slow paths
pub trait BarrierRecorder: Send + Sync + 'static {
    /// `target` is being stored into `slot` of the public object `src`, and
    /// `target` is still private.
    fn object_reference_write_slow(
        &self,
        mutator: MutatorId,
        src: ObjectReference,
        slot: Address,
        target: ObjectReference,
    );

    /// A bulk reference copy into a public array.
    ///
    /// # Safety
    /// Both ranges must be readable reference slots.
    unsafe fn array_copy_slow(&self, mutator: MutatorId, src: Range<Address>, dst: Range<Address>);

    /// A public object was loaded
    fn object_reference_read_slow(&self, _mutator: MutatorId, _target: ObjectReference) {}

    /// Make `object` public regardless of where it is stored
    fn publish_object(&self, mutator: MutatorId, object: ObjectReference);
}

#[derive(Default)]
struct BarrierCounters {
    writes: AtomicU64,
    slow_path_calls: AtomicU64,
    array_copies: AtomicU64,
    public_reads: AtomicU64,
}

/// Barrier statistics for one mutator
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BarrierStats {
    /// Reference writes seen
    pub writes: u64,
    /// Calls into the recorder (writes and array copies)
    pub slow_path_calls: u64,
    /// Non-empty array copies seen
    pub array_copies: u64,
    /// Loads of public objects reported
    pub public_reads: u64,
}

/// Per-mutator publication barrier
pub struct PublicObjectBarrier {
    mutator: MutatorId,
    mode: BarrierMode,
    bitmap: Arc<PublicBitmap>,
    recorder: Arc<dyn BarrierRecorder>,
    counters: BarrierCounters,
}

impl PublicObjectBarrier {
    /// Create the barrier for one mutator
    pub fn new(
        mutator: MutatorId,
        mode: BarrierMode,
        bitmap: Arc<PublicBitmap>,
        recorder: Arc<dyn BarrierRecorder>,
    ) -> Self {
        Self {
            mutator,
            mode,
            bitmap,
            recorder,
            counters: BarrierCounters::default(),
        }
    }

    /// Call-site strategy in use
    pub fn mode(&self) -> BarrierMode {
        self.mode
    }

    /// Write barrier for `src.slot = target`
    #[inline]
    pub fn object_reference_write(&self, src: ObjectReference, slot: Address, target: ObjectReference) {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        match self.mode {
            BarrierMode::FastPath => {
                if target.is_null() || !self.bitmap.is_public(src.to_address()) {
                    return;
                }
                self.object_reference_write_mid(src, slot, target);
            }
            BarrierMode::AlwaysSlow => self.object_reference_write_full(src, slot, target),
        }
    }

    #[inline(never)]
    fn object_reference_write_full(&self, src: ObjectReference, slot: Address, target: ObjectReference) {
        if target.is_null() || !self.bitmap.is_public(src.to_address()) {
            return;
        }
        self.object_reference_write_mid(src, slot, target);
    }

    /// `src` is public: record unless the target is public already
    #[inline(never)]
    fn object_reference_write_mid(&self, src: ObjectReference, slot: Address, target: ObjectReference) {
        if self.bitmap.is_public(target.to_address()) {
            return;
        }
        self.counters.slow_path_calls.fetch_add(1, Ordering::Relaxed);
        self.recorder
            .object_reference_write_slow(self.mutator, src, slot, target);
    }

    /// Barrier for copying `count` references from `src` to `dst`, where
    /// `dst` lies inside `dst_array`. Fires at most one recorder call.
    ///
    /// # Safety
    /// `src..src + count` slots must be readable reference slots.
    #[inline]
    pub unsafe fn object_reference_array_copy(
        &self,
        src: Address,
        dst: Address,
        count: usize,
        dst_array: ObjectReference,
    ) {
        if count == 0 {
            return;
        }
        self.counters.array_copies.fetch_add(1, Ordering::Relaxed);
        match self.mode {
            BarrierMode::FastPath => {
                if !self.bitmap.is_public(dst_array.to_address()) {
                    return;
                }
                // SAFETY: Forwarded caller contract
                unsafe { self.array_copy_mid(src, dst, count) }
            }
            // SAFETY: Forwarded caller contract
            BarrierMode::AlwaysSlow => unsafe { self.array_copy_full(src, dst, count, dst_array) },
        }
    }

    #[inline(never)]
    unsafe fn array_copy_full(&self, src: Address, dst: Address, count: usize, dst_array: ObjectReference) {
        if !self.bitmap.is_public(dst_array.to_address()) {
            return;
        }
        // SAFETY: Forwarded caller contract
        unsafe { self.array_copy_mid(src, dst, count) }
    }

    /// Destination is public: record unless every copied value already is
    #[inline(never)]
    unsafe fn array_copy_mid(&self, src: Address, dst: Address, count: usize) {
        let bytes = count * BYTES_IN_SLOT;
        let all_public = (0..count).all(|i| {
            // SAFETY: Caller guarantees the source slots are readable
            let value = unsafe { src.add(i * BYTES_IN_SLOT).load_reference() };
            value.is_null() || self.bitmap.is_public(value.to_address())
        });
        if all_public {
            return;
        }
        self.counters.slow_path_calls.fetch_add(1, Ordering::Relaxed);
        // SAFETY: Caller guarantees the source slots are readable
        unsafe {
            self.recorder
                .array_copy_slow(self.mutator, src..src.add(bytes), dst..dst.add(bytes));
        }
    }

    /// Read barrier for a loaded reference
    #[inline]
    pub fn object_reference_read(&self, target: ObjectReference) {
        match self.mode {
            BarrierMode::FastPath => {
                if target.is_null() || !self.bitmap.is_public(target.to_address()) {
                    return;
                }
                self.object_reference_read_slow(target);
            }
            BarrierMode::AlwaysSlow => self.object_reference_read_full(target),
        }
    }

    #[inline(never)]
    fn object_reference_read_full(&self, target: ObjectReference) {
        if target.is_null() || !self.bitmap.is_public(target.to_address()) {
            return;
        }
        self.object_reference_read_slow(target);
    }

    #[inline(never)]
    fn object_reference_read_slow(&self, target: ObjectReference) {
        self.counters.public_reads.fetch_add(1, Ordering::Relaxed);
        self.recorder
            .object_reference_read_slow(self.mutator, target);
    }

    /// Force `object` public through the recorder
    pub fn publish(&self, object: ObjectReference) {
        if object.is_null() || self.bitmap.is_public(object.to_address()) {
            return;
        }
        self.recorder.publish_object(self.mutator, object);
    }

    /// Snapshot of the counters
    pub fn statistics(&self) -> BarrierStats {
        BarrierStats {
            writes: self.counters.writes.load(Ordering::Relaxed),
            slow_path_calls: self.counters.slow_path_calls.load(Ordering::Relaxed),
            array_copies: self.counters.array_copies.load(Ordering::Relaxed),
            public_reads: self.counters.public_reads.load(Ordering::Relaxed),
        }
    }

    /// Zero the counters
    pub fn reset_statistics(&self) {
        self.counters.writes.store(0, Ordering::Relaxed);
        self.counters.slow_path_calls.store(0, Ordering::Relaxed);
        self.counters.array_copies.store(0, Ordering::Relaxed);
        self.counters.public_reads.store(0, Ordering::Relaxed);
    }
}

/// Recorder that publishes the private closure of every newly published target
///
/// Runs on the writing mutator's thread. Everything it publishes is private
/// and therefore owned by that thread, so no other thread can race on the
/// same granules.
pub struct PublishingRecorder<M: ObjectModel> {
    bitmap: Arc<PublicBitmap>,
    model: Arc<M>,
    published_objects: AtomicU64,
    published_bytes: AtomicU64,
}

impl<M: ObjectModel> PublishingRecorder<M> {
    /// Create a recorder over `bitmap`
    pub fn new(bitmap: Arc<PublicBitmap>, model: Arc<M>) -> Self {
        Self {
            bitmap,
            model,
            published_objects: AtomicU64::new(0),
            published_bytes: AtomicU64::new(0),
        }
    }

    /// Objects published so far
    pub fn published_objects(&self) -> u64 {
        self.published_objects.load(Ordering::Relaxed)
    }

    /// Bytes published so far
    pub fn published_bytes(&self) -> u64 {
        self.published_bytes.load(Ordering::Relaxed)
    }

    /// Publish `root` and every private object reachable from it.
    /// Returns the number of objects that changed state.
    pub fn publish_closure(&self, mutator: MutatorId, root: ObjectReference) -> usize {
        if !self.try_publish(mutator, root) {
            return 0;
        }

        let mut worklist = vec![root];
        let mut published = 0;
        let mut bytes = 0;
        while let Some(object) = worklist.pop() {
            published += 1;
            bytes += self.model.object_size(object);
            self.model.scan_object(object, &mut |slot| {
                // SAFETY: ObjectModel guarantees reported slots are readable
                let child = unsafe { slot.load_reference() };
                if self.try_publish(mutator, child) {
                    worklist.push(child);
                }
            });
        }

        self.published_objects
            .fetch_add(published as u64, Ordering::Relaxed);
        self.published_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);

        #[cfg(feature = "gc_logging")]
        tracing::trace!(
            target: "otter::gc",
            mutator = mutator.0,
            root = root.as_usize(),
            objects = published,
            bytes,
            "published object closure"
        );

        published
    }

    fn try_publish(&self, mutator: MutatorId, object: ObjectReference) -> bool {
        if object.is_null() {
            return false;
        }
        assert!(
            self.bitmap.contains(object.to_address()),
            "mutator {mutator:?} publishing {object:?} outside the side metadata range"
        );
        if self.bitmap.is_public(object.to_address()) {
            return false;
        }
        debug_assert!(
            self.model
                .owner_of(object)
                .is_none_or(|owner| owner == mutator),
            "mutator {:?} publishing {} it does not own",
            mutator,
            self.model.dump_object(object)
        );
        self.bitmap.mark_public(object.to_address())
    }
}

impl<M: ObjectModel> BarrierRecorder for PublishingRecorder<M> {
    fn object_reference_write_slow(
        &self,
        mutator: MutatorId,
        _src: ObjectReference,
        _slot: Address,
        target: ObjectReference,
    ) {
        self.publish_closure(mutator, target);
    }

    unsafe fn array_copy_slow(&self, mutator: MutatorId, src: Range<Address>, _dst: Range<Address>) {
        let mut slot = src.start;
        while slot < src.end {
            // SAFETY: Caller guarantees the source range is readable
            let value = unsafe { slot.load_reference() };
            self.publish_closure(mutator, value);
            slot = slot.add(BYTES_IN_SLOT);
        }
    }

    fn publish_object(&self, mutator: MutatorId, object: ObjectReference) {
        self.publish_closure(mutator, object);
    }
}
