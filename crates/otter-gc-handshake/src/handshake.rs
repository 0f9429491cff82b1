//! Runtime-facing upcall table
//!
//! [`Handshake`] owns the process-wide collector state (side metadata,
//! mutator registry, stop-the-world coordinator, thread-local request queue)
//! and exposes every entry point the runtime calls into. One instance lives
//! for the whole process; see [`init`] and [`get`].

use crate::address::{Address, ObjectReference, VmThread};
use crate::barrier::{BarrierRecorder, PublicObjectBarrier, PublishingRecorder};
use crate::closure::{self, RootsSink};
use crate::code_roots::CodeRootRegistry;
use crate::config::HandshakeConfig;
use crate::coordinator::{EpochTicket, StwCoordinator};
use crate::error::HandshakeError;
use crate::local_gc::ThreadLocalGcBlocker;
use crate::mutator::{Mutator, MutatorHandle};
use crate::oom::{self, OutOfMemory};
use crate::registry::MutatorRegistry;
use crate::side_metadata::PublicBitmap;
use crate::vm::{GcThreadContext, GcThreadKind, ObjectModel, VmRuntime};
use std::sync::{Arc, OnceLock};

/// Collector state shared with the runtime
pub struct Handshake {
    config: HandshakeConfig,
    runtime: Arc<dyn VmRuntime>,
    bitmap: Arc<PublicBitmap>,
    recorder: Arc<dyn BarrierRecorder>,
    registry: MutatorRegistry,
    coordinator: StwCoordinator,
    local_gc: ThreadLocalGcBlocker,
    code_roots: CodeRootRegistry,
}

impl Handshake {
    /// Build a handshake whose barrier slow paths go to `recorder`.
    ///
    /// `recorder` must publish into `bitmap`, which has to cover the heap
    /// range named by `config` with the configured granule.
    pub fn new(
        config: HandshakeConfig,
        runtime: Arc<dyn VmRuntime>,
        bitmap: Arc<PublicBitmap>,
        recorder: Arc<dyn BarrierRecorder>,
    ) -> Result<Self, HandshakeError> {
        config.validate()?;
        if bitmap.granule_bytes() != config.granule_bytes() {
            return Err(HandshakeError::MetadataMismatch("granule size differs"));
        }
        let last = Address::from_usize(config.heap_base + config.heap_size.saturating_sub(1));
        if !bitmap.contains(Address::from_usize(config.heap_base)) || !bitmap.contains(last) {
            return Err(HandshakeError::MetadataMismatch("heap range not covered"));
        }

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "otter::gc",
            barrier = ?config.barrier,
            granule = config.granule_bytes(),
            heap_base = config.heap_base,
            heap_size = config.heap_size,
            gc_threads = config.gc_threads,
            "GC handshake created"
        );

        Ok(Self {
            config,
            runtime,
            bitmap,
            recorder,
            registry: MutatorRegistry::new(),
            coordinator: StwCoordinator::new(),
            local_gc: ThreadLocalGcBlocker::new(),
            code_roots: CodeRootRegistry::new(),
        })
    }

    /// Build a handshake with a fresh side-metadata bitmap and the
    /// publishing recorder over `model`
    pub fn with_object_model<M: ObjectModel>(
        config: HandshakeConfig,
        runtime: Arc<dyn VmRuntime>,
        model: Arc<M>,
    ) -> Result<Self, HandshakeError> {
        config.validate()?;
        let bitmap = Arc::new(PublicBitmap::new(
            config.heap_base,
            config.heap_size,
            config.log_granule_bytes,
        ));
        let recorder = Arc::new(PublishingRecorder::new(Arc::clone(&bitmap), model));
        Self::new(config, runtime, bitmap, recorder)
    }

    /// Configuration in effect
    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    /// Publication bitmap
    pub fn bitmap(&self) -> &Arc<PublicBitmap> {
        &self.bitmap
    }

    /// Attached mutators
    pub fn registry(&self) -> &MutatorRegistry {
        &self.registry
    }

    /// Global stop-the-world coordinator
    pub fn coordinator(&self) -> &StwCoordinator {
        &self.coordinator
    }

    /// Thread-local collection queue
    pub fn local_gc(&self) -> &ThreadLocalGcBlocker {
        &self.local_gc
    }

    /// Root slots of installed code blobs
    pub fn code_roots(&self) -> &CodeRootRegistry {
        &self.code_roots
    }

    // ------------------------------------------------------------------
    // Mutator lifecycle
    // ------------------------------------------------------------------

    /// Attach the calling runtime thread and build its mutator state
    pub fn bind_mutator(&self, tls: VmThread) -> MutatorHandle {
        let id = self.registry.allocate_id();
        let barrier = PublicObjectBarrier::new(
            id,
            self.config.barrier,
            Arc::clone(&self.bitmap),
            Arc::clone(&self.recorder),
        );
        let mutator = Arc::new(Mutator::new(id, tls, barrier));
        self.registry.register(Arc::clone(&mutator));

        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "otter::gc", mutator = id.0, tls = tls.0, "mutator bound");

        mutator
    }

    /// Detach a mutator. Panics if it was never bound or is already gone.
    pub fn destroy_mutator(&self, mutator: &MutatorHandle) {
        assert!(
            self.registry.unregister(mutator),
            "destroying unbound mutator {:?}",
            mutator.id()
        );

        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "otter::gc", mutator = mutator.id().0, "mutator destroyed");
    }

    /// Mutator bound to a runtime thread
    pub fn mutator(&self, tls: VmThread) -> Option<MutatorHandle> {
        self.registry.mutator(tls)
    }

    /// Whether a runtime thread is an attached mutator
    pub fn is_mutator(&self, tls: VmThread) -> bool {
        self.registry.is_mutator(tls)
    }

    // ------------------------------------------------------------------
    // Barriers
    // ------------------------------------------------------------------

    /// Write barrier for `src.slot = target`
    #[inline]
    pub fn record_reference_write(
        &self,
        mutator: &Mutator,
        src: ObjectReference,
        slot: Address,
        target: ObjectReference,
    ) {
        mutator.barrier().object_reference_write(src, slot, target);
    }

    /// Barrier for a bulk copy of `count` reference slots into `dst_array`
    ///
    /// # Safety
    /// `src` and `dst` must each start `count` readable reference slots.
    pub unsafe fn record_array_copy(
        &self,
        mutator: &Mutator,
        src: Address,
        dst: Address,
        count: usize,
        dst_array: ObjectReference,
    ) {
        // SAFETY: forwarded caller guarantee
        unsafe {
            mutator
                .barrier()
                .object_reference_array_copy(src, dst, count, dst_array)
        }
    }

    /// Read barrier for a load of `target`
    #[inline]
    pub fn record_reference_read(&self, mutator: &Mutator, target: ObjectReference) {
        mutator.barrier().object_reference_read(target);
    }

    /// Publish `object` and its private closure unconditionally
    pub fn publish_object(&self, mutator: &Mutator, object: ObjectReference) {
        mutator.barrier().publish(object);
    }

    /// Whether `object` is public
    pub fn is_public(&self, object: ObjectReference) -> bool {
        !object.is_null() && self.bitmap.is_public(object.to_address())
    }

    // ------------------------------------------------------------------
    // Global collection
    // ------------------------------------------------------------------

    /// Park every mutator and hand each one to `visitor`. Returns the epoch
    /// the cycle started from.
    pub fn stop_all_mutators(&self, visitor: &mut dyn FnMut(&MutatorHandle)) -> EpochTicket {
        self.coordinator.stop_all_mutators(
            &*self.runtime,
            &self.registry,
            self.config.scan_mutators_in_safepoint,
            visitor,
        )
    }

    /// Resume every mutator and release threads waiting for this cycle
    pub fn resume_mutators(&self) {
        self.coordinator.resume_mutators(&*self.runtime);
    }

    /// Block the calling mutator until the current collection completes
    pub fn block_until_collection_done(&self) {
        self.coordinator.block_until_collection_done();
    }

    /// Snapshot the epoch, run `trigger` (which asks the collector for a
    /// cycle), then wait for that cycle to finish
    pub fn collect_and_wait<F: FnOnce()>(&self, trigger: F) {
        let ticket = self.coordinator.ticket();
        trigger();
        self.coordinator.wait_past(ticket);
    }

    // ------------------------------------------------------------------
    // Thread-local collection
    // ------------------------------------------------------------------

    /// Ask the collector for a thread-local collection of `mutator`
    pub fn request_thread_local_collection(&self, mutator: &MutatorHandle) {
        self.local_gc.request(mutator);
    }

    /// Block `mutator` until its thread-local collection is done
    pub fn block_for_thread_local_collection(&self, mutator: &MutatorHandle) {
        self.local_gc.block(mutator);
    }

    /// Collector side: wait for the next request and run it.
    /// Returns the collected mutator and its root count.
    pub fn serve_thread_local_collection<S: RootsSink + ?Sized>(
        &self,
        sink: &mut S,
    ) -> (MutatorHandle, usize) {
        let mutator = self.local_gc.next_request();
        let roots = self.local_gc.collect(&*self.runtime, &mutator, sink);
        (mutator, roots)
    }

    // ------------------------------------------------------------------
    // Roots and collector threads
    // ------------------------------------------------------------------

    /// Empty roots buffer sized by the configuration, for sinks to hand out
    pub fn fresh_roots_buffer(&self) -> Vec<Address> {
        Vec::with_capacity(self.config.roots_buffer_capacity)
    }

    /// Report a parked mutator's roots into `sink`. Returns the slot count.
    pub fn scan_roots<S: RootsSink + ?Sized>(&self, mutator: &MutatorHandle, sink: &mut S) -> usize {
        closure::scan_roots(&*self.runtime, mutator, sink)
    }

    /// Report roots that belong to no mutator into `sink`: the runtime's
    /// global roots and the code roots. A nursery collection only needs code
    /// blobs installed since the previous scan. Returns the slot count.
    pub fn scan_vm_roots<S: RootsSink + ?Sized>(&self, sink: &mut S, nursery_only: bool) -> usize {
        closure::scan_vm_roots(&*self.runtime, &self.code_roots, nursery_only, sink)
    }

    /// Record the reference slots embedded in a newly installed code blob
    pub fn register_code_roots(&self, code: Address, slots: Vec<Address>) {
        self.code_roots.register(code, slots);
    }

    /// Forget the reference slots of a freed code blob
    pub fn unregister_code_roots(&self, code: Address) -> usize {
        self.code_roots.unregister(code)
    }

    /// Ask the runtime for one controller thread and `gc_threads` workers.
    /// `worker` receives its ordinal.
    pub fn spawn_collector_threads<C, W>(&self, controller: C, worker: W)
    where
        C: FnOnce() + Send + 'static,
        W: Fn(usize) + Send + Sync + 'static,
    {
        self.runtime.spawn_collector_thread(GcThreadContext {
            kind: GcThreadKind::Controller,
            ordinal: 0,
            body: Box::new(controller),
        });

        let worker = Arc::new(worker);
        for ordinal in 0..self.config.gc_threads {
            let worker = Arc::clone(&worker);
            self.runtime.spawn_collector_thread(GcThreadContext {
                kind: GcThreadKind::Worker,
                ordinal,
                body: Box::new(move || worker(ordinal)),
            });
        }

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "otter::gc",
            workers = self.config.gc_threads,
            "collector threads requested"
        );
    }

    /// Hand references discovered during a cycle to the runtime and wake its
    /// reference handler. An empty list is a no-op.
    pub fn enqueue_references(&self, references: &[ObjectReference]) {
        if references.is_empty() {
            return;
        }

        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "otter::gc", count = references.len(), "enqueueing references");

        self.runtime.enqueue_references(references);
        self.runtime.schedule_finalization();
    }

    /// React to an allocation failure
    pub fn report_out_of_memory(&self, kind: OutOfMemory) {
        oom::report_out_of_memory(kind);
    }
}

static HANDSHAKE: OnceLock<Handshake> = OnceLock::new();

/// Install the process-wide handshake. It is never torn down.
pub fn init(handshake: Handshake) -> Result<&'static Handshake, HandshakeError> {
    let mut installed = false;
    let global = HANDSHAKE.get_or_init(|| {
        installed = true;
        handshake
    });
    if installed {
        Ok(global)
    } else {
        Err(HandshakeError::AlreadyInitialized)
    }
}

/// Process-wide handshake, if [`init`] has run
pub fn get() -> Option<&'static Handshake> {
    HANDSHAKE.get()
}
