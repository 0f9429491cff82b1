//! Downcalls into the managed runtime
//!
//! The handshake never parks a thread or walks an object itself; it asks the
//! runtime through these traits.

use crate::address::{Address, MutatorId, ObjectReference};
use crate::mutator::MutatorHandle;

/// Kind of collector thread the runtime is asked to start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcThreadKind {
    /// Drives collection cycles
    Controller,
    /// Executes collection work
    Worker,
}

/// Everything a freshly spawned collector thread needs
pub struct GcThreadContext {
    /// Controller or worker
    pub kind: GcThreadKind,
    /// Worker ordinal (0 for the controller)
    pub ordinal: usize,
    /// Thread body, run to completion on the new thread
    pub body: Box<dyn FnOnce() + Send + 'static>,
}

impl GcThreadContext {
    /// Suggested OS thread name
    pub fn thread_name(&self) -> String {
        match self.kind {
            GcThreadKind::Controller => "otter-gc-controller".to_string(),
            GcThreadKind::Worker => format!("otter-gc-worker-{}", self.ordinal),
        }
    }
}

impl std::fmt::Debug for GcThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcThreadContext")
            .field("kind", &self.kind)
            .field("ordinal", &self.ordinal)
            .finish_non_exhaustive()
    }
}

/// Thread control the runtime provides to the collector
pub trait VmRuntime: Send + Sync + 'static {
    /// Park every live mutator.
    ///
    /// When `report` is given, call it once per mutator while that mutator is
    /// parked. Returns only once every mutator is parked.
    fn suspend_all_mutators(&self, report: Option<&mut dyn FnMut(&MutatorHandle)>);

    /// Let every mutator parked by `suspend_all_mutators` run again
    fn resume_all_mutators(&self);

    /// Park one mutator and call `visitor` once it is parked
    fn suspend_one_mutator(&self, mutator: &MutatorHandle, visitor: &mut dyn FnMut(&MutatorHandle));

    /// Let a mutator parked by `suspend_one_mutator` run again
    fn resume_one_mutator(&self, mutator: &MutatorHandle);

    /// Report every root slot of a parked mutator's stack and thread-local state
    fn scan_mutator_roots(&self, mutator: &MutatorHandle, visitor: &mut dyn FnMut(Address));

    /// Report root slots held outside any mutator: globals, handle tables,
    /// interned strings, runtime-internal threads. Called while the world is
    /// stopped. Runtimes without such roots keep the default.
    fn scan_vm_roots(&self, _visitor: &mut dyn FnMut(Address)) {}

    /// Start an OS thread for the collector
    fn spawn_collector_thread(&self, context: GcThreadContext);

    /// Hand discovered references to the runtime's pending-reference list
    fn enqueue_references(&self, references: &[ObjectReference]);

    /// Wake the runtime's finalizer thread
    fn schedule_finalization(&self) {}
}

/// Object introspection the runtime provides to the collector
///
/// # Safety
/// Every slot passed to a `scan_object` visitor must be an aligned, readable
/// reference slot inside a live object for as long as that object is live.
pub unsafe trait ObjectModel: Send + Sync + 'static {
    /// Size of the object in bytes
    fn object_size(&self, object: ObjectReference) -> usize;

    /// Report every reference slot of `object`
    fn scan_object(&self, object: ObjectReference, visitor: &mut dyn FnMut(Address));

    /// Human readable description, for diagnostics
    fn dump_object(&self, object: ObjectReference) -> String;

    /// Mutator that owns a private object, if the allocator tracks ownership.
    /// Only consulted by debug assertions.
    fn owner_of(&self, _object: ObjectReference) -> Option<MutatorId> {
        None
    }
}
