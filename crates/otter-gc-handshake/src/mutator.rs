//! Per-thread mutator state block

use crate::address::{MutatorId, VmThread};
use crate::barrier::PublicObjectBarrier;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;

/// Thread-local collection status of one mutator
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalGcStatus {
    /// No thread-local collection pending
    Inactive = 0,
    /// A thread-local collection of this mutator is requested or running
    Active = 1,
}

/// State the collector keeps for one attached runtime thread
///
/// Owned by its thread, except the local collection status which the
/// collector touches only under `local_gc` while the thread is parked.
pub struct Mutator {
    /// Dense id
    id: MutatorId,
    /// Runtime thread handle
    tls: VmThread,
    /// Publication barrier for this thread's writes
    barrier: PublicObjectBarrier,
    /// Thread-local collection status
    local_gc: Mutex<LocalGcStatus>,
    /// Signalled when `local_gc` returns to `Inactive`
    local_gc_done: Condvar,
}

/// Shared handle to a mutator's state block
pub type MutatorHandle = Arc<Mutator>;

impl Mutator {
    /// Create a mutator state block
    pub fn new(id: MutatorId, tls: VmThread, barrier: PublicObjectBarrier) -> Self {
        Self {
            id,
            tls,
            barrier,
            local_gc: Mutex::new(LocalGcStatus::Inactive),
            local_gc_done: Condvar::new(),
        }
    }

    /// Mutator id
    pub fn id(&self) -> MutatorId {
        self.id
    }

    /// Runtime thread handle
    pub fn tls(&self) -> VmThread {
        self.tls
    }

    /// Publication barrier
    pub fn barrier(&self) -> &PublicObjectBarrier {
        &self.barrier
    }

    /// Current thread-local collection status
    pub fn local_gc_status(&self) -> LocalGcStatus {
        *self.local_gc.lock()
    }

    pub(crate) fn lock_local_gc(&self) -> MutexGuard<'_, LocalGcStatus> {
        self.local_gc.lock()
    }

    pub(crate) fn wait_local_gc(&self, guard: &mut MutexGuard<'_, LocalGcStatus>) {
        self.local_gc_done.wait(guard);
    }

    pub(crate) fn notify_local_gc(&self) {
        self.local_gc_done.notify_all();
    }
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("id", &self.id)
            .field("tls", &self.tls)
            .field("local_gc", &self.local_gc_status())
            .finish()
    }
}
