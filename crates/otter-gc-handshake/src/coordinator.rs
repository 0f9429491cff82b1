//! Global stop-the-world coordination
//!
//! ## Protocol
//!
//! - The collector calls [`StwCoordinator::stop_all_mutators`]; the runtime
//!   parks every mutator and each one is handed to the collector's visitor
//! - The collector does its work while everything is parked
//! - [`StwCoordinator::resume_mutators`] resumes the runtime, then bumps the
//!   epoch under the lock and wakes every waiter
//!
//! Mutators that need a collection to finish take an [`EpochTicket`] and wait
//! until the epoch moves past it. A ticket has to be taken before the thread
//! can be parked, otherwise a cycle may complete between the park and the
//! snapshot and the thread would wait for a cycle nobody is going to run.

use crate::mutator::MutatorHandle;
use crate::registry::MutatorRegistry;
use crate::vm::VmRuntime;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Coordinator phase
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StwPhase {
    /// All mutators executing
    Running = 0,
    /// Suspension requested, runtime parking mutators
    RequestingSuspend = 1,
    /// All mutators parked, collector active
    Suspended = 2,
    /// Runtime resuming mutators
    Resuming = 3,
}

impl From<u8> for StwPhase {
    fn from(v: u8) -> Self {
        match v {
            0 => StwPhase::Running,
            1 => StwPhase::RequestingSuspend,
            2 => StwPhase::Suspended,
            3 => StwPhase::Resuming,
            _ => StwPhase::Running,
        }
    }
}

/// Epoch snapshot taken before waiting for a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochTicket(usize);

impl EpochTicket {
    /// Epoch value at the time the ticket was taken
    pub fn epoch(self) -> usize {
        self.0
    }
}

/// Stop-the-world statistics
#[derive(Debug, Default, Clone)]
pub struct StwStats {
    /// Completed stop-the-world cycles
    pub cycles: u64,
    /// Pause of the last cycle (suspend request to resume)
    pub last_pause: Duration,
    /// Longest pause
    pub max_pause: Duration,
    /// Sum of all pauses
    pub total_pause: Duration,
}

/// Global stop-the-world coordinator
pub struct StwCoordinator {
    /// Completed cycles; written only under `gc_lock`
    epoch: CachePadded<AtomicUsize>,
    /// Current phase
    phase: AtomicU8,
    /// Lock waiters block on
    gc_lock: Mutex<()>,
    /// Signalled after every epoch bump
    gc_done: Condvar,
    /// When the running cycle asked for suspension
    pause_start: Mutex<Option<Instant>>,
    /// Statistics
    stats: Mutex<StwStats>,
}

impl StwCoordinator {
    /// Create a coordinator at epoch 0
    pub fn new() -> Self {
        Self {
            epoch: CachePadded::new(AtomicUsize::new(0)),
            phase: AtomicU8::new(StwPhase::Running as u8),
            gc_lock: Mutex::new(()),
            gc_done: Condvar::new(),
            pause_start: Mutex::new(None),
            stats: Mutex::new(StwStats::default()),
        }
    }

    /// Current phase
    pub fn phase(&self) -> StwPhase {
        StwPhase::from(self.phase.load(Ordering::Acquire))
    }

    /// Completed cycles
    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }

    /// Snapshot the epoch for a later [`wait_past`](Self::wait_past)
    pub fn ticket(&self) -> EpochTicket {
        EpochTicket(self.epoch())
    }

    /// Statistics
    pub fn stats(&self) -> StwStats {
        self.stats.lock().clone()
    }

    fn transition(&self, from: StwPhase, to: StwPhase) {
        let swapped = self
            .phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire);
        if let Err(actual) = swapped {
            panic!(
                "stop-the-world phase {:?} -> {:?} attempted from {:?}",
                from,
                to,
                StwPhase::from(actual)
            );
        }
    }

    /// Park every mutator and hand each one to `visitor`. Returns the epoch
    /// snapshotted before suspension was requested.
    ///
    /// With `scan_in_safepoint` the runtime calls the visitor while parking;
    /// otherwise the registry is walked once everything is parked. Not
    /// cancellable: every call must be paired with
    /// [`resume_mutators`](Self::resume_mutators).
    pub fn stop_all_mutators(
        &self,
        runtime: &dyn VmRuntime,
        registry: &MutatorRegistry,
        scan_in_safepoint: bool,
        visitor: &mut dyn FnMut(&MutatorHandle),
    ) -> EpochTicket {
        let ticket = self.ticket();
        self.transition(StwPhase::Running, StwPhase::RequestingSuspend);
        *self.pause_start.lock() = Some(Instant::now());

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "otter::gc",
            epoch = self.epoch(),
            mutators = registry.len(),
            "requesting the runtime to suspend all mutators"
        );

        if scan_in_safepoint {
            runtime.suspend_all_mutators(Some(visitor));
        } else {
            runtime.suspend_all_mutators(None);
            registry.reset_iteration();
            while let Some(mutator) = registry.next_mutator() {
                visitor(&mutator);
            }
        }

        self.transition(StwPhase::RequestingSuspend, StwPhase::Suspended);

        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "otter::gc", "mutators stopped");

        ticket
    }

    /// Resume every mutator, advance the epoch and wake all waiters
    pub fn resume_mutators(&self, runtime: &dyn VmRuntime) {
        self.transition(StwPhase::Suspended, StwPhase::Resuming);

        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "otter::gc", "requesting the runtime to resume all mutators");

        runtime.resume_all_mutators();

        {
            let _guard = self.gc_lock.lock();
            self.epoch.fetch_add(1, Ordering::AcqRel);
            self.transition(StwPhase::Resuming, StwPhase::Running);
            self.gc_done.notify_all();
        }

        if let Some(start) = self.pause_start.lock().take() {
            let pause = start.elapsed();
            let mut stats = self.stats.lock();
            stats.cycles += 1;
            stats.last_pause = pause;
            stats.max_pause = stats.max_pause.max(pause);
            stats.total_pause += pause;
        }

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "otter::gc",
            epoch = self.epoch(),
            "mutators resumed and notified"
        );
    }

    /// Block until the epoch moves past `ticket`. Spurious wakeups are
    /// absorbed by re-checking the epoch.
    pub fn wait_past(&self, ticket: EpochTicket) {
        let mut guard = self.gc_lock.lock();
        while self.epoch.load(Ordering::Acquire) <= ticket.0 {
            self.gc_done.wait(&mut guard);
        }
    }

    /// Block until the cycle running (or about to run) when this is called
    /// has completed
    pub fn block_until_collection_done(&self) {
        let ticket = self.ticket();

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "otter::gc",
            epoch = ticket.0,
            thread = ?std::thread::current().id(),
            "blocking until GC finishes"
        );

        self.wait_past(ticket);

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "otter::gc",
            thread = ?std::thread::current().id(),
            "resumed after GC finished"
        );
    }
}

impl Default for StwCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
