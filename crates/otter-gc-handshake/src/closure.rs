//! Thread-local root buffering
//!
//! Root slots reported by the runtime are batched into a buffer and handed to
//! the collector in chunks. The collector takes each full buffer and returns a
//! fresh one, whose capacity sets the size of the next batch.

use crate::address::Address;
use crate::code_roots::CodeRootRegistry;
use crate::mutator::MutatorHandle;
use crate::vm::VmRuntime;

/// Collector side of root scanning
pub trait RootsSink {
    /// Empty buffer for the first batch; its capacity is the batch size
    fn acquire_buffer(&mut self) -> Vec<Address>;

    /// Take ownership of a batch of root slots and return a fresh buffer
    fn report_roots(&mut self, roots: Vec<Address>) -> Vec<Address>;

    /// Return the final, emptied buffer
    fn release_buffer(&mut self, _buffer: Vec<Address>) {}
}

/// Buffer that flushes root slots to a [`RootsSink`] when full
///
/// Dropping the closure flushes whatever is left, so no reported slot is ever
/// lost, and then releases the buffer.
pub struct ThreadLocalRootsClosure<'a, S: RootsSink + ?Sized> {
    sink: &'a mut S,
    buffer: Vec<Address>,
    /// Batch size; follows the capacity of the buffer the sink hands back
    cap: usize,
    flushes: usize,
    visited: usize,
}

impl<'a, S: RootsSink + ?Sized> ThreadLocalRootsClosure<'a, S> {
    /// Create a closure with a buffer taken from `sink`
    pub fn new(sink: &'a mut S) -> Self {
        let buffer = sink.acquire_buffer();
        let cap = buffer.capacity().max(1);
        Self {
            sink,
            buffer,
            cap,
            flushes: 0,
            visited: 0,
        }
    }

    /// Record one root slot
    pub fn visit(&mut self, slot: Address) {
        self.buffer.push(slot);
        self.visited += 1;
        if self.buffer.len() >= self.cap {
            self.flush();
        }
    }

    /// Batches handed to the sink so far
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// Slots recorded so far
    pub fn visited(&self) -> usize {
        self.visited
    }

    fn flush(&mut self) {
        let full = std::mem::take(&mut self.buffer);
        let mut fresh = self.sink.report_roots(full);
        fresh.clear();
        self.cap = fresh.capacity().max(1);
        self.buffer = fresh;
        self.flushes += 1;
    }
}

impl<S: RootsSink + ?Sized> Drop for ThreadLocalRootsClosure<'_, S> {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            self.flush();
        }
        let buffer = std::mem::take(&mut self.buffer);
        self.sink.release_buffer(buffer);
    }
}

/// Scan a parked mutator's roots into `sink`. Returns the slot count.
pub fn scan_roots<S: RootsSink + ?Sized>(
    runtime: &dyn VmRuntime,
    mutator: &MutatorHandle,
    sink: &mut S,
) -> usize {
    let mut closure = ThreadLocalRootsClosure::new(sink);
    runtime.scan_mutator_roots(mutator, &mut |slot| closure.visit(slot));
    let visited = closure.visited();

    #[cfg(feature = "gc_logging")]
    tracing::trace!(
        target: "otter::gc",
        mutator = mutator.id().0,
        roots = visited,
        batches = closure.flushes() + usize::from(!closure.buffer.is_empty()),
        "scanned thread-local roots"
    );

    visited
}

/// Scan roots that belong to no mutator into `sink`: the runtime's own roots,
/// then code roots (nursery blobs only when `nursery_only`). Returns the
/// slot count.
pub fn scan_vm_roots<S: RootsSink + ?Sized>(
    runtime: &dyn VmRuntime,
    code_roots: &CodeRootRegistry,
    nursery_only: bool,
    sink: &mut S,
) -> usize {
    let mut closure = ThreadLocalRootsClosure::new(sink);
    runtime.scan_vm_roots(&mut |slot| closure.visit(slot));
    #[cfg(feature = "gc_logging")]
    let vm_roots = closure.visited();
    code_roots.scan(nursery_only, &mut |slot| closure.visit(slot));
    let visited = closure.visited();

    #[cfg(feature = "gc_logging")]
    tracing::trace!(
        target: "otter::gc",
        vm_roots,
        code_roots = visited - vm_roots,
        nursery_only,
        "scanned VM roots"
    );

    visited
}
