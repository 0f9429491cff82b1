//! Registry of attached mutators

use crate::address::{MutatorId, VmThread};
use crate::mutator::MutatorHandle;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-flight pass over the registry
struct Iteration {
    snapshot: Vec<MutatorHandle>,
    next: usize,
}

/// Every mutator currently attached to the runtime
///
/// Iteration through [`next_mutator`](Self::next_mutator) is a single
/// process-wide cursor: it is only driven by the collector while mutators are
/// suspended, so there is never more than one pass in flight.
pub struct MutatorRegistry {
    /// Attached mutators in attach order
    mutators: RwLock<Vec<MutatorHandle>>,
    /// Lookup by runtime thread handle
    by_tls: RwLock<FxHashMap<VmThread, MutatorHandle>>,
    /// Next mutator id
    next_id: AtomicUsize,
    /// Cursor for `next_mutator`
    cursor: Mutex<Option<Iteration>>,
}

impl MutatorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            mutators: RwLock::new(Vec::new()),
            by_tls: RwLock::new(FxHashMap::default()),
            next_id: AtomicUsize::new(0),
            cursor: Mutex::new(None),
        }
    }

    /// Reserve the id for the next mutator
    pub fn allocate_id(&self) -> MutatorId {
        MutatorId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Attach a mutator
    pub fn register(&self, mutator: MutatorHandle) {
        let mut by_tls = self.by_tls.write();
        assert!(
            !by_tls.contains_key(&mutator.tls()),
            "thread {:?} bound twice",
            mutator.tls()
        );
        by_tls.insert(mutator.tls(), Arc::clone(&mutator));
        self.mutators.write().push(mutator);
    }

    /// Detach a mutator. Returns false if it was not attached.
    pub fn unregister(&self, mutator: &MutatorHandle) -> bool {
        let removed = self.by_tls.write().remove(&mutator.tls()).is_some();
        self.mutators.write().retain(|m| m.id() != mutator.id());
        removed
    }

    /// Mutator bound to a runtime thread
    pub fn mutator(&self, tls: VmThread) -> Option<MutatorHandle> {
        self.by_tls.read().get(&tls).cloned()
    }

    /// Whether a runtime thread is an attached mutator
    pub fn is_mutator(&self, tls: VmThread) -> bool {
        self.by_tls.read().contains_key(&tls)
    }

    /// Number of attached mutators
    pub fn len(&self) -> usize {
        self.mutators.read().len()
    }

    /// Whether no mutator is attached
    pub fn is_empty(&self) -> bool {
        self.mutators.read().is_empty()
    }

    /// Copy of the current mutator list
    pub fn snapshot(&self) -> Vec<MutatorHandle> {
        self.mutators.read().clone()
    }

    /// Next mutator of the current pass, or `None` once the pass is done.
    ///
    /// The first call of a pass snapshots the registry; the `None` rearms the
    /// cursor for a fresh pass.
    pub fn next_mutator(&self) -> Option<MutatorHandle> {
        let mut cursor = self.cursor.lock();
        let iteration = cursor.get_or_insert_with(|| Iteration {
            snapshot: self.snapshot(),
            next: 0,
        });
        match iteration.snapshot.get(iteration.next) {
            Some(mutator) => {
                let mutator = Arc::clone(mutator);
                iteration.next += 1;
                Some(mutator)
            }
            None => {
                *cursor = None;
                None
            }
        }
    }

    /// Abandon the current pass; the next `next_mutator` starts over
    pub fn reset_iteration(&self) {
        *self.cursor.lock() = None;
    }
}

impl Default for MutatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutator::test_support::mutator;

    fn registry_with(n: usize) -> (MutatorRegistry, Vec<MutatorHandle>) {
        let registry = MutatorRegistry::new();
        let mutators: Vec<_> = (0..n)
            .map(|_| {
                let m = mutator(registry.allocate_id().0);
                registry.register(Arc::clone(&m));
                m
            })
            .collect();
        (registry, mutators)
    }

    #[test]
    fn test_register_and_lookup() {
        let (registry, mutators) = registry_with(2);
        assert_eq!(registry.len(), 2);
        assert_eq!(mutators[0].id(), MutatorId(0));
        assert_eq!(mutators[1].id(), MutatorId(1));
        assert!(registry.is_mutator(mutators[1].tls()));
        assert_eq!(
            registry.mutator(mutators[0].tls()).map(|m| m.id()),
            Some(MutatorId(0))
        );
        assert!(!registry.is_mutator(VmThread(1)));
    }

    #[test]
    fn test_unregister() {
        let (registry, mutators) = registry_with(3);
        assert!(registry.unregister(&mutators[1]));
        assert!(!registry.unregister(&mutators[1]));
        assert_eq!(registry.len(), 2);
        assert!(!registry.is_mutator(mutators[1].tls()));
    }

    #[test]
    #[should_panic(expected = "bound twice")]
    fn test_double_bind_panics() {
        let registry = MutatorRegistry::new();
        let m = mutator(0);
        registry.register(Arc::clone(&m));
        registry.register(m);
    }

    #[test]
    fn test_iteration_single_pass_and_rearm() {
        let (registry, _mutators) = registry_with(3);

        let mut seen = Vec::new();
        while let Some(m) = registry.next_mutator() {
            seen.push(m.id());
        }
        assert_eq!(seen, vec![MutatorId(0), MutatorId(1), MutatorId(2)]);

        // Exhaustion rearmed the cursor
        let again: Vec<_> = std::iter::from_fn(|| registry.next_mutator())
            .map(|m| m.id())
            .collect();
        assert_eq!(again, seen);
    }

    #[test]
    fn test_reset_mid_pass() {
        let (registry, _mutators) = registry_with(3);
        assert_eq!(registry.next_mutator().map(|m| m.id()), Some(MutatorId(0)));
        assert_eq!(registry.next_mutator().map(|m| m.id()), Some(MutatorId(1)));
        registry.reset_iteration();
        assert_eq!(registry.next_mutator().map(|m| m.id()), Some(MutatorId(0)));
    }

    #[test]
    fn test_empty_registry_iteration() {
        let registry = MutatorRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.next_mutator().is_none());
        assert!(registry.next_mutator().is_none());
    }
}
