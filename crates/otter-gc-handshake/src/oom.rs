//! Out-of-memory reporting

use thiserror::Error;

/// Why the collector could not satisfy an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OutOfMemory {
    /// The managed heap is full even after collecting. Recoverable: the
    /// allocation site raises the runtime's own out-of-memory error.
    #[error("managed heap exhausted")]
    HeapExhausted,
    /// The allocator could not map or reserve memory from the OS
    #[error("allocator could not obtain memory from the operating system")]
    AllocatorResourceExhausted,
}

impl OutOfMemory {
    /// Whether the process cannot continue after this condition
    pub fn is_fatal(self) -> bool {
        matches!(self, OutOfMemory::AllocatorResourceExhausted)
    }
}

/// React to an out-of-memory condition.
///
/// Heap exhaustion is only logged and returns. Resource exhaustion writes a
/// diagnostic to stderr and aborts the process without unwinding.
pub fn report_out_of_memory(kind: OutOfMemory) {
    if !kind.is_fatal() {
        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "otter::gc", %kind, "out of memory, left to the allocation site");
        return;
    }

    #[cfg(feature = "gc_logging")]
    tracing::error!(target: "otter::gc", %kind, "fatal out of memory");

    eprintln!("otter-gc: fatal: {kind}");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(!OutOfMemory::HeapExhausted.is_fatal());
        assert!(OutOfMemory::AllocatorResourceExhausted.is_fatal());
    }

    #[test]
    fn test_heap_exhausted_returns() {
        report_out_of_memory(OutOfMemory::HeapExhausted);
    }

    #[test]
    fn test_display() {
        assert_eq!(OutOfMemory::HeapExhausted.to_string(), "managed heap exhausted");
    }
}
