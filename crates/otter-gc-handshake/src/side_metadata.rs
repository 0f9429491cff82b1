//! Publication side metadata
//!
//! One bit per heap granule records whether the object starting in that
//! granule has been made visible outside its creating thread. The table is
//! laid out like the runtime's other side metadata: each metadata byte covers
//! eight consecutive granules, bit `(addr >> log_granule) & 7`.
//!
//! - Reads are a single relaxed-enough byte load, no locks
//! - Bits only go from private to public while the object lives
//! - Only the owning thread publishes its own private objects

use crate::address::Address;
use std::sync::atomic::{AtomicU8, Ordering};

/// Granules covered by one metadata byte
const GRANULES_PER_BYTE: usize = 8;

/// Publication bitmap over a contiguous heap range
pub struct PublicBitmap {
    /// Base address of the covered range
    base: usize,
    /// Size of the covered range in bytes
    size: usize,
    /// log2 of the granule size
    log_granule: u8,
    /// Metadata bytes
    bytes: Box<[AtomicU8]>,
}

impl PublicBitmap {
    /// Create a bitmap covering `[base, base + size)` with `2^log_granule`
    /// byte granules. `base` must be granule aligned.
    pub fn new(base: usize, size: usize, log_granule: u8) -> Self {
        assert!(
            (log_granule as u32) + 3 < usize::BITS,
            "granule 2^{log_granule} too large for side metadata"
        );
        let granule = 1usize << log_granule;
        assert!(
            base & (granule - 1) == 0,
            "side metadata base {base:#x} is not {granule}-byte aligned"
        );
        let granules = size.div_ceil(granule);
        let len = granules.div_ceil(GRANULES_PER_BYTE);
        Self {
            base,
            size,
            log_granule,
            bytes: (0..len).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    /// Granule size in bytes
    pub fn granule_bytes(&self) -> usize {
        1 << self.log_granule
    }

    /// Whether `addr` falls in the covered range
    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        let addr = addr.as_usize();
        addr >= self.base && addr - self.base < self.size
    }

    #[inline]
    fn locate(&self, addr: Address) -> (usize, u8) {
        let offset = addr.as_usize() - self.base;
        let byte = offset >> (self.log_granule as usize + 3);
        let bit = (addr.as_usize() >> self.log_granule) & (GRANULES_PER_BYTE - 1);
        (byte, 1 << bit)
    }

    /// Read the publication bit for the granule containing `addr`.
    /// Addresses outside the covered range are private.
    #[inline]
    pub fn is_public(&self, addr: Address) -> bool {
        if !self.contains(addr) {
            return false;
        }
        let (byte, mask) = self.locate(addr);
        self.bytes[byte].load(Ordering::Acquire) & mask != 0
    }

    /// Set the publication bit for the granule containing `addr`.
    ///
    /// Returns true if this call made the granule public. The byte update is
    /// an atomic OR: neighbouring granules sharing the byte may be owned by
    /// other threads.
    pub fn mark_public(&self, addr: Address) -> bool {
        assert!(
            self.contains(addr),
            "publishing {addr:?} outside the side metadata range"
        );
        let (byte, mask) = self.locate(addr);
        // Cheap re-check avoids dirtying the cache line for public objects
        if self.bytes[byte].load(Ordering::Relaxed) & mask != 0 {
            return false;
        }
        self.bytes[byte].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    /// Clear the bits for `[start, start + bytes)`.
    ///
    /// Only for memory the collector has reclaimed: live objects never go
    /// back to private.
    pub fn clear_range(&self, start: Address, bytes: usize) {
        let granule = self.granule_bytes();
        let mut addr = start.as_usize() & !(granule - 1);
        let end = start.as_usize() + bytes;
        while addr < end {
            let a = Address::from_usize(addr);
            if self.contains(a) {
                let (byte, mask) = self.locate(a);
                self.bytes[byte].fetch_and(!mask, Ordering::AcqRel);
            }
            addr += granule;
        }
    }

    /// Number of public granules
    pub fn public_count(&self) -> usize {
        self.bytes
            .iter()
            .map(|b| b.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

impl std::fmt::Debug for PublicBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicBitmap")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .field("granule", &self.granule_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(raw: usize) -> Address {
        Address::from_usize(raw)
    }

    #[test]
    fn test_mark_and_query() {
        let bitmap = PublicBitmap::new(0x1000, 0x1000, 3);
        assert!(!bitmap.is_public(addr(0x1000)));

        assert!(bitmap.mark_public(addr(0x1000)));
        assert!(bitmap.is_public(addr(0x1000)));
        // Same granule
        assert!(bitmap.is_public(addr(0x1004)));
        // Next granule untouched
        assert!(!bitmap.is_public(addr(0x1008)));
    }

    #[test]
    fn test_mark_is_idempotent() {
        let bitmap = PublicBitmap::new(0x1000, 0x1000, 3);
        assert!(bitmap.mark_public(addr(0x1040)));
        assert!(!bitmap.mark_public(addr(0x1040)));
        assert_eq!(bitmap.public_count(), 1);
    }

    #[test]
    fn test_monotonic_under_neighbour_writes() {
        let bitmap = PublicBitmap::new(0x1000, 0x1000, 3);
        bitmap.mark_public(addr(0x1010));
        for granule in 0..64 {
            bitmap.mark_public(addr(0x1000 + granule * 8));
            assert!(bitmap.is_public(addr(0x1010)));
        }
        assert_eq!(bitmap.public_count(), 64);
    }

    #[test]
    fn test_out_of_range_reads_private() {
        let bitmap = PublicBitmap::new(0x1000, 0x100, 3);
        assert!(!bitmap.contains(addr(0x0ff8)));
        assert!(!bitmap.contains(addr(0x1100)));
        assert!(!bitmap.is_public(addr(0x2000)));
    }

    #[test]
    #[should_panic(expected = "outside the side metadata range")]
    fn test_mark_out_of_range_panics() {
        let bitmap = PublicBitmap::new(0x1000, 0x100, 3);
        bitmap.mark_public(addr(0x4000));
    }

    #[test]
    #[should_panic(expected = "too large for side metadata")]
    fn test_oversized_granule_panics() {
        PublicBitmap::new(0, 0x1000, 61);
    }

    #[test]
    fn test_larger_granule() {
        let bitmap = PublicBitmap::new(0x1000, 0x1000, 4);
        bitmap.mark_public(addr(0x1010));
        assert!(bitmap.is_public(addr(0x1018)));
        assert!(!bitmap.is_public(addr(0x1020)));
    }

    #[test]
    fn test_clear_reclaimed_range() {
        let bitmap = PublicBitmap::new(0x1000, 0x1000, 3);
        for offset in (0..0x80).step_by(8) {
            bitmap.mark_public(addr(0x1000 + offset));
        }
        bitmap.clear_range(addr(0x1020), 0x20);
        assert!(bitmap.is_public(addr(0x1018)));
        assert!(!bitmap.is_public(addr(0x1020)));
        assert!(!bitmap.is_public(addr(0x1038)));
        assert!(bitmap.is_public(addr(0x1040)));
        assert_eq!(bitmap.public_count(), 12);
    }

    #[test]
    fn test_concurrent_owners_share_bytes() {
        use std::sync::Arc;

        let bitmap = Arc::new(PublicBitmap::new(0x1000, 0x1000, 3));
        let handles: Vec<_> = (0..8)
            .map(|owner| {
                let bitmap = Arc::clone(&bitmap);
                std::thread::spawn(move || {
                    // Each thread owns every 8th granule, so all threads hit every byte
                    for i in 0..64 {
                        bitmap.mark_public(addr(0x1000 + (i * 8 + owner) * 8));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(bitmap.public_count(), 512);
    }
}
