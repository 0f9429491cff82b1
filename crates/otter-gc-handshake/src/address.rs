//! Raw address types shared by the barrier, the side metadata and the runtime
//! downcalls.

use std::fmt;

/// A raw machine address (heap slot, root slot, metadata byte).
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(usize);

impl Address {
    /// The zero address
    pub const ZERO: Address = Address(0);

    /// Wrap a raw address
    pub const fn from_usize(raw: usize) -> Self {
        Self(raw)
    }

    /// Wrap a pointer
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Raw value
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Is this the zero address
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` further on
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Whether the address is aligned to `align` (a power of two)
    pub const fn is_aligned_to(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Read the reference stored in the slot at this address.
    ///
    /// # Safety
    /// The address must point to a readable, aligned reference slot.
    pub unsafe fn load_reference(self) -> ObjectReference {
        // SAFETY: Caller guarantees the slot is valid for reads
        ObjectReference(unsafe { std::ptr::read_volatile(self.0 as *const usize) })
    }

    /// Store a reference into the slot at this address.
    ///
    /// # Safety
    /// The address must point to a writable, aligned reference slot.
    pub unsafe fn store_reference(self, value: ObjectReference) {
        // SAFETY: Caller guarantees the slot is valid for writes
        unsafe { std::ptr::write_volatile(self.0 as *mut usize, value.0) }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A reference to a managed object. The zero value is the null reference.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectReference(usize);

impl ObjectReference {
    /// The null reference
    pub const NULL: ObjectReference = ObjectReference(0);

    /// Wrap a raw object address
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Reference for the object starting at `addr`
    pub const fn from_address(addr: Address) -> Self {
        Self(addr.as_usize())
    }

    /// Is this the null reference
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Start address of the object
    pub const fn to_address(self) -> Address {
        Address(self.0)
    }

    /// Raw value
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("null")
        } else {
            write!(f, "obj@{:#x}", self.0)
        }
    }
}

/// Opaque handle the runtime uses to identify one of its threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmThread(pub usize);

/// Dense id handed out when a mutator attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutatorId(pub usize);
