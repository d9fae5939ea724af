//! Pointer-plus-tag-bits primitives.
//!
//! Objects with alignment `2^N` leave their N low address bits free, and
//! the runtime packs small integers into them: edge indices, ownership
//! sentinels, flag bits. A [`TaggedPtr`] is the plain packed word, an
//! [`AtomicTaggedPtr`] is the same thing updatable as a single atomic.
//!
//! The packing is untyped on purpose: callers know what the address means
//! (the runtime stores revisions, sub-arrays and task nodes in these) and
//! reinterpret it themselves. What this module guarantees is only that
//! address and tag round-trip without interfering with each other.

use std::sync::atomic::{AtomicUsize, Ordering};

/// A word packing an address and `BITS` low tag bits.
///
/// The address must be aligned to `1 << BITS`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaggedPtr<const BITS: u32> {
    bits: usize,
}

impl<const BITS: u32> TaggedPtr<BITS> {
    /// Mask covering the tag bits.
    pub const TAG_MASK: usize = (1 << BITS) - 1;

    /// The null pointer with a zero tag.
    #[inline]
    pub const fn null() -> Self {
        Self { bits: 0 }
    }

    /// Pack `addr` and `tag` together.
    ///
    /// Debug builds assert that `addr` is sufficiently aligned and that
    /// `tag` fits.
    #[inline]
    pub fn pack(addr: usize, tag: usize) -> Self {
        debug_assert_eq!(addr & Self::TAG_MASK, 0, "address not aligned for tag");
        debug_assert!(tag <= Self::TAG_MASK, "tag out of range");
        Self { bits: addr | tag }
    }

    /// Reconstruct from a raw packed word.
    #[inline]
    pub const fn from_bits(bits: usize) -> Self {
        Self { bits }
    }

    /// The raw packed word.
    #[inline]
    pub const fn bits(self) -> usize {
        self.bits
    }

    /// The address part.
    #[inline]
    pub const fn addr(self) -> usize {
        self.bits & !Self::TAG_MASK
    }

    /// The tag part.
    #[inline]
    pub const fn tag(self) -> usize {
        self.bits & Self::TAG_MASK
    }

    /// Is the address part null?
    #[inline]
    pub const fn is_null(self) -> bool {
        self.addr() == 0
    }

    /// Same address, different tag.
    #[inline]
    pub fn with_tag(self, tag: usize) -> Self {
        Self::pack(self.addr(), tag)
    }
}

impl<const BITS: u32> std::fmt::Debug for TaggedPtr<BITS> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaggedPtr({:#x}, tag={})", self.addr(), self.tag())
    }
}

impl<const BITS: u32> Default for TaggedPtr<BITS> {
    fn default() -> Self {
        Self::null()
    }
}

/// An atomically updatable [`TaggedPtr`].
#[derive(Debug)]
pub struct AtomicTaggedPtr<const BITS: u32> {
    bits: AtomicUsize,
}

impl<const BITS: u32> AtomicTaggedPtr<BITS> {
    /// Create holding the null pointer with a zero tag.
    #[inline]
    pub const fn new() -> Self {
        Self {
            bits: AtomicUsize::new(0),
        }
    }

    /// Create from an initial value.
    #[inline]
    pub fn from_ptr(ptr: TaggedPtr<BITS>) -> Self {
        Self {
            bits: AtomicUsize::new(ptr.bits()),
        }
    }

    /// Load the current value.
    #[inline]
    pub fn load(&self, order: Ordering) -> TaggedPtr<BITS> {
        TaggedPtr::from_bits(self.bits.load(order))
    }

    /// Store a new value.
    #[inline]
    pub fn store(&self, ptr: TaggedPtr<BITS>, order: Ordering) {
        self.bits.store(ptr.bits(), order);
    }

    /// Compare-and-swap; returns the observed value on failure.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: TaggedPtr<BITS>,
        new: TaggedPtr<BITS>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedPtr<BITS>, TaggedPtr<BITS>> {
        self.bits
            .compare_exchange(current.bits(), new.bits(), success, failure)
            .map(TaggedPtr::from_bits)
            .map_err(TaggedPtr::from_bits)
    }

    /// Unconditional exchange.
    #[inline]
    pub fn swap(&self, new: TaggedPtr<BITS>, order: Ordering) -> TaggedPtr<BITS> {
        TaggedPtr::from_bits(self.bits.swap(new.bits(), order))
    }
}

impl<const BITS: u32> Default for AtomicTaggedPtr<BITS> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_roundtrip() {
        let ptr = TaggedPtr::<6>::pack(0x1040, 33);
        assert_eq!(ptr.addr(), 0x1040);
        assert_eq!(ptr.tag(), 33);
        assert!(!ptr.is_null());
    }

    #[test]
    fn test_null() {
        let ptr = TaggedPtr::<3>::null();
        assert!(ptr.is_null());
        assert_eq!(ptr.tag(), 0);
    }

    #[test]
    fn test_null_with_tag_is_still_null() {
        let ptr = TaggedPtr::<3>::pack(0, 5);
        assert!(ptr.is_null());
        assert_eq!(ptr.tag(), 5);
    }

    #[test]
    fn test_with_tag() {
        let ptr = TaggedPtr::<6>::pack(0x2000, 10).with_tag(62);
        assert_eq!(ptr.addr(), 0x2000);
        assert_eq!(ptr.tag(), 62);
    }

    #[test]
    fn test_atomic_cas() {
        let atomic = AtomicTaggedPtr::<2>::new();
        let old = atomic.load(Ordering::Relaxed);
        assert!(old.is_null());

        let new = TaggedPtr::pack(0x100, 3);
        assert!(atomic
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok());
        assert_eq!(atomic.load(Ordering::Relaxed), new);

        // Stale expected value must fail.
        assert!(atomic
            .compare_exchange(old, TaggedPtr::null(), Ordering::AcqRel, Ordering::Relaxed)
            .is_err());
    }
}
