//! Runtime object handles and metadata access
//!
//! [`RObj`] and [`IObj`] are copyable handles pointing at an object's user
//! payload; all metadata lives at negative offsets. Offsets from the
//! payload, growing downward:
//!
//! ```text
//! -8   vtable word (low 3 bits are collector tag bits)
//! -16  instance size word      (array and string kinds only)
//! then, interned objects only:
//! -16/-24  delegate word       (0 = this object is its own delegate)
//! -24/-32  refcount            (zero for non-delegate cycle members)
//! below    embedded invocation (invocation kind only)
//! ```
//!
//! The collector overwrites the vtable word of a moved object with the
//! forwarding address tagged with [`FORWARD_TAG`]; everything else reading
//! metadata must therefore either run outside a collection or check the
//! tag first.

use super::type_desc::Type;
use super::vtable::VTableRef;
use super::{ObjectKind, WORD_SIZE};
use rill_util::TaggedPtr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// The metadata word: a vtable (or forwarding) address plus three tag
/// bits owned by the collector.
pub type MetaWord = TaggedPtr<3>;

/// Uninterned metadata: the vtable word.
pub const UNINTERNED_META_SIZE: usize = WORD_SIZE;

/// Standard interned metadata: refcount + delegate + vtable words.
pub const INTERNED_META_SIZE: usize = 3 * WORD_SIZE;

/// Vtable-word tag bit: the word is a forwarding address.
pub const FORWARD_TAG: usize = 0b1;

/// Mask clearing the collector tag bits from a vtable word.
pub const META_TAG_MASK: usize = 0b111;

/// A handle to an uninterned runtime object (payload pointer).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RObj(NonNull<u8>);

/// A handle to an interned object (payload pointer, lives in iobj memory).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IObj(NonNull<u8>);

unsafe impl Send for IObj {}
unsafe impl Sync for IObj {}

macro_rules! common_metadata_impl {
    ($name:ident) => {
        impl $name {
            /// Wrap a payload address.
            ///
            /// # Safety
            ///
            /// `addr` must point at the payload of a live object with the
            /// matching layout.
            #[inline]
            pub unsafe fn from_addr(addr: usize) -> Self {
                Self(NonNull::new_unchecked(addr as *mut u8))
            }

            #[inline]
            pub fn addr(self) -> usize {
                self.0.as_ptr() as usize
            }

            #[inline]
            pub fn payload_ptr(self) -> *mut u8 {
                self.0.as_ptr()
            }

            #[inline]
            fn meta_word_ptr(self) -> *mut usize {
                (self.addr() - WORD_SIZE) as *mut usize
            }

            /// Raw vtable word, tags included.
            #[inline]
            pub fn meta_word(self) -> usize {
                unsafe { *self.meta_word_ptr() }
            }

            #[inline]
            pub fn set_meta_word(self, word: usize) {
                unsafe { *self.meta_word_ptr() = word };
            }

            #[inline]
            pub fn vtable(self) -> VTableRef {
                let word = self.meta_word();
                debug_assert_eq!(word & META_TAG_MASK, 0, "reading vtable of forwarded object");
                VTableRef::from_bits(word)
            }

            #[inline]
            pub fn set_vtable(self, vtable: VTableRef) {
                self.set_meta_word(vtable.bits());
            }

            #[inline]
            pub fn type_(self) -> &'static Type {
                self.vtable().type_()
            }

            #[inline]
            pub fn is_frozen(self) -> bool {
                self.vtable().is_frozen()
            }

            /// Instance size word (array element count, or string
            /// byte-size+hash). Only valid for array and string kinds.
            #[inline]
            pub fn size_word(self) -> usize {
                unsafe { *((self.addr() - 2 * WORD_SIZE) as *const usize) }
            }

            #[inline]
            pub fn set_size_word(self, word: usize) {
                unsafe { *((self.addr() - 2 * WORD_SIZE) as *mut usize) = word };
            }

            /// Element count of an array instance.
            #[inline]
            pub fn array_len(self) -> usize {
                debug_assert_eq!(self.type_().kind(), ObjectKind::Array);
                self.size_word()
            }

            /// Payload bytes of this instance (varies per instance for
            /// arrays and strings).
            pub fn payload_byte_size(self) -> usize {
                let type_ = self.type_();
                match type_.kind() {
                    ObjectKind::Array => type_.user_byte_size() * self.size_word(),
                    ObjectKind::String => {
                        rill_util::round_up((self.size_word() as u32) as usize, WORD_SIZE)
                    }
                    _ => type_.user_byte_size(),
                }
            }

            /// Payload size in words.
            #[inline]
            pub fn payload_words(self) -> usize {
                self.payload_byte_size() / WORD_SIZE
            }

            /// Has the collector already moved this object?
            #[inline]
            pub fn is_forwarded(self) -> bool {
                MetaWord::from_bits(self.meta_word()).tag() & FORWARD_TAG != 0
            }

            /// The address this object was moved to.
            #[inline]
            pub fn forwarding_addr(self) -> usize {
                debug_assert!(self.is_forwarded());
                MetaWord::from_bits(self.meta_word()).addr()
            }

            /// Overwrite the metadata with a forwarding marker.
            #[inline]
            pub fn set_forwarded(self, new_addr: usize) {
                self.set_meta_word(MetaWord::pack(new_addr, FORWARD_TAG).bits());
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.addr())
            }
        }
    };
}

common_metadata_impl!(RObj);
common_metadata_impl!(IObj);

impl IObj {
    /// Bytes of metadata before the vtable word that hold the instance
    /// size, if this kind has one.
    #[inline]
    fn size_meta_bytes(self) -> usize {
        match self.type_().kind() {
            ObjectKind::Array | ObjectKind::String => WORD_SIZE,
            _ => 0,
        }
    }

    #[inline]
    fn delegate_slot(self) -> &'static AtomicUsize {
        let addr = self.addr() - 2 * WORD_SIZE - self.size_meta_bytes();
        unsafe { &*(addr as *const AtomicUsize) }
    }

    #[inline]
    fn refcount_slot(self) -> &'static AtomicU32 {
        let addr = self.addr() - 3 * WORD_SIZE - self.size_meta_bytes();
        unsafe { &*(addr as *const AtomicU32) }
    }

    /// The refcount delegate: `self`, unless this object is a non-delegate
    /// member of an interned cycle.
    #[inline]
    pub fn delegate(self) -> IObj {
        match self.delegate_slot().load(Ordering::Acquire) {
            0 => self,
            addr => unsafe { IObj::from_addr(addr) },
        }
    }

    /// Is this object its own refcount delegate?
    #[inline]
    pub fn is_delegate(self) -> bool {
        self.delegate_slot().load(Ordering::Acquire) == 0
    }

    /// Point this object's refcounting at `delegate` (cycle collapse).
    #[inline]
    pub fn set_delegate(self, delegate: IObj) {
        debug_assert_ne!(delegate.addr(), self.addr());
        self.delegate_slot().store(delegate.addr(), Ordering::Release);
    }

    /// Current refcount of this object itself (zero for non-delegate
    /// cycle members).
    #[inline]
    pub fn local_refcount(self) -> u32 {
        self.refcount_slot().load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_local_refcount(self, count: u32) {
        self.refcount_slot().store(count, Ordering::Release);
    }

    /// Increment the delegate's refcount.
    #[inline]
    pub fn incref(self) {
        let delegate = self.delegate();
        let old = delegate.refcount_slot().fetch_add(1, Ordering::Relaxed);
        debug_assert_ne!(old, 0, "incref of dead interned object");
    }

    /// Increment the delegate's refcount unless it already reached zero
    /// (the object is dying and must be treated as absent).
    #[inline]
    #[must_use]
    pub fn try_incref(self) -> bool {
        let slot = self.delegate().refcount_slot();
        let mut current = slot.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            match slot.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Decrement the delegate's refcount; returns true if it reached zero
    /// (the caller must then arrange finalization through the interner).
    #[inline]
    #[must_use]
    pub fn decref_raw(self) -> bool {
        let delegate = self.delegate();
        let old = delegate.refcount_slot().fetch_sub(1, Ordering::AcqRel);
        debug_assert_ne!(old, 0, "decref of dead interned object");
        old == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::type_desc::Type;

    /// Hand-build an uninterned object in a plain buffer.
    fn make_object(buffer: &mut [usize], type_: &'static Type) -> RObj {
        let meta_words = type_.uninterned_metadata_byte_size() / WORD_SIZE;
        let payload = unsafe { buffer.as_mut_ptr().add(meta_words) };
        let obj = unsafe { RObj::from_addr(payload as usize) };
        obj.set_vtable(type_.vtable());
        obj
    }

    #[test]
    fn test_vtable_roundtrip() {
        let type_ = Type::class_factory("MetaTest", 16, &[]);
        let mut buffer = [0usize; 4];
        let obj = make_object(&mut buffer, type_);
        assert!(std::ptr::eq(obj.type_(), type_));
        assert!(!obj.is_frozen());
        assert_eq!(obj.payload_byte_size(), 16);
    }

    #[test]
    fn test_forwarding_marker() {
        let type_ = Type::class_factory("FwdTest", 8, &[]);
        let mut buffer = [0usize; 3];
        let obj = make_object(&mut buffer, type_);
        assert!(!obj.is_forwarded());
        obj.set_forwarded(0x1000);
        assert!(obj.is_forwarded());
        assert_eq!(obj.forwarding_addr(), 0x1000);
    }

    #[test]
    fn test_array_size_word() {
        let type_ = Type::array_factory("WordArray", 8, &[], Default::default());
        let mut buffer = [0usize; 8];
        // Array layout: [len][vtable][payload]
        let payload = unsafe { buffer.as_mut_ptr().add(2) };
        let obj = unsafe { RObj::from_addr(payload as usize) };
        obj.set_vtable(type_.vtable());
        obj.set_size_word(5);
        assert_eq!(obj.array_len(), 5);
        assert_eq!(obj.payload_byte_size(), 40);
    }
}
