//! VTable - per-type dispatch record
//!
//! A vtable carries the frozen flag and the function pointer for memoized
//! entry points, and points back at the [`Type`] descriptor. Every type
//! owns two vtables, a normal one and a frozen one; freezing an object is
//! a vtable-word swap, so the frozen bit costs no per-object space.

use super::type_desc::Type;
use super::IObj;

/// Entry point of a memoized invocation. Receives the interned argument
/// object; delivers its result through the awaitable completion ABI.
pub type EntryFn = fn(IObj);

/// Per-type dispatch record. Leaked on creation; lives forever.
pub struct VTable {
    type_: &'static Type,
    frozen: bool,
    entry: Option<EntryFn>,
}

impl VTable {
    pub(super) fn new(type_: &'static Type, frozen: bool, entry: Option<EntryFn>) -> VTable {
        VTable {
            type_,
            frozen,
            entry,
        }
    }

    /// The type this vtable dispatches for.
    #[inline]
    pub fn type_(&self) -> &'static Type {
        self.type_
    }

    /// Is an object holding this vtable frozen?
    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// The memoized entry point, if this is an invocation type.
    #[inline]
    pub fn entry(&self) -> Option<EntryFn> {
        self.entry
    }
}

impl std::fmt::Debug for VTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VTable")
            .field("type", &self.type_.name())
            .field("frozen", &self.frozen)
            .field("entry", &self.entry.is_some())
            .finish()
    }
}

/// A word-sized reference to a vtable, as stored in object metadata.
///
/// The low three bits of the word are tag bits owned by the collector (see
/// [`super::robj::FORWARD_TAG`]); a `VTableRef` always has them clear.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VTableRef(usize);

impl VTableRef {
    #[inline]
    pub fn new(vtable: &'static VTable) -> VTableRef {
        let bits = vtable as *const VTable as usize;
        debug_assert_eq!(bits & 0b111, 0);
        VTableRef(bits)
    }

    #[inline]
    pub fn from_bits(bits: usize) -> VTableRef {
        debug_assert_eq!(bits & 0b111, 0);
        VTableRef(bits)
    }

    #[inline]
    pub fn bits(self) -> usize {
        self.0
    }

    #[inline]
    pub fn vtable(self) -> &'static VTable {
        debug_assert_ne!(self.0, 0);
        unsafe { &*(self.0 as *const VTable) }
    }

    #[inline]
    pub fn type_(self) -> &'static Type {
        self.vtable().type_()
    }

    #[inline]
    pub fn is_frozen(self) -> bool {
        self.vtable().is_frozen()
    }
}

impl std::fmt::Debug for VTableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 == 0 {
            write!(f, "VTableRef(null)")
        } else {
            write!(f, "VTableRef({})", self.type_().name())
        }
    }
}
