//! Type Descriptor - per-class record consumed by the runtime
//!
//! A `Type` describes one of five kinds (class, array, string, invocation,
//! cycle handle) and carries everything the allocator, collector, freezer
//! and interner need: sizes, the two-stripe reference mask, layout hints,
//! and the optional state-change hook driven on intern-table insertion and
//! finalization.
//!
//! Types are created through the factory functions and leaked; compiled
//! code and tests hold `&'static Type` forever, matching the lifetime of
//! the vtables embedded in object metadata.

use super::refmask::RefMask;
use super::robj::{IObj, INTERNED_META_SIZE, UNINTERNED_META_SIZE};
use super::vtable::{EntryFn, VTable, VTableRef};
use super::{ObjectKind, StateChange, WORD_SIZE};
use rill_util::round_up;

/// Layout hints, one bit each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeHints(pub u8);

impl TypeHints {
    /// Payload mixes reference and non-reference words.
    pub const MIXED_REFS: TypeHints = TypeHints(1 << 0);
    /// Every reference slot points at already-frozen data.
    pub const ALL_FROZEN_REFS: TypeHints = TypeHints(1 << 1);
    /// No mutable object aliases this object's payload.
    pub const NO_MUTABLE_ALIASES: TypeHints = TypeHints(1 << 2);
    /// Interning this type is known to be unprofitable; the interner may
    /// keep duplicates.
    pub const AVOID_INTERN_TABLE: TypeHints = TypeHints(1 << 3);

    #[inline]
    pub fn contains(self, other: TypeHints) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn union(self, other: TypeHints) -> TypeHints {
        TypeHints(self.0 | other.0)
    }
}

/// State-change hook type.
pub type StateChangeHook = fn(IObj, StateChange);

/// Convenience for factories that take no hook.
pub const STATE_CHANGE_HOOK_NONE: Option<StateChangeHook> = None;

/// Extra uninterned metadata for array and string instances: one word
/// holding the instance size (element count or byte size + hash).
pub const SIZE_META_BYTES: usize = WORD_SIZE;

/// Per-class descriptor.
pub struct Type {
    name: String,
    kind: ObjectKind,

    /// For class/invocation: payload bytes. For array: bytes per element.
    /// For string: zero (size is per-instance).
    user_byte_size: usize,

    uninterned_meta_size: usize,
    interned_meta_size: usize,

    ref_mask: RefMask,
    hints: TypeHints,
    on_state_change: Option<StateChangeHook>,

    vtable: std::sync::OnceLock<&'static VTable>,
    frozen_vtable: std::sync::OnceLock<&'static VTable>,
}

impl Type {
    fn build(
        name: &str,
        kind: ObjectKind,
        user_byte_size: usize,
        extra_interned_bytes: usize,
        ref_mask: RefMask,
        hints: TypeHints,
        on_state_change: Option<StateChangeHook>,
        entry: Option<EntryFn>,
    ) -> &'static Type {
        let size_meta = match kind {
            ObjectKind::Array | ObjectKind::String => SIZE_META_BYTES,
            _ => 0,
        };
        let type_: &'static Type = Box::leak(Box::new(Type {
            name: name.to_owned(),
            kind,
            user_byte_size,
            uninterned_meta_size: UNINTERNED_META_SIZE + size_meta,
            interned_meta_size: INTERNED_META_SIZE
                + size_meta
                + round_up(extra_interned_bytes, WORD_SIZE),
            ref_mask,
            hints,
            on_state_change,
            vtable: std::sync::OnceLock::new(),
            frozen_vtable: std::sync::OnceLock::new(),
        }));
        type_
            .vtable
            .set(Box::leak(Box::new(VTable::new(type_, false, entry))))
            .ok();
        type_
            .frozen_vtable
            .set(Box::leak(Box::new(VTable::new(type_, true, entry))))
            .ok();
        type_
    }

    /// Ordinary class with fixed payload size and references at the given
    /// byte offsets.
    pub fn class_factory(name: &str, user_byte_size: usize, ref_offsets: &[usize]) -> &'static Type {
        Type::build(
            name,
            ObjectKind::Class,
            round_up(user_byte_size, WORD_SIZE),
            0,
            RefMask::new(round_up(user_byte_size, WORD_SIZE), ref_offsets),
            TypeHints::default(),
            None,
            None,
        )
    }

    /// Array type: `slot_bytes` per element, references at `ref_offsets`
    /// within each element, mask tiled across the payload.
    pub fn array_factory(
        name: &str,
        slot_bytes: usize,
        ref_offsets: &[usize],
        hints: TypeHints,
    ) -> &'static Type {
        let slot = round_up(slot_bytes.max(1), WORD_SIZE);
        Type::build(
            name,
            ObjectKind::Array,
            slot,
            0,
            RefMask::tiled(slot, ref_offsets),
            hints,
            None,
            None,
        )
    }

    /// Invocation type: an interned argument tuple plus the memoized entry
    /// point. `extra_interned_bytes` reserves interned metadata for the
    /// runtime's embedded invocation bookkeeping.
    pub fn invocation_factory(
        name: &str,
        user_byte_size: usize,
        ref_offsets: &[usize],
        extra_interned_bytes: usize,
        hints: TypeHints,
        on_state_change: Option<StateChangeHook>,
        entry: Option<EntryFn>,
    ) -> &'static Type {
        Type::build(
            name,
            ObjectKind::Invocation,
            round_up(user_byte_size, WORD_SIZE),
            extra_interned_bytes,
            RefMask::new(round_up(user_byte_size, WORD_SIZE), ref_offsets),
            hints,
            on_state_change,
            entry,
        )
    }

    /// The built-in long-string type (no references; size per instance).
    pub(crate) fn string_factory(name: &str) -> &'static Type {
        Type::build(
            name,
            ObjectKind::String,
            0,
            0,
            RefMask::empty(0),
            TypeHints::ALL_FROZEN_REFS.union(TypeHints::NO_MUTABLE_ALIASES),
            None,
            None,
        )
    }

    /// The built-in cycle-handle sentinel type (one reference slot: the
    /// delegate-to-be).
    pub(crate) fn cycle_handle_factory(name: &str) -> &'static Type {
        Type::build(
            name,
            ObjectKind::CycleHandle,
            WORD_SIZE,
            0,
            RefMask::new(WORD_SIZE, &[0]),
            TypeHints::default(),
            None,
            None,
        )
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Fixed payload bytes (classes/invocations) or per-element bytes
    /// (arrays).
    #[inline]
    pub fn user_byte_size(&self) -> usize {
        self.user_byte_size
    }

    #[inline]
    pub fn uninterned_metadata_byte_size(&self) -> usize {
        self.uninterned_meta_size
    }

    #[inline]
    pub fn interned_metadata_byte_size(&self) -> usize {
        self.interned_meta_size
    }

    #[inline]
    pub fn ref_mask(&self) -> &RefMask {
        &self.ref_mask
    }

    #[inline]
    pub fn hints(&self) -> TypeHints {
        self.hints
    }

    #[inline]
    pub fn on_state_change(&self) -> Option<StateChangeHook> {
        self.on_state_change
    }

    #[inline]
    pub fn vtable(&self) -> VTableRef {
        VTableRef::new(self.vtable.get().expect("vtable initialized by factory"))
    }

    #[inline]
    pub fn frozen_vtable(&self) -> VTableRef {
        VTableRef::new(
            self.frozen_vtable
                .get()
                .expect("vtable initialized by factory"),
        )
    }
}

impl std::fmt::Debug for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Type")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("user_byte_size", &self.user_byte_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::STRIPE_COLLECT;

    #[test]
    fn test_class_factory_sizes() {
        let t = Type::class_factory("Pair", 16, &[0, 8]);
        assert_eq!(t.kind(), ObjectKind::Class);
        assert_eq!(t.user_byte_size(), 16);
        assert_eq!(t.uninterned_metadata_byte_size(), UNINTERNED_META_SIZE);
        assert_eq!(t.interned_metadata_byte_size(), INTERNED_META_SIZE);
        assert!(t.ref_mask().is_ref(STRIPE_COLLECT, 0));
        assert!(t.ref_mask().is_ref(STRIPE_COLLECT, 1));
    }

    #[test]
    fn test_array_factory_has_size_meta() {
        let t = Type::array_factory("RefArray", 8, &[0], TypeHints::default());
        assert_eq!(t.kind(), ObjectKind::Array);
        assert_eq!(
            t.uninterned_metadata_byte_size(),
            UNINTERNED_META_SIZE + SIZE_META_BYTES
        );
    }

    #[test]
    fn test_vtables_share_type() {
        let t = Type::class_factory("Point", 16, &[]);
        assert!(std::ptr::eq(t.vtable().type_(), t));
        assert!(std::ptr::eq(t.frozen_vtable().type_(), t));
        assert!(!t.vtable().is_frozen());
        assert!(t.frozen_vtable().is_frozen());
    }

    #[test]
    fn test_invocation_extra_metadata() {
        let t = Type::invocation_factory("memo", 8, &[0], 100, TypeHints::default(), None, None);
        assert_eq!(
            t.interned_metadata_byte_size(),
            INTERNED_META_SIZE + round_up(100, WORD_SIZE)
        );
    }

    #[test]
    fn test_hints() {
        let hints = TypeHints::MIXED_REFS.union(TypeHints::AVOID_INTERN_TABLE);
        assert!(hints.contains(TypeHints::MIXED_REFS));
        assert!(!hints.contains(TypeHints::ALL_FROZEN_REFS));
    }
}
