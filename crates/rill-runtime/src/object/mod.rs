//! Object Model - runtime objects, type descriptors, vtables
//!
//! Every allocated value (an `RObj`) carries a one-word metadata slot
//! immediately before its user payload. The metadata word points at a
//! [`VTable`], which carries the frozen flag and the memoized entry point
//! and in turn points at the [`Type`] descriptor.
//!
//! Memory layout:
//!
//! ```text
//! uninterned object:
//! ┌──────────────┬───────────────────────────┐
//! │ vtable word  │ user payload ...          │
//! └──────────────┴───────────────────────────┘
//!                ^ RObj points here
//!
//! interned object:
//! ┌───────────┬───────────┬──────────────┬───────────────┐
//! │ refcount  │ delegate  │ vtable word  │ user payload  │
//! └───────────┴───────────┴──────────────┴───────────────┘
//!                                        ^ IObj points here
//! ```
//!
//! Invocation-kind objects carry the embedded `Invocation` bookkeeping
//! struct in additional interned metadata preceding the refcount word.
//!
//! Pointer-sized values whose top two bits are set are *fake pointers*:
//! inline payloads (short strings, boxed scalars) that every consumer must
//! short-circuit without dereferencing.

pub mod ptr;
pub mod refmask;
pub mod robj;
pub mod type_desc;
pub mod vtable;

pub use ptr::{IObjOrFake, ObjOrFake, RObjOrFake};
pub use refmask::{RefMask, STRIPE_COLLECT, STRIPE_COUNT, STRIPE_FREEZE};
pub use robj::{IObj, RObj, FORWARD_TAG, INTERNED_META_SIZE, UNINTERNED_META_SIZE};
pub use type_desc::{Type, TypeHints, STATE_CHANGE_HOOK_NONE};
pub use vtable::{EntryFn, VTable, VTableRef};

/// Allocation alignment for all runtime objects.
pub const ALLOC_ALIGN: usize = 8;

/// Word size used throughout the object model.
pub const WORD_SIZE: usize = 8;

/// The five kinds of runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectKind {
    Class = 0,
    Array = 1,
    String = 2,
    Invocation = 3,
    CycleHandle = 4,
}

/// Argument to a type's state-change hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// The object was just inserted into the intern table.
    Initialize,
    /// The object's refcount reached zero and it is about to be freed.
    Finalize,
}
