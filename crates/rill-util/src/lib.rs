//! rill-util - Foundation Utilities for the Rill Runtime
//!
//! This crate provides the low-level building blocks shared by the runtime
//! crates. Everything here is a zero-cost abstraction: the helpers compile
//! down to the same code a hand-written implementation would produce.
//!
//! Contents:
//!
//! - [`spin`]: single-byte spinlock used for per-instance locks where a
//!   full mutex would double the size of the protected object.
//! - [`tagged`]: pointer-plus-tag-bits primitives. Aligned pointers have
//!   free low bits, and the runtime packs edge indices, ownership states
//!   and flags into them.
//! - [`align`]: alignment arithmetic helpers.

pub mod align;
pub mod spin;
pub mod tagged;

pub use align::{is_aligned, round_up};
pub use spin::SpinLock;
pub use tagged::{AtomicTaggedPtr, TaggedPtr};

/// Crate version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
