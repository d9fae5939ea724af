//! Cycle groups - strongly connected components of interned objects
//!
//! Interning a cyclic graph collapses each strongly connected component
//! into a group with one elected *delegate*: non-delegate members carry a
//! back pointer to the delegate and keep a zero refcount, and every
//! refcount operation on a member forwards to the delegate. When the
//! delegate's count reaches zero the whole component finalizes as one
//! unit.
//!
//! The registry here records group membership (the delegate does not have
//! room to carry a member list in its own metadata).

use crate::object::IObj;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Membership record for one interned cycle.
pub struct CycleGroup {
    /// Every member, delegate included (payload addresses).
    pub members: Vec<usize>,
}

lazy_static::lazy_static! {
    static ref GROUPS: Mutex<FxHashMap<usize, CycleGroup>> = Mutex::new(FxHashMap::default());
}

/// Record a freshly collapsed component. `delegate` must be a member.
pub fn register_group(delegate: IObj, members: Vec<usize>) {
    debug_assert!(members.contains(&delegate.addr()));
    GROUPS
        .lock()
        .insert(delegate.addr(), CycleGroup { members });
}

/// Remove and return the group led by `delegate`, if any.
pub fn take_group(delegate: IObj) -> Option<CycleGroup> {
    GROUPS.lock().remove(&delegate.addr())
}

/// Number of members in the group led by `delegate` (zero if `delegate`
/// leads no group).
pub fn group_size(delegate: IObj) -> usize {
    GROUPS
        .lock()
        .get(&delegate.addr())
        .map(|group| group.members.len())
        .unwrap_or(0)
}
