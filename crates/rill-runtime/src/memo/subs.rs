//! Subscription sets - the inverse (up) edges of a revision
//!
//! An unordered set of up edges to the revisions that want invalidation
//! when this revision's `end` drops from "never" to a finite transaction.
//!
//! Storage graduates with size:
//! - empty: one null word;
//! - one subscriber: the up edge stored inline in the set's own word;
//! - more: a linked list of 64-byte [`SubArray`]s. Free slots chain
//!   through their own edge words into a freelist whose head lives in
//!   slot 0 of the first array. When the inline subscriber is displaced
//!   by a second subscription it moves to the well-known slot 1 of the
//!   first array, so down edges carrying [`INLINE_SUBSCRIPTION_INDEX`]
//!   still find it in O(1).
//!
//! All operations require the owning revision's lock.

use super::edge::{DownEdge, Edge, EdgeIndex, UpEdge, INLINE_SUBSCRIPTION_INDEX};
use super::revision::Revision;
use std::cell::Cell;

/// Edges per array: a 64-byte line minus the owner and next pointers.
pub const SUB_ARRAY_SIZE: usize = 6;

/// Slot 0 of the head array holds the freelist head, not a subscription.
const FREELIST_SLOT: usize = 0;

/// Where a displaced inline subscription lands in the head array.
const MOVED_INLINE_SLOT: usize = 1;

/// One block of subscription storage.
#[repr(C, align(64))]
pub struct SubArray {
    /// Revision whose subscription set owns this array.
    pub owner: *mut Revision,

    /// Next array in the list.
    pub next: *mut SubArray,

    /// Live slots hold up edges (revision-flavored); free slots hold a
    /// sub-array-flavored link to the next free slot, or null at the end
    /// of the freelist.
    pub slots: [Cell<Edge>; SUB_ARRAY_SIZE],
}

static_assertions::const_assert_eq!(std::mem::size_of::<SubArray>(), 64);

impl SubArray {
    fn new_boxed(owner: *mut Revision, next: *mut SubArray) -> *mut SubArray {
        Box::into_raw(Box::new(SubArray {
            owner,
            next,
            slots: Default::default(),
        }))
    }
}

/// The set of up edges subscribed to one revision.
pub struct SubscriptionSet {
    /// Null = empty; revision-flavored = single inline up edge;
    /// sub-array-flavored = head of the array list.
    rep: Cell<Edge>,
}

impl Default for SubscriptionSet {
    fn default() -> Self {
        SubscriptionSet {
            rep: Cell::new(Edge::null()),
        }
    }
}

impl SubscriptionSet {
    /// True if the set holds no subscriptions and no storage. A false
    /// result does not imply a live subscription (arrays may be empty).
    pub fn obviously_empty(&self) -> bool {
        self.rep.get().is_null()
    }

    fn head_array(&self) -> Option<*mut SubArray> {
        self.rep.get().as_sub_array()
    }

    fn freelist_pop(&self) -> Option<(*mut SubArray, EdgeIndex)> {
        let head = self.head_array()?;
        let free = unsafe { (*head).slots[FREELIST_SLOT].get() };
        let array = free.as_sub_array()?;
        let index = free.index();
        let next_free = unsafe { (*array).slots[index as usize].get() };
        unsafe { (*head).slots[FREELIST_SLOT].set(next_free) };
        Some((array, index))
    }

    fn freelist_push(&self, array: *mut SubArray, index: EdgeIndex) {
        let head = self.head_array().expect("freelist push without arrays");
        let old_free = unsafe { (*head).slots[FREELIST_SLOT].get() };
        unsafe {
            (*array).slots[index as usize].set(old_free);
            (*head).slots[FREELIST_SLOT].set(Edge::to_sub_array(array, index));
        }
    }

    /// Subscribe `subscriber`; returns the down edge the subscriber must
    /// store in its trace slot to find this subscription again.
    ///
    /// `owner` is the revision owning this set (locked by the caller).
    pub fn subscribe(&self, owner: *mut Revision, subscriber: UpEdge) -> DownEdge {
        let rep = self.rep.get();

        if rep.is_null() {
            // First subscriber: store inline.
            self.rep.set(subscriber.as_edge());
            return Edge::to_revision(owner, INLINE_SUBSCRIPTION_INDEX);
        }

        if rep.as_revision().is_some() {
            // Second subscriber: graduate to a SubArray, moving the
            // inline edge to its well-known slot.
            let array = SubArray::new_boxed(owner, std::ptr::null_mut());
            unsafe {
                (*array).slots[MOVED_INLINE_SLOT].set(rep);
                // Chain the remaining slots into the freelist.
                (*array).slots[FREELIST_SLOT].set(Edge::null());
            }
            self.rep.set(Edge::to_sub_array(array, 0));
            for index in (MOVED_INLINE_SLOT + 1..SUB_ARRAY_SIZE).rev() {
                self.freelist_push(array, index as EdgeIndex);
            }
            return self.subscribe(owner, subscriber);
        }

        // Array list: take a free slot, growing if needed.
        let (array, index) = match self.freelist_pop() {
            Some(slot) => slot,
            None => {
                let head = self.head_array().expect("array rep");
                let fresh = SubArray::new_boxed(owner, unsafe { (*head).next });
                unsafe { (*head).next = fresh };
                for index in (1..SUB_ARRAY_SIZE).rev() {
                    self.freelist_push(fresh, index as EdgeIndex);
                }
                (fresh, 0)
            }
        };
        unsafe { (*array).slots[index as usize].set(subscriber.as_edge()) };
        Edge::to_sub_array(array, index)
    }

    /// The up edge a down edge with [`INLINE_SUBSCRIPTION_INDEX`] refers
    /// to: still inline, or at the moved slot of the first array.
    pub fn inline_subscriber(&self) -> UpEdge {
        let rep = self.rep.get();
        if let Some(array) = rep.as_sub_array() {
            UpEdge::from_edge(unsafe { (*array).slots[MOVED_INLINE_SLOT].get() })
        } else {
            UpEdge::from_edge(rep)
        }
    }

    /// Remove the subscription a down edge points at.
    pub fn unsubscribe(&self, edge: DownEdge) {
        if edge.index() == INLINE_SUBSCRIPTION_INDEX {
            let rep = self.rep.get();
            if let Some(array) = rep.as_sub_array() {
                unsafe { (*array).slots[MOVED_INLINE_SLOT].set(Edge::null()) };
                self.freelist_push(array, MOVED_INLINE_SLOT as EdgeIndex);
            } else {
                self.rep.set(Edge::null());
            }
            return;
        }
        let array = edge
            .as_sub_array()
            .expect("down edge with a slot index must point at a SubArray");
        unsafe { (*array).slots[edge.index() as usize].set(Edge::null()) };
        self.freelist_push(array, edge.index());
    }

    /// Overwrite the up edge a down edge refers to (a subscriber's trace
    /// slot moved).
    pub fn reassign(&self, edge: DownEdge, subscriber: UpEdge) {
        if edge.index() == INLINE_SUBSCRIPTION_INDEX {
            let rep = self.rep.get();
            if let Some(array) = rep.as_sub_array() {
                unsafe { (*array).slots[MOVED_INLINE_SLOT].set(subscriber.as_edge()) };
            } else {
                self.rep.set(subscriber.as_edge());
            }
        } else {
            let array = edge.as_sub_array().expect("slot-indexed down edge");
            unsafe { (*array).slots[edge.index() as usize].set(subscriber.as_edge()) };
        }
    }

    /// Visit every live subscription.
    pub fn for_each(&self, mut f: impl FnMut(UpEdge)) {
        let rep = self.rep.get();
        if rep.is_null() {
            return;
        }
        if rep.as_revision().is_some() {
            f(UpEdge::from_edge(rep));
            return;
        }
        let mut array = rep.as_sub_array();
        let mut first = true;
        while let Some(current) = array {
            let slots = unsafe { &(*current).slots };
            for (index, slot) in slots.iter().enumerate() {
                if first && index == FREELIST_SLOT {
                    continue;
                }
                let edge = slot.get();
                // Live slots hold revision-flavored edges; free slots
                // hold sub-array links or null.
                if edge.as_revision().is_some() {
                    f(UpEdge::from_edge(edge));
                }
            }
            array = unsafe { (*current).next.as_mut().map(|next| next as *mut SubArray) };
            first = false;
        }
    }

    /// Number of live subscriptions (O(n); test support).
    pub fn len(&self) -> usize {
        let mut count = 0;
        self.for_each(|_| count += 1);
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard all subscriptions and storage.
    pub fn clear(&self) {
        let rep = self.rep.take();
        let mut array = rep.as_sub_array();
        while let Some(current) = array {
            let next = unsafe { (*current).next };
            unsafe { drop(Box::from_raw(current)) };
            array = if next.is_null() { None } else { Some(next) };
        }
    }
}

impl Drop for SubscriptionSet {
    fn drop(&mut self) {
        self.clear();
    }
}
