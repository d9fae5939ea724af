//! Handles - movable GC roots
//!
//! A handle keeps an obstack object alive as a root without preventing the
//! collector from moving it: collections rewrite the handle's value slot.
//! Handles form a circular doubly-linked list anchored in their obstack.
//!
//! Only the thread owning the process may examine a handle's value or
//! links. The one exception is the owner field, protected by its own
//! mutex: an external thread only ever needs to learn which process to
//! post a task to, and that answer must stay coherent while ownership is
//! being transferred by `join_child`.

use crate::object::RObjOrFake;
use crate::process::{Process, ProcessRef};
use crate::process::task::Task;
use parking_lot::Mutex;
use std::cell::Cell;
use std::ptr::NonNull;

/// One node in an obstack's handle list. The obstack's anchor is a node
/// whose value is never read.
///
/// `repr(C)` so the value slot sits at offset zero: the collector patches
/// it through a raw word pointer like any other root slot.
#[repr(C)]
pub struct HandleNode {
    value: Cell<RObjOrFake>,
    next: Cell<*mut HandleNode>,
    prev: Cell<*mut HandleNode>,
    owner: Mutex<Option<ProcessRef>>,
}

// The value and link fields are only touched by the thread that owns the
// containing process; the owner field carries its own lock.
unsafe impl Send for HandleNode {}
unsafe impl Sync for HandleNode {}

impl HandleNode {
    /// A detached anchor node (links point at itself once `init_anchor`
    /// runs).
    pub fn anchor() -> Box<HandleNode> {
        let node = Box::new(HandleNode {
            value: Cell::new(RObjOrFake::null()),
            next: Cell::new(std::ptr::null_mut()),
            prev: Cell::new(std::ptr::null_mut()),
            owner: Mutex::new(None),
        });
        let ptr = &*node as *const HandleNode as *mut HandleNode;
        node.next.set(ptr);
        node.prev.set(ptr);
        node
    }

    #[inline]
    pub fn value(&self) -> RObjOrFake {
        self.value.get()
    }

    #[inline]
    pub fn set_value(&self, value: RObjOrFake) {
        self.value.set(value);
    }

    #[inline]
    pub fn next(&self) -> *mut HandleNode {
        self.next.get()
    }

    /// Splice this node out of its list.
    pub fn unlink(&self) {
        let next = self.next.get();
        let prev = self.prev.get();
        unsafe {
            (*prev).next.set(next);
            (*next).prev.set(prev);
        }
        let this = self as *const HandleNode as *mut HandleNode;
        self.next.set(this);
        self.prev.set(this);
    }

    /// Insert `node` right after `self`.
    pub fn prepend(&self, node: *mut HandleNode) {
        let this = self as *const HandleNode as *mut HandleNode;
        unsafe {
            (*node).prev.set(this);
            (*node).next.set(self.next.get());
            (*self.next.get()).prev.set(node);
        }
        self.next.set(node);
    }

    /// Move every node of `other`'s list (excluding its anchor) into this
    /// list, reassigning ownership to `new_owner`.
    pub fn splice_from(&self, other: &HandleNode, new_owner: &ProcessRef) {
        let mut cursor = other.next.get();
        let other_anchor = other as *const HandleNode as *mut HandleNode;
        while cursor != other_anchor {
            let node = unsafe { &*cursor };
            let next = node.next.get();
            // The owner mutex orders this against concurrent schedule()
            // calls from other threads.
            *node.owner.lock() = Some(new_owner.clone());
            node.unlink();
            self.prepend(cursor);
            cursor = next;
        }
    }

    /// Iterate every real handle in the list anchored here.
    pub fn for_each(&self, mut f: impl FnMut(&HandleNode)) {
        let anchor = self as *const HandleNode as *mut HandleNode;
        let mut cursor = self.next.get();
        while cursor != anchor {
            let node = unsafe { &*cursor };
            let next = node.next.get();
            f(node);
            cursor = next;
        }
    }

    /// Does the list anchored here contain any node?
    pub fn any(&self) -> bool {
        self.next.get() != self as *const HandleNode as *mut HandleNode
    }

    /// Does the list contain any node wrapping a real pointer?
    pub fn any_valid(&self) -> bool {
        let mut found = false;
        self.for_each(|node| found |= node.value().is_ptr());
        found
    }
}

/// Owning wrapper for one handle; unlinks on drop.
///
/// Dropping (and reading) a handle is only legal on the thread that owns
/// the handle's process; posting tasks through it is legal from any
/// thread.
pub struct Handle {
    node: NonNull<HandleNode>,
}

unsafe impl Send for Handle {}

impl Handle {
    /// Create a handle linked into `anchor`, owned by `owner`.
    pub(crate) fn new(
        anchor: &HandleNode,
        value: RObjOrFake,
        owner: Option<ProcessRef>,
    ) -> Handle {
        let node = Box::into_raw(Box::new(HandleNode {
            value: Cell::new(value),
            next: Cell::new(std::ptr::null_mut()),
            prev: Cell::new(std::ptr::null_mut()),
            owner: Mutex::new(owner),
        }));
        anchor.prepend(node);
        Handle {
            node: unsafe { NonNull::new_unchecked(node) },
        }
    }

    /// The current pointer. Only valid until the next collection.
    #[inline]
    pub fn get(&self) -> RObjOrFake {
        unsafe { self.node.as_ref() }.value()
    }

    /// Post a task to whatever process currently owns this handle.
    ///
    /// Safe to call from any thread; returns false if the handle has no
    /// owner or the owner is dead.
    pub fn schedule_task(&self, task: Box<dyn Task>) -> bool {
        let node = unsafe { self.node.as_ref() };
        let owner = node.owner.lock();
        match owner.as_ref() {
            Some(process) => process.schedule_task(task).is_ok(),
            None => false,
        }
    }

    /// Is the calling thread's current process the owner?
    pub fn is_owned_by_current_process(&self) -> bool {
        let node = unsafe { self.node.as_ref() };
        let owner = node.owner.lock();
        match (owner.as_ref(), Process::current()) {
            (Some(owner), Some(current)) => std::ptr::eq(&**owner, &*current),
            _ => false,
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        unsafe {
            self.node.as_ref().unlink();
            drop(Box::from_raw(self.node.as_ptr()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_starts_empty() {
        let anchor = HandleNode::anchor();
        assert!(!anchor.any());
        assert!(!anchor.any_valid());
    }

    #[test]
    fn test_link_unlink() {
        let anchor = HandleNode::anchor();
        let fake = RObjOrFake::from_fake_bits(-5);
        let handle = Handle::new(&anchor, fake, None);
        assert!(anchor.any());
        // A fake-pointer handle is linked but not "valid".
        assert!(!anchor.any_valid());
        assert_eq!(handle.get(), fake);
        drop(handle);
        assert!(!anchor.any());
    }

    #[test]
    fn test_for_each_sees_all() {
        let anchor = HandleNode::anchor();
        let h1 = Handle::new(&anchor, RObjOrFake::from_fake_bits(-1), None);
        let h2 = Handle::new(&anchor, RObjOrFake::from_fake_bits(-2), None);
        let mut seen = Vec::new();
        anchor.for_each(|node| seen.push(node.value().sbits()));
        seen.sort();
        assert_eq!(seen, vec![-2, -1]);
        drop(h1);
        drop(h2);
    }

    #[test]
    fn test_splice() {
        let parent = HandleNode::anchor();
        let child = HandleNode::anchor();
        let handle = Handle::new(&child, RObjOrFake::from_fake_bits(-7), None);
        assert!(child.any());

        let process = crate::process::Process::make().unwrap();
        parent.splice_from(&child, &process);
        assert!(!child.any());
        assert!(parent.any());
        assert_eq!(handle.get().sbits(), -7);
    }
}
