//! LRU list - eviction order for memoized invocations
//!
//! A doubly-linked list of invocations, most recently used at the head.
//! The list does not hold references; an invocation removes itself when
//! it finalizes. Hot `move_to_head` updates use try-lock and drop the
//! update on contention rather than stall the evaluation path.

use super::invocation::{Invocation, OwningList};
use parking_lot::Mutex;

struct LruList {
    head: *mut Invocation,
    tail: *mut Invocation,
    len: usize,
}

unsafe impl Send for LruList {}

lazy_static::lazy_static! {
    static ref LRU: Mutex<LruList> = Mutex::new(LruList {
        head: std::ptr::null_mut(),
        tail: std::ptr::null_mut(),
        len: 0,
    });
}

fn unlink(list: &mut LruList, inv: &Invocation) {
    let prev = inv.lru_prev.get();
    let next = inv.lru_next.get();
    if prev.is_null() {
        list.head = next;
    } else {
        unsafe { (*prev).lru_next.set(next) };
    }
    if next.is_null() {
        list.tail = prev;
    } else {
        unsafe { (*next).lru_prev.set(prev) };
    }
    inv.lru_prev.set(std::ptr::null_mut());
    inv.lru_next.set(std::ptr::null_mut());
    list.len -= 1;
}

fn push_head(list: &mut LruList, inv: &Invocation) {
    let inv_ptr = inv as *const Invocation as *mut Invocation;
    inv.lru_prev.set(std::ptr::null_mut());
    inv.lru_next.set(list.head);
    if list.head.is_null() {
        list.tail = inv_ptr;
    } else {
        unsafe { (*list.head).lru_prev.set(inv_ptr) };
    }
    list.head = inv_ptr;
    list.len += 1;
}

/// Move `inv` to the LRU head (inserting it if it is in no list). Called
/// with the invocation locked; skipped entirely when the list is busy or
/// the invocation sits in a cleanup list.
///
/// Invocations without an entry point (cells) are never inserted:
/// evicting them would discard state that cannot be recomputed.
pub fn move_to_head_lck(inv: &Invocation) {
    match inv.owning_list() {
        OwningList::Cleanup => return,
        OwningList::Lru => {
            if let Some(mut list) = LRU.try_lock() {
                unlink(&mut list, inv);
                push_head(&mut list, inv);
            }
        }
        OwningList::None => {
            if inv.as_iobj().vtable().vtable().entry().is_none() {
                return;
            }
            let mut list = LRU.lock();
            inv.set_owning_list(OwningList::Lru);
            push_head(&mut list, inv);
        }
    }
}

/// Remove `inv` from the list if present (finalization, or migration to
/// a cleanup list). Called with the invocation locked.
pub fn remove_lck(inv: &Invocation) {
    if inv.owning_list() == OwningList::Lru {
        let mut list = LRU.lock();
        unlink(&mut list, inv);
        inv.set_owning_list(OwningList::None);
    }
}

/// Number of invocations currently in the list.
pub fn len() -> usize {
    LRU.lock().len
}

/// The most recently used invocation, for tests.
pub fn most_recently_used() -> Option<crate::object::IObj> {
    let list = LRU.lock();
    if list.head.is_null() {
        None
    } else {
        let inv = unsafe { &*list.head };
        let iobj = inv.as_iobj();
        iobj.incref();
        Some(iobj)
    }
}

/// Evict the least recently used invocation: detach its revisions so
/// they survive on their own as graph nodes, letting refcounting free
/// whatever nothing else reaches. Returns false if the list was empty.
pub fn discard_least_recently_used() -> bool {
    // Take the reference while still holding the list mutex: the moment
    // the mutex drops, a concurrent finalization could unlink and free
    // the tail out from under us.
    let iobj = {
        let list = LRU.lock();
        if list.tail.is_null() {
            return false;
        }
        let inv = unsafe { &*list.tail };
        let iobj = inv.as_iobj();
        if !iobj.try_incref() {
            // Already finalizing; it will remove itself.
            return false;
        }
        iobj
    };
    let inv = Invocation::from_iobj(iobj);
    {
        let guard = super::invocation::lock_invocation(inv);
        lru_evict_lck(guard.invocation());
    }
    log::debug!("lru: discarded invocation {:#x}", iobj.addr());
    crate::lock::safe_decref_iobj(iobj);
    true
}

fn lru_evict_lck(inv: &Invocation) {
    remove_lck(inv);
    inv.detach_revisions_lck();
}
