//! Cells - mutable inputs to the memoization graph
//!
//! A cell is a permanently-allocated invocation with no body: it always
//! has a valid value, starting with an initial revision `[1, never)` and
//! mutated only by transactions, which append a new head revision and
//! truncate the old one.
//!
//! Every cell is its own identity: the argument object carries a unique
//! id and the type carries the avoid-intern-table hint, so two cells
//! never canonicalize together.

use super::invocation::{install_initial_revision, Invocation};
use super::value::MemoValue;
use super::TxnId;
use crate::error::Result;
use crate::object::{IObj, RObj, Type, TypeHints, UNINTERNED_META_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};

lazy_static::lazy_static! {
    static ref CELL_TYPE: &'static Type = Type::invocation_factory(
        "CellInvocation",
        8,
        &[],
        super::invocation::invocation_extra_bytes(),
        TypeHints::AVOID_INTERN_TABLE,
        None,
        None,
    );
}

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

/// The built-in cell invocation type (serde support).
pub fn cell_type() -> &'static Type {
    *CELL_TYPE
}

/// A mutable input cell.
pub struct Cell {
    invocation: IObj,
}

impl Cell {
    /// Create a cell holding `initial_value`.
    pub fn new(initial_value: MemoValue) -> Result<Cell> {
        // Build a transient argument object carrying a fresh id, intern
        // it (the type's hint keeps it out of the canonical table), and
        // seed the revision list.
        let id = NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed);
        let mut buffer = [0usize; 2];
        debug_assert_eq!(UNINTERNED_META_SIZE, 8);
        let payload = unsafe { buffer.as_mut_ptr().add(1) };
        let robj = unsafe { RObj::from_addr(payload as usize) };
        robj.set_vtable(cell_type().vtable());
        unsafe { *(payload as *mut u64) = id };

        let iobj = crate::intern::intern(robj)?;
        let inv = Invocation::from_iobj(iobj);
        install_initial_revision(inv, initial_value);
        Ok(Cell { invocation: iobj })
    }

    /// The interned invocation backing this cell (no reference
    /// transferred).
    pub fn invocation(&self) -> IObj {
        self.invocation
    }

    /// Read the cell's value at `txn` (or the newest visible
    /// transaction).
    pub fn read(&self, txn: Option<TxnId>) -> Result<MemoValue> {
        super::invocation::evaluate_sync(self.invocation, txn)
    }
}

impl Drop for Cell {
    fn drop(&mut self) {
        let inv = Invocation::from_iobj(self.invocation);
        {
            let guard = super::invocation::lock_invocation(inv);
            guard.invocation().detach_revisions_lck();
        }
        crate::lock::safe_decref_iobj(self.invocation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memo::newest_visible_txn;

    #[test]
    fn test_cell_reads_initial_value() {
        let cell = Cell::new(MemoValue::Int64(100)).unwrap();
        assert_eq!(cell.read(None).unwrap(), MemoValue::Int64(100));
        assert_eq!(
            cell.read(Some(newest_visible_txn())).unwrap(),
            MemoValue::Int64(100)
        );
    }

    #[test]
    fn test_cells_are_distinct() {
        let a = Cell::new(MemoValue::Int64(1)).unwrap();
        let b = Cell::new(MemoValue::Int64(1)).unwrap();
        assert_ne!(a.invocation().addr(), b.invocation().addr());
    }

    #[test]
    fn test_cell_invocation_has_one_revision() {
        let cell = Cell::new(MemoValue::Null).unwrap();
        let inv = Invocation::from_iobj(cell.invocation());
        assert_eq!(inv.revision_count(), 1);
    }
}
