//! Traces - the ordered inputs one evaluation consumed
//!
//! A trace is a revision's sequence of down edges, in first-use order.
//! Down edges are strong: a trace keeps its input revisions alive, and
//! clearing the trace both unsubscribes and releases them.
//!
//! Storage graduates with size: empty, one inline edge, or a heap
//! [`TraceArray`] of up to [`MAX_TRACE_SIZE`] edges with an `inactive`
//! bitmask (a bit is set when the corresponding input's `end` is no
//! longer "never" — those are the only inputs a refresh must examine).
//! Fanouts beyond [`MAX_TRACE_SIZE`] are arranged by the invocation layer
//! as a tree of dummy revisions, so any single trace fits the mask.

use super::edge::{DownEdge, EdgeIndex};
use std::cell::Cell;

/// Maximum edges in one trace array; larger traces become trees.
pub const MAX_TRACE_SIZE: usize = 52;

/// Heap storage for a multi-edge trace.
pub struct TraceArray {
    inactive: Cell<u64>,
    edges: Vec<Cell<DownEdge>>,
}

enum Rep {
    Empty,
    Inline {
        edge: Cell<DownEdge>,
        inactive: Cell<bool>,
    },
    Array(Box<TraceArray>),
}

/// The inputs of one revision.
pub struct Trace {
    rep: Rep,
}

impl Default for Trace {
    fn default() -> Trace {
        Trace { rep: Rep::Empty }
    }
}

impl Trace {
    /// A trace with room for `size` edges, all null and active; fill with
    /// [`Trace::assign`] while building.
    pub fn with_size(size: usize) -> Trace {
        assert!(size <= MAX_TRACE_SIZE, "trace fanout exceeds one array");
        let rep = match size {
            0 => Rep::Empty,
            1 => Rep::Inline {
                edge: Cell::new(DownEdge::null()),
                inactive: Cell::new(false),
            },
            _ => Rep::Array(Box::new(TraceArray {
                inactive: Cell::new(0),
                edges: (0..size).map(|_| Cell::new(DownEdge::null())).collect(),
            })),
        };
        Trace { rep }
    }

    /// Number of edges.
    pub fn size(&self) -> usize {
        match &self.rep {
            Rep::Empty => 0,
            Rep::Inline { .. } => 1,
            Rep::Array(array) => array.edges.len(),
        }
    }

    /// An empty trace is typically one that was discarded to save memory
    /// (the revision can no longer refresh).
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// The edge at `index`.
    pub fn get(&self, index: EdgeIndex) -> DownEdge {
        match &self.rep {
            Rep::Empty => crate::fatal!("indexing an empty trace"),
            Rep::Inline { edge, .. } => {
                debug_assert_eq!(index, 0);
                edge.get()
            }
            Rep::Array(array) => array.edges[index as usize].get(),
        }
    }

    /// Set the edge at `index`. Only used while building or rewiring the
    /// trace under the owner's lock.
    pub fn assign(&self, index: EdgeIndex, edge: DownEdge) {
        match &self.rep {
            Rep::Empty => crate::fatal!("assigning into an empty trace"),
            Rep::Inline { edge: slot, .. } => {
                debug_assert_eq!(index, 0);
                slot.set(edge);
            }
            Rep::Array(array) => array.edges[index as usize].set(edge),
        }
    }

    /// Bit mask of inactive edges.
    pub fn inactive_mask(&self) -> u64 {
        match &self.rep {
            Rep::Empty => 0,
            Rep::Inline { inactive, .. } => inactive.get() as u64,
            Rep::Array(array) => array.inactive.get(),
        }
    }

    /// Is any edge inactive?
    pub fn any_inactive(&self) -> bool {
        self.inactive_mask() != 0
    }

    pub fn is_inactive(&self, index: EdgeIndex) -> bool {
        self.inactive_mask() & (1 << index) != 0
    }

    /// Mark one edge inactive (its input's end became finite).
    pub fn set_inactive(&self, index: EdgeIndex) {
        match &self.rep {
            Rep::Empty => {}
            Rep::Inline { inactive, .. } => {
                debug_assert_eq!(index, 0);
                inactive.set(true);
            }
            Rep::Array(array) => array.inactive.set(array.inactive.get() | 1 << index),
        }
    }

    /// Mark one edge active again (a refresh extended its input).
    pub fn set_active(&self, index: EdgeIndex) {
        match &self.rep {
            Rep::Empty => {}
            Rep::Inline { inactive, .. } => {
                debug_assert_eq!(index, 0);
                inactive.set(false);
            }
            Rep::Array(array) => array.inactive.set(array.inactive.get() & !(1 << index)),
        }
    }

    /// Visit each (index, edge) pair.
    pub fn for_each(&self, mut f: impl FnMut(EdgeIndex, DownEdge)) {
        match &self.rep {
            Rep::Empty => {}
            Rep::Inline { edge, .. } => f(0, edge.get()),
            Rep::Array(array) => {
                for (index, slot) in array.edges.iter().enumerate() {
                    f(index as EdgeIndex, slot.get());
                }
            }
        }
    }

    /// Drop the storage without touching the graph. The caller is
    /// responsible for having unsubscribed and released the inputs.
    pub fn take(&mut self) -> Trace {
        std::mem::take(self)
    }
}
