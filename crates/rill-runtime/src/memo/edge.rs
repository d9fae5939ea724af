//! Edges - bidirectional links in the dependency graph
//!
//! Graph nodes are revisions. A **down edge** points from a revision to
//! one of the inputs used to compute its value; an **up edge** points from
//! a revision to a subscriber that depends on it. Every edge can find its
//! reverse edge in O(1): the packed word carries a pointer plus a 6-bit
//! index naming where the reverse edge lives in the target.
//!
//! A down edge usually points at a [`SubArray`] owned by the input's
//! subscription set (the index is the slot holding the reverse up edge).
//! As a special case, a subscription set with a single subscriber stores
//! that up edge inline, and the corresponding down edge points directly
//! at the input revision with index [`INLINE_SUBSCRIPTION_INDEX`].
//!
//! Revisions and sub-arrays are 64-byte aligned, freeing the low six bits
//! for the index; the sub-array flag uses a high bit, which a 47-bit user
//! address space leaves clear.

use super::revision::Revision;
use super::subs::SubArray;

/// Index locating a reverse edge inside its target.
pub type EdgeIndex = u8;

/// The down-edge index meaning "the reverse up edge is stored inline in
/// the target revision's subscription set" (or at its well-known moved
/// slot).
pub const INLINE_SUBSCRIPTION_INDEX: EdgeIndex = 63;

/// Index meaning "no edge".
pub const NO_EDGE_INDEX: EdgeIndex = 62;

const INDEX_MASK: usize = 0x3f;
const SUBARRAY_FLAG: usize = 1 << 62;
const ADDR_MASK: usize = !(INDEX_MASK | SUBARRAY_FLAG);

/// A packed (pointer, index) edge. See the module docs for the two
/// logical subtypes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge(usize);

impl Edge {
    #[inline]
    pub const fn null() -> Edge {
        Edge(0)
    }

    #[inline]
    pub fn to_revision(rev: *mut Revision, index: EdgeIndex) -> Edge {
        debug_assert_eq!(rev as usize & !ADDR_MASK, 0);
        Edge(rev as usize | index as usize)
    }

    #[inline]
    pub fn to_sub_array(array: *mut SubArray, index: EdgeIndex) -> Edge {
        debug_assert_eq!(array as usize & !ADDR_MASK, 0);
        Edge(array as usize | SUBARRAY_FLAG | index as usize)
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 & ADDR_MASK == 0
    }

    #[inline]
    pub fn index(self) -> EdgeIndex {
        (self.0 & INDEX_MASK) as EdgeIndex
    }

    #[inline]
    pub fn is_sub_array(self) -> bool {
        self.0 & SUBARRAY_FLAG != 0
    }

    #[inline]
    pub fn as_sub_array(self) -> Option<*mut SubArray> {
        if self.is_sub_array() && !self.is_null() {
            Some((self.0 & ADDR_MASK) as *mut SubArray)
        } else {
            None
        }
    }

    #[inline]
    pub fn as_revision(self) -> Option<*mut Revision> {
        if !self.is_sub_array() && !self.is_null() {
            Some((self.0 & ADDR_MASK) as *mut Revision)
        } else {
            None
        }
    }

    /// The revision this edge leads to: directly, or through the
    /// sub-array's owner.
    pub fn target(self) -> *mut Revision {
        if let Some(array) = self.as_sub_array() {
            unsafe { (*array).owner }
        } else {
            self.as_revision().unwrap_or(std::ptr::null_mut())
        }
    }

    #[inline]
    pub fn bits(self) -> usize {
        self.0
    }

    #[inline]
    pub fn from_bits(bits: usize) -> Edge {
        Edge(bits)
    }
}

impl Default for Edge {
    fn default() -> Edge {
        Edge::null()
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "Edge(null)")
        } else if self.is_sub_array() {
            write!(
                f,
                "Edge(subarray {:#x}[{}])",
                self.0 & ADDR_MASK,
                self.index()
            )
        } else {
            write!(f, "Edge(rev {:#x}[{}])", self.0 & ADDR_MASK, self.index())
        }
    }
}

/// An input edge: from a revision to the place in the input's
/// subscription set where the reverse up edge lives.
pub type DownEdge = Edge;

/// A subscriber edge: from a revision to the slot in the subscriber's
/// trace holding the reverse down edge.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct UpEdge(Edge);

impl UpEdge {
    #[inline]
    pub fn new(subscriber: *mut Revision, trace_slot: EdgeIndex) -> UpEdge {
        UpEdge(Edge::to_revision(subscriber, trace_slot))
    }

    #[inline]
    pub const fn null() -> UpEdge {
        UpEdge(Edge::null())
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// The subscriber revision.
    #[inline]
    pub fn subscriber(self) -> *mut Revision {
        debug_assert!(!self.0.is_sub_array());
        self.0.target()
    }

    /// The slot in the subscriber's trace holding the reverse down edge.
    #[inline]
    pub fn trace_slot(self) -> EdgeIndex {
        self.0.index()
    }

    #[inline]
    pub fn as_edge(self) -> Edge {
        self.0
    }

    #[inline]
    pub fn from_edge(edge: Edge) -> UpEdge {
        debug_assert!(!edge.is_sub_array());
        UpEdge(edge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_edge() {
        let edge = Edge::null();
        assert!(edge.is_null());
        assert!(edge.as_revision().is_none());
        assert!(edge.as_sub_array().is_none());
    }

    #[test]
    fn test_revision_edge_roundtrip() {
        let fake_rev = 0x4000 as *mut Revision;
        let edge = Edge::to_revision(fake_rev, 17);
        assert!(!edge.is_sub_array());
        assert_eq!(edge.as_revision(), Some(fake_rev));
        assert_eq!(edge.index(), 17);
        assert_eq!(edge.target(), fake_rev);
    }

    #[test]
    fn test_sub_array_flag_does_not_clobber_index() {
        let fake_array = 0x8000 as *mut SubArray;
        let edge = Edge::to_sub_array(fake_array, 5);
        assert!(edge.is_sub_array());
        assert_eq!(edge.as_sub_array(), Some(fake_array));
        assert_eq!(edge.index(), 5);
        assert!(edge.as_revision().is_none());
    }

    #[test]
    fn test_up_edge_accessors() {
        let fake_rev = 0x1_0040 as *mut Revision;
        let up = UpEdge::new(fake_rev, 9);
        assert_eq!(up.subscriber(), fake_rev);
        assert_eq!(up.trace_slot(), 9);
    }
}
