//! MemoValue - the tagged union a revision caches
//!
//! Holds either a real language value (interned object, exception,
//! string, scalar, null, fake pointer) or internal bookkeeping: a
//! [`Context`] marking an in-flight computation (a *placeholder*), or an
//! invalidation watcher waiting for its one-shot notification.
//!
//! Object-carrying variants own one reference on the interned object;
//! clone increfs and drop defers the decref through the lock manager.

use super::context::Context;
use super::watcher::WatcherRef;
use crate::object::{IObj, IObjOrFake};

/// A memoized value.
#[derive(Debug, Default)]
pub enum MemoValue {
    /// No known value.
    #[default]
    Undef,

    /// Computation in flight; the context owns the placeholder revision.
    Context(*mut Context),

    /// A watcher waiting for an invalidation notification.
    Watcher(WatcherRef),

    /// A normally returned interned object (one refcount held).
    Object(IObj),

    /// A thrown interned exception object (one refcount held).
    Exception(IObj),

    /// An interned long string (one refcount held).
    LongString(IObj),

    /// The null value.
    Null,

    /// An IEEE double.
    Double(f64),

    /// An int64 (or smaller integer scalar).
    Int64(i64),

    /// Bits of a short string.
    ShortString(i64),

    /// Bits of a fake pointer.
    FakePtr(i64),
}

// Values travel between processes (and threads) under the runtime's
// locking discipline; the raw context pointer is only dereferenced under
// the owning invocation's lock.
unsafe impl Send for MemoValue {}

impl MemoValue {
    /// Take ownership of one reference to an interned object.
    pub fn from_iobj(obj: IObj) -> MemoValue {
        MemoValue::Object(obj)
    }

    /// Wrap a pointer-or-fake word, taking ownership of one reference if
    /// it is a pointer.
    pub fn from_iobj_or_fake(value: IObjOrFake) -> MemoValue {
        if let Some(obj) = value.ptr() {
            MemoValue::Object(obj)
        } else if value.is_null() {
            MemoValue::Null
        } else {
            MemoValue::FakePtr(value.sbits())
        }
    }

    /// Is this a real language value (not undef or internal bookkeeping)?
    pub fn is_language_value(&self) -> bool {
        !matches!(
            self,
            MemoValue::Undef | MemoValue::Context(_) | MemoValue::Watcher(_)
        )
    }

    /// The in-flight context, if this is a placeholder.
    pub fn as_context(&self) -> Option<*mut Context> {
        match self {
            MemoValue::Context(ctx) => Some(*ctx),
            _ => None,
        }
    }

    /// The interned object, if any variant carries one.
    pub fn as_iobj(&self) -> Option<IObj> {
        match self {
            MemoValue::Object(obj) | MemoValue::Exception(obj) | MemoValue::LongString(obj) => {
                Some(*obj)
            }
            _ => None,
        }
    }

    pub fn as_int64(&self) -> Option<i64> {
        match self {
            MemoValue::Int64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            MemoValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// Is this an exception value?
    pub fn is_exception(&self) -> bool {
        matches!(self, MemoValue::Exception(_))
    }

    /// Reset to `Undef`, releasing any owned reference.
    pub fn reset(&mut self) {
        *self = MemoValue::Undef;
    }

    /// Steal the owned object without adjusting its refcount, leaving
    /// `Undef` behind.
    pub fn detach_iobj(&mut self) -> Option<IObj> {
        let obj = self.as_iobj()?;
        std::mem::forget(std::mem::take(self));
        Some(obj)
    }
}

impl Clone for MemoValue {
    fn clone(&self) -> MemoValue {
        if let Some(obj) = self.as_iobj() {
            obj.incref();
        }
        match self {
            MemoValue::Undef => MemoValue::Undef,
            MemoValue::Context(ctx) => MemoValue::Context(*ctx),
            MemoValue::Watcher(w) => MemoValue::Watcher(w.clone()),
            MemoValue::Object(obj) => MemoValue::Object(*obj),
            MemoValue::Exception(obj) => MemoValue::Exception(*obj),
            MemoValue::LongString(obj) => MemoValue::LongString(*obj),
            MemoValue::Null => MemoValue::Null,
            MemoValue::Double(d) => MemoValue::Double(*d),
            MemoValue::Int64(n) => MemoValue::Int64(*n),
            MemoValue::ShortString(bits) => MemoValue::ShortString(*bits),
            MemoValue::FakePtr(bits) => MemoValue::FakePtr(*bits),
        }
    }
}

impl Drop for MemoValue {
    fn drop(&mut self) {
        if let Some(obj) = self.as_iobj() {
            crate::lock::safe_decref_iobj(obj);
        }
    }
}

impl PartialEq for MemoValue {
    fn eq(&self, other: &MemoValue) -> bool {
        use MemoValue::*;
        match (self, other) {
            (Undef, Undef) | (Null, Null) => true,
            (Context(a), Context(b)) => a == b,
            (Watcher(a), Watcher(b)) => std::sync::Arc::ptr_eq(a, b),
            (Object(a), Object(b))
            | (Exception(a), Exception(b))
            | (LongString(a), LongString(b)) => a.addr() == b.addr(),
            // Bit equality, so NaN == NaN here: two commits of the same
            // NaN bits must elide.
            (Double(a), Double(b)) => a.to_bits() == b.to_bits(),
            (Int64(a), Int64(b)) => a == b,
            (ShortString(a), ShortString(b)) => a == b,
            (FakePtr(a), FakePtr(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_undef() {
        assert!(matches!(MemoValue::default(), MemoValue::Undef));
        assert!(!MemoValue::default().is_language_value());
    }

    #[test]
    fn test_scalar_equality() {
        assert_eq!(MemoValue::Int64(7), MemoValue::Int64(7));
        assert_ne!(MemoValue::Int64(7), MemoValue::Int64(8));
        assert_ne!(MemoValue::Int64(0), MemoValue::Null);
        assert_eq!(
            MemoValue::Double(f64::NAN),
            MemoValue::Double(f64::NAN),
            "bit equality treats identical NaNs as equal"
        );
    }

    #[test]
    fn test_language_value_classification() {
        assert!(MemoValue::Null.is_language_value());
        assert!(MemoValue::Int64(0).is_language_value());
        assert!(!MemoValue::Context(std::ptr::null_mut()).is_language_value());
    }
}
