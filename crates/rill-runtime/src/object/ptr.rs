//! Pointer-or-fake tagged words
//!
//! A pointer-sized value with the top two bits set is a *fake pointer*:
//! an inline payload (short string bits, boxed scalar) rather than a
//! memory address. Interpreted as a signed word, every fake pointer is
//! negative, so the check is one comparison; collectors and interners
//! short-circuit fakes without dereferencing them.

use super::robj::{IObj, RObj};

macro_rules! obj_or_fake_impl {
    ($name:ident, $obj:ident) => {
        /// A word that is null, a real object pointer, or a fake pointer.
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn null() -> Self {
                Self(0)
            }

            #[inline]
            pub fn from_obj(obj: $obj) -> Self {
                Self(obj.addr())
            }

            /// Build a fake pointer from its signed bits (must be
            /// negative).
            #[inline]
            pub fn from_fake_bits(sbits: i64) -> Self {
                debug_assert!(sbits < 0, "fake pointers have the top bits set");
                Self(sbits as usize)
            }

            #[inline]
            pub const fn from_bits(bits: usize) -> Self {
                Self(bits)
            }

            #[inline]
            pub const fn bits(self) -> usize {
                self.0
            }

            /// The bits as a signed word.
            #[inline]
            pub const fn sbits(self) -> i64 {
                self.0 as i64
            }

            #[inline]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            /// Is this an inline payload rather than an address?
            #[inline]
            pub const fn is_fake(self) -> bool {
                self.sbits() < 0
            }

            /// Is this a dereferenceable object pointer?
            #[inline]
            pub const fn is_ptr(self) -> bool {
                self.sbits() > 0
            }

            /// The object, if this holds a real pointer.
            #[inline]
            pub fn ptr(self) -> Option<$obj> {
                if self.is_ptr() {
                    Some(unsafe { $obj::from_addr(self.0) })
                } else {
                    None
                }
            }

            /// The object, asserting this is a real pointer.
            #[inline]
            pub fn unwrap_ptr(self) -> $obj {
                debug_assert!(self.is_ptr());
                unsafe { $obj::from_addr(self.0) }
            }
        }

        impl From<$obj> for $name {
            fn from(obj: $obj) -> Self {
                Self::from_obj(obj)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                if self.is_null() {
                    write!(f, concat!(stringify!($name), "(null)"))
                } else if self.is_fake() {
                    write!(f, concat!(stringify!($name), "(fake {:#x})"), self.0)
                } else {
                    write!(f, concat!(stringify!($name), "({:#x})"), self.0)
                }
            }
        }
    };
}

obj_or_fake_impl!(RObjOrFake, RObj);
obj_or_fake_impl!(IObjOrFake, IObj);

/// Either flavor, for generic reference-slot walking.
pub type ObjOrFake = RObjOrFake;

impl RObjOrFake {
    /// Reinterpret as the interned flavor (used after interning replaces
    /// the pointee).
    #[inline]
    pub fn as_iobj_or_fake(self) -> IObjOrFake {
        IObjOrFake::from_bits(self.0)
    }
}

impl IObjOrFake {
    #[inline]
    pub fn as_robj_or_fake(self) -> RObjOrFake {
        RObjOrFake::from_bits(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null() {
        let p = RObjOrFake::null();
        assert!(p.is_null());
        assert!(!p.is_fake());
        assert!(!p.is_ptr());
        assert!(p.ptr().is_none());
    }

    #[test]
    fn test_fake_bits() {
        let p = RObjOrFake::from_fake_bits(-42);
        assert!(p.is_fake());
        assert!(!p.is_ptr());
        assert_eq!(p.sbits(), -42);
        assert!(p.ptr().is_none());
    }

    #[test]
    fn test_real_pointer() {
        let obj = unsafe { RObj::from_addr(0x4000) };
        let p = RObjOrFake::from_obj(obj);
        assert!(p.is_ptr());
        assert!(!p.is_fake());
        assert_eq!(p.ptr().unwrap().addr(), 0x4000);
    }
}
