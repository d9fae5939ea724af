//! Freeze - deep structural snapshots
//!
//! `freeze` returns a deep copy of an object graph with the frozen bit set
//! on every copy, walking the freeze stripe of each type's reference mask.
//! Already-frozen targets short-circuit: no copy is made and the original
//! pointer is kept, which also makes the operation idempotent. Cycles in
//! the input are reproduced through the working original-to-copy map.
//!
//! Interned objects are canonical and immutable; freezing keeps pointers
//! to them as-is.

use super::Obstack;
use crate::arena::{kind_of, MemoryKind};
use crate::error::Result;
use crate::object::{RObj, RObjOrFake, STRIPE_FREEZE};
use rustc_hash::FxHashMap;

/// Freeze `obj` into this obstack.
pub(super) fn freeze(ob: &mut Obstack, obj: RObjOrFake) -> Result<RObjOrFake> {
    let root = match obj.ptr() {
        Some(root) => root,
        None => return Ok(obj),
    };
    if kind_of(root.addr()) == MemoryKind::IObj || root.is_frozen() {
        return Ok(obj);
    }
    let mut copies = FxHashMap::default();
    let copy = freeze_copy(ob, root, &mut copies)?;
    Ok(RObjOrFake::from_obj(copy))
}

fn freeze_copy(
    ob: &mut Obstack,
    obj: RObj,
    copies: &mut FxHashMap<usize, usize>,
) -> Result<RObj> {
    if let Some(&copy_addr) = copies.get(&obj.addr()) {
        // Back edge: reproduce the cycle.
        return Ok(unsafe { RObj::from_addr(copy_addr) });
    }

    let copy = ob.shallow_clone(obj)?;
    copy.set_vtable(obj.type_().frozen_vtable());
    copies.insert(obj.addr(), copy.addr());

    let mask = obj.type_().ref_mask();
    if !mask.any_refs() {
        return Ok(copy);
    }

    let mut ref_offsets = Vec::new();
    mask.for_each_ref(STRIPE_FREEZE, copy.payload_words(), |offset| {
        ref_offsets.push(offset)
    });

    for offset in ref_offsets {
        let slot = (copy.addr() + offset) as *mut usize;
        let value = RObjOrFake::from_bits(unsafe { *slot });
        let target = match value.ptr() {
            Some(target) => target,
            None => continue,
        };
        if kind_of(target.addr()) == MemoryKind::IObj || target.is_frozen() {
            // Already immutable; share it.
            continue;
        }
        let frozen_target = freeze_copy(ob, target, copies)?;
        unsafe { *slot = frozen_target.addr() };
    }
    Ok(copy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Type;

    fn pair_type() -> &'static Type {
        Type::class_factory("FreezePair", 16, &[0])
    }

    fn read_ref(obj: RObj, offset: usize) -> RObjOrFake {
        RObjOrFake::from_bits(unsafe { *((obj.addr() + offset) as *const usize) })
    }

    fn write_ref(obj: RObj, offset: usize, value: RObjOrFake) {
        unsafe { *((obj.addr() + offset) as *mut usize) = value.bits() };
    }

    #[test]
    fn test_freeze_fake_is_identity() {
        let mut ob = Obstack::new().unwrap();
        let fake = RObjOrFake::from_fake_bits(-9);
        assert_eq!(ob.freeze(fake).unwrap(), fake);
    }

    #[test]
    fn test_freeze_copies_and_marks() {
        let mut ob = Obstack::new().unwrap();
        let obj = ob.alloc_object(pair_type()).unwrap();
        unsafe { *((obj.addr() + 8) as *mut u64) = 77 };

        let frozen = ob.freeze(RObjOrFake::from_obj(obj)).unwrap().unwrap_ptr();
        assert_ne!(frozen.addr(), obj.addr());
        assert!(frozen.is_frozen());
        assert!(!obj.is_frozen());
        assert_eq!(unsafe { *((frozen.addr() + 8) as *const u64) }, 77);
    }

    #[test]
    fn test_freeze_idempotent() {
        let mut ob = Obstack::new().unwrap();
        let obj = ob.alloc_object(pair_type()).unwrap();
        let once = ob.freeze(RObjOrFake::from_obj(obj)).unwrap();
        let twice = ob.freeze(once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_freeze_deep_shares_frozen() {
        let mut ob = Obstack::new().unwrap();
        let inner = ob.alloc_object(pair_type()).unwrap();
        let frozen_inner = ob.freeze(RObjOrFake::from_obj(inner)).unwrap();

        let outer = ob.alloc_object(pair_type()).unwrap();
        write_ref(outer, 0, frozen_inner);

        let frozen_outer = ob.freeze(RObjOrFake::from_obj(outer)).unwrap().unwrap_ptr();
        // The already-frozen inner object was shared, not copied.
        assert_eq!(read_ref(frozen_outer, 0), frozen_inner);
    }

    #[test]
    fn test_freeze_reproduces_cycle() {
        let mut ob = Obstack::new().unwrap();
        let a = ob.alloc_object(pair_type()).unwrap();
        let b = ob.alloc_object(pair_type()).unwrap();
        write_ref(a, 0, RObjOrFake::from_obj(b));
        write_ref(b, 0, RObjOrFake::from_obj(a));

        let frozen_a = ob.freeze(RObjOrFake::from_obj(a)).unwrap().unwrap_ptr();
        let frozen_b = read_ref(frozen_a, 0).unwrap_ptr();
        assert!(frozen_a.is_frozen());
        assert!(frozen_b.is_frozen());
        assert_ne!(frozen_a.addr(), a.addr());
        assert_ne!(frozen_b.addr(), b.addr());
        // The copy's cycle closes back on the copy, not the original.
        assert_eq!(read_ref(frozen_b, 0).unwrap_ptr().addr(), frozen_a.addr());
    }
}
