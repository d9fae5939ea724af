//! Strings - short strings in fake pointers, long strings on the heap
//!
//! A string value is one word. Up to seven bytes pack directly into the
//! word: the payload sits in the low seven bytes and the top five bits
//! hold `length - 8`, sign-extended, so every short string is negative
//! when read as a signed word (a fake pointer) and `sbits > 0` means
//! "pointer to a long string object".
//!
//! Long strings are ordinary runtime objects of the built-in string type:
//! the instance size word packs the byte size with a 32-bit hash whose
//! top bit is always set, and the payload is the raw bytes.

use crate::error::Result;
use crate::memo::MemoValue;
use crate::object::{IObj, RObj, RObjOrFake, Type};
use crate::obstack::Obstack;
use std::cmp::Ordering;
use std::hash::{BuildHasher, Hash, Hasher};

/// Longest string that packs into the word itself.
pub const MAX_SHORT_LENGTH: usize = 7;

/// Arithmetic shift recovering `length - 8` from a short string.
const SHORT_LENGTH_SHIFT: u32 = 59;

/// The long-string hash tag: the hash half of the size word always has
/// this bit set.
const HASH_TAG: u32 = 0x8000_0000;

lazy_static::lazy_static! {
    static ref STRING_TYPE: &'static Type = Type::string_factory("LongString");
    static ref STRING_HASHER: ahash::RandomState =
        ahash::RandomState::with_seeds(0x5111, 0x1115, 0x51_51, 0x15_15);
}

/// The built-in long-string type.
pub fn string_type() -> &'static Type {
    *STRING_TYPE
}

/// A one-word string value: short bits or a long-string pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringValue(i64);

impl StringValue {
    pub const EMPTY: StringValue = StringValue((-8i64) << SHORT_LENGTH_SHIFT);

    #[inline]
    pub fn sbits(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn from_sbits(sbits: i64) -> StringValue {
        StringValue(sbits)
    }

    #[inline]
    pub fn is_long(self) -> bool {
        self.0 > 0
    }

    fn long_obj(self) -> RObj {
        debug_assert!(self.is_long());
        unsafe { RObj::from_addr(self.0 as usize) }
    }
}

fn pack_short(bytes: &[u8]) -> StringValue {
    debug_assert!(bytes.len() <= MAX_SHORT_LENGTH);
    let mut buffer = [0u8; 8];
    buffer[..bytes.len()].copy_from_slice(bytes);
    let data = u64::from_le_bytes(buffer);
    let tag = ((bytes.len() as i64 - 8) << SHORT_LENGTH_SHIFT) as u64;
    StringValue((data | tag) as i64)
}

fn hash32(bytes: &[u8]) -> u32 {
    let mut hasher = STRING_HASHER.build_hasher();
    bytes.hash(&mut hasher);
    (hasher.finish() as u32) | HASH_TAG
}

/// The size word a long-string instance of `bytes` carries (persistence
/// support).
pub(crate) fn long_string_size_word(bytes: &[u8]) -> usize {
    bytes.len() | ((hash32(bytes) as usize) << 32)
}

fn make_long(ob: &mut Obstack, bytes: &[u8]) -> Result<StringValue> {
    debug_assert!(bytes.len() > MAX_SHORT_LENGTH);
    let obj = ob.alloc_string_bytes(string_type(), bytes, long_string_size_word(bytes))?;
    Ok(StringValue(obj.addr() as i64))
}

/// Build a string from raw bytes.
pub fn from_bytes(ob: &mut Obstack, bytes: &[u8]) -> Result<StringValue> {
    if bytes.len() <= MAX_SHORT_LENGTH {
        Ok(pack_short(bytes))
    } else {
        make_long(ob, bytes)
    }
}

/// Build a string from UTF-8 text.
pub fn from_utf8(ob: &mut Obstack, text: &str) -> Result<StringValue> {
    from_bytes(ob, text.as_bytes())
}

/// Build a string from a character sequence.
pub fn from_chars(ob: &mut Obstack, chars: &[char]) -> Result<StringValue> {
    let mut text = String::with_capacity(chars.len() * 4);
    text.extend(chars.iter());
    from_utf8(ob, &text)
}

/// Byte length of a string.
pub fn byte_size(value: StringValue) -> usize {
    if value.is_long() {
        (value.long_obj().size_word() as u32) as usize
    } else {
        ((value.sbits() >> SHORT_LENGTH_SHIFT) + 8) as usize
    }
}

/// Run `f` over the string's bytes.
pub fn with_bytes<R>(value: StringValue, f: impl FnOnce(&[u8]) -> R) -> R {
    if value.is_long() {
        let obj = value.long_obj();
        let size = (obj.size_word() as u32) as usize;
        let bytes = unsafe { std::slice::from_raw_parts(obj.payload_ptr() as *const u8, size) };
        f(bytes)
    } else {
        let buffer = (value.sbits() as u64).to_le_bytes();
        f(&buffer[..byte_size(value)])
    }
}

/// Copy the string's bytes out.
pub fn to_bytes(value: StringValue) -> Vec<u8> {
    with_bytes(value, |bytes| bytes.to_vec())
}

/// Render as owned UTF-8 (lossy on invalid sequences).
pub fn to_string(value: StringValue) -> String {
    with_bytes(value, |bytes| String::from_utf8_lossy(bytes).into_owned())
}

/// One byte, unchecked beyond a debug assertion.
pub fn unsafe_get(value: StringValue, index: usize) -> u8 {
    debug_assert!(index < byte_size(value));
    with_bytes(value, |bytes| bytes[index])
}

/// The 32-bit string hash (tagged for long strings; derived for short).
pub fn hash(value: StringValue) -> u32 {
    if value.is_long() {
        (value.long_obj().size_word() >> 32) as u32
    } else {
        with_bytes(value, hash32)
    }
}

/// Structural equality.
pub fn equal(a: StringValue, b: StringValue) -> bool {
    if !a.is_long() && !b.is_long() {
        return a.sbits() == b.sbits();
    }
    byte_size(a) == byte_size(b) && compare(a, b) == Ordering::Equal
}

/// Bytewise total order.
pub fn compare(a: StringValue, b: StringValue) -> Ordering {
    with_bytes(a, |a_bytes| with_bytes(b, |b_bytes| a_bytes.cmp(b_bytes)))
}

/// Concatenate two strings into `ob`.
pub fn concat(ob: &mut Obstack, a: StringValue, b: StringValue) -> Result<StringValue> {
    concat_n(ob, &[a, b])
}

/// Concatenate any number of strings into `ob`.
pub fn concat_n(ob: &mut Obstack, parts: &[StringValue]) -> Result<StringValue> {
    let total: usize = parts.iter().map(|&part| byte_size(part)).sum();
    let mut bytes = Vec::with_capacity(total);
    for &part in parts {
        with_bytes(part, |part_bytes| bytes.extend_from_slice(part_bytes));
    }
    from_bytes(ob, &bytes)
}

/// Lift a string into a memo value, interning long strings so the cached
/// copy is canonical and obstack-independent.
pub fn to_memo_value(value: StringValue) -> Result<MemoValue> {
    if !value.is_long() {
        return Ok(MemoValue::ShortString(value.sbits()));
    }
    let obj = value.long_obj();
    if crate::arena::kind_of(obj.addr()) == crate::arena::MemoryKind::IObj {
        let iobj = unsafe { IObj::from_addr(obj.addr()) };
        iobj.incref();
        return Ok(MemoValue::LongString(iobj));
    }
    let iobj = crate::intern::intern(obj)?;
    Ok(MemoValue::LongString(iobj))
}

/// Recover a string value from a memo value, if it holds one.
pub fn from_memo_value(value: &MemoValue) -> Option<StringValue> {
    match value {
        MemoValue::ShortString(sbits) => Some(StringValue::from_sbits(*sbits)),
        MemoValue::LongString(iobj) => Some(StringValue(iobj.addr() as i64)),
        _ => None,
    }
}

/// A string value as a pointer-or-fake word (ABI support).
pub fn as_obj_or_fake(value: StringValue) -> RObjOrFake {
    RObjOrFake::from_bits(value.sbits() as usize)
}
