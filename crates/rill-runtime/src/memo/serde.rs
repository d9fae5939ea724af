//! Memo-cache persistence
//!
//! Serializes the interned heap and the memoized values of invocations to
//! a flat file, and restores them at startup. Layout:
//!
//! ```text
//! u64 version (0)
//! u64 build hash
//! u64 interned-object count
//! u64 invocation count
//! tagged records ...
//! u8  0 (end tag)
//! ```
//!
//! Record tags: 1 = class, 2 = long string, 3 = array, 4 = invocation
//! (payload + memo value + dependency ids), 5 = regex (recognized but not
//! produced by this runtime). References inside payloads are 1-based
//! indices into the objects table; non-positive words are fake pointers
//! copied verbatim. Vtable ids are offsets from a reference vtable so the
//! file tolerates address-space layout randomization; id -1 names the
//! built-in cell-invocation vtable and -2 the regex vtable.
//!
//! Any malformed input rejects the whole cache with a deserialization
//! error; execution proceeds with an empty cache. Restored values are
//! installed through a [`FakeCaller`]-guarded path as permanently-active
//! revisions; the build hash ties the file to the inputs it was computed
//! from.

use super::caller::FakeCaller;
use super::invocation::{install_initial_revision, lock_invocation, Invocation};
use super::value::MemoValue;
use super::TxnId;
use crate::error::{Result, RuntimeError};
use crate::intern;
use crate::object::{IObj, IObjOrFake, ObjectKind, VTableRef, WORD_SIZE};
use rustc_hash::FxHashMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::io::{Read, Write};

const FORMAT_VERSION: u64 = 0;

const TAG_CLASS: u8 = 1;
const TAG_LONG_STRING: u8 = 2;
const TAG_ARRAY: u8 = 3;
const TAG_INVOCATION: u8 = 4;
const TAG_REGEX: u8 = 5;
const TAG_END: u8 = 0;

const VTABLE_ID_CELL: i64 = -1;
const VTABLE_ID_REGEX: i64 = -2;

// Memo-value subtags inside invocation records.
const VALUE_UNDEF: u8 = 0;
const VALUE_NULL: u8 = 1;
const VALUE_INT64: u8 = 2;
const VALUE_DOUBLE: u8 = 3;
const VALUE_SHORT_STRING: u8 = 4;
const VALUE_FAKE_PTR: u8 = 5;
const VALUE_OBJECT: u8 = 6;
const VALUE_EXCEPTION: u8 = 7;
const VALUE_LONG_STRING: u8 = 8;

fn build_hash() -> u64 {
    let mut hasher = ahash::RandomState::with_seeds(7, 7, 7, 7).build_hasher();
    crate::VERSION.hash(&mut hasher);
    hasher.finish()
}

fn reference_vtable() -> VTableRef {
    crate::string::string_type().frozen_vtable()
}

fn vtable_id(vtable: VTableRef) -> i64 {
    if std::ptr::eq(vtable.type_(), super::cell::cell_type()) {
        return VTABLE_ID_CELL;
    }
    vtable.bits() as i64 - reference_vtable().bits() as i64
}

fn vtable_from_id(id: i64, offset: u64) -> Result<VTableRef> {
    match id {
        VTABLE_ID_CELL => Ok(super::cell::cell_type().frozen_vtable()),
        VTABLE_ID_REGEX => Err(RuntimeError::Deserialization {
            offset,
            reason: "regex records are not supported by this runtime".into(),
        }),
        _ => {
            let bits = (reference_vtable().bits() as i64).wrapping_add(id);
            if bits <= 0 || bits % WORD_SIZE as i64 != 0 {
                return Err(RuntimeError::Deserialization {
                    offset,
                    reason: format!("vtable id {} resolves outside the vtable space", id),
                });
            }
            Ok(VTableRef::from_bits(bits as usize))
        }
    }
}

// ----------------------------------------------------------------------
// Writer

struct CacheWriter<'a, W: Write> {
    out: &'a mut W,
}

impl<W: Write> CacheWriter<'_, W> {
    fn u8(&mut self, value: u8) -> Result<()> {
        self.bytes(&[value])
    }

    fn u32(&mut self, value: u32) -> Result<()> {
        self.bytes(&value.to_le_bytes())
    }

    fn u64(&mut self, value: u64) -> Result<()> {
        self.bytes(&value.to_le_bytes())
    }

    fn i64(&mut self, value: i64) -> Result<()> {
        self.bytes(&value.to_le_bytes())
    }

    fn bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.out
            .write_all(bytes)
            .map_err(|err| RuntimeError::Runtime(format!("memo cache write failed: {}", err)))
    }
}

/// Serialize the memo cache as of `txn`.
pub fn serialize_memo_cache(out: &mut impl Write, txn: TxnId) -> Result<()> {
    let objects = intern::snapshot();
    let mut index_of: FxHashMap<usize, u64> = FxHashMap::default();
    for (position, obj) in objects.iter().enumerate() {
        index_of.insert(obj.addr(), position as u64 + 1);
    }
    let invocation_count = objects
        .iter()
        .filter(|obj| obj.type_().kind() == ObjectKind::Invocation)
        .count() as u64;

    let mut writer = CacheWriter { out };
    writer.u64(FORMAT_VERSION)?;
    writer.u64(build_hash())?;
    writer.u64(objects.len() as u64)?;
    writer.u64(invocation_count)?;

    let mut result = Ok(());
    for obj in objects.iter() {
        result = write_object(&mut writer, *obj, &index_of, txn);
        if result.is_err() {
            break;
        }
    }
    if result.is_ok() {
        result = writer.u8(TAG_END);
    }
    // Release the snapshot pins whether or not the write succeeded.
    for obj in objects.iter() {
        crate::lock::safe_decref_iobj(*obj);
    }
    result?;
    log::debug!(
        "memo cache serialized: {} objects ({} invocations) at txn {}",
        objects.len(),
        invocation_count,
        txn
    );
    Ok(())
}

fn encode_word(word: usize, index_of: &FxHashMap<usize, u64>) -> u64 {
    let value = IObjOrFake::from_bits(word);
    if value.is_ptr() {
        // A reference slot must point at a serialized object.
        index_of.get(&word).copied().unwrap_or(0)
    } else {
        word as u64
    }
}

fn write_payload(
    writer: &mut CacheWriter<'_, impl Write>,
    obj: IObj,
    index_of: &FxHashMap<usize, u64>,
) -> Result<()> {
    let words = obj.payload_words();
    let mask = obj.type_().ref_mask();
    let mut ref_slots = vec![false; words];
    mask.for_each_ref(crate::object::STRIPE_COLLECT, words, |offset| {
        ref_slots[offset / WORD_SIZE] = true;
    });
    for slot in 0..words {
        let word = unsafe { *((obj.addr() + slot * WORD_SIZE) as *const usize) };
        if ref_slots[slot] {
            writer.u64(encode_word(word, index_of))?;
        } else {
            writer.u64(word as u64)?;
        }
    }
    Ok(())
}

fn write_object(
    writer: &mut CacheWriter<'_, impl Write>,
    obj: IObj,
    index_of: &FxHashMap<usize, u64>,
    txn: TxnId,
) -> Result<()> {
    let type_ = obj.type_();
    match type_.kind() {
        ObjectKind::String => {
            writer.u8(TAG_LONG_STRING)?;
            let size = (obj.size_word() as u32) as usize;
            writer.u32(size as u32)?;
            let bytes = unsafe { std::slice::from_raw_parts(obj.payload_ptr() as *const u8, size) };
            writer.bytes(bytes)
        }
        ObjectKind::Array => {
            writer.u8(TAG_ARRAY)?;
            writer.i64(vtable_id(obj.vtable()))?;
            writer.u32(obj.array_len() as u32)?;
            write_payload(writer, obj, index_of)
        }
        ObjectKind::Invocation => {
            writer.u8(TAG_INVOCATION)?;
            writer.i64(vtable_id(obj.vtable()))?;
            write_payload(writer, obj, index_of)?;

            let inv = Invocation::from_iobj(obj);
            let (value, deps) = {
                let guard = lock_invocation(inv);
                let mut value = MemoValue::Undef;
                let mut deps: Vec<u64> = Vec::new();
                let head = guard.invocation().head_lck();
                if !head.is_null() {
                    let rev = unsafe { &*head };
                    if rev.contains_lck(txn) && rev.value_lck().is_language_value() {
                        value = rev.value_clone_lck();
                        rev.trace_lck().for_each(|_, edge| {
                            if edge.is_null() {
                                return;
                            }
                            let target = unsafe { &*edge.target() };
                            if let Some(owner) = target.owner_lck() {
                                if let Some(&index) = index_of.get(&owner.as_iobj().addr()) {
                                    deps.push(index);
                                }
                            }
                        });
                    }
                }
                (value, deps)
            };

            write_memo_value(writer, &value, index_of)?;
            writer.u64(deps.len() as u64)?;
            for dep in deps {
                writer.u64(dep)?;
            }
            Ok(())
        }
        ObjectKind::Class | ObjectKind::CycleHandle => {
            writer.u8(TAG_CLASS)?;
            writer.i64(vtable_id(obj.vtable()))?;
            write_payload(writer, obj, index_of)
        }
    }
}

fn write_memo_value(
    writer: &mut CacheWriter<'_, impl Write>,
    value: &MemoValue,
    index_of: &FxHashMap<usize, u64>,
) -> Result<()> {
    match value {
        MemoValue::Null => {
            writer.u8(VALUE_NULL)?;
            writer.u64(0)
        }
        MemoValue::Int64(n) => {
            writer.u8(VALUE_INT64)?;
            writer.i64(*n)
        }
        MemoValue::Double(d) => {
            writer.u8(VALUE_DOUBLE)?;
            writer.u64(d.to_bits())
        }
        MemoValue::ShortString(bits) => {
            writer.u8(VALUE_SHORT_STRING)?;
            writer.i64(*bits)
        }
        MemoValue::FakePtr(bits) => {
            writer.u8(VALUE_FAKE_PTR)?;
            writer.i64(*bits)
        }
        MemoValue::Object(obj) => {
            writer.u8(VALUE_OBJECT)?;
            writer.u64(index_of.get(&obj.addr()).copied().unwrap_or(0))
        }
        MemoValue::Exception(obj) => {
            writer.u8(VALUE_EXCEPTION)?;
            writer.u64(index_of.get(&obj.addr()).copied().unwrap_or(0))
        }
        MemoValue::LongString(obj) => {
            writer.u8(VALUE_LONG_STRING)?;
            writer.u64(index_of.get(&obj.addr()).copied().unwrap_or(0))
        }
        _ => {
            writer.u8(VALUE_UNDEF)?;
            writer.u64(0)
        }
    }
}

// ----------------------------------------------------------------------
// Reader

struct CacheReader<'a, R: Read> {
    input: &'a mut R,
    offset: u64,
}

impl<R: Read> CacheReader<'_, R> {
    fn fail<T>(&self, reason: impl Into<String>) -> Result<T> {
        Err(RuntimeError::Deserialization {
            offset: self.offset,
            reason: reason.into(),
        })
    }

    fn bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        match self.input.read_exact(&mut buffer) {
            Ok(()) => {
                self.offset += len as u64;
                Ok(buffer)
            }
            Err(err) => self.fail(format!("short read: {}", err)),
        }
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("four bytes")))
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self.bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("eight bytes")))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }
}

enum RecordValue {
    Scalar(u8, i64),
    Indexed(u8, u64),
}

struct ObjectRecord {
    vtable: Option<VTableRef>,
    string_bytes: Option<Vec<u8>>,
    array_len: Option<u32>,
    payload: Vec<u64>,
    memo_value: Option<RecordValue>,
    deps: Vec<u64>,
}

/// Restore a memo cache. On any error the partially read state is
/// discarded and the runtime continues with an empty cache.
pub fn deserialize_memo_cache(input: &mut impl Read) -> Result<usize> {
    let mut reader = CacheReader { input, offset: 0 };

    if reader.u64()? != FORMAT_VERSION {
        return reader.fail("unsupported memo cache version");
    }
    if reader.u64()? != build_hash() {
        return reader.fail("memo cache was produced by a different build");
    }
    let object_count = reader.u64()? as usize;
    let invocation_count = reader.u64()? as usize;
    if object_count > (1 << 32) {
        return reader.fail("implausible object count");
    }

    let mut records = Vec::with_capacity(object_count);
    for _ in 0..object_count {
        records.push(read_record(&mut reader)?);
    }
    if reader.u8()? != TAG_END {
        return reader.fail("missing end tag");
    }
    let seen_invocations = records
        .iter()
        .filter(|record| {
            record
                .vtable
                .map(|v| v.type_().kind() == ObjectKind::Invocation)
                .unwrap_or(false)
        })
        .count();
    if seen_invocations != invocation_count {
        return reader.fail("invocation count mismatch");
    }

    install_records(records, &mut reader)
}

fn read_record(reader: &mut CacheReader<'_, impl Read>) -> Result<ObjectRecord> {
    let tag = reader.u8()?;
    let mut record = ObjectRecord {
        vtable: None,
        string_bytes: None,
        array_len: None,
        payload: Vec::new(),
        memo_value: None,
        deps: Vec::new(),
    };
    match tag {
        TAG_LONG_STRING => {
            let size = reader.u32()? as usize;
            if size > (1 << 30) {
                return reader.fail("implausible string size");
            }
            record.string_bytes = Some(reader.bytes(size)?);
        }
        TAG_CLASS | TAG_ARRAY | TAG_INVOCATION => {
            let offset = reader.offset;
            let vtable = vtable_from_id(reader.i64()?, offset)?;
            let type_ = vtable.type_();
            let payload_words = match tag {
                TAG_ARRAY => {
                    if type_.kind() != ObjectKind::Array {
                        return reader.fail("array record with non-array vtable");
                    }
                    let len = reader.u32()?;
                    record.array_len = Some(len);
                    type_.user_byte_size() / WORD_SIZE * len as usize
                }
                _ => {
                    if matches!(type_.kind(), ObjectKind::Array | ObjectKind::String) {
                        return reader.fail("record tag does not match vtable kind");
                    }
                    type_.user_byte_size() / WORD_SIZE
                }
            };
            record.vtable = Some(vtable);
            for _ in 0..payload_words {
                record.payload.push(reader.u64()?);
            }
            if tag == TAG_INVOCATION {
                if type_.kind() != ObjectKind::Invocation {
                    return reader.fail("invocation record with non-invocation vtable");
                }
                let subtag = reader.u8()?;
                record.memo_value = Some(match subtag {
                    VALUE_OBJECT | VALUE_EXCEPTION | VALUE_LONG_STRING => {
                        RecordValue::Indexed(subtag, reader.u64()?)
                    }
                    VALUE_UNDEF | VALUE_NULL | VALUE_INT64 | VALUE_DOUBLE
                    | VALUE_SHORT_STRING | VALUE_FAKE_PTR => {
                        RecordValue::Scalar(subtag, reader.i64()?)
                    }
                    _ => return reader.fail("unknown memo value subtag"),
                });
                let dep_count = reader.u64()? as usize;
                if dep_count > (1 << 24) {
                    return reader.fail("implausible dependency count");
                }
                for _ in 0..dep_count {
                    record.deps.push(reader.u64()?);
                }
            }
        }
        TAG_REGEX => {
            return reader.fail("regex records are not supported by this runtime");
        }
        _ => return reader.fail(format!("unknown record tag {}", tag)),
    }
    Ok(record)
}

fn install_records(
    records: Vec<ObjectRecord>,
    reader: &mut CacheReader<'_, impl Read>,
) -> Result<usize> {
    // Pass 1: materialize every object with raw payloads in place.
    let mut objects: Vec<IObj> = Vec::with_capacity(records.len());
    for record in records.iter() {
        let obj = match &record.string_bytes {
            Some(bytes) => intern::materialize_string(bytes)?,
            None => {
                let vtable = record.vtable.expect("non-string record carries a vtable");
                intern::materialize_raw(vtable, record.array_len, &record.payload)?
            }
        };
        objects.push(obj);
    }

    // Pass 2: patch reference slots from indices to addresses; each slot
    // takes one reference on its target.
    for (record, obj) in records.iter().zip(objects.iter()) {
        if record.string_bytes.is_some() {
            continue;
        }
        let mask = obj.type_().ref_mask();
        let words = obj.payload_words();
        let mut bad_index = false;
        mask.for_each_ref(crate::object::STRIPE_COLLECT, words, |offset| {
            let slot = (obj.addr() + offset) as *mut usize;
            let stored = unsafe { *slot } as u64;
            if stored as i64 <= 0 {
                // Fake pointer or null, copied verbatim.
                return;
            }
            match objects.get(stored as usize - 1) {
                Some(target) => {
                    target.incref();
                    unsafe { *slot = target.addr() };
                }
                None => bad_index = true,
            }
        });
        if bad_index {
            return reader.fail("reference index out of bounds");
        }
    }

    // Pass 3: publish into the intern table and run initialize hooks.
    for obj in objects.iter() {
        intern::install_materialized(*obj);
    }

    // Pass 4: install memoized values as permanently-active revisions,
    // then drive each through a FakeCaller to prove it is servable (the
    // fake asserts the machinery neither suspends nor retries here).
    let mut installed = 0usize;
    for (record, obj) in records.iter().zip(objects.iter()) {
        let Some(encoded) = &record.memo_value else {
            continue;
        };
        let value = decode_memo_value(encoded, &objects, reader)?;
        if value.is_language_value() {
            let inv = Invocation::from_iobj(*obj);
            install_initial_revision(inv, value);
            super::invocation::evaluate(*obj, FakeCaller::new(1));
            installed += 1;
        }
    }

    // Pass 5: drop the installer references; anything unreferenced
    // finalizes right here.
    for obj in objects {
        crate::lock::safe_decref_iobj(obj);
    }

    log::debug!("memo cache restored: {} memoized values", installed);
    Ok(installed)
}

fn decode_memo_value(
    encoded: &RecordValue,
    objects: &[IObj],
    reader: &mut CacheReader<'_, impl Read>,
) -> Result<MemoValue> {
    Ok(match *encoded {
        RecordValue::Scalar(VALUE_NULL, _) => MemoValue::Null,
        RecordValue::Scalar(VALUE_INT64, n) => MemoValue::Int64(n),
        RecordValue::Scalar(VALUE_DOUBLE, bits) => MemoValue::Double(f64::from_bits(bits as u64)),
        RecordValue::Scalar(VALUE_SHORT_STRING, bits) => MemoValue::ShortString(bits),
        RecordValue::Scalar(VALUE_FAKE_PTR, bits) => MemoValue::FakePtr(bits),
        RecordValue::Scalar(_, _) => MemoValue::Undef,
        RecordValue::Indexed(subtag, index) => {
            if index == 0 {
                return reader.fail("memo value references an unserialized object");
            }
            let target = match objects.get(index as usize - 1) {
                Some(target) => *target,
                None => return reader.fail("memo value index out of bounds"),
            };
            target.incref();
            match subtag {
                VALUE_EXCEPTION => MemoValue::Exception(target),
                VALUE_LONG_STRING => MemoValue::LongString(target),
                _ => MemoValue::Object(target),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_wrong_version() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&99u64.to_le_bytes());
        bytes.extend_from_slice(&build_hash().to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.push(TAG_END);
        let err = deserialize_memo_cache(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, RuntimeError::Deserialization { .. }));
    }

    #[test]
    fn test_rejects_wrong_build_hash() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&0xdead_beefu64.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.push(TAG_END);
        assert!(deserialize_memo_cache(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_rejects_truncated_file() {
        let bytes = FORMAT_VERSION.to_le_bytes().to_vec();
        assert!(deserialize_memo_cache(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_empty_cache_roundtrip_shape() {
        // An empty, well-formed cache parses cleanly.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&build_hash().to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.push(TAG_END);
        assert_eq!(deserialize_memo_cache(&mut bytes.as_slice()).unwrap(), 0);
    }

    #[test]
    fn test_rejects_regex_record() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&build_hash().to_le_bytes());
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.push(TAG_REGEX);
        let err = deserialize_memo_cache(&mut bytes.as_slice()).unwrap_err();
        match err {
            RuntimeError::Deserialization { reason, .. } => {
                assert!(reason.contains("regex"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
