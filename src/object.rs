//! Object headers, storage classes, and the positional value table (spec
//! §3, §4.9).

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::address::UniqueAddress;
use crate::error::{Error, Result};

/// Tagged-union discriminator for a stored value (spec §3). `Undefined` is
/// both the "no class" catalogue sentinel and the fallback for an
/// unrecognized on-disk discriminator (SPEC_FULL.md Open Question #2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum StorageClass {
    Int64 = 0,
    Int32 = 1,
    Float64 = 2,
    Decimal = 3,
    Bool = 4,
    PooledString = 5,
    Bytes = 6,
    DateTime = 7,
    DateTimeTz = 8,
    Date = 9,
    Time = 10,
    EnumValue = 11,
    List = 12,
    Tuple = 13,
    Dict = 14,
    Set = 15,
    Block = 16,
    DataFrame = 17,
    ByteArray = 18,
    Class = 19,
    Tag = 20,
    Undefined = 21,
}

impl StorageClass {
    pub fn from_u8(tag: u8) -> Self {
        match tag {
            0 => Self::Int64,
            1 => Self::Int32,
            2 => Self::Float64,
            3 => Self::Decimal,
            4 => Self::Bool,
            5 => Self::PooledString,
            6 => Self::Bytes,
            7 => Self::DateTime,
            8 => Self::DateTimeTz,
            9 => Self::Date,
            10 => Self::Time,
            11 => Self::EnumValue,
            12 => Self::List,
            13 => Self::Tuple,
            14 => Self::Dict,
            15 => Self::Set,
            16 => Self::Block,
            17 => Self::DataFrame,
            18 => Self::ByteArray,
            19 => Self::Class,
            20 => Self::Tag,
            _ => Self::Undefined,
        }
    }
}

/// A scalar or reference value tagged with its [`StorageClass`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int64(i64),
    Float64(f64),
    Bool(bool),
    PooledString(String),
    Bytes(Vec<u8>),
    Address(UniqueAddress),
    Undefined,
}

impl Value {
    pub fn storage_class(&self) -> StorageClass {
        match self {
            Value::Int64(_) => StorageClass::Int64,
            Value::Float64(_) => StorageClass::Float64,
            Value::Bool(_) => StorageClass::Bool,
            Value::PooledString(_) => StorageClass::PooledString,
            Value::Bytes(_) => StorageClass::Bytes,
            Value::Address(_) => StorageClass::Tag,
            Value::Undefined => StorageClass::Undefined,
        }
    }
}

/// Encode a value's tag byte plus its little-endian payload, for the on-disk
/// overlaid record (spec §3, §4.5/§4.9's `measure`/`write`/`parse` contract).
pub(crate) fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int64(v) => {
            out.push(0);
            out.write_i64::<LittleEndian>(*v).unwrap();
        }
        Value::Float64(v) => {
            out.push(1);
            out.write_f64::<LittleEndian>(*v).unwrap();
        }
        Value::Bool(v) => {
            out.push(2);
            out.push(*v as u8);
        }
        Value::PooledString(s) => {
            out.push(3);
            let bytes = s.as_bytes();
            out.write_u32::<LittleEndian>(bytes.len() as u32).unwrap();
            out.extend_from_slice(bytes);
        }
        Value::Bytes(b) => {
            out.push(4);
            out.write_u32::<LittleEndian>(b.len() as u32).unwrap();
            out.extend_from_slice(b);
        }
        Value::Address(a) => {
            out.push(5);
            out.write_u64::<LittleEndian>(a.value()).unwrap();
        }
        Value::Undefined => out.push(6),
    }
}

fn truncated_value() -> Error {
    Error::Internal("truncated value in stored object record")
}

/// Decode a value written by [`encode_value`].
pub(crate) fn decode_value(cur: &mut Cursor<&[u8]>) -> Result<Value> {
    let tag = cur.read_u8().map_err(|_| truncated_value())?;
    Ok(match tag {
        0 => Value::Int64(cur.read_i64::<LittleEndian>().map_err(|_| truncated_value())?),
        1 => Value::Float64(cur.read_f64::<LittleEndian>().map_err(|_| truncated_value())?),
        2 => Value::Bool(cur.read_u8().map_err(|_| truncated_value())? != 0),
        3 => {
            let len = cur.read_u32::<LittleEndian>().map_err(|_| truncated_value())? as usize;
            let mut buf = vec![0u8; len];
            cur.read_exact(&mut buf).map_err(|_| truncated_value())?;
            Value::PooledString(String::from_utf8(buf).map_err(|_| truncated_value())?)
        }
        4 => {
            let len = cur.read_u32::<LittleEndian>().map_err(|_| truncated_value())? as usize;
            let mut buf = vec![0u8; len];
            cur.read_exact(&mut buf).map_err(|_| truncated_value())?;
            Value::Bytes(buf)
        }
        5 => Value::Address(UniqueAddress::from_value(
            cur.read_u64::<LittleEndian>().map_err(|_| truncated_value())?,
        )),
        6 => Value::Undefined,
        _ => return Err(Error::Internal("unrecognized value tag in stored object record")),
    })
}

/// Paired reference counters every managed object carries (spec §3, §4.9).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectHeader {
    pub tag_refs: u32,
    pub obj_refs: u32,
}

impl ObjectHeader {
    pub fn has_refs(&self) -> bool {
        self.tag_refs > 0 || self.obj_refs > 0
    }

    /// Returns `true` if both counters reached zero.
    pub fn inc_ref(&mut self, is_tag: bool) -> Result<()> {
        let counter = if is_tag { &mut self.tag_refs } else { &mut self.obj_refs };
        *counter = counter.checked_add(1).ok_or(Error::Internal("ref count overflow"))?;
        Ok(())
    }

    pub fn dec_ref(&mut self, is_tag: bool) -> Result<bool> {
        let counter = if is_tag { &mut self.tag_refs } else { &mut self.obj_refs };
        *counter = counter.checked_sub(1).ok_or(Error::Internal("ref count underflow"))?;
        Ok(!self.has_refs())
    }
}

/// Dense positional header: the storage class of the first `K` attribute
/// slots (spec §4.9). Slots beyond the dense prefix live in `overflow`.
#[derive(Debug, Clone, Default)]
pub struct PosVt {
    dense: Vec<StorageClass>,
    overflow: BTreeMap<u32, StorageClass>,
}

impl PosVt {
    pub fn new(dense_len: usize) -> Self {
        Self {
            dense: vec![StorageClass::Undefined; dense_len],
            overflow: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, slot: u32, class: StorageClass) {
        if (slot as usize) < self.dense.len() {
            self.dense[slot as usize] = class;
        } else {
            self.overflow.insert(slot, class);
        }
    }

    pub fn get(&self, slot: u32) -> StorageClass {
        if (slot as usize) < self.dense.len() {
            self.dense[slot as usize]
        } else {
            self.overflow.get(&slot).copied().unwrap_or(StorageClass::Undefined)
        }
    }
}

/// The sparse tail of an Object's attributes: slot index -> typed value,
/// for slots beyond the dense [`PosVt`] prefix (spec §4.9).
#[derive(Debug, Clone, Default)]
pub struct XValuesVector {
    values: BTreeMap<u32, Value>,
}

impl XValuesVector {
    pub fn set(&mut self, slot: u32, value: Value) {
        self.values.insert(slot, value);
    }

    pub fn get(&self, slot: u32) -> Option<&Value> {
        self.values.get(&slot)
    }
}

/// Content-addressed interning pool with reference counts (spec §3,
/// `LimitedPool<T>`/`RC_LimitedStringPool`), used for pooled strings and tag
/// values. Keyed by `xxh3` of the content so equal strings always share one
/// slot regardless of insertion order.
#[derive(Default)]
pub struct StringPool {
    entries: Mutex<BTreeMap<u64, (String, u32)>>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(s: &str) -> u64 {
        xxhash_rust::xxh3::xxh3_64(s.as_bytes())
    }

    /// Intern `s`, incrementing its reference count (inserting at count 1 if
    /// this is the first occurrence). Returns the content key.
    pub fn intern(&self, s: &str) -> u64 {
        let key = Self::key(s);
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(key)
            .and_modify(|(_, count)| *count += 1)
            .or_insert_with(|| (s.to_string(), 1));
        key
    }

    pub fn get(&self, key: u64) -> Option<String> {
        self.entries.lock().unwrap().get(&key).map(|(s, _)| s.clone())
    }

    pub fn ref_count(&self, key: u64) -> u32 {
        self.entries.lock().unwrap().get(&key).map(|(_, c)| *c).unwrap_or(0)
    }

    /// Drop one reference, evicting the entry once its count reaches zero.
    /// Errors if `key` isn't present (double release).
    pub fn release(&self, key: u64) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let (_, count) = entries
            .get_mut(&key)
            .ok_or(Error::KeyNotFound("string pool key not interned"))?;
        *count -= 1;
        if *count == 0 {
            entries.remove(&key);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A user-defined type descriptor (spec §3).
#[derive(Debug, Clone)]
pub struct Class {
    pub name: String,
    pub module: String,
    pub type_id: String,
    pub attrs: Vec<String>,
    pub base: Option<UniqueAddress>,
    pub flags: u32,
}

/// `name -> address` registry of declared classes (spec §3).
#[derive(Debug, Clone, Default)]
pub struct ObjectCatalogue {
    by_name: BTreeMap<String, UniqueAddress>,
}

impl ObjectCatalogue {
    pub fn register(&mut self, name: impl Into<String>, addr: UniqueAddress) {
        self.by_name.insert(name.into(), addr);
    }

    pub fn lookup(&self, name: &str) -> Result<UniqueAddress> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::ClassNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inc_then_dec_leaves_header_unchanged() {
        let mut header = ObjectHeader::default();
        header.inc_ref(false).unwrap();
        let became_zero = header.dec_ref(false).unwrap();
        assert!(became_zero);
        assert_eq!(header, ObjectHeader::default());
    }

    #[test]
    fn dropping_last_reference_is_detected_exactly_once() {
        let mut header = ObjectHeader::default();
        header.inc_ref(true).unwrap();
        header.inc_ref(false).unwrap();
        assert!(!header.dec_ref(true).unwrap());
        assert!(header.dec_ref(false).unwrap());
    }

    #[test]
    fn unrecognized_discriminator_falls_back_to_undefined() {
        assert_eq!(StorageClass::from_u8(255), StorageClass::Undefined);
    }

    #[test]
    fn posvt_overflow_slots_round_trip() {
        let mut vt = PosVt::new(4);
        vt.set(2, StorageClass::Int64);
        vt.set(10, StorageClass::Bytes);
        assert_eq!(vt.get(2), StorageClass::Int64);
        assert_eq!(vt.get(10), StorageClass::Bytes);
        assert_eq!(vt.get(3), StorageClass::Undefined);
    }

    #[test]
    fn catalogue_reports_class_not_found() {
        let cat = ObjectCatalogue::default();
        assert!(matches!(cat.lookup("Widget"), Err(Error::ClassNotFound(_))));
    }

    #[test]
    fn every_value_variant_round_trips_through_encode_decode() {
        let values = vec![
            Value::Int64(-7),
            Value::Float64(2.5),
            Value::Bool(true),
            Value::PooledString("hi".to_string()),
            Value::Bytes(vec![1, 2, 3]),
            Value::Address(UniqueAddress::from_value(0x4242)),
            Value::Undefined,
        ];
        for value in values {
            let mut bytes = Vec::new();
            encode_value(&value, &mut bytes);
            let mut cur = std::io::Cursor::new(bytes.as_slice());
            assert_eq!(decode_value(&mut cur).unwrap(), value);
        }
    }

    #[test]
    fn string_pool_shares_equal_content_and_evicts_at_zero_refs() {
        let pool = StringPool::new();
        let a = pool.intern("hello");
        let b = pool.intern("hello");
        assert_eq!(a, b);
        assert_eq!(pool.ref_count(a), 2);

        pool.release(a).unwrap();
        assert_eq!(pool.ref_count(a), 1);
        assert_eq!(pool.get(a).as_deref(), Some("hello"));

        pool.release(a).unwrap();
        assert!(pool.is_empty());
        assert!(pool.release(a).is_err());
    }
}
