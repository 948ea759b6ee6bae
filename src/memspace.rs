//! Memspace: `(prefix, allocator, uuid)` — the virtual address space
//! v-objects live in (spec §3, §4.5, §4.9).
//!
//! Every allocation's bytes, and the allocator's own directory of slabs and
//! free lists, are written through [`crate::prefix::Prefix`] so a workspace
//! reopened on the same file recovers its whole object graph, not just raw
//! page bytes.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::address::{Address, UniqueAddress};
use crate::alloc::SlotAllocator;
use crate::error::{Error, Result};
use crate::object::{self, ObjectHeader, StorageClass, Value};
use crate::prefix::Prefix;

/// A slot reserved for general object-graph allocations; slot 0 stays
/// reserved by [`SlotAllocator`] and is where the allocator's own directory
/// lives, so the two can never collide.
pub const OBJECT_SLOT: u16 = 1;

/// Logical offset of the directory's 4-byte length prefix, inside slot 0's
/// byte range. Slot 0 is never handed out for object allocation, so this
/// offset is safe to reserve for the allocator's own bookkeeping.
const DIRECTORY_LEN_OFFSET: u64 = 0;
const DIRECTORY_PAYLOAD_OFFSET: u64 = 4;

/// The dynamically-typed payload an overlaid record carries (spec §3, §4.5
/// collections): `List`/`Tuple`/`Set` hold typed items, `Dict` holds packed
/// pairs, `Block` holds a single homogeneous column, `ByteArray` is a raw
/// byte vector, `DataFrame` is a vector of block addresses plus an index.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectKind {
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    Block { class: StorageClass, values: Vec<Value> },
    DataFrame { columns: Vec<UniqueAddress>, index: Vec<Value> },
    ByteArray(Vec<u8>),
}

fn truncated() -> Error {
    Error::Internal("truncated object record")
}

fn encode_values(values: &[Value], out: &mut Vec<u8>) {
    out.write_u32::<LittleEndian>(values.len() as u32).unwrap();
    for v in values {
        object::encode_value(v, out);
    }
}

fn decode_values(cur: &mut Cursor<&[u8]>) -> Result<Vec<Value>> {
    let len = cur.read_u32::<LittleEndian>().map_err(|_| truncated())? as usize;
    (0..len).map(|_| object::decode_value(cur)).collect()
}

/// Encode an [`ObjectKind`]'s tag byte plus its payload.
fn encode_kind(kind: &ObjectKind, out: &mut Vec<u8>) {
    match kind {
        ObjectKind::List(v) => {
            out.push(0);
            encode_values(v, out);
        }
        ObjectKind::Tuple(v) => {
            out.push(1);
            encode_values(v, out);
        }
        ObjectKind::Dict(pairs) => {
            out.push(2);
            out.write_u32::<LittleEndian>(pairs.len() as u32).unwrap();
            for (k, val) in pairs {
                object::encode_value(k, out);
                object::encode_value(val, out);
            }
        }
        ObjectKind::Set(v) => {
            out.push(3);
            encode_values(v, out);
        }
        ObjectKind::Block { class, values } => {
            out.push(4);
            out.push(*class as u8);
            encode_values(values, out);
        }
        ObjectKind::DataFrame { columns, index } => {
            out.push(5);
            out.write_u32::<LittleEndian>(columns.len() as u32).unwrap();
            for c in columns {
                out.write_u64::<LittleEndian>(c.value()).unwrap();
            }
            encode_values(index, out);
        }
        ObjectKind::ByteArray(bytes) => {
            out.push(6);
            out.write_u32::<LittleEndian>(bytes.len() as u32).unwrap();
            out.extend_from_slice(bytes);
        }
    }
}

/// Decode an [`ObjectKind`] written by [`encode_kind`].
fn decode_kind(cur: &mut Cursor<&[u8]>) -> Result<ObjectKind> {
    let tag = cur.read_u8().map_err(|_| truncated())?;
    Ok(match tag {
        0 => ObjectKind::List(decode_values(cur)?),
        1 => ObjectKind::Tuple(decode_values(cur)?),
        2 => {
            let len = cur.read_u32::<LittleEndian>().map_err(|_| truncated())? as usize;
            let mut pairs = Vec::with_capacity(len);
            for _ in 0..len {
                let key = object::decode_value(cur)?;
                let val = object::decode_value(cur)?;
                pairs.push((key, val));
            }
            ObjectKind::Dict(pairs)
        }
        3 => ObjectKind::Set(decode_values(cur)?),
        4 => {
            let class = StorageClass::from_u8(cur.read_u8().map_err(|_| truncated())?);
            ObjectKind::Block { class, values: decode_values(cur)? }
        }
        5 => {
            let n = cur.read_u32::<LittleEndian>().map_err(|_| truncated())? as usize;
            let mut columns = Vec::with_capacity(n);
            for _ in 0..n {
                columns.push(UniqueAddress::from_value(
                    cur.read_u64::<LittleEndian>().map_err(|_| truncated())?,
                ));
            }
            ObjectKind::DataFrame { columns, index: decode_values(cur)? }
        }
        6 => {
            let len = cur.read_u32::<LittleEndian>().map_err(|_| truncated())? as usize;
            let mut buf = vec![0u8; len];
            cur.read_exact(&mut buf).map_err(|_| truncated())?;
            ObjectKind::ByteArray(buf)
        }
        _ => return Err(Error::Internal("unrecognized object kind tag in stored record")),
    })
}

/// Frame a header and kind as `u32 body-length | tag_refs | obj_refs | kind`.
fn encode_record(header: &ObjectHeader, kind: &ObjectKind) -> Vec<u8> {
    let mut body = Vec::new();
    body.write_u32::<LittleEndian>(header.tag_refs).unwrap();
    body.write_u32::<LittleEndian>(header.obj_refs).unwrap();
    encode_kind(kind, &mut body);

    let mut framed = Vec::with_capacity(body.len() + 4);
    framed.write_u32::<LittleEndian>(body.len() as u32).unwrap();
    framed.extend_from_slice(&body);
    framed
}

/// Decode a record written by [`encode_record`] out of a (possibly
/// over-sized, slab-padded) byte buffer.
fn decode_record(bytes: &[u8]) -> Result<(ObjectHeader, ObjectKind)> {
    let mut cur = Cursor::new(bytes);
    let body_len = cur.read_u32::<LittleEndian>().map_err(|_| truncated())? as usize;
    let start = cur.position() as usize;
    let body = bytes.get(start..start + body_len).ok_or_else(truncated)?;

    let mut body_cur = Cursor::new(body);
    let tag_refs = body_cur.read_u32::<LittleEndian>().map_err(|_| truncated())?;
    let obj_refs = body_cur.read_u32::<LittleEndian>().map_err(|_| truncated())?;
    let kind = decode_kind(&mut body_cur)?;
    Ok((ObjectHeader { tag_refs, obj_refs }, kind))
}

fn value_address(v: &Value) -> Option<UniqueAddress> {
    match v {
        Value::Address(a) => Some(*a),
        _ => None,
    }
}

/// Nested addresses a container directly references, so a collector can
/// cascade `decRef` into them when the container itself is freed.
fn nested_addresses(kind: &ObjectKind) -> Vec<UniqueAddress> {
    match kind {
        ObjectKind::List(v) | ObjectKind::Tuple(v) | ObjectKind::Set(v) => {
            v.iter().filter_map(value_address).collect()
        }
        ObjectKind::Dict(pairs) => pairs
            .iter()
            .flat_map(|(k, val)| [value_address(k), value_address(val)])
            .flatten()
            .collect(),
        ObjectKind::Block { values, .. } => values.iter().filter_map(value_address).collect(),
        ObjectKind::DataFrame { columns, index } => {
            let mut out = columns.clone();
            out.extend(index.iter().filter_map(value_address));
            out
        }
        ObjectKind::ByteArray(_) => Vec::new(),
    }
}

/// The virtual address space v-objects live in: a [`SlotAllocator`] whose
/// own directory, and every object's bytes, round-trip through a `Prefix`
/// (spec §3 "Memspace: tuple (prefix, allocator, uuid)").
pub struct Memspace {
    pub uuid: [u8; 16],
    allocator: SlotAllocator,
}

impl Memspace {
    /// Open a memspace over `prefix`, reconstructing the allocator directory
    /// from the prefix's current state if one was already persisted. A fresh
    /// prefix (all pages unwritten) decodes to an empty allocator.
    pub fn open(prefix: &Prefix, uuid: [u8; 16], slot_size: u64) -> Result<Self> {
        let state = prefix.current_state();
        let len_bytes = prefix.read_range(DIRECTORY_LEN_OFFSET, 4, state)?;
        let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
        let payload = if len == 0 {
            Vec::new()
        } else {
            prefix.read_range(DIRECTORY_PAYLOAD_OFFSET, len, state)?
        };
        let allocator = SlotAllocator::decode(slot_size, &payload)?;
        Ok(Self { uuid, allocator })
    }

    fn persist_directory(&self, txn: &mut crate::prefix::Transaction<'_>) -> Result<()> {
        let payload = self.allocator.encode();
        txn.write_range(DIRECTORY_LEN_OFFSET, &(payload.len() as u32).to_le_bytes())?;
        txn.write_range(DIRECTORY_PAYLOAD_OFFSET, &payload)?;
        Ok(())
    }

    /// Allocate a fresh object, writing its encoded record through `prefix`
    /// and returning its process-wide unique address.
    pub fn alloc_object(&self, prefix: &Prefix, kind: ObjectKind) -> Result<UniqueAddress> {
        let framed = encode_record(&ObjectHeader::default(), &kind);
        let addr = self.allocator.alloc(OBJECT_SLOT, framed.len())?;
        let uniq = self.allocator.make_address_unique(OBJECT_SLOT, addr)?;

        let mut txn = prefix.begin_atomic();
        txn.write_range(addr.offset(), &framed)?;
        self.persist_directory(&mut txn)?;
        txn.commit()?;
        Ok(uniq)
    }

    fn read_record(&self, prefix: &Prefix, addr: UniqueAddress) -> Result<(ObjectHeader, ObjectKind)> {
        let capacity = self.allocator.get_alloc_size(OBJECT_SLOT, Address::from(addr))?;
        let bytes = prefix.read_range(addr.offset(), capacity, prefix.current_state())?;
        decode_record(&bytes)
    }

    fn write_record(
        &self,
        prefix: &Prefix,
        addr: UniqueAddress,
        header: &ObjectHeader,
        kind: &ObjectKind,
    ) -> Result<()> {
        let framed = encode_record(header, kind);
        let capacity = self.allocator.get_alloc_size(OBJECT_SLOT, Address::from(addr))?;
        if framed.len() > capacity {
            return Err(Error::Internal("object payload exceeds its allocated capacity"));
        }
        let mut txn = prefix.begin_atomic();
        txn.write_range(addr.offset(), &framed)?;
        txn.commit()?;
        Ok(())
    }

    pub fn with_kind<R>(&self, prefix: &Prefix, addr: UniqueAddress, f: impl FnOnce(&ObjectKind) -> R) -> Result<R> {
        let (_, kind) = self.read_record(prefix, addr)?;
        Ok(f(&kind))
    }

    /// Mutate a v-object's payload in place. The re-encoded record must still
    /// fit the capacity its original allocation was sized for — growing past
    /// it would require relocating the object, which would invalidate every
    /// other object's stored address into it, so this is not supported.
    pub fn with_kind_mut<R>(&self, prefix: &Prefix, addr: UniqueAddress, f: impl FnOnce(&mut ObjectKind) -> R) -> Result<R> {
        let (header, mut kind) = self.read_record(prefix, addr)?;
        let ret = f(&mut kind);
        self.write_record(prefix, addr, &header, &kind)?;
        Ok(ret)
    }

    pub fn header(&self, prefix: &Prefix, addr: UniqueAddress) -> Result<ObjectHeader> {
        let (header, _) = self.read_record(prefix, addr)?;
        Ok(header)
    }

    /// `incRef`/`decRef` (spec §4.9): mutates the header in place and
    /// reports whether the object has just dropped to zero references.
    pub fn change_ref(&self, prefix: &Prefix, addr: UniqueAddress, is_tag: bool, delta: i8) -> Result<bool> {
        let (mut header, kind) = self.read_record(prefix, addr)?;
        let became_zero = if delta > 0 {
            header.inc_ref(is_tag)?;
            false
        } else {
            header.dec_ref(is_tag)?
        };
        self.write_record(prefix, addr, &header, &kind)?;
        Ok(became_zero)
    }

    /// Nested addresses a container directly references, so a collector can
    /// cascade `decRef` into them when the container itself is freed.
    pub fn nested_refs(&self, prefix: &Prefix, addr: UniqueAddress) -> Result<Vec<UniqueAddress>> {
        let (_, kind) = self.read_record(prefix, addr)?;
        Ok(nested_addresses(&kind))
    }

    /// Release `addr`'s storage: free its slab allocation and persist the
    /// updated directory. Double-free surfaces as `KeyNotFound` via the
    /// allocator.
    pub fn free_object(&self, prefix: &Prefix, addr: UniqueAddress) -> Result<()> {
        self.allocator.free(OBJECT_SLOT, Address::from(addr))?;
        let mut txn = prefix.begin_atomic();
        self.persist_directory(&mut txn)?;
        txn.commit()?;
        Ok(())
    }

    pub fn contains(&self, addr: UniqueAddress) -> bool {
        self.allocator.get_alloc_size(OBJECT_SLOT, Address::from(addr)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn open_memspace() -> (Prefix, Memspace) {
        let prefix = Prefix::create_anon(&Config::default()).unwrap();
        let ms = Memspace::open(&prefix, [0; 16], 1 << 20).unwrap();
        (prefix, ms)
    }

    #[test]
    fn alloc_inc_dec_and_free_round_trip() {
        let (prefix, ms) = open_memspace();
        let addr = ms.alloc_object(&prefix, ObjectKind::List(vec![Value::Int64(1)])).unwrap();
        assert!(ms.contains(addr));
        ms.change_ref(&prefix, addr, false, 1).unwrap();
        assert!(ms.header(&prefix, addr).unwrap().has_refs());
        assert!(ms.change_ref(&prefix, addr, false, -1).unwrap());
        ms.free_object(&prefix, addr).unwrap();
        assert!(!ms.contains(addr));
        assert!(ms.free_object(&prefix, addr).is_err());
    }

    #[test]
    fn nested_refs_surface_child_addresses() {
        let (prefix, ms) = open_memspace();
        let child = ms.alloc_object(&prefix, ObjectKind::Tuple(vec![Value::Int64(1)])).unwrap();
        let parent = ms
            .alloc_object(&prefix, ObjectKind::List(vec![Value::Address(child)]))
            .unwrap();
        assert_eq!(ms.nested_refs(&prefix, parent).unwrap(), vec![child]);
    }

    #[test]
    fn with_kind_mut_persists_changes_across_reads() {
        let (prefix, ms) = open_memspace();
        let initial = vec![Value::Int64(1), Value::Int64(2), Value::Int64(3)];
        let addr = ms.alloc_object(&prefix, ObjectKind::List(initial)).unwrap();
        ms.with_kind_mut(&prefix, addr, |kind| {
            if let ObjectKind::List(v) = kind {
                v.push(Value::Int64(4));
            }
        })
        .unwrap();
        ms.with_kind(&prefix, addr, |kind| {
            assert_eq!(
                kind,
                &ObjectKind::List(vec![Value::Int64(1), Value::Int64(2), Value::Int64(3), Value::Int64(4)])
            );
        })
        .unwrap();
    }

    #[test]
    fn growing_past_the_original_size_class_is_rejected() {
        let (prefix, ms) = open_memspace();
        let addr = ms.alloc_object(&prefix, ObjectKind::ByteArray(vec![0; 4])).unwrap();
        let err = ms.with_kind_mut(&prefix, addr, |kind| {
            if let ObjectKind::ByteArray(b) = kind {
                *b = vec![0; 4096];
            }
        });
        assert!(matches!(err, Err(Error::Internal(_))));
    }

    #[test]
    fn reopening_the_same_prefix_recovers_the_object_graph() {
        let prefix = Prefix::create_anon(&Config::default()).unwrap();
        let ms = Memspace::open(&prefix, [0; 16], 1 << 20).unwrap();
        let addr = ms
            .alloc_object(&prefix, ObjectKind::Tuple(vec![Value::Int64(42)]))
            .unwrap();
        ms.change_ref(&prefix, addr, false, 1).unwrap();

        // A fresh `Memspace` over the same prefix (simulating a reopen)
        // must see the same allocator directory and object bytes.
        let reopened = Memspace::open(&prefix, [0; 16], 1 << 20).unwrap();
        assert!(reopened.contains(addr));
        assert!(reopened.header(&prefix, addr).unwrap().has_refs());
        reopened.with_kind(&prefix, addr, |kind| {
            assert_eq!(kind, &ObjectKind::Tuple(vec![Value::Int64(42)]));
        })
        .unwrap();
    }
}
