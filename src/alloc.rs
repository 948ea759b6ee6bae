//! Slab, slot, and bitset allocators (spec §4.4).

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::address::{Address, UniqueAddress};
use crate::error::{Error, Result};

fn truncated() -> Error {
    Error::Internal("truncated allocator directory")
}

/// Round `n` up to the next power-of-two size class, floored at 8 bytes.
fn size_class(n: usize) -> usize {
    n.max(8).next_power_of_two()
}

/// A single slab: a bitmap-free, size-classed bump allocator over
/// `[0, slab_size)`. Administrative bookkeeping (which classes own which
/// offsets) lives in `used`/`free_lists` rather than literal slab bytes.
pub struct SlabAllocator {
    base: u64,
    slab_size: u64,
    front: AtomicU64,
    free_lists: Mutex<HashMap<usize, Vec<u64>>>,
    used: Mutex<HashMap<u64, usize>>,
    next_instance_id: AtomicU16,
}

impl SlabAllocator {
    pub fn new(base: u64, slab_size: u64) -> Self {
        Self {
            base,
            slab_size,
            front: AtomicU64::new(0),
            free_lists: Mutex::new(HashMap::new()),
            used: Mutex::new(HashMap::new()),
            next_instance_id: AtomicU16::new(1),
        }
    }

    /// Administrative overhead as a fraction of the slab, for diagnostics:
    /// one `(u64, usize)` entry per live allocation.
    pub fn admin_overhead_bytes(&self) -> usize {
        let used = self.used.lock().unwrap();
        used.len() * (std::mem::size_of::<u64>() + std::mem::size_of::<usize>())
    }

    pub fn alloc(&self, n: usize) -> Result<Address> {
        let class = size_class(n);
        if let Some(offset) = self.free_lists.lock().unwrap().get_mut(&class).and_then(Vec::pop) {
            self.used.lock().unwrap().insert(offset, class);
            return Ok(Address::from_offset(self.base + offset));
        }
        let class_u64 = class as u64;
        let offset = self
            .front
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                (f + class_u64 <= self.slab_size).then_some(f + class_u64)
            })
            .map_err(|_| Error::OutOfDiskSpace { requested: n })?;
        self.used.lock().unwrap().insert(offset, class);
        Ok(Address::from_offset(self.base + offset))
    }

    pub fn free(&self, addr: Address) -> Result<()> {
        let offset = addr.offset() - self.base;
        let class = self
            .used
            .lock()
            .unwrap()
            .remove(&offset)
            .ok_or(Error::KeyNotFound("address not currently allocated"))?;
        self.free_lists.lock().unwrap().entry(class).or_default().push(offset);
        Ok(())
    }

    pub fn get_alloc_size(&self, addr: Address) -> Result<usize> {
        let offset = addr.offset() - self.base;
        self.used
            .lock()
            .unwrap()
            .get(&offset)
            .copied()
            .ok_or(Error::KeyNotFound("address not currently allocated"))
    }

    /// Reserve a fresh instance id for `addr`, never reusing one issued
    /// earlier in this slab's lifetime (spec §4.4, §9 Open Question #4:
    /// exhaustion is fatal, no automatic rotation).
    pub fn make_address_unique(&self, addr: Address) -> Result<UniqueAddress> {
        let id = self.next_instance_id.fetch_add(1, Ordering::SeqCst);
        if id as u64 > crate::address::INSTANCE_ID_MAX {
            return Err(Error::Internal("slab exhausted its 14-bit instance id space"));
        }
        Ok(UniqueAddress::new(addr, id))
    }

    pub fn is_empty(&self) -> bool {
        self.used.lock().unwrap().is_empty()
    }

    /// Serialize this slab's bookkeeping (front pointer, next instance id,
    /// used offsets, and free lists) so it can be reconstructed on reopen
    /// without re-scanning any object bytes.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.write_u64::<LittleEndian>(self.base).unwrap();
        out.write_u64::<LittleEndian>(self.slab_size).unwrap();
        out.write_u64::<LittleEndian>(self.front.load(Ordering::SeqCst)).unwrap();
        out.write_u16::<LittleEndian>(self.next_instance_id.load(Ordering::SeqCst)).unwrap();

        let used = self.used.lock().unwrap();
        out.write_u32::<LittleEndian>(used.len() as u32).unwrap();
        for (&offset, &class) in used.iter() {
            out.write_u64::<LittleEndian>(offset).unwrap();
            out.write_u64::<LittleEndian>(class as u64).unwrap();
        }
        drop(used);

        let free_lists = self.free_lists.lock().unwrap();
        out.write_u32::<LittleEndian>(free_lists.len() as u32).unwrap();
        for (&class, offsets) in free_lists.iter() {
            out.write_u64::<LittleEndian>(class as u64).unwrap();
            out.write_u32::<LittleEndian>(offsets.len() as u32).unwrap();
            for &offset in offsets {
                out.write_u64::<LittleEndian>(offset).unwrap();
            }
        }
    }

    /// Reconstruct a slab from bytes written by [`Self::encode`].
    pub fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self> {
        let base = cur.read_u64::<LittleEndian>().map_err(|_| truncated())?;
        let slab_size = cur.read_u64::<LittleEndian>().map_err(|_| truncated())?;
        let front = cur.read_u64::<LittleEndian>().map_err(|_| truncated())?;
        let next_instance_id = cur.read_u16::<LittleEndian>().map_err(|_| truncated())?;

        let used_len = cur.read_u32::<LittleEndian>().map_err(|_| truncated())? as usize;
        let mut used = HashMap::with_capacity(used_len);
        for _ in 0..used_len {
            let offset = cur.read_u64::<LittleEndian>().map_err(|_| truncated())?;
            let class = cur.read_u64::<LittleEndian>().map_err(|_| truncated())? as usize;
            used.insert(offset, class);
        }

        let class_count = cur.read_u32::<LittleEndian>().map_err(|_| truncated())? as usize;
        let mut free_lists = HashMap::with_capacity(class_count);
        for _ in 0..class_count {
            let class = cur.read_u64::<LittleEndian>().map_err(|_| truncated())? as usize;
            let len = cur.read_u32::<LittleEndian>().map_err(|_| truncated())? as usize;
            let mut offsets = Vec::with_capacity(len);
            for _ in 0..len {
                offsets.push(cur.read_u64::<LittleEndian>().map_err(|_| truncated())?);
            }
            free_lists.insert(class, offsets);
        }

        Ok(Self {
            base,
            slab_size,
            front: AtomicU64::new(front),
            free_lists: Mutex::new(free_lists),
            used: Mutex::new(used),
            next_instance_id: AtomicU16::new(next_instance_id),
        })
    }
}

/// Dispatches allocations to a per-slot child [`SlabAllocator`]. Slot 0 is
/// reserved and never usable as a sub-allocator (spec §4.4).
pub struct SlotAllocator {
    slots: Mutex<HashMap<u16, SlabAllocator>>,
    slot_size: u64,
}

impl SlotAllocator {
    pub fn new(slot_size: u64) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            slot_size,
        }
    }

    fn with_slot<R>(&self, slot: u16, f: impl FnOnce(&SlabAllocator) -> R) -> Result<R> {
        if slot == 0 {
            return Err(Error::Input("slot 0 is reserved and cannot be allocated from"));
        }
        let mut slots = self.slots.lock().unwrap();
        let slab = slots
            .entry(slot)
            .or_insert_with(|| SlabAllocator::new(slot as u64 * self.slot_size, self.slot_size));
        Ok(f(slab))
    }

    pub fn alloc(&self, slot: u16, n: usize) -> Result<Address> {
        self.with_slot(slot, |slab| slab.alloc(n))?
    }

    pub fn free(&self, slot: u16, addr: Address) -> Result<()> {
        self.with_slot(slot, |slab| slab.free(addr))?
    }

    pub fn get_alloc_size(&self, slot: u16, addr: Address) -> Result<usize> {
        self.with_slot(slot, |slab| slab.get_alloc_size(addr))?
    }

    pub fn make_address_unique(&self, slot: u16, addr: Address) -> Result<UniqueAddress> {
        self.with_slot(slot, |slab| slab.make_address_unique(addr))?
    }

    /// Serialize every slot's slab directory so the whole allocator can be
    /// reconstructed on reopen without replaying object allocations.
    pub fn encode(&self) -> Vec<u8> {
        let slots = self.slots.lock().unwrap();
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(slots.len() as u32).unwrap();
        for (&slot, slab) in slots.iter() {
            out.write_u16::<LittleEndian>(slot).unwrap();
            let mut slab_bytes = Vec::new();
            slab.encode(&mut slab_bytes);
            out.write_u32::<LittleEndian>(slab_bytes.len() as u32).unwrap();
            out.extend_from_slice(&slab_bytes);
        }
        out
    }

    /// Reconstruct a slot allocator from bytes written by [`Self::encode`];
    /// an empty byte slice decodes to a fresh allocator with no slots touched.
    pub fn decode(slot_size: u64, bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::new(slot_size));
        }
        let mut cur = Cursor::new(bytes);
        let slot_count = cur.read_u32::<LittleEndian>().map_err(|_| truncated())? as usize;
        let mut slots = HashMap::with_capacity(slot_count);
        for _ in 0..slot_count {
            let slot = cur.read_u16::<LittleEndian>().map_err(|_| truncated())?;
            let len = cur.read_u32::<LittleEndian>().map_err(|_| truncated())? as usize;
            let pos = cur.position() as usize;
            let slab_bytes = bytes.get(pos..pos + len).ok_or_else(truncated)?;
            let mut slab_cur = Cursor::new(slab_bytes);
            slots.insert(slot, SlabAllocator::decode(&mut slab_cur)?);
            cur.set_position((pos + len) as u64);
        }
        Ok(Self {
            slots: Mutex::new(slots),
            slot_size,
        })
    }
}

/// A fixed-width bitmap allocator for small sub-page admin structures; can
/// grow from either end of its range (spec §4.4).
pub struct BitsetAllocator {
    bits: Mutex<Vec<bool>>,
    up_cursor: AtomicU64,
    down_cursor: AtomicU64,
}

impl BitsetAllocator {
    pub fn new(len: usize) -> Self {
        Self {
            bits: Mutex::new(vec![false; len]),
            up_cursor: AtomicU64::new(0),
            down_cursor: AtomicU64::new(len as u64),
        }
    }

    pub fn alloc_up(&self) -> Result<u64> {
        let idx = self.up_cursor.fetch_add(1, Ordering::SeqCst);
        let mut bits = self.bits.lock().unwrap();
        if idx >= self.down_cursor.load(Ordering::SeqCst) || idx as usize >= bits.len() {
            return Err(Error::OutOfDiskSpace { requested: 1 });
        }
        bits[idx as usize] = true;
        Ok(idx)
    }

    pub fn alloc_down(&self) -> Result<u64> {
        let idx = self.down_cursor.fetch_sub(1, Ordering::SeqCst) - 1;
        if idx < self.up_cursor.load(Ordering::SeqCst) {
            return Err(Error::OutOfDiskSpace { requested: 1 });
        }
        self.bits.lock().unwrap()[idx as usize] = true;
        Ok(idx)
    }

    pub fn free(&self, idx: u64) -> Result<()> {
        let mut bits = self.bits.lock().unwrap();
        let slot = bits
            .get_mut(idx as usize)
            .ok_or(Error::KeyNotFound("bitset index out of range"))?;
        if !*slot {
            return Err(Error::KeyNotFound("bitset index already free"));
        }
        *slot = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_size_matches_request_and_double_free_is_key_not_found() {
        let slab = SlabAllocator::new(0, 1 << 20);
        let addr = slab.alloc(37).unwrap();
        assert_eq!(slab.get_alloc_size(addr).unwrap(), 64);
        slab.free(addr).unwrap();
        assert!(slab.free(addr).is_err());
    }

    #[test]
    fn freed_slot_is_reused_by_a_matching_size_class_request() {
        let slab = SlabAllocator::new(0, 1 << 20);
        let a = slab.alloc(100).unwrap();
        slab.free(a).unwrap();
        let b = slab.alloc(80).unwrap(); // same size class (128) as `a`
        assert_eq!(a, b);
    }

    #[test]
    fn instance_ids_are_never_repeated() {
        let slab = SlabAllocator::new(0, 1 << 20);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let addr = slab.alloc(8).unwrap();
            let uniq = slab.make_address_unique(addr).unwrap();
            assert!(seen.insert(uniq.instance_id()));
        }
    }

    #[test]
    fn slot_zero_is_reserved() {
        let slots = SlotAllocator::new(1 << 20);
        assert!(slots.alloc(0, 8).is_err());
        assert!(slots.alloc(1, 8).is_ok());
    }

    #[test]
    fn full_alloc_free_cycle_drains_a_small_slab() {
        let slab = SlabAllocator::new(0, 4 << 20);
        let mut addrs = Vec::new();
        for size in 1..=1024usize {
            match slab.alloc(size) {
                Ok(a) => addrs.push(a),
                Err(_) => break,
            }
        }
        assert!(!addrs.is_empty());
        assert!(slab.admin_overhead_bytes() < (4usize << 20) / 10);
        for addr in addrs.into_iter().rev() {
            slab.free(addr).unwrap();
        }
        assert!(slab.is_empty());
    }

    #[test]
    fn slot_allocator_directory_round_trips_through_encode_decode() {
        let slots = SlotAllocator::new(1 << 20);
        let a = slots.alloc(1, 40).unwrap();
        let b = slots.alloc(1, 100).unwrap();
        slots.free(1, a).unwrap();
        slots.alloc(2, 16).unwrap();

        let bytes = slots.encode();
        let restored = SlotAllocator::decode(1 << 20, &bytes).unwrap();

        assert_eq!(restored.get_alloc_size(1, b).unwrap(), 128);
        assert!(restored.get_alloc_size(1, a).is_err()); // freed, not re-allocated yet
        let c = restored.alloc(1, 50).unwrap();
        assert_eq!(c, a); // reused from the restored free list, same size class
        assert!(restored.alloc(0, 8).is_err()); // slot 0 still reserved
    }

    #[test]
    fn empty_directory_bytes_decode_to_a_fresh_allocator() {
        let restored = SlotAllocator::decode(1 << 20, &[]).unwrap();
        assert!(restored.alloc(1, 8).is_ok());
    }

    #[test]
    fn bitset_allocates_from_both_ends() {
        let bits = BitsetAllocator::new(4);
        let up = bits.alloc_up().unwrap();
        let down = bits.alloc_down().unwrap();
        assert_ne!(up, down);
        bits.free(up).unwrap();
        assert!(bits.free(up).is_err());
    }
}
