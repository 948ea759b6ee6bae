//! Logical addressing: 64-bit offsets with an optional 14-bit instance id
//! (spec §3, §6). Grounded on `dbzero/core/memory/Address.hpp`.

use std::fmt;

/// Bits reserved for the instance id within a [`UniqueAddress`]'s packed value.
pub const INSTANCE_ID_BITS: u32 = 14;
const INSTANCE_ID_MASK: u64 = (1 << INSTANCE_ID_BITS) - 1;
/// Largest instance id a single slab may ever hand out.
pub const INSTANCE_ID_MAX: u64 = INSTANCE_ID_MASK;
const OFFSET_MAX: u64 = 1 << 50;

/// A plain logical address: an offset within a memspace with no instance id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

impl Address {
    pub const NULL: Address = Address(0);

    pub fn from_offset(offset: u64) -> Self {
        debug_assert!(offset < OFFSET_MAX, "offset exceeds 50-bit range");
        Address(offset)
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn offset(self) -> u64 {
        self.0
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(0x{:x})", self.0)
    }
}

impl std::ops::Add<u64> for Address {
    type Output = Address;
    fn add(self, rhs: u64) -> Address {
        Address(self.0 + rhs)
    }
}

impl std::ops::Sub<u64> for Address {
    type Output = Address;
    fn sub(self, rhs: u64) -> Address {
        Address(self.0 - rhs)
    }
}

/// A 64-bit logical address packing a 50-bit offset and a 14-bit instance id
/// (spec §3, §6). `instance_id == 0` means "plain address" and decodes back
/// to an [`Address`] transparently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UniqueAddress(u64);

impl UniqueAddress {
    pub const NULL: UniqueAddress = UniqueAddress(0);

    /// Pack an address and a non-zero instance id. Panics (via `debug_assert`)
    /// on a zero id or an offset that doesn't fit 50 bits, mirroring the
    /// source's `assert`-based contract.
    pub fn new(address: Address, instance_id: u16) -> Self {
        debug_assert!(instance_id as u64 <= INSTANCE_ID_MAX);
        debug_assert!(address.offset() < OFFSET_MAX);
        UniqueAddress((address.offset() << INSTANCE_ID_BITS) | instance_id as u64)
    }

    /// Wrap a plain address with no instance id (`instance_id == 0`).
    pub fn from_plain(address: Address) -> Self {
        UniqueAddress(address.offset() << INSTANCE_ID_BITS)
    }

    pub fn from_value(value: u64) -> Self {
        UniqueAddress(value)
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn offset(self) -> u64 {
        self.0 >> INSTANCE_ID_BITS
    }

    pub fn instance_id(self) -> u16 {
        (self.0 & INSTANCE_ID_MASK) as u16
    }

    pub fn has_instance_id(self) -> bool {
        (self.0 & INSTANCE_ID_MASK) != 0
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Strip the instance id, returning the plain physical address.
    pub fn address(self) -> Address {
        Address::from_offset(self.offset())
    }
}

impl From<UniqueAddress> for Address {
    fn from(ua: UniqueAddress) -> Address {
        ua.address()
    }
}

impl fmt::Display for UniqueAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_instance_id() {
            write!(f, "UniqueAddress(0x{:x}#{})", self.offset(), self.instance_id())
        } else {
            write!(f, "UniqueAddress(0x{:x})", self.offset())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_offset_and_instance() {
        let addr = Address::from_offset(0x1234);
        let ua = UniqueAddress::new(addr, 7);
        assert_eq!(ua.offset(), 0x1234);
        assert_eq!(ua.instance_id(), 7);
        assert!(ua.has_instance_id());
        assert_eq!(ua.address(), addr);
    }

    #[test]
    fn plain_address_has_no_instance_id() {
        let addr = Address::from_offset(42);
        let ua = UniqueAddress::from_plain(addr);
        assert!(!ua.has_instance_id());
        assert_eq!(ua.instance_id(), 0);
        assert_eq!(ua.address(), addr);
    }

    #[test]
    fn ordering_matches_packed_value() {
        let a = UniqueAddress::new(Address::from_offset(1), 1);
        let b = UniqueAddress::new(Address::from_offset(2), 1);
        assert!(a < b);
    }
}
