//! Range-tree index: ordered `key -> address` pairs with bulk load and
//! range scans (spec §4.8).

use std::collections::BTreeMap;

use crate::address::UniqueAddress;
use crate::error::{Error, Result};

/// Auto-assigned from the first non-null key added to a [`Builder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexDataType {
    #[default]
    Auto,
    Int64,
    UInt64,
}

/// Accumulates `(key, addr)` pairs before a bulk load into a [`RangeTree`].
#[derive(Default)]
pub struct Builder {
    items: Vec<(i64, UniqueAddress)>,
    nulls: Vec<UniqueAddress>,
    data_type: IndexDataType,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            nulls: Vec::new(),
            data_type: IndexDataType::Auto,
        }
    }

    pub fn add(&mut self, key: i64, addr: UniqueAddress) {
        self.items.push((key, addr));
        if self.data_type == IndexDataType::Auto {
            self.data_type = IndexDataType::Int64;
        }
    }

    pub fn add_null(&mut self, addr: UniqueAddress) {
        self.nulls.push(addr);
    }

    /// Sort accumulated items by key and bulk-load them into `tree`,
    /// invoking `add_cb` per newly introduced address so the caller can
    /// `incRef` it.
    pub fn flush(mut self, tree: &mut RangeTree, mut add_cb: impl FnMut(UniqueAddress)) -> Result<()> {
        if self.data_type != IndexDataType::Auto {
            tree.check_type(self.data_type)?;
        }
        self.items.sort_by_key(|(k, _)| *k);
        for (key, addr) in self.items {
            tree.entries.entry(key).or_default().push(addr);
            add_cb(addr);
        }
        for addr in self.nulls {
            tree.nulls.push(addr);
            add_cb(addr);
        }
        Ok(())
    }
}

/// An ordered `i64 key -> [address]` index (spec §4.8). A real deployment
/// bounds each leaf to N items; this in-memory form keeps one `Vec` per key,
/// which is the same externally-observable ordering contract.
#[derive(Default)]
pub struct RangeTree {
    entries: BTreeMap<i64, Vec<UniqueAddress>>,
    nulls: Vec<UniqueAddress>,
    data_type: IndexDataType,
}

impl RangeTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn key_of(&self, addr: UniqueAddress) -> Option<i64> {
        self.entries.iter().find(|(_, v)| v.contains(&addr)).map(|(k, _)| *k)
    }

    /// Materialize keys for the addresses `iter` yields and emit them in key
    /// order (`asc`/`desc`); nulls are placed according to `null_first`.
    pub fn sort(&self, iter: impl IntoIterator<Item = UniqueAddress>, asc: bool, null_first: bool) -> Vec<UniqueAddress> {
        let mut keyed: Vec<(Option<i64>, UniqueAddress)> =
            iter.into_iter().map(|a| (self.key_of(a), a)).collect();
        keyed.sort_by(|(ka, _), (kb, _)| match (ka, kb) {
            (Some(a), Some(b)) => a.cmp(b),
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => {
                if null_first {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Greater
                }
            }
            (Some(_), None) => {
                if null_first {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Less
                }
            }
        });
        if !asc {
            keyed.reverse();
        }
        keyed.into_iter().map(|(_, a)| a).collect()
    }

    /// Ordered scan over `[low, high]`; a missing bound means unbounded.
    pub fn range(&self, low: Option<i64>, high: Option<i64>) -> Vec<UniqueAddress> {
        let lo = low.unwrap_or(i64::MIN);
        let hi = high.unwrap_or(i64::MAX);
        self.entries
            .range(lo..=hi)
            .flat_map(|(_, addrs)| addrs.iter().copied())
            .collect()
    }

    pub fn check_type(&mut self, inferred: IndexDataType) -> Result<()> {
        if self.data_type == IndexDataType::Auto {
            self.data_type = inferred;
        } else if self.data_type != inferred {
            return Err(Error::Input("key type conflicts with the index's established type"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    fn addr(n: u64) -> UniqueAddress {
        UniqueAddress::new(Address::from_offset(n), 1)
    }

    #[test]
    fn sort_orders_addresses_by_their_inserted_keys() {
        let mut tree = RangeTree::new();
        let mut builder = Builder::new();
        let pairs = [(99, 3), (199, 5), (13, 2), (199, 7), (142, 9), (152, 8), (27, 4)];
        for (key, id) in pairs {
            builder.add(key, addr(id));
        }
        builder.flush(&mut tree, |_| {}).unwrap();

        let query = vec![addr(4), addr(3), addr(8)];
        let sorted = tree.sort(query, true, false);
        assert_eq!(sorted, vec![addr(4), addr(3), addr(8)]); // keys 27, 99, 152
    }

    #[test]
    fn flush_rejects_a_builder_whose_key_type_conflicts_with_the_tree() {
        let mut tree = RangeTree::new();
        tree.check_type(IndexDataType::UInt64).unwrap(); // tree already committed to uint64 keys
        let mut builder = Builder::new();
        builder.add(1, addr(1));
        assert!(matches!(builder.flush(&mut tree, |_| {}), Err(Error::Input(_))));
    }

    #[test]
    fn range_scan_respects_bounds() {
        let mut tree = RangeTree::new();
        let mut builder = Builder::new();
        for (key, id) in [(1, 1), (5, 2), (10, 3), (15, 4)] {
            builder.add(key, addr(id));
        }
        builder.flush(&mut tree, |_| {}).unwrap();
        assert_eq!(tree.range(Some(5), Some(10)), vec![addr(2), addr(3)]);
        assert_eq!(tree.range(None, Some(5)), vec![addr(1), addr(2)]);
    }
}
