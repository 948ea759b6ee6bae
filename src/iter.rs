//! Composable full-text/range iterators over sorted address posting lists
//! (spec §4.6). Each node advances over `UniqueAddress` keys in strictly
//! increasing order (or decreasing, for reverse direction) except `Orx`,
//! which may repeat.

use crate::address::UniqueAddress;

/// Iteration direction a composite node advances in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// Common seam every query-tree node advances through: end-of-stream test,
/// current key peek, advance, seek-forward join, and early stop (spec §4.6).
pub trait FtIterator {
    type Key: Ord + Copy;

    fn is_end(&self) -> bool;
    fn get_key(&self) -> Option<Self::Key>;
    fn advance(&mut self) -> Option<Self::Key>;
    fn join(&mut self, k: Self::Key);
    fn stop(&mut self);
}

/// Leaf posting-list iterator: a sorted `Vec<UniqueAddress>` walked forward.
pub struct PostingList {
    items: Vec<UniqueAddress>,
    pos: usize,
    stopped: bool,
}

impl PostingList {
    pub fn new(mut items: Vec<UniqueAddress>) -> Self {
        items.sort();
        items.dedup();
        Self { items, pos: 0, stopped: false }
    }
}

impl FtIterator for PostingList {
    type Key = UniqueAddress;

    fn is_end(&self) -> bool {
        self.stopped || self.pos >= self.items.len()
    }

    fn get_key(&self) -> Option<UniqueAddress> {
        self.items.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<UniqueAddress> {
        let current = self.get_key();
        if current.is_some() {
            self.pos += 1;
        }
        current
    }

    /// Seek to the first key `>= k`.
    fn join(&mut self, k: UniqueAddress) {
        while !self.is_end() && self.get_key().unwrap() < k {
            self.pos += 1;
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}

/// AND: drains the minimum-key driver, then joins the others until all
/// children agree on a key (spec §4.6).
pub fn intersect(lists: Vec<Vec<UniqueAddress>>) -> Vec<UniqueAddress> {
    let mut iters: Vec<PostingList> = lists.into_iter().map(PostingList::new).collect();
    let mut out = Vec::new();
    if iters.is_empty() {
        return out;
    }
    loop {
        if iters.iter().any(PostingList::is_end) {
            break;
        }
        let max_key = iters.iter().filter_map(PostingList::get_key).max().unwrap();
        for it in iters.iter_mut() {
            it.join(max_key);
        }
        if iters.iter().any(PostingList::is_end) {
            break;
        }
        let keys: Vec<_> = iters.iter().map(|it| it.get_key().unwrap()).collect();
        if keys.iter().all(|k| *k == keys[0]) {
            out.push(keys[0]);
            for it in iters.iter_mut() {
                it.advance();
            }
        }
    }
    out
}

/// OR: min-heap-style union; duplicates across children collapse to one
/// emission (spec §4.6).
pub fn union(lists: Vec<Vec<UniqueAddress>>) -> Vec<UniqueAddress> {
    let mut all: Vec<UniqueAddress> = lists.into_iter().flatten().collect();
    all.sort();
    all.dedup();
    all
}

/// ORX: same as [`union`] but preserves duplicate emissions across children.
pub fn union_exclusive(lists: Vec<Vec<UniqueAddress>>) -> Vec<UniqueAddress> {
    let mut all: Vec<UniqueAddress> = lists.into_iter().flatten().collect();
    all.sort();
    all
}

/// ANDNOT: `a` minus `b` (spec §4.6).
pub fn and_not(a: Vec<UniqueAddress>, b: Vec<UniqueAddress>) -> Vec<UniqueAddress> {
    let mut b = b;
    b.sort();
    a.into_iter().filter(|k| b.binary_search(k).is_err()).collect()
}

/// Span: coarsens each key into a `1 << span_shift`-sized bucket.
pub fn span(items: &[UniqueAddress], span_shift: u32) -> Vec<u64> {
    items.iter().map(|a| a.value() >> span_shift).collect()
}

/// Slice: `(start, stop, step)` cut over a forward-only sequence.
pub fn slice<T: Clone>(items: &[T], start: usize, stop: usize, step: usize) -> Vec<T> {
    assert!(step >= 1, "slice only supports a forward step >= 1");
    items
        .iter()
        .enumerate()
        .skip(start)
        .take_while(|(i, _)| *i < stop)
        .step_by(step)
        .map(|(_, v)| v.clone())
        .collect()
}

/// A composable query shape, used only to compute a deterministic signature
/// for memoizing results by shape and operands (spec §4.6, §6). Each variant
/// is a serial type id followed by its payload, all multi-byte numbers
/// little-endian.
pub enum IterNode {
    Leaf(Vec<UniqueAddress>),
    And(Vec<IterNode>),
    Or(Vec<IterNode>),
    Orx(Vec<IterNode>),
    AndNot(Box<IterNode>, Box<IterNode>),
    Span(Box<IterNode>, u32),
    Slice(Box<IterNode>, usize, usize, usize),
}

impl IterNode {
    fn serial_type(&self) -> u8 {
        match self {
            IterNode::Leaf(_) => 0,
            IterNode::And(_) => 1,
            IterNode::Or(_) => 2,
            IterNode::Orx(_) => 3,
            IterNode::AndNot(..) => 4,
            IterNode::Span(..) => 5,
            IterNode::Slice(..) => 6,
        }
    }

    fn write_signature(&self, sink: &mut Vec<u8>) {
        sink.push(self.serial_type());
        match self {
            IterNode::Leaf(items) => {
                sink.extend_from_slice(&(items.len() as u64).to_le_bytes());
                for a in items {
                    sink.extend_from_slice(&a.value().to_le_bytes());
                }
            }
            IterNode::And(children) | IterNode::Or(children) | IterNode::Orx(children) => {
                sink.extend_from_slice(&(children.len() as u64).to_le_bytes());
                for c in children {
                    c.write_signature(sink);
                }
            }
            IterNode::AndNot(a, b) => {
                a.write_signature(sink);
                b.write_signature(sink);
            }
            IterNode::Span(inner, shift) => {
                inner.write_signature(sink);
                sink.extend_from_slice(&shift.to_le_bytes());
            }
            IterNode::Slice(inner, start, stop, step) => {
                inner.write_signature(sink);
                for v in [*start as u64, *stop as u64, *step as u64] {
                    sink.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
    }

    /// Base32-encoded xxh3 digest of this node's byte signature.
    pub fn signature(&self) -> String {
        let mut sink = Vec::new();
        self.write_signature(&mut sink);
        let hash = xxhash_rust::xxh3::xxh3_64(&sink);
        base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &hash.to_le_bytes())
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
    fn and_iterator_emits_strictly_increasing_common_keys() {
        let a = vec![addr(1), addr(3), addr(5), addr(7)];
        let b = vec![addr(2), addr(3), addr(5), addr(9)];
        let result = intersect(vec![a, b]);
        assert_eq!(result, vec![addr(3), addr(5)]);
        assert!(result.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn or_collapses_duplicates_but_orx_preserves_them() {
        let a = vec![addr(1), addr(2)];
        let b = vec![addr(2), addr(3)];
        assert_eq!(union(vec![a.clone(), b.clone()]), vec![addr(1), addr(2), addr(3)]);
        assert_eq!(union_exclusive(vec![a, b]), vec![addr(1), addr(2), addr(2), addr(3)]);
    }

    #[test]
    fn andnot_removes_the_right_hand_keys() {
        let a = vec![addr(1), addr(2), addr(3)];
        let b = vec![addr(2)];
        assert_eq!(and_not(a, b), vec![addr(1), addr(3)]);
    }

    #[test]
    fn slice_takes_a_forward_step() {
        let items: Vec<u64> = (0..10).collect();
        assert_eq!(slice(&items, 2, 8, 2), vec![2, 4, 6]);
    }

    #[test]
    fn signature_is_deterministic_and_distinguishes_shape_and_operands() {
        let leaf_a = IterNode::Leaf(vec![addr(1), addr(2)]);
        let leaf_a_again = IterNode::Leaf(vec![addr(1), addr(2)]);
        assert_eq!(leaf_a.signature(), leaf_a_again.signature());

        let leaf_b = IterNode::Leaf(vec![addr(1), addr(3)]);
        assert_ne!(leaf_a.signature(), leaf_b.signature());

        let and_node = IterNode::And(vec![IterNode::Leaf(vec![addr(1)]), IterNode::Leaf(vec![addr(2)])]);
        let or_node = IterNode::Or(vec![IterNode::Leaf(vec![addr(1)]), IterNode::Leaf(vec![addr(2)])]);
        assert_ne!(and_node.signature(), or_node.signature(), "same children, different shape must differ");
    }
}
