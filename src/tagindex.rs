//! Tag index: a bidirectional many-to-many map of object <-> tag, with a
//! batched builder and composable query iterators (spec §4.7).

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use crate::address::UniqueAddress;
use crate::iter;

/// A buffered batch of tag mutations, committed atomically by [`Builder::flush`]
/// (spec §4.7: `beginBatchUpdate`/`flush`/`close`).
#[derive(Default)]
pub struct Builder {
    adds: Vec<(UniqueAddress, UniqueAddress)>,
    removes: Vec<(UniqueAddress, UniqueAddress)>,
}

impl Builder {
    pub fn add_tag(&mut self, obj: UniqueAddress, tag: UniqueAddress) {
        self.adds.push((obj, tag));
    }

    pub fn add_tags(&mut self, obj: UniqueAddress, tags: &[UniqueAddress]) {
        for &t in tags {
            self.add_tag(obj, t);
        }
    }

    pub fn remove_tag(&mut self, obj: UniqueAddress, tag: UniqueAddress) {
        self.removes.push((obj, tag));
    }

    pub fn remove_tags(&mut self, obj: UniqueAddress, tags: &[UniqueAddress]) {
        for &t in tags {
            self.remove_tag(obj, t);
        }
    }

    /// Apply every buffered mutation to `index` atomically.
    pub fn flush(self, index: &TagIndex) {
        let mut obj_to_tags = index.obj_to_tags.lock().unwrap();
        let mut tag_to_objs = index.tag_to_objs.lock().unwrap();
        for (obj, tag) in self.adds {
            obj_to_tags.entry(obj).or_default().insert(tag);
            tag_to_objs.entry(tag).or_default().insert(obj);
        }
        for (obj, tag) in self.removes {
            if let Some(tags) = obj_to_tags.get_mut(&obj) {
                tags.remove(&tag);
            }
            if let Some(objs) = tag_to_objs.get_mut(&tag) {
                objs.remove(&obj);
            }
        }
    }

    /// Discard the batch without applying it (spec §4.7, `close()`).
    pub fn close(self) {}
}

/// Bidirectional `object <-> tag` index backed by a sparse boolean matrix
/// (spec §3, §4.7): `obj_to_tags`/`tag_to_objs` are each other's transpose.
#[derive(Default)]
pub struct TagIndex {
    obj_to_tags: Mutex<HashMap<UniqueAddress, BTreeSet<UniqueAddress>>>,
    tag_to_objs: Mutex<HashMap<UniqueAddress, BTreeSet<UniqueAddress>>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_batch_update(&self) -> Builder {
        Builder::default()
    }

    pub fn add_tag(&self, obj: UniqueAddress, tag: UniqueAddress) {
        let mut builder = self.begin_batch_update();
        builder.add_tag(obj, tag);
        builder.flush(self);
    }

    pub fn remove_tag(&self, obj: UniqueAddress, tag: UniqueAddress) {
        let mut builder = self.begin_batch_update();
        builder.remove_tag(obj, tag);
        builder.flush(self);
    }

    pub fn add_tags(&self, obj: UniqueAddress, tags: &[UniqueAddress]) {
        let mut builder = self.begin_batch_update();
        builder.add_tags(obj, tags);
        builder.flush(self);
    }

    pub fn remove_tags(&self, obj: UniqueAddress, tags: &[UniqueAddress]) {
        let mut builder = self.begin_batch_update();
        builder.remove_tags(obj, tags);
        builder.flush(self);
    }

    /// Strip every tag `obj` carries, e.g. when the object itself is freed.
    pub fn remove_all_tags(&self, obj: UniqueAddress) {
        let mut obj_to_tags = self.obj_to_tags.lock().unwrap();
        let Some(tags) = obj_to_tags.remove(&obj) else {
            return;
        };
        drop(obj_to_tags);
        let mut tag_to_objs = self.tag_to_objs.lock().unwrap();
        for tag in tags {
            if let Some(objs) = tag_to_objs.get_mut(&tag) {
                objs.remove(&obj);
            }
        }
    }

    /// Objects carrying every tag in `tags` (spec §4.7, `find`).
    pub fn find(&self, tags: &[UniqueAddress]) -> BTreeSet<UniqueAddress> {
        let tag_to_objs = self.tag_to_objs.lock().unwrap();
        let lists: Vec<Vec<UniqueAddress>> = tags
            .iter()
            .map(|t| tag_to_objs.get(t).map(|s| s.iter().copied().collect()).unwrap_or_default())
            .collect();
        drop(tag_to_objs);
        if lists.is_empty() {
            return BTreeSet::new();
        }
        iter::intersect(lists).into_iter().collect()
    }

    /// Partitions `candidates` by whether they carry any (`exclusive=false`)
    /// or all (`exclusive=true`) of `tags` (spec §4.7, `splitBy`).
    pub fn split_by(&self, tags: &[UniqueAddress], candidates: &[UniqueAddress], exclusive: bool) -> Vec<UniqueAddress> {
        let obj_to_tags = self.obj_to_tags.lock().unwrap();
        candidates
            .iter()
            .filter(|obj| {
                let held = obj_to_tags.get(obj).cloned().unwrap_or_default();
                if exclusive {
                    tags.iter().all(|t| held.contains(t))
                } else {
                    tags.iter().any(|t| held.contains(t))
                }
            })
            .copied()
            .collect()
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
    fn add_and_remove_tags_change_find_results() {
        let index = TagIndex::new();
        let (o, p) = (addr(1), addr(2));
        let (a, b, c) = (addr(10), addr(11), addr(12));

        index.add_tags(o, &[a, b, c]);
        index.add_tags(p, &[a, b]);
        index.remove_tags(o, &[a]);

        assert_eq!(index.find(&[a]), BTreeSet::from([p]));
        assert_eq!(index.find(&[b]), BTreeSet::from([o, p]));
        assert!(index.find(&[a, c]).is_empty());
    }

    #[test]
    fn remove_all_tags_clears_both_directions() {
        let index = TagIndex::new();
        let (o, p) = (addr(1), addr(2));
        let (a, b) = (addr(10), addr(11));
        index.add_tags(o, &[a, b]);
        index.add_tags(p, &[a]);

        index.remove_all_tags(o);

        assert!(index.find(&[a]) == BTreeSet::from([p]));
        assert!(index.find(&[b]).is_empty());
    }

    #[test]
    fn batch_update_is_all_or_nothing_until_flushed() {
        let index = TagIndex::new();
        let obj = addr(1);
        let tag = addr(10);
        let mut builder = index.begin_batch_update();
        builder.add_tag(obj, tag);
        assert!(index.find(&[tag]).is_empty(), "unflushed batch must not be visible");
        builder.flush(&index);
        assert!(index.find(&[tag]).contains(&obj));
    }
}
