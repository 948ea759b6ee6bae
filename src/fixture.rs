//! Fixture: a per-prefix transactional context (spec §4.11).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::address::UniqueAddress;
use crate::error::{Error, Result};
use crate::gc::{Gc0, MemspaceView};
use crate::memspace::Memspace;
use crate::object::{ObjectCatalogue, StringPool};
use crate::prefix::Prefix;
use crate::rangetree::RangeTree;
use crate::tagindex::TagIndex;

/// `address -> host-language object` cache (spec §4.11, "LangCache").
#[derive(Default)]
pub struct LangCache {
    entries: Mutex<HashMap<UniqueAddress, ()>>,
}

impl LangCache {
    pub fn remember(&self, addr: UniqueAddress) {
        self.entries.lock().unwrap().insert(addr, ());
    }

    pub fn forget(&self, addr: UniqueAddress) {
        self.entries.lock().unwrap().remove(&addr);
    }

    pub fn contains(&self, addr: UniqueAddress) -> bool {
        self.entries.lock().unwrap().contains_key(&addr)
    }
}

/// A transactional view of one prefix: its memspace, caches, GC registry,
/// and resource catalogue of core singletons (spec §4.11).
pub struct Fixture {
    pub prefix: Prefix,
    pub memspace: Memspace,
    pub lang_cache: LangCache,
    pub gc: Gc0,
    pub tag_index: TagIndex,
    pub range_tree: Mutex<RangeTree>,
    pub catalogue: Mutex<ObjectCatalogue>,
    pub strings: StringPool,
    poisoned: AtomicBool,
}

impl Fixture {
    pub fn new(prefix: Prefix, slot_size: u64) -> Result<Self> {
        let uuid = prefix.uuid();
        let memspace = Memspace::open(&prefix, uuid, slot_size)?;
        Ok(Self {
            prefix,
            memspace,
            lang_cache: LangCache::default(),
            gc: Gc0::new(),
            tag_index: TagIndex::new(),
            range_tree: Mutex::new(RangeTree::new()),
            catalogue: Mutex::new(ObjectCatalogue::default()),
            strings: StringPool::new(),
            poisoned: AtomicBool::new(false),
        })
    }

    /// `true` once a fatal error (spec §7: `Internal`/`BadAddress`/
    /// `OutOfDiskSpace`) has been observed through [`Self::guard`]; every
    /// subsequent call through it is rejected without retrying the op.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Run `op`, poisoning the fixture if it fails fatally. Rejects outright
    /// if already poisoned, so a broken fixture never silently continues.
    fn guard<T>(&self, op: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.is_poisoned() {
            return Err(Error::Internal("fixture is poisoned by a prior fatal error"));
        }
        let result = op();
        if let Err(e) = &result {
            if e.is_fatal() {
                tracing::error!(error = %e, "fixture poisoned by fatal error");
                self.poisoned.store(true, Ordering::SeqCst);
            }
        }
        result
    }

    /// Run the collector and drop anything it reclaimed from the LangCache
    /// and tag index (spec §4.10, §4.11).
    pub fn collect(&self) -> Result<Vec<UniqueAddress>> {
        self.guard(|| {
            let view = MemspaceView { memspace: &self.memspace, prefix: &self.prefix };
            let freed = self.gc.collect(&view)?;
            tracing::debug!(count = freed.len(), "gc0 collection pass");
            for &addr in &freed {
                self.lang_cache.forget(addr);
                self.tag_index.remove_all_tags(addr);
            }
            Ok(freed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::memspace::ObjectKind;
    use crate::object::Value;

    #[test]
    fn fixture_wires_gc_into_lang_cache_forgetting() {
        let prefix = Prefix::create_anon(&Config::default()).unwrap();
        let fixture = Fixture::new(prefix, 1 << 20).unwrap();
        let addr = fixture
            .memspace
            .alloc_object(&fixture.prefix, ObjectKind::List(vec![Value::Int64(1)]))
            .unwrap();
        fixture.lang_cache.remember(addr);
        fixture.gc.add(addr);
        let view = MemspaceView { memspace: &fixture.memspace, prefix: &fixture.prefix };
        fixture.gc.remove(addr, &view).unwrap();
        let freed = fixture.collect().unwrap();
        assert_eq!(freed, vec![addr]);
        assert!(!fixture.lang_cache.contains(addr));
    }

    #[test]
    fn a_fatal_error_poisons_the_fixture_for_subsequent_calls() {
        let prefix = Prefix::create_anon(&Config::default()).unwrap();
        let fixture = Fixture::new(prefix, 1 << 20).unwrap();
        assert!(!fixture.is_poisoned());

        let err = fixture.guard(|| Err::<(), Error>(Error::Internal("synthetic failure")));
        assert!(err.is_err());
        assert!(fixture.is_poisoned());

        // Even an op that would otherwise succeed is rejected once poisoned.
        let rejected = fixture.guard(|| Ok::<(), Error>(()));
        assert!(matches!(rejected, Err(Error::Internal(_))));
    }
}
