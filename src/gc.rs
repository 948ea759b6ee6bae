//! GC0: the tri-phase, in-fixture reference-count collector (spec §4.10).

use std::collections::HashSet;
use std::sync::Mutex;

use crate::address::UniqueAddress;
use crate::error::Result;
use crate::memspace::Memspace;
use crate::prefix::Prefix;

/// The object-store seam GC0 collects through: membership, ref-count
/// mutation, nested-address discovery, and storage release. The trait exists
/// so `Gc0` depends on this seam rather than `Memspace`'s full surface.
pub trait GcOps {
    fn gc_contains(&self, addr: UniqueAddress) -> bool;
    fn gc_has_refs(&self, addr: UniqueAddress) -> Result<bool>;
    fn gc_nested_refs(&self, addr: UniqueAddress) -> Result<Vec<UniqueAddress>>;
    fn gc_dec_ref(&self, addr: UniqueAddress) -> Result<bool>;
    fn gc_free(&self, addr: UniqueAddress) -> Result<()>;
}

/// Borrows a memspace together with the prefix its objects are durably
/// stored through; the only implementer of [`GcOps`], since every memspace
/// operation now needs a `Prefix` to read and write object bytes.
pub struct MemspaceView<'a> {
    pub memspace: &'a Memspace,
    pub prefix: &'a Prefix,
}

impl GcOps for MemspaceView<'_> {
    fn gc_contains(&self, addr: UniqueAddress) -> bool {
        self.memspace.contains(addr)
    }

    fn gc_has_refs(&self, addr: UniqueAddress) -> Result<bool> {
        Ok(self.memspace.header(self.prefix, addr)?.has_refs())
    }

    fn gc_nested_refs(&self, addr: UniqueAddress) -> Result<Vec<UniqueAddress>> {
        self.memspace.nested_refs(self.prefix, addr)
    }

    fn gc_dec_ref(&self, addr: UniqueAddress) -> Result<bool> {
        self.memspace.change_ref(self.prefix, addr, false, -1)
    }

    fn gc_free(&self, addr: UniqueAddress) -> Result<()> {
        self.memspace.free_object(self.prefix, addr)
    }
}

/// Tracks every live v-object address registered in a fixture and the
/// addresses pending reclamation.
#[derive(Default)]
pub struct Gc0 {
    registry: Mutex<HashSet<UniqueAddress>>,
    pending: Mutex<Vec<UniqueAddress>>,
}

impl Gc0 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly constructed v-object instance.
    pub fn add(&self, addr: UniqueAddress) {
        self.registry.lock().unwrap().insert(addr);
    }

    /// A v-object instance is going out of scope; if the underlying object
    /// has no references left, queue it for `collect()`.
    pub fn remove(&self, addr: UniqueAddress, memspace: &impl GcOps) -> Result<()> {
        self.registry.lock().unwrap().remove(&addr);
        if !memspace.gc_has_refs(addr)? {
            self.pending.lock().unwrap().push(addr);
        }
        Ok(())
    }

    /// Drop every zero-ref object in the pending queue, cascading `decRef`
    /// into any nested addresses it directly references and freeing its
    /// storage through the allocator.
    pub fn collect(&self, memspace: &impl GcOps) -> Result<Vec<UniqueAddress>> {
        let mut freed = Vec::new();
        loop {
            let batch: Vec<UniqueAddress> = std::mem::take(&mut *self.pending.lock().unwrap());
            if batch.is_empty() {
                break;
            }
            for addr in batch {
                if !memspace.gc_contains(addr) {
                    continue;
                }
                let nested = memspace.gc_nested_refs(addr)?;
                memspace.gc_free(addr)?;
                tracing::trace!(?addr, children = nested.len(), "gc0 freed object");
                freed.push(addr);
                for child in nested {
                    if memspace.gc_dec_ref(child)? {
                        self.pending.lock().unwrap().push(child);
                    }
                }
            }
        }
        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::memspace::ObjectKind;
    use crate::object::Value;

    #[test]
    fn collect_reclaims_unreferenced_objects_and_their_children() {
        let prefix = Prefix::create_anon(&Config::default()).unwrap();
        let memspace = Memspace::open(&prefix, [0; 16], 1 << 20).unwrap();
        let view = MemspaceView { memspace: &memspace, prefix: &prefix };
        let gc = Gc0::new();

        let tuple = memspace.alloc_object(&prefix, ObjectKind::Tuple(vec![Value::Int64(1)])).unwrap();
        memspace.change_ref(&prefix, tuple, false, 1).unwrap(); // held by the user
        gc.add(tuple);

        let list = memspace
            .alloc_object(&prefix, ObjectKind::List(vec![Value::Address(tuple)]))
            .unwrap();
        memspace.change_ref(&prefix, tuple, false, 1).unwrap(); // held by `l`'s container slot
        memspace.change_ref(&prefix, list, false, 1).unwrap(); // held by the user
        gc.add(list);

        // decRef l, then t.
        memspace.change_ref(&prefix, list, false, -1).unwrap();
        gc.remove(list, &view).unwrap();
        memspace.change_ref(&prefix, tuple, false, -1).unwrap();
        gc.remove(tuple, &view).unwrap();

        let freed = gc.collect(&view).unwrap();
        assert!(freed.contains(&list));
        assert!(freed.contains(&tuple));
        assert!(!memspace.contains(list));
        assert!(!memspace.contains(tuple));
    }
}
