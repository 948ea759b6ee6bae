//! Snapshot: a read-only workspace view pinned to a state number (spec §4.11).

use crate::error::{Error, Result};
use crate::prefix::{Prefix, Snapshot as PrefixSnapshot};

/// A read-only view of one fixture's prefix, pinned to the state number
/// observed at construction. `modify()` calls against it must be rejected
/// by the caller; `read_page` always resolves against the pinned state.
pub struct Snapshot<'p> {
    prefix: &'p Prefix,
    pinned: PrefixSnapshot,
}

impl<'p> Snapshot<'p> {
    pub fn new(prefix: &'p Prefix) -> Self {
        Self {
            prefix,
            pinned: prefix.get_snapshot(),
        }
    }

    pub fn state_num(&self) -> u64 {
        self.pinned.state_num
    }

    pub fn read_page(&self, page_num: u64) -> Result<Option<Vec<u8>>> {
        self.prefix.read_page(page_num, self.pinned.state_num)
    }

    /// Snapshots are read-only: any write attempt is rejected outright.
    pub fn modify_page(&self, _page_num: u64) -> Result<()> {
        Err(Error::Input("snapshots are read-only views and cannot be modified"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn snapshot_is_isolated_from_writes_made_after_it_was_taken() {
        let prefix = Prefix::create_anon(&Config::default()).unwrap();
        let mut txn = prefix.begin_atomic();
        txn.modify_page(0).unwrap()[0] = 1;
        txn.commit().unwrap();

        let snap = Snapshot::new(&prefix);
        assert!(snap.modify_page(0).is_err());

        let mut txn2 = prefix.begin_atomic();
        txn2.modify_page(0).unwrap()[0] = 2;
        txn2.commit().unwrap();

        assert_eq!(snap.read_page(0).unwrap().unwrap()[0], 1);
        assert_eq!(prefix.read_page(0, prefix.current_state()).unwrap().unwrap()[0], 2);
    }
}
