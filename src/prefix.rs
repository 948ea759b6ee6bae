//! The prefix: a CoW, multi-version paged storage substrate (spec §4.1).
//!
//! A [`Prefix`] owns one backing file (or none, for an anonymous in-memory
//! prefix) and hands out page content at any previously-committed state
//! number. Writers stage changes in a [`Transaction`]; `commit` assigns the
//! next state number, diffs each touched page against its predecessor (or
//! falls back to a full copy when the diff won't fit the budget), and
//! appends a [`ChangeLogEntry`] plus the page images to the durable log.

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::cache::PrefixCache;
use crate::changelog::ChangeLogEntry;
use crate::config::Config;
use crate::diff;
use crate::error::{Error, Result};
use crate::lock::{AccessMode, ResourceLock};
use crate::storage::{BlockStore, RootData};

/// A single page version: either the full page, or a diff against the
/// immediately preceding version of the same page.
#[derive(Clone)]
enum PageImage {
    Full(Vec<u8>),
    Diff(Vec<u8>),
}

/// A page's full version history, newest last.
type PageHistory = BTreeMap<u64, PageImage>;

/// A snapshot pins a prefix to a state number so repeated reads against it
/// always observe the same committed view (spec §4.1, `getSnapshot`).
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub state_num: u64,
}

/// A staged set of page writes not yet committed.
pub struct Transaction<'p> {
    prefix: &'p Prefix,
    base_state: u64,
    staged: HashMap<u64, Vec<u8>>,
}

impl<'p> Transaction<'p> {
    /// Return a mutable, clone-on-first-touch view of `page_num`, reading it
    /// at the transaction's base state if this is the first touch.
    pub fn modify_page(&mut self, page_num: u64) -> Result<&mut Vec<u8>> {
        if !self.staged.contains_key(&page_num) {
            let buf = self
                .prefix
                .read_page(page_num, self.base_state)?
                .unwrap_or_else(|| crate::page::zero_page(self.prefix.page_size));
            self.staged.insert(page_num, buf);
        }
        Ok(self.staged.get_mut(&page_num).unwrap())
    }

    /// Write `data` starting at logical byte offset `start_offset`, touching
    /// as many pages as the write spans (generalizes [`Self::modify_page`]
    /// from whole pages to an arbitrary byte range, the way [`crate::lock::
    /// BoundaryLock`] generalizes a single page to two).
    pub fn write_range(&mut self, start_offset: u64, data: &[u8]) -> Result<()> {
        let page_size = self.prefix.page_size as u64;
        let mut written = 0usize;
        while written < data.len() {
            let offset = start_offset + written as u64;
            let page_num = offset / page_size;
            let in_page = (offset % page_size) as usize;
            let take = (data.len() - written).min(self.prefix.page_size - in_page);
            let page = self.modify_page(page_num)?;
            page[in_page..in_page + take].copy_from_slice(&data[written..written + take]);
            written += take;
        }
        Ok(())
    }

    /// Commit the staged writes, returning the new state number.
    pub fn commit(self) -> Result<u64> {
        self.prefix.commit(self.base_state, self.staged)
    }
}

pub struct Prefix {
    page_size: usize,
    diff_budget: usize,
    uuid: [u8; 16],
    store: Mutex<BlockStore>,
    histories: Mutex<HashMap<u64, PageHistory>>,
    cache: Mutex<PrefixCache>,
    current_state: AtomicU64,
    max_page_num: AtomicU64,
    changelog_len: AtomicU64,
}

impl Prefix {
    /// Open or create a file-backed prefix at `path`.
    pub fn open_file(path: &Path, config: &Config) -> Result<Self> {
        config.validate()?;

        // Sanity-check against the OS page size, the way the teacher's own
        // file-open path does. Unlike the teacher (fixed 4k/16k pages), this
        // crate supports arbitrary power-of-two page sizes (including the
        // small ones this crate's own tests use), so a mismatch is logged
        // rather than rejected outright.
        let os_page_size = page_size::get();
        if config.page_size < os_page_size || !config.page_size.is_multiple_of(os_page_size) {
            tracing::warn!(
                configured = config.page_size,
                os_page_size,
                "configured page_size is not a multiple of the OS page size"
            );
        }

        if path.exists() {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            let mut store = BlockStore::open_file(file)?;
            let root = store
                .read_root()
                .ok_or(Error::Internal("prefix file has no valid root"))?;
            let (histories, max_page_num) = Self::replay(&mut store, root.changelog_len)?;
            return Ok(Self {
                page_size: root.page_size as usize,
                diff_budget: config.page_size / 2,
                uuid: root.uuid,
                histories: Mutex::new(histories),
                cache: Mutex::new(PrefixCache::new(config.cache_bytes, root.page_size as usize)),
                current_state: AtomicU64::new(root.state_num),
                max_page_num: AtomicU64::new(max_page_num),
                changelog_len: AtomicU64::new(root.changelog_len),
                store: Mutex::new(store),
            });
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut store = BlockStore::create_file(file)?;
        let uuid = uuid_from_path(path);
        let root = RootData {
            page_size: config.page_size as u32,
            state_num: 0,
            uuid,
            changelog_len: 0,
            body: Vec::new(),
        };
        store.write_root(&root)?;
        Ok(Self {
            page_size: config.page_size,
            diff_budget: config.page_size / 2,
            uuid,
            store: Mutex::new(store),
            histories: Mutex::new(HashMap::new()),
            cache: Mutex::new(PrefixCache::new(config.cache_bytes, config.page_size)),
            current_state: AtomicU64::new(0),
            max_page_num: AtomicU64::new(0),
            changelog_len: AtomicU64::new(0),
        })
    }

    /// Create an anonymous, in-memory-only prefix (no durable backing file).
    pub fn create_anon(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            page_size: config.page_size,
            diff_budget: config.page_size / 2,
            uuid: [0; 16],
            store: Mutex::new(BlockStore::create_anon()),
            histories: Mutex::new(HashMap::new()),
            cache: Mutex::new(PrefixCache::new(config.cache_bytes, config.page_size)),
            current_state: AtomicU64::new(0),
            max_page_num: AtomicU64::new(0),
            changelog_len: AtomicU64::new(0),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    pub fn current_state(&self) -> u64 {
        self.current_state.load(Ordering::SeqCst)
    }

    pub fn get_snapshot(&self) -> Snapshot {
        Snapshot {
            state_num: self.current_state(),
        }
    }

    /// Begin a write transaction rooted at the prefix's current state.
    pub fn begin_atomic(&self) -> Transaction<'_> {
        Transaction {
            prefix: self,
            base_state: self.current_state(),
            staged: HashMap::new(),
        }
    }

    /// Resolve a page's content as of `state_num`, or `None` if the page was
    /// never written at or before that state (spec §4.1, three-tier
    /// resolution: cache, then diff-chain reconstruction, then "never
    /// written").
    pub fn read_page(&self, page_num: u64, state_num: u64) -> Result<Option<Vec<u8>>> {
        if self.cache.lock().unwrap().is_known_missing(page_num, state_num) {
            return Ok(None);
        }

        let histories = self.histories.lock().unwrap();
        let Some(history) = histories.get(&page_num) else {
            self.cache.lock().unwrap().mark_missing(page_num, state_num);
            return Ok(None);
        };
        // The newest committed version at or before `state_num` is the only
        // one that can ever answer this query; peeking it is cheap and lets
        // the cache be consulted as an exact-match lookup below, regardless
        // of which states it happens to already hold (see `cache::get`).
        let Some(&found_state) = history.range(..=state_num).next_back().map(|(s, _)| s) else {
            drop(histories);
            self.cache.lock().unwrap().mark_missing(page_num, state_num);
            return Ok(None);
        };

        if let Some(lock) = self.cache.lock().unwrap().get(page_num, found_state) {
            return Ok(Some(lock.read().clone()));
        }

        let mut chain: Vec<&PageImage> = Vec::new();
        for (_, image) in history.range(..=found_state).rev() {
            chain.push(image);
            if matches!(image, PageImage::Full(_)) {
                break;
            }
        }
        chain.reverse();
        let mut buf = match chain.first() {
            Some(PageImage::Full(bytes)) => bytes.clone(),
            _ => return Err(Error::Internal("page history has no full base image")),
        };
        for image in &chain[1..] {
            match image {
                PageImage::Diff(patch) => {
                    buf = diff::apply(&buf, patch)
                        .ok_or(Error::Internal("stored page diff failed to apply"))?;
                }
                PageImage::Full(bytes) => buf = bytes.clone(),
            }
        }
        drop(histories);

        let lock = Arc::new(ResourceLock::new(
            page_num,
            found_state,
            AccessMode::READ,
            buf.clone(),
        ));
        self.cache.lock().unwrap().insert(page_num, found_state, lock);
        Ok(Some(buf))
    }

    /// Read `len` bytes starting at logical byte offset `start_offset` as of
    /// `state_num`, spanning as many pages as needed. A page never written at
    /// or before `state_num` reads as zero, matching [`Transaction::
    /// modify_page`]'s zero-fill for a fresh page.
    pub fn read_range(&self, start_offset: u64, len: usize, state_num: u64) -> Result<Vec<u8>> {
        let page_size = self.page_size as u64;
        let mut out = Vec::with_capacity(len);
        let mut read = 0usize;
        while read < len {
            let offset = start_offset + read as u64;
            let page_num = offset / page_size;
            let in_page = (offset % page_size) as usize;
            let take = (len - read).min(self.page_size - in_page);
            let page = self
                .read_page(page_num, state_num)?
                .unwrap_or_else(|| crate::page::zero_page(self.page_size));
            out.extend_from_slice(&page[in_page..in_page + take]);
            read += take;
        }
        Ok(out)
    }

    fn commit(&self, base_state: u64, staged: HashMap<u64, Vec<u8>>) -> Result<u64> {
        if staged.is_empty() {
            return Ok(base_state);
        }
        let new_state = base_state + 1;
        tracing::debug!(new_state, pages = staged.len(), "committing transaction");
        let mut histories = self.histories.lock().unwrap();
        let mut touched: Vec<u64> = staged.keys().copied().collect();
        touched.sort_unstable();

        let mut record = Vec::new();
        record.write_u32::<LittleEndian>(touched.len() as u32).unwrap();
        for &page_num in &touched {
            let new_buf = &staged[&page_num];
            let history = histories.entry(page_num).or_default();
            let prev_full = history
                .range(..=base_state)
                .next_back()
                .and_then(|(_, img)| match img {
                    PageImage::Full(b) => Some(b.clone()),
                    PageImage::Diff(_) => None,
                });

            let image = match &prev_full {
                Some(old) if old.len() == new_buf.len() => {
                    match diff::diff(old, new_buf, self.diff_budget) {
                        Some(patch) => PageImage::Diff(patch),
                        None => PageImage::Full(new_buf.clone()),
                    }
                }
                _ => PageImage::Full(new_buf.clone()),
            };

            record.write_u64::<LittleEndian>(page_num).unwrap();
            match &image {
                PageImage::Full(b) => {
                    record.write_u8(1).unwrap();
                    record.write_u32::<LittleEndian>(b.len() as u32).unwrap();
                    record.extend_from_slice(b);
                }
                PageImage::Diff(b) => {
                    record.write_u8(0).unwrap();
                    record.write_u32::<LittleEndian>(b.len() as u32).unwrap();
                    record.extend_from_slice(b);
                }
            }
            history.insert(new_state, image);

            self.max_page_num.fetch_max(page_num, Ordering::SeqCst);
            let lock = Arc::new(ResourceLock::new(
                page_num,
                new_state,
                AccessMode::READ | AccessMode::WRITE,
                new_buf.clone(),
            ));
            self.cache.lock().unwrap().insert(page_num, new_state, lock);
        }
        drop(histories);

        let end_storage_page_num = self.max_page_num.load(Ordering::SeqCst);
        let entry = ChangeLogEntry::new(new_state, touched, end_storage_page_num);
        let entry_bytes = entry.encode();

        let mut full_record = Vec::new();
        full_record
            .write_u32::<LittleEndian>(entry_bytes.len() as u32)
            .unwrap();
        full_record.extend_from_slice(&entry_bytes);
        full_record.extend_from_slice(&record);

        let mut framed = Vec::new();
        framed
            .write_u32::<LittleEndian>(full_record.len() as u32)
            .unwrap();
        framed.extend_from_slice(&full_record);

        let mut store = self.store.lock().unwrap();
        let offset = self.changelog_len.load(Ordering::SeqCst);
        store.append_changelog(offset, &framed)?;
        let new_changelog_len = offset + framed.len() as u64;
        store.write_root(&RootData {
            page_size: self.page_size as u32,
            state_num: new_state,
            uuid: self.uuid,
            changelog_len: new_changelog_len,
            body: Vec::new(),
        })?;
        drop(store);

        self.changelog_len.store(new_changelog_len, Ordering::SeqCst);
        self.current_state.store(new_state, Ordering::SeqCst);
        tracing::trace!(new_state, new_changelog_len, "commit flushed to the change log");
        Ok(new_state)
    }

    /// Rebuild in-memory page histories by replaying the durable change log
    /// from the start (spec §4.1, crash-recovery on reopen).
    fn replay(store: &mut BlockStore, changelog_len: u64) -> Result<(HashMap<u64, PageHistory>, u64)> {
        tracing::debug!(changelog_len, "replaying change log on reopen");
        let mut histories: HashMap<u64, PageHistory> = HashMap::new();
        let mut max_page_num = 0u64;
        if changelog_len == 0 {
            return Ok((histories, max_page_num));
        }
        let bytes = store.read_changelog(0, changelog_len as usize)?;
        let mut pos = 0usize;
        while pos < bytes.len() {
            if pos + 4 > bytes.len() {
                return Err(Error::Internal("truncated change-log frame length"));
            }
            let frame_len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            let frame = bytes
                .get(pos..pos + frame_len)
                .ok_or(Error::Internal("truncated change-log frame body"))?;
            pos += frame_len;

            let mut cur = std::io::Cursor::new(frame);
            let entry_len = cur.read_u32::<LittleEndian>().unwrap() as usize;
            let entry_start = cur.position() as usize;
            let entry = ChangeLogEntry::decode(&frame[entry_start..entry_start + entry_len])?;
            cur.set_position((entry_start + entry_len) as u64);

            let page_count = cur.read_u32::<LittleEndian>().unwrap() as usize;
            for _ in 0..page_count {
                let page_num = cur.read_u64::<LittleEndian>().unwrap();
                let is_full = cur.read_u8().unwrap() != 0;
                let len = cur.read_u32::<LittleEndian>().unwrap() as usize;
                let body_start = cur.position() as usize;
                let body = frame
                    .get(body_start..body_start + len)
                    .ok_or(Error::Internal("truncated page image in change-log"))?
                    .to_vec();
                cur.set_position((body_start + len) as u64);
                let image = if is_full {
                    PageImage::Full(body)
                } else {
                    PageImage::Diff(body)
                };
                histories.entry(page_num).or_default().insert(entry.state_num, image);
                max_page_num = max_page_num.max(page_num);
            }
        }
        Ok((histories, max_page_num))
    }
}

fn uuid_from_path(path: &Path) -> [u8; 16] {
    let hash = xxhash_rust::xxh3::xxh3_128(path.to_string_lossy().as_bytes());
    hash.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn cfg() -> Config {
        Config {
            page_size: 16,
            ..Config::default()
        }
    }

    #[test]
    fn writes_are_invisible_until_committed_and_isolated_per_snapshot() {
        let prefix = Prefix::create_anon(&cfg()).unwrap();
        let snap0 = prefix.get_snapshot();

        let mut txn = prefix.begin_atomic();
        txn.modify_page(0).unwrap().copy_from_slice(b"AAAAAAAAAAAAAAAA");
        let state1 = txn.commit().unwrap();
        assert_eq!(state1, 1);

        // The pre-commit snapshot must still see "never written".
        assert_eq!(prefix.read_page(0, snap0.state_num).unwrap(), None);
        assert_eq!(
            prefix.read_page(0, state1).unwrap().unwrap(),
            b"AAAAAAAAAAAAAAAA".to_vec()
        );

        let mut txn2 = prefix.begin_atomic();
        txn2.modify_page(0).unwrap()[0] = b'B';
        let state2 = txn2.commit().unwrap();

        // Old snapshot is untouched by the later write (CoW isolation).
        assert_eq!(
            prefix.read_page(0, state1).unwrap().unwrap(),
            b"AAAAAAAAAAAAAAAA".to_vec()
        );
        assert_eq!(prefix.read_page(0, state2).unwrap().unwrap()[0], b'B');
    }

    #[test]
    fn reopening_a_file_backed_prefix_replays_the_change_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p0.db0");
        let cfg = cfg();

        let state_after;
        {
            let prefix = Prefix::open_file(&path, &cfg).unwrap();
            let mut txn = prefix.begin_atomic();
            txn.modify_page(3).unwrap().copy_from_slice(b"HELLO, WORLD!!!!");
            state_after = txn.commit().unwrap();
            let mut txn2 = prefix.begin_atomic();
            txn2.modify_page(3).unwrap()[0] = b'J';
            txn2.commit().unwrap();
        }

        let reopened = Prefix::open_file(&path, &cfg).unwrap();
        assert_eq!(reopened.current_state(), state_after + 1);
        assert_eq!(
            reopened.read_page(3, state_after).unwrap().unwrap(),
            b"HELLO, WORLD!!!!".to_vec()
        );
        assert_eq!(reopened.read_page(3, state_after + 1).unwrap().unwrap()[0], b'J');
    }

    #[test]
    fn unwritten_page_is_reported_missing_not_zeroed() {
        let prefix = Prefix::create_anon(&cfg()).unwrap();
        assert_eq!(prefix.read_page(99, prefix.current_state()).unwrap(), None);
    }

    #[test]
    fn range_write_and_read_span_multiple_pages() {
        let prefix = Prefix::create_anon(&cfg()).unwrap(); // page_size = 16
        let mut txn = prefix.begin_atomic();
        txn.write_range(10, b"0123456789ABCDEF").unwrap(); // spans pages 0, 1, 2
        let state = txn.commit().unwrap();
        assert_eq!(prefix.read_range(10, 16, state).unwrap(), b"0123456789ABCDEF".to_vec());
        // Bytes outside the write on a touched page read back as zero.
        assert_eq!(prefix.read_page(0, state).unwrap().unwrap()[..10], [0u8; 10]);
    }
}
