//! Workspace: a set of named fixtures sharing a cache budget and an
//! inter-process lock (spec §4.11, §6).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fs4::fs_std::FileExt;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fixture::Fixture;
use crate::prefix::Prefix;

/// How often a blocking acquisition polls `try_lock_exclusive` while waiting
/// out its deadline.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Options governing acquisition of a workspace's inter-process lock
/// (spec §6): `{blocking, timeout_ms, force_unlock}`. `timeout_ms` of `0`
/// (the default) means "wait forever" when `blocking` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockOptions {
    pub blocking: bool,
    pub timeout_ms: u64,
    pub force_unlock: bool,
}

struct InterProcessLock {
    _file: File,
}

impl InterProcessLock {
    fn acquire(path: &Path, opts: LockOptions) -> Result<Self> {
        if opts.force_unlock && path.exists() {
            let _ = std::fs::remove_file(path);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        tracing::debug!(
            path = %path.display(),
            blocking = opts.blocking,
            timeout_ms = opts.timeout_ms,
            "acquiring workspace lock"
        );
        if opts.blocking {
            Self::acquire_blocking(&file, opts.timeout_ms)?;
        } else {
            file.try_lock_exclusive()
                .map_err(|_| Error::Io(std::io::Error::other("workspace is locked by another process")))?;
        }
        Ok(Self { _file: file })
    }

    /// Poll `try_lock_exclusive` until it succeeds or `timeout_ms` elapses.
    /// `timeout_ms == 0` waits without a bound, matching the unbounded
    /// `lock_exclusive` contract for callers that genuinely want that.
    fn acquire_blocking(file: &File, timeout_ms: u64) -> Result<()> {
        if timeout_ms == 0 {
            return file
                .lock_exclusive()
                .map_err(|_| Error::Io(std::io::Error::other("lock acquisition failed")));
        }
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(()),
                Err(_) if Instant::now() >= deadline => {
                    return Err(Error::Io(std::io::Error::other("timed out waiting for workspace lock")));
                }
                Err(_) => std::thread::sleep(LOCK_POLL_INTERVAL.min(deadline - Instant::now())),
            }
        }
    }
}

/// The top-level container: a directory of prefix files, each opened as a
/// named [`Fixture`] under a shared configuration (spec §4.11).
pub struct Workspace {
    dir: PathBuf,
    config: Config,
    _lock: InterProcessLock,
    fixtures: Mutex<HashMap<String, Fixture>>,
}

impl Workspace {
    /// Open the workspace directory at `dir`, creating it if necessary, and
    /// acquire its inter-process lock.
    pub fn open(dir: impl Into<PathBuf>, config: Config, lock_opts: LockOptions) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let lock = InterProcessLock::acquire(&dir.join(".workspace.lock"), lock_opts)?;
        Ok(Self {
            dir,
            config,
            _lock: lock,
            fixtures: Mutex::new(HashMap::new()),
        })
    }

    /// Open (creating if absent) the named fixture's prefix file and
    /// register it under `name`.
    pub fn open_fixture(&self, name: &str) -> Result<()> {
        let mut fixtures = self.fixtures.lock().unwrap();
        if fixtures.contains_key(name) {
            return Ok(());
        }
        let path = self.dir.join(format!("{name}.db0"));
        let prefix = Prefix::open_file(&path, &self.config)?;
        let fixture = Fixture::new(prefix, self.config.slab_size as u64)?;
        fixtures.insert(name.to_string(), fixture);
        Ok(())
    }

    pub fn with_fixture<R>(&self, name: &str, f: impl FnOnce(&Fixture) -> R) -> Result<R> {
        let fixtures = self.fixtures.lock().unwrap();
        let fixture = fixtures.get(name).ok_or(Error::KeyNotFound("no such fixture open"))?;
        Ok(f(fixture))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_a_second_workspace_on_the_same_dir_without_force_unlock_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ws1 = Workspace::open(dir.path(), Config::default(), LockOptions::default()).unwrap();
        let err = Workspace::open(dir.path(), Config::default(), LockOptions::default());
        assert!(err.is_err());
        drop(ws1);
    }

    #[test]
    fn blocking_acquire_times_out_against_an_already_held_lock() {
        let dir = tempfile::tempdir().unwrap();
        let ws1 = Workspace::open(dir.path(), Config::default(), LockOptions::default()).unwrap();
        let opts = LockOptions { blocking: true, timeout_ms: 50, force_unlock: false };
        let err = Workspace::open(dir.path(), Config::default(), opts);
        assert!(err.is_err());
        drop(ws1);
    }

    #[test]
    fn fixtures_are_reachable_by_name_after_opening() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path(), Config::default(), LockOptions::default()).unwrap();
        ws.open_fixture("main").unwrap();
        let state = ws.with_fixture("main", |f| f.prefix.current_state()).unwrap();
        assert_eq!(state, 0);
        assert!(ws.with_fixture("missing", |_| ()).is_err());
    }
}
