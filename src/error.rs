use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the storage engine (spec §7).
///
/// `Internal`, `BadAddress`, and `OutOfDiskSpace` are fatal: the fixture that
/// raised one is poisoned and must be re-opened. `Input`, `KeyNotFound`,
/// `Io`, and `ClassNotFound` are recoverable and unwind to the API boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An invariant was violated; the fixture that raised this is no longer usable.
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),

    /// Caller-provided value was invalid (bad index, unknown attribute, type mismatch).
    #[error("invalid input: {0}")]
    Input(&'static str),

    /// A lookup by key failed (pool, slot, catalogue, allocator).
    #[error("key not found: {0}")]
    KeyNotFound(&'static str),

    /// A transient storage failure (short read/write, lock timeout).
    #[error("storage I/O failed")]
    Io(#[source] std::io::Error),

    /// The backing file could not grow any further.
    #[error("out of disk space: requested {requested} more bytes")]
    OutOfDiskSpace { requested: usize },

    /// A v-object address was out of bounds or pointed at corrupt data.
    #[error("address out of bounds or corrupt record at offset 0x{offset:x}")]
    BadAddress { offset: u64 },

    /// An embedder asked for a host type that isn't registered.
    #[error("class not registered: {0}")]
    ClassNotFound(String),
}

impl Error {
    /// True for the three fatal kinds that poison their owning fixture.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Internal(_) | Error::BadAddress { .. } | Error::OutOfDiskSpace { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}
