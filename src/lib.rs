//! A persistent object-graph storage engine: a paged, copy-on-write
//! storage substrate; a memspace/allocator layer; a reference-counted
//! object model with range-tree and tag indexes; and a GC0 collector.

pub mod address;
pub mod alloc;
pub mod cache;
pub mod changelog;
pub mod config;
pub mod diff;
pub mod error;
pub mod fixture;
pub mod gc;
pub mod iter;
pub mod lock;
pub mod memspace;
pub mod object;
pub mod page;
pub mod prefix;
pub mod rangetree;
pub mod snapshot;
pub mod storage;
pub mod tagindex;
pub mod workspace;

pub use config::Config;
pub use error::{Error, Result};
pub use fixture::Fixture;
pub use prefix::Prefix;
pub use workspace::Workspace;

/// Install a `tracing` subscriber reading `RUST_LOG`, falling back to
/// `info`. Intended for embedders and `#[test]`s that want log output;
/// safe to call more than once (later calls are no-ops).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
