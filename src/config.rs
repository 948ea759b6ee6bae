//! Workspace/prefix tunables (spec §6).

use crate::error::{Error, Result};

/// Read/write access requested when opening a workspace or fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    ReadOnly,
    ReadWrite,
}

/// Parse an access-type string the way the source's `parseAccessType` does:
/// any `'w'` character anywhere in the string escalates to read-write.
pub fn parse_access_type(s: &str) -> AccessType {
    if s.chars().any(|c| c == 'w' || c == 'W') {
        AccessType::ReadWrite
    } else {
        AccessType::ReadOnly
    }
}

/// Tunables recognized by a [`crate::workspace::Workspace`] (spec §6).
#[derive(Debug, Clone)]
pub struct Config {
    /// Prefix page size in bytes. Must be a power of two and a multiple of 8.
    pub page_size: usize,
    /// Soft cap, in bytes, for the [`crate::cache::CacheRecycler`].
    pub cache_bytes: usize,
    /// Default slab size handed to a fresh [`crate::alloc::slab::SlabAllocator`].
    pub slab_size: usize,
    /// Read-only vs. read-write.
    pub access_type: AccessType,
    /// Reads-before-self-sort for the adaptive lookup tree.
    pub sort_threshold: u32,
    /// Meta-stream stride, in bytes (spec §6).
    pub step_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: crate::page::DEFAULT_PAGE_SIZE,
            cache_bytes: 2 << 30,
            slab_size: 64 << 20,
            access_type: AccessType::ReadWrite,
            sort_threshold: 4,
            step_size: 16 << 20,
        }
    }
}

impl Config {
    /// Validate the tunables, rejecting a page size that isn't a sane power of two.
    pub fn validate(&self) -> Result<()> {
        if self.page_size < 8 || !self.page_size.is_power_of_two() {
            return Err(Error::Input("page_size must be a power of two >= 8"));
        }
        if self.slab_size < self.page_size || !self.slab_size.is_multiple_of(self.page_size) {
            return Err(Error::Input("slab_size must be a page_size-aligned multiple"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_type_escalates_on_any_w() {
        assert_eq!(parse_access_type("r"), AccessType::ReadOnly);
        assert_eq!(parse_access_type("rw"), AccessType::ReadWrite);
        assert_eq!(parse_access_type("wr"), AccessType::ReadWrite);
        assert_eq!(parse_access_type(""), AccessType::ReadOnly);
    }

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        let cfg = Config {
            page_size: 4097,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
