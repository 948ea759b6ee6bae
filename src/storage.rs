//! Durable root header storage (spec §6 on-disk layout).
//!
//! Adapted from the teacher's `RootData`/`RootHeader`: a prefix keeps two
//! root pages and always writes to whichever one is stale, so a crash mid
//! write never destroys both copies. Each root page is `[header | bytes |
//! xxh3 checksum]`; the header with the higher `state_num` whose checksum
//! verifies wins on reopen.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use bytemuck::{Pod, Zeroable};
use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, Result};

pub const ROOT_SIZE: usize = 4096;
const MAGIC: [u8; 8] = *b"db0-pfx\0";

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RootHeader {
    magic: [u8; 8],
    version: u8,
    _reserved: [u8; 7],
    page_size: u32,
    body_len: u32,
    state_num: u64,
    uuid: [u8; 16],
    changelog_len: u64,
}

/// Everything persisted about a prefix's identity and commit watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootData {
    pub page_size: u32,
    pub state_num: u64,
    pub uuid: [u8; 16],
    pub changelog_len: u64,
    pub body: Vec<u8>,
}

impl RootData {
    fn encode(&self) -> Result<Vec<u8>> {
        let body_len = u32::try_from(self.body.len())
            .map_err(|_| Error::Internal("root body too large for a single page"))?;
        let header = RootHeader {
            magic: MAGIC,
            version: 1,
            _reserved: [0; 7],
            page_size: self.page_size,
            body_len,
            state_num: self.state_num,
            uuid: self.uuid,
            changelog_len: self.changelog_len,
        };
        let mut out = Vec::with_capacity(ROOT_SIZE);
        out.extend_from_slice(bytemuck::bytes_of(&header));
        out.extend_from_slice(&self.body);
        let hash = xxhash_rust::xxh3::xxh3_64(&out);
        out.extend_from_slice(&hash.to_le_bytes());
        if out.len() > ROOT_SIZE {
            return Err(Error::Internal("root page overflowed its fixed size"));
        }
        out.resize(ROOT_SIZE, 0);
        Ok(out)
    }

    fn decode(page: &[u8]) -> Result<Self> {
        let header_len = std::mem::size_of::<RootHeader>();
        let header: RootHeader = *bytemuck::from_bytes(&page[..header_len]);
        if header.magic != MAGIC || header.version != 1 {
            return Err(Error::Internal("root page magic/version mismatch"));
        }
        let body_len = header.body_len as usize;
        let body = page
            .get(header_len..header_len + body_len)
            .ok_or(Error::Internal("root body length out of range"))?;
        let hash_start = header_len + body_len;
        let hash_bytes = page
            .get(hash_start..hash_start + 8)
            .ok_or(Error::Internal("root checksum missing"))?;
        let stored_hash = u64::from_le_bytes(hash_bytes.try_into().unwrap());
        let actual_hash = xxhash_rust::xxh3::xxh3_64(&page[..hash_start]);
        if stored_hash != actual_hash {
            return Err(Error::Internal("root page checksum mismatch"));
        }
        Ok(Self {
            page_size: header.page_size,
            state_num: header.state_num,
            uuid: header.uuid,
            changelog_len: header.changelog_len,
            body: body.to_vec(),
        })
    }
}

/// The dual-root store plus the append-only change-log stream for one
/// prefix. `None` file means an anonymous, in-memory-only prefix.
pub struct BlockStore {
    file: Option<File>,
    root_map: Option<MmapMut>,
    mem_root: Option<[u8; 2 * ROOT_SIZE]>,
    write_root0: bool,
}

impl BlockStore {
    /// Create a brand-new, empty store (no committed root yet).
    pub fn create_anon() -> Self {
        Self {
            file: None,
            root_map: None,
            mem_root: Some([0u8; 2 * ROOT_SIZE]),
            write_root0: true,
        }
    }

    pub fn create_file(file: File) -> Result<Self> {
        file.set_len(2 * ROOT_SIZE as u64)?;
        let map = unsafe { MmapOptions::new().len(2 * ROOT_SIZE).map_mut(&file)? };
        Ok(Self {
            file: Some(file),
            root_map: Some(map),
            mem_root: None,
            write_root0: true,
        })
    }

    pub fn open_file(file: File) -> Result<Self> {
        let len = file.metadata()?.len();
        if len < 2 * ROOT_SIZE as u64 {
            return Err(Error::Internal("prefix file too small to hold its root pages"));
        }
        let map = unsafe { MmapOptions::new().len(2 * ROOT_SIZE).map_mut(&file)? };
        let root0 = RootData::decode(&map[0..ROOT_SIZE]);
        let root1 = RootData::decode(&map[ROOT_SIZE..2 * ROOT_SIZE]);
        let write_root0 = match (&root0, &root1) {
            (Ok(r0), Ok(r1)) => r1.state_num > r0.state_num,
            (Err(_), Ok(_)) => true,
            _ => false,
        };
        Ok(Self {
            file: Some(file),
            root_map: Some(map),
            mem_root: None,
            write_root0,
        })
    }

    fn root_bytes(&self) -> &[u8] {
        match (&self.root_map, &self.mem_root) {
            (Some(map), _) => &map[..],
            (None, Some(mem)) => &mem[..],
            _ => unreachable!(),
        }
    }

    /// Read the most recently committed root data, if any.
    pub fn read_root(&self) -> Option<RootData> {
        let bytes = self.root_bytes();
        let root0 = RootData::decode(&bytes[0..ROOT_SIZE]);
        let root1 = RootData::decode(&bytes[ROOT_SIZE..2 * ROOT_SIZE]);
        match (root0, root1) {
            (Ok(r0), Ok(r1)) => Some(if r1.state_num > r0.state_num { r1 } else { r0 }),
            (Ok(r), Err(_)) | (Err(_), Ok(r)) => Some(r),
            _ => None,
        }
    }

    /// Write `root` into whichever root page is currently stale, flipping
    /// which one is stale for next time.
    pub fn write_root(&mut self, root: &RootData) -> Result<()> {
        let encoded = root.encode()?;
        let (start, _end) = if self.write_root0 {
            (0, ROOT_SIZE)
        } else {
            (ROOT_SIZE, 2 * ROOT_SIZE)
        };
        match (&mut self.root_map, &mut self.mem_root) {
            (Some(map), _) => {
                map[start..start + ROOT_SIZE].copy_from_slice(&encoded);
                map.flush_range(start, ROOT_SIZE)?;
            }
            (None, Some(mem)) => {
                mem[start..start + ROOT_SIZE].copy_from_slice(&encoded);
            }
            _ => unreachable!(),
        }
        self.write_root0 = !self.write_root0;
        Ok(())
    }

    /// Append raw bytes to the change-log stream at the given byte offset
    /// (always the previous `changelog_len`), growing the file as needed.
    pub fn append_changelog(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(()); // anonymous prefixes don't persist a changelog
        };
        file.seek(SeekFrom::Start(2 * ROOT_SIZE as u64 + offset))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    pub fn read_changelog(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let Some(file) = self.file.as_mut() else {
            return Err(Error::Internal("anonymous prefix has no persisted changelog"));
        };
        let mut buf = vec![0u8; len];
        file.seek(SeekFrom::Start(2 * ROOT_SIZE as u64 + offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}
