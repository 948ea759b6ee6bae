//! Per-commit change log entries (spec §3, §6).
//!
//! Grounded on `dbzero/core/storage/ChangeLog.{hpp,cpp}`: a change-log entry
//! records the sorted list of page numbers touched by a commit, optionally
//! run-length compressed, plus a trailing sentinel "end storage page number"
//! used to detect truncation on reopen.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::{Error, Result};

/// A single `(page_delta, run_length)` pair in the RLE encoding.
struct Run {
    delta: u64,
    count: u32,
}

/// The sorted set of page numbers modified by one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeLogEntry {
    pub state_num: u64,
    pub pages: Vec<u64>,
    pub end_storage_page_num: u64,
}

impl ChangeLogEntry {
    pub fn new(state_num: u64, mut pages: Vec<u64>, end_storage_page_num: u64) -> Self {
        pages.sort_unstable();
        pages.dedup();
        Self {
            state_num,
            pages,
            end_storage_page_num,
        }
    }

    fn rle_runs(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = Vec::new();
        let mut prev = 0u64;
        for &page in &self.pages {
            let delta = page - prev;
            prev = page;
            match runs.last_mut() {
                Some(run) if run.delta == delta => run.count += 1,
                _ => runs.push(Run { delta, count: 1 }),
            }
        }
        runs
    }

    /// Encode as `[state_num:u64][end_sentinel:u64][rle_flag:u8][body]`.
    /// `body` is either the RLE run list or a flat page-number list,
    /// whichever is shorter — matching the source's `initRLECompress`,
    /// which only applies RLE when it was explicitly requested; here we
    /// choose automatically since there's no external caller to decide.
    pub fn encode(&self) -> Vec<u8> {
        let mut flat = Vec::with_capacity(8 * self.pages.len());
        for &p in &self.pages {
            flat.write_u64::<LittleEndian>(p).unwrap();
        }

        let runs = self.rle_runs();
        let mut rle = Vec::new();
        rle.write_u32::<LittleEndian>(runs.len() as u32).unwrap();
        for run in &runs {
            rle.write_u64::<LittleEndian>(run.delta).unwrap();
            rle.write_u32::<LittleEndian>(run.count).unwrap();
        }

        let use_rle = rle.len() < flat.len();
        let mut out = Vec::new();
        out.write_u64::<LittleEndian>(self.state_num).unwrap();
        out.write_u64::<LittleEndian>(self.end_storage_page_num)
            .unwrap();
        out.write_u8(use_rle as u8).unwrap();
        if use_rle {
            out.write_u32::<LittleEndian>(self.pages.len() as u32)
                .unwrap();
            out.extend_from_slice(&rle);
        } else {
            out.extend_from_slice(&flat);
        }
        out
    }

    /// Decode one entry written by [`Self::encode`].
    ///
    /// A short read or an internally inconsistent run table is reported as
    /// `Error::Internal` — per spec §4.1, a corrupt change-log entry means
    /// the prefix should be treated as truncated at the last good entry.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let state_num = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| Error::Internal("truncated change-log entry header"))?;
        let end_storage_page_num = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| Error::Internal("truncated change-log entry header"))?;
        let use_rle = cursor
            .read_u8()
            .map_err(|_| Error::Internal("truncated change-log entry header"))?
            != 0;

        let pages = if use_rle {
            let total = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| Error::Internal("truncated RLE page count"))? as usize;
            let run_count = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| Error::Internal("truncated RLE run count"))? as usize;
            let mut pages = Vec::with_capacity(total);
            let mut prev = 0u64;
            for _ in 0..run_count {
                let delta = cursor
                    .read_u64::<LittleEndian>()
                    .map_err(|_| Error::Internal("truncated RLE run"))?;
                let count = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| Error::Internal("truncated RLE run"))?;
                for _ in 0..count {
                    prev += delta;
                    pages.push(prev);
                }
            }
            if pages.len() != total {
                return Err(Error::Internal("RLE run table disagrees with page count"));
            }
            pages
        } else {
            let remaining = buf.len() - cursor.position() as usize;
            if !remaining.is_multiple_of(8) {
                return Err(Error::Internal("flat change-log body isn't u64-aligned"));
            }
            let mut pages = Vec::with_capacity(remaining / 8);
            for _ in 0..(remaining / 8) {
                pages.push(
                    cursor
                        .read_u64::<LittleEndian>()
                        .map_err(|_| Error::Internal("truncated flat change-log body"))?,
                );
            }
            pages
        };

        Ok(Self {
            state_num,
            pages,
            end_storage_page_num,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_sparse_pages() {
        let entry = ChangeLogEntry::new(42, vec![5, 3, 100, 3], 128);
        let encoded = entry.encode();
        let decoded = ChangeLogEntry::decode(&encoded).unwrap();
        assert_eq!(decoded.state_num, 42);
        assert_eq!(decoded.pages, vec![3, 5, 100]);
        assert_eq!(decoded.end_storage_page_num, 128);
    }

    #[test]
    fn round_trips_consecutive_run_with_rle() {
        let pages: Vec<u64> = (10..200).collect();
        let entry = ChangeLogEntry::new(1, pages.clone(), 1000);
        let encoded = entry.encode();
        // A single evenly-spaced run should compress far below the flat encoding.
        assert!(encoded.len() < pages.len() * 8);
        let decoded = ChangeLogEntry::decode(&encoded).unwrap();
        assert_eq!(decoded.pages, pages);
    }

    #[test]
    fn decode_rejects_truncated_entry() {
        assert!(ChangeLogEntry::decode(&[1, 2, 3]).is_err());
    }
}
