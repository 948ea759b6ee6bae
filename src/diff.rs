//! Per-page diff encode/apply (spec §4.1, testable property 2).
//!
//! Pages being diffed are always equal length (fixed page size), so the
//! codec never needs to represent a length change. A diff is a sequence of
//! runs, each either a `Copy` (bytes unchanged from the old image) or a
//! `Replace` (bytes that differ, stored inline). Runs are encoded as
//! `[tag: u8][len: u32 LE]` followed by the replacement bytes for `Replace`
//! runs.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

const TAG_COPY: u8 = 0;
const TAG_REPLACE: u8 = 1;

/// Diff `old` against `new`, returning `None` if the encoded diff would
/// exceed `budget` bytes (the caller should fall back to full-page storage).
pub fn diff(old: &[u8], new: &[u8], budget: usize) -> Option<Vec<u8>> {
    assert_eq!(old.len(), new.len(), "diffed pages must be equal length");
    let mut out = Vec::new();
    let mut i = 0;
    while i < old.len() {
        if old[i] == new[i] {
            let start = i;
            while i < old.len() && old[i] == new[i] {
                i += 1;
            }
            out.push(TAG_COPY);
            out.write_u32::<LittleEndian>((i - start) as u32).ok()?;
        } else {
            let start = i;
            while i < old.len() && old[i] != new[i] {
                i += 1;
            }
            out.push(TAG_REPLACE);
            out.write_u32::<LittleEndian>((i - start) as u32).ok()?;
            out.extend_from_slice(&new[start..i]);
        }
        if out.len() > budget {
            return None;
        }
    }
    if out.len() > budget {
        None
    } else {
        Some(out)
    }
}

/// Apply a diff produced by [`diff`] to `old`, reproducing `new`.
///
/// Returns `None` on a malformed patch (truncated run header, run extending
/// past the page, or a non-`Copy`/`Replace` tag); callers should treat this
/// as `Error::Internal` — a corrupt diff can never be partially applied.
pub fn apply(old: &[u8], patch: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(old.len());
    let mut cursor = Cursor::new(patch);
    let mut pos = 0usize;
    while (cursor.position() as usize) < patch.len() {
        let tag = cursor.read_u8().ok()?;
        let len = cursor.read_u32::<LittleEndian>().ok()? as usize;
        match tag {
            TAG_COPY => {
                out.extend_from_slice(old.get(pos..pos + len)?);
                pos += len;
            }
            TAG_REPLACE => {
                let start = cursor.position() as usize;
                let bytes = patch.get(start..start + len)?;
                out.extend_from_slice(bytes);
                cursor.set_position((start + len) as u64);
                pos += len;
            }
            _ => return None,
        }
    }
    if pos == old.len() {
        Some(out)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_for_any_equal_length_pair() {
        let a = b"AAAAAAAAAABBBBBBBBBBCCCCCCCCCC".to_vec();
        let b = b"AAAAAAAAAAXXXXBBBBBBCCCCCCCCCC".to_vec();
        let patch = diff(&a, &b, 1 << 16).expect("small diff should fit any reasonable budget");
        let out = apply(&a, &patch).unwrap();
        assert_eq!(out, b);
    }

    #[test]
    fn identical_pages_diff_to_a_tiny_patch() {
        let a = vec![7u8; 4096];
        let patch = diff(&a, &a, 4096).unwrap();
        assert!(patch.len() < 16);
        assert_eq!(apply(&a, &patch).unwrap(), a);
    }

    #[test]
    fn over_budget_diff_reports_failure() {
        let a = vec![0u8; 4096];
        let mut b = vec![0u8; 4096];
        // Flip every other byte: worst case for run-length diffing.
        for (i, byte) in b.iter_mut().enumerate() {
            if i % 2 == 0 {
                *byte = 1;
            }
        }
        assert!(diff(&a, &b, 64).is_none());
    }

    #[test]
    fn apply_rejects_truncated_patch() {
        let a = vec![0u8; 16];
        assert!(apply(&a, &[TAG_COPY, 1, 0, 0]).is_none());
    }
}
