//! Segment Directory
//!
//! Enumerates segment files, orders them by first LSN and verifies that
//! their ranges tile the log without gaps.

use std::path::{Path, PathBuf};

use super::record::Lsn;
use super::segment::{parse_segment_name, scan_segment, SegmentMeta, SegmentScan};
use crate::error::{Error, Result};

/// A segment file discovered on disk, not yet scanned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub first_lsn: Lsn,
    pub path: PathBuf,
}

/// List all segment files in a directory, ordered by first LSN
pub fn list_segments(dir: &Path) -> Result<Vec<SegmentFile>> {
    let mut segments = Vec::new();

    if !dir.exists() {
        return Ok(segments);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if let Some(first_lsn) = name.to_str().and_then(parse_segment_name) {
            segments.push(SegmentFile {
                first_lsn,
                path: entry.path(),
            });
        }
    }

    // Zero-padded names: name order is LSN order
    segments.sort_by_key(|s| s.first_lsn);
    Ok(segments)
}

/// Fully validated view of a WAL directory
#[derive(Debug)]
pub struct SegmentDirectory {
    /// Sealed segments, oldest first
    pub sealed: Vec<SegmentMeta>,
    /// Scan of the last segment, which becomes the active one
    pub active: Option<SegmentScan>,
}

impl SegmentDirectory {
    /// Scan every segment and check contiguity
    ///
    /// A tear in a sealed segment is corruption. A tear in the last segment
    /// is reported on `active.torn` for the writer to repair.
    pub fn scan(dir: &Path) -> Result<Self> {
        let files = list_segments(dir)?;
        let mut sealed: Vec<SegmentMeta> = Vec::with_capacity(files.len().saturating_sub(1));
        let mut active = None;

        let count = files.len();
        for (index, file) in files.into_iter().enumerate() {
            if let Some(prev) = sealed.last() {
                check_adjacent(prev, &file)?;
            }

            let scan = scan_segment(&file.path, file.first_lsn)?;
            if scan.unknown_kinds > 0 {
                tracing::debug!(
                    segment = ?file.path,
                    count = scan.unknown_kinds,
                    "Segment holds records of unknown kind"
                );
            }

            if index + 1 == count {
                active = Some(scan);
            } else {
                if let Some(torn) = scan.torn {
                    return Err(Error::CorruptSegment {
                        path: file.path,
                        offset: torn.offset,
                        reason: torn.reason.to_string(),
                    });
                }
                sealed.push(scan.meta);
            }
        }

        Ok(Self { sealed, active })
    }

    /// LSN of the last valid record, or 0 for an empty log
    pub fn last_lsn(&self) -> Lsn {
        match &self.active {
            Some(scan) => scan.meta.last_lsn,
            None => 0,
        }
    }
}

fn check_adjacent(prev: &SegmentMeta, next: &SegmentFile) -> Result<()> {
    let expected = prev.last_lsn + 1;
    if expected != next.first_lsn {
        return Err(Error::SegmentGap {
            path: next.path.clone(),
            expected,
            found: next.first_lsn,
        });
    }
    Ok(())
}
