//! WAL Reader
//!
//! Lazy, forward-only replay of records across segments.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use super::directory::{list_segments, SegmentFile};
use super::record::{Lsn, Record, TornReason};
use super::segment::{ReadOutcome, SegmentReader};
use crate::error::{Error, Result};

/// Where a replay of the active segment stopped on a torn record
///
/// The writer truncates the segment to `offset` when it next opens the
/// directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncationPoint {
    pub segment: PathBuf,
    pub offset: u64,
    pub reason: TornReason,
}

/// Iterator over records with `lsn >= from_lsn`, in LSN order
///
/// Yields `Err` at most once; iteration ends after an error.
pub struct Replay {
    /// Segments not yet opened
    pending: VecDeque<SegmentFile>,
    current: Option<CurrentSegment>,
    /// LSN the next decoded record must carry
    expected: Option<Lsn>,
    from_lsn: Lsn,
    truncation_point: Option<TruncationPoint>,
    finished: bool,
    unknown_kinds: u64,
}

struct CurrentSegment {
    file: SegmentFile,
    reader: SegmentReader,
    /// The newest segment in the directory, the only one allowed a tear
    is_last: bool,
}

/// Replay the WAL in `dir` from `from_lsn`
///
/// Sealed segments wholly below `from_lsn` are never opened. Segment files
/// are listed once, up front.
pub fn replay(dir: &Path, from_lsn: Lsn) -> Result<Replay> {
    let files = list_segments(dir)?;

    // A segment can be skipped when its successor already starts at or
    // before `from_lsn`
    let skip = files
        .windows(2)
        .take_while(|pair| pair[1].first_lsn <= from_lsn)
        .count();

    tracing::debug!(
        ?dir,
        from_lsn,
        segments = files.len(),
        skipped = skip,
        "Starting WAL replay"
    );

    Ok(Replay {
        pending: files.into_iter().skip(skip).collect(),
        current: None,
        expected: None,
        from_lsn,
        truncation_point: None,
        finished: false,
        unknown_kinds: 0,
    })
}

impl Replay {
    /// Set once iteration stopped on a torn record in the active segment
    pub fn truncation_point(&self) -> Option<&TruncationPoint> {
        self.truncation_point.as_ref()
    }

    /// Records yielded so far with a kind this build does not recognise
    pub fn unknown_kinds(&self) -> u64 {
        self.unknown_kinds
    }

    /// Starting LSN of this replay
    pub fn from_lsn(&self) -> Lsn {
        self.from_lsn
    }

    fn open_next_segment(&mut self) -> Result<bool> {
        let Some(file) = self.pending.pop_front() else {
            return Ok(false);
        };

        if let Some(expected) = self.expected {
            if file.first_lsn != expected {
                return Err(Error::SegmentGap {
                    path: file.path.clone(),
                    expected,
                    found: file.first_lsn,
                });
            }
        }
        self.expected = Some(file.first_lsn);

        let reader = SegmentReader::open(&file.path)?;
        self.current = Some(CurrentSegment {
            is_last: self.pending.is_empty(),
            file,
            reader,
        });
        Ok(true)
    }

    fn next_inner(&mut self) -> Result<Option<Record>> {
        loop {
            if self.current.is_none() && !self.open_next_segment()? {
                return Ok(None);
            }
            let Some(current) = self.current.as_mut() else {
                return Ok(None);
            };

            match current.reader.next_record()? {
                ReadOutcome::Record(record) => {
                    let expected = self.expected.unwrap_or(current.file.first_lsn);
                    if record.lsn != expected {
                        return Err(Error::CorruptSegment {
                            path: current.file.path.clone(),
                            offset: current.reader.position(),
                            reason: format!("expected LSN {}, found {}", expected, record.lsn),
                        });
                    }
                    self.expected = Some(expected + 1);

                    if record.lsn < self.from_lsn {
                        continue;
                    }
                    if record.kind_unknown() {
                        self.unknown_kinds += 1;
                        tracing::warn!(
                            lsn = record.lsn,
                            kind = %record.kind,
                            segment = ?current.file.path,
                            "Replaying record of unknown kind"
                        );
                    }
                    return Ok(Some(record));
                }
                ReadOutcome::End => {
                    self.current = None;
                }
                ReadOutcome::Torn(torn) => {
                    if !current.is_last {
                        return Err(Error::CorruptSegment {
                            path: current.file.path.clone(),
                            offset: torn.offset,
                            reason: format!("torn record in sealed segment: {}", torn.reason),
                        });
                    }

                    tracing::warn!(
                        segment = ?current.file.path,
                        offset = torn.offset,
                        reason = %torn.reason,
                        "Replay stopped at torn tail"
                    );
                    self.truncation_point = Some(TruncationPoint {
                        segment: current.file.path.clone(),
                        offset: torn.offset,
                        reason: torn.reason,
                    });
                    self.current = None;
                    return Ok(None);
                }
            }
        }
    }
}

impl Iterator for Replay {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_inner() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                tracing::error!("WAL replay failed: {}", e);
                Some(Err(e))
            }
        }
    }
}

impl std::iter::FusedIterator for Replay {}
