//! WAL Segment Management
//!
//! A segment is a headerless file of concatenated records covering a
//! contiguous LSN range. Its name is the zero-padded first LSN, so sorting
//! names sorts segments.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::record::{Lsn, Record, RecordHeader, TornReason, HEADER_LEN};
use crate::error::{Error, Result};

/// Segment file extension
pub const SEGMENT_EXTENSION: &str = "wal";

/// Number of digits in a segment file stem
const SEGMENT_NAME_DIGITS: usize = 20;

/// File name for the segment starting at `first_lsn`
pub fn segment_file_name(first_lsn: Lsn) -> String {
    format!("{:020}.{}", first_lsn, SEGMENT_EXTENSION)
}

/// Parse a segment file name, returning its first LSN
///
/// Only names of exactly twenty digits followed by `.wal` match. LSNs start
/// at 1, so an all-zero name is not a segment.
pub fn parse_segment_name(name: &str) -> Option<Lsn> {
    let stem = name.strip_suffix(".wal")?;
    if stem.len() != SEGMENT_NAME_DIGITS || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse::<Lsn>().ok().filter(|lsn| *lsn > 0)
}

/// Location and LSN range of a segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMeta {
    pub path: PathBuf,
    pub first_lsn: Lsn,
    /// Last LSN held; `first_lsn - 1` for an empty segment
    pub last_lsn: Lsn,
    /// Valid bytes in the file
    pub len: u64,
}

impl SegmentMeta {
    pub fn record_count(&self) -> u64 {
        (self.last_lsn + 1).saturating_sub(self.first_lsn)
    }

    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }
}

/// A record position where decoding stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TornRecord {
    pub offset: u64,
    pub reason: TornReason,
}

/// Result of reading the next record from a segment
#[derive(Debug)]
pub enum ReadOutcome {
    Record(Record),
    /// Clean end of file on a record boundary
    End,
    Torn(TornRecord),
}

/// Streaming record reader over one segment file
pub struct SegmentReader {
    reader: BufReader<File>,
    path: PathBuf,
    /// Offset of the next record
    pos: u64,
    /// File length when the reader was opened
    len: u64,
}

impl SegmentReader {
    /// Open a segment for reading from the start
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::with_capacity(64 * 1024, file),
            path: path.to_path_buf(),
            pos: 0,
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the next unread record
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Decode the next record
    ///
    /// I/O failures are errors; malformed bytes are reported as `Torn` and
    /// the reader is rewound to the start of the malformed record.
    pub fn next_record(&mut self) -> Result<ReadOutcome> {
        let remaining = self.len - self.pos;
        if remaining == 0 {
            return Ok(ReadOutcome::End);
        }
        if remaining < HEADER_LEN as u64 {
            return self.torn(TornReason::Truncated);
        }

        let mut header_bytes = [0u8; HEADER_LEN];
        match self.reader.read_exact(&mut header_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return self.torn(TornReason::Truncated)
            }
            Err(e) => return Err(e.into()),
        }

        let header = match RecordHeader::parse(&header_bytes) {
            Ok(header) => header,
            Err(reason) => return self.torn(reason),
        };

        let body_len = header.body_len();
        if (body_len as u64) > remaining - HEADER_LEN as u64 {
            return self.torn(TornReason::Truncated);
        }

        let mut body = vec![0u8; body_len];
        match self.reader.read_exact(&mut body) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return self.torn(TornReason::Truncated)
            }
            Err(e) => return Err(e.into()),
        }

        match header.finish(&header_bytes, &body) {
            Ok(record) => {
                self.pos += (HEADER_LEN + body_len) as u64;
                Ok(ReadOutcome::Record(record))
            }
            Err(reason) => self.torn(reason),
        }
    }

    fn torn(&mut self, reason: TornReason) -> Result<ReadOutcome> {
        // Header and body reads may have consumed part of the record
        self.reader.seek(SeekFrom::Start(self.pos))?;
        Ok(ReadOutcome::Torn(TornRecord {
            offset: self.pos,
            reason,
        }))
    }
}

/// Outcome of scanning a whole segment
#[derive(Debug, Clone)]
pub struct SegmentScan {
    pub meta: SegmentMeta,
    /// Set when the scan stopped on a malformed record
    pub torn: Option<TornRecord>,
    /// Number of records with a kind this build does not know
    pub unknown_kinds: u64,
}

/// Scan a segment end to end, checking LSN continuity
///
/// A record whose LSN is not the expected successor is corruption even if
/// its checksum is valid. Tears are returned for the caller to classify.
pub fn scan_segment(path: &Path, first_lsn: Lsn) -> Result<SegmentScan> {
    let mut reader = SegmentReader::open(path)?;
    let mut expected = first_lsn;
    let mut unknown_kinds = 0;

    let torn = loop {
        match reader.next_record()? {
            ReadOutcome::Record(record) => {
                if record.lsn != expected {
                    return Err(Error::CorruptSegment {
                        path: path.to_path_buf(),
                        offset: reader.position(),
                        reason: format!("expected LSN {}, found {}", expected, record.lsn),
                    });
                }
                if record.kind_unknown() {
                    unknown_kinds += 1;
                }
                expected += 1;
            }
            ReadOutcome::End => break None,
            ReadOutcome::Torn(torn) => break Some(torn),
        }
    };

    Ok(SegmentScan {
        meta: SegmentMeta {
            path: path.to_path_buf(),
            first_lsn,
            last_lsn: expected - 1,
            len: reader.position(),
        },
        torn,
        unknown_kinds,
    })
}

/// The single segment open for append
pub struct ActiveSegment {
    path: PathBuf,
    file: File,
    first_lsn: Lsn,
    /// Last LSN handed to the OS; `first_lsn - 1` when empty
    last_lsn: Lsn,
    /// Bytes handed to the OS
    len: u64,
}

impl ActiveSegment {
    /// Create a new, empty segment file at `path`
    pub fn create(path: PathBuf, first_lsn: Lsn) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;

        Ok(Self {
            path,
            file,
            first_lsn,
            last_lsn: first_lsn - 1,
            len: 0,
        })
    }

    /// Reopen an existing segment whose valid prefix was already scanned
    pub fn open(meta: &SegmentMeta) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(&meta.path)?;
        let len = file.metadata()?.len();
        if len != meta.len {
            return Err(Error::Io(io::Error::new(
                ErrorKind::InvalidData,
                format!(
                    "segment {:?} is {} bytes, scan expected {}",
                    meta.path, len, meta.len
                ),
            )));
        }

        Ok(Self {
            path: meta.path.clone(),
            file,
            first_lsn: meta.first_lsn,
            last_lsn: meta.last_lsn,
            len,
        })
    }

    /// Write whole records to the file
    ///
    /// `last_lsn` is the LSN of the final record contained in `bytes`.
    pub fn write_records(&mut self, bytes: &[u8], last_lsn: Lsn) -> Result<()> {
        self.file.write_all(bytes)?;
        self.len += bytes.len() as u64;
        self.last_lsn = last_lsn;
        Ok(())
    }

    /// Sync segment to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn first_lsn(&self) -> Lsn {
        self.first_lsn
    }

    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Snapshot of this segment's metadata
    pub fn meta(&self) -> SegmentMeta {
        SegmentMeta {
            path: self.path.clone(),
            first_lsn: self.first_lsn,
            last_lsn: self.last_lsn,
            len: self.len,
        }
    }
}

/// Cut a segment back to `len` bytes and make the cut durable
pub fn truncate_segment(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::record::RecordKind;
    use tempfile::tempdir;

    fn write_records(path: &Path, lsns: std::ops::RangeInclusive<Lsn>) -> Vec<u64> {
        let mut buf = Vec::new();
        let mut ends = Vec::new();
        for lsn in lsns {
            Record::new(lsn, RecordKind::UpdateStateKey, Some("t1".into()), vec![7; 16])
                .encode_into(&mut buf);
            ends.push(buf.len() as u64);
        }
        std::fs::write(path, &buf).unwrap();
        ends
    }

    #[test]
    fn test_segment_names() {
        assert_eq!(segment_file_name(1), "00000000000000000001.wal");
        assert_eq!(parse_segment_name("00000000000000000532.wal"), Some(532));
        assert_eq!(parse_segment_name("0000000000000000532.wal"), None);
        assert_eq!(parse_segment_name("00000000000000000532.log"), None);
        assert_eq!(parse_segment_name("0000000000000000053x.wal"), None);
        assert_eq!(parse_segment_name("wal.lock"), None);
        assert_eq!(parse_segment_name("00000000000000000000.wal"), None);
    }

    #[test]
    fn test_scan_clean_segment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(segment_file_name(5));
        let ends = write_records(&path, 5..=14);

        let scan = scan_segment(&path, 5).unwrap();
        assert!(scan.torn.is_none());
        assert_eq!(scan.meta.first_lsn, 5);
        assert_eq!(scan.meta.last_lsn, 14);
        assert_eq!(scan.meta.record_count(), 10);
        assert_eq!(scan.meta.len, *ends.last().unwrap());
    }

    #[test]
    fn test_scan_reports_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(segment_file_name(1));
        let ends = write_records(&path, 1..=4);

        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 3]).unwrap();

        let scan = scan_segment(&path, 1).unwrap();
        assert_eq!(scan.meta.last_lsn, 3);
        assert_eq!(scan.meta.len, ends[2]);
        let torn = scan.torn.unwrap();
        assert_eq!(torn.offset, ends[2]);
        assert_eq!(torn.reason, TornReason::Truncated);
    }

    #[test]
    fn test_reader_rewinds_on_torn_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(segment_file_name(1));
        let ends = write_records(&path, 1..=3);

        // Corrupt the last payload byte so the header and body read fine
        let mut bytes = std::fs::read(&path).unwrap();
        let at = bytes.len() - 5;
        bytes[at] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = SegmentReader::open(&path).unwrap();
        for _ in 0..2 {
            assert!(matches!(reader.next_record().unwrap(), ReadOutcome::Record(_)));
        }
        for _ in 0..2 {
            match reader.next_record().unwrap() {
                ReadOutcome::Torn(torn) => {
                    assert_eq!(torn.offset, ends[1]);
                    assert_eq!(torn.reason, TornReason::ChecksumMismatch);
                }
                _ => panic!("expected a torn record"),
            }
            assert_eq!(reader.position(), ends[1]);
        }

        // The underlying stream sits at the torn record again
        let mut rest = Vec::new();
        reader.reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, bytes[ends[1] as usize..]);
    }

    #[test]
    fn test_scan_rejects_lsn_discontinuity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(segment_file_name(1));
        write_records(&path, 2..=3);

        let err = scan_segment(&path, 1).unwrap_err();
        assert!(matches!(err, Error::CorruptSegment { .. }));
    }

    #[test]
    fn test_empty_segment_scan() {
        let dir = tempdir().unwrap();
        let segment = ActiveSegment::create(dir.path().join(segment_file_name(9)), 9).unwrap();
        assert!(segment.is_empty());
        assert_eq!(segment.last_lsn(), 8);

        let scan = scan_segment(segment.path(), 9).unwrap();
        assert!(scan.meta.is_empty());
        assert!(scan.torn.is_none());
    }

    #[test]
    fn test_active_segment_append_and_reopen() {
        let dir = tempdir().unwrap();
        let mut segment = ActiveSegment::create(dir.path().join(segment_file_name(1)), 1).unwrap();

        let mut buf = Vec::new();
        for lsn in 1..=3 {
            Record::new(lsn, RecordKind::ConfirmFact, None, b"fact".to_vec()).encode_into(&mut buf);
        }
        segment.write_records(&buf, 3).unwrap();
        segment.sync().unwrap();
        assert_eq!(segment.len(), buf.len() as u64);

        let meta = segment.meta();
        drop(segment);

        let reopened = ActiveSegment::open(&meta).unwrap();
        assert_eq!(reopened.last_lsn(), 3);
        assert_eq!(reopened.len(), buf.len() as u64);
    }

    #[test]
    fn test_create_refuses_existing_segment() {
        let dir = tempdir().unwrap();
        ActiveSegment::create(dir.path().join(segment_file_name(1)), 1).unwrap();
        assert!(ActiveSegment::create(dir.path().join(segment_file_name(1)), 1).is_err());
    }
}
