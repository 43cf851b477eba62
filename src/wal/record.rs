//! WAL Record Types and Codec
//!
//! Every record is laid out as
//!
//! ```text
//! [magic:4 "WALR"][kind:u8][flags:u8][reserved:u16]
//! [lsn:u64][timestamp:u64][task_id_len:u16][payload_len:u32]
//! [task_id bytes][payload bytes][checksum:u32]
//! ```
//!
//! Integers are little-endian. The CRC32C checksum covers every byte that
//! precedes it. A `task_id_len` of zero means the record has no task.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Log Sequence Number - unique, dense identifier for each record
pub type Lsn = u64;

/// Magic bytes prefixing every record
pub const RECORD_MAGIC: [u8; 4] = *b"WALR";

/// Fixed header size in bytes (everything before the task id)
pub const HEADER_LEN: usize = 30;

/// Checksum trailer size in bytes
pub const CHECKSUM_LEN: usize = 4;

/// Largest payload accepted at append time (16 MiB)
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Largest task id the length field can describe
pub const MAX_TASK_ID_LEN: usize = u16::MAX as usize;

/// Kind of mutation a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    SetGoal,
    AddConstraint,
    RemoveConstraint,
    UpdateStateKey,
    DeleteStateKey,
    ConfirmFact,
    Checkpoint,
    NoopHeartbeat,
    /// A kind this build does not know; carried through replay untouched
    Unknown(u8),
}

impl RecordKind {
    /// Wire code for this kind
    pub fn code(&self) -> u8 {
        match self {
            RecordKind::SetGoal => 1,
            RecordKind::AddConstraint => 2,
            RecordKind::RemoveConstraint => 3,
            RecordKind::UpdateStateKey => 4,
            RecordKind::DeleteStateKey => 5,
            RecordKind::ConfirmFact => 6,
            RecordKind::Checkpoint => 7,
            RecordKind::NoopHeartbeat => 8,
            RecordKind::Unknown(code) => *code,
        }
    }

    /// Parse a wire code
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => RecordKind::SetGoal,
            2 => RecordKind::AddConstraint,
            3 => RecordKind::RemoveConstraint,
            4 => RecordKind::UpdateStateKey,
            5 => RecordKind::DeleteStateKey,
            6 => RecordKind::ConfirmFact,
            7 => RecordKind::Checkpoint,
            8 => RecordKind::NoopHeartbeat,
            other => RecordKind::Unknown(other),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, RecordKind::Unknown(_))
    }

    /// Stable name used in logs and events
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::SetGoal => "SET_GOAL",
            RecordKind::AddConstraint => "ADD_CONSTRAINT",
            RecordKind::RemoveConstraint => "REMOVE_CONSTRAINT",
            RecordKind::UpdateStateKey => "UPDATE_STATE_KEY",
            RecordKind::DeleteStateKey => "DELETE_STATE_KEY",
            RecordKind::ConfirmFact => "CONFIRM_FACT",
            RecordKind::Checkpoint => "CHECKPOINT",
            RecordKind::NoopHeartbeat => "NOOP_HEARTBEAT",
            RecordKind::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Unknown(code) => write!(f, "UNKNOWN({:#04x})", code),
            known => f.write_str(known.as_str()),
        }
    }
}

/// A single WAL record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub lsn: Lsn,
    pub kind: RecordKind,
    /// Opaque flag bits, preserved as written
    pub flags: u8,
    pub task_id: Option<String>,
    /// Microseconds since the Unix epoch at append time
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl Record {
    /// Create a record stamped with the current wall clock
    pub fn new(lsn: Lsn, kind: RecordKind, task_id: Option<String>, payload: Vec<u8>) -> Self {
        Self {
            lsn,
            kind,
            flags: 0,
            task_id,
            timestamp: now_micros(),
            payload,
        }
    }

    /// True when the kind was not recognized on decode
    pub fn kind_unknown(&self) -> bool {
        !self.kind.is_known()
    }

    /// Size of this record once encoded
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + self.task_id.as_ref().map_or(0, |t| t.len())
            + self.payload.len()
            + CHECKSUM_LEN
    }

    /// Encode into a fresh buffer
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Append the encoded record to `buf`
    ///
    /// Length limits are enforced by the writer; callers encoding by hand
    /// must keep the task id within `MAX_TASK_ID_LEN`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        let task = self.task_id.as_deref().unwrap_or("").as_bytes();

        buf.extend_from_slice(&RECORD_MAGIC);
        buf.push(self.kind.code());
        buf.push(self.flags);
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&(task.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(task);
        buf.extend_from_slice(&self.payload);

        let checksum = crc32c::crc32c(&buf[start..]);
        buf.extend_from_slice(&checksum.to_le_bytes());
    }
}

/// Why a byte range could not be decoded as a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TornReason {
    /// Fewer bytes remain than the header or declared lengths need
    Truncated,
    BadMagic,
    /// Declared payload length is above `MAX_PAYLOAD_LEN`
    OversizedLength,
    ChecksumMismatch,
    /// Checksum matched but the task id is not UTF-8
    InvalidTaskId,
}

impl fmt::Display for TornReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TornReason::Truncated => "truncated record",
            TornReason::BadMagic => "bad magic",
            TornReason::OversizedLength => "length field exceeds limit",
            TornReason::ChecksumMismatch => "checksum mismatch",
            TornReason::InvalidTaskId => "task id is not valid UTF-8",
        };
        f.write_str(text)
    }
}

/// Parsed fixed-size header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: u8,
    pub flags: u8,
    pub lsn: Lsn,
    pub timestamp: u64,
    pub task_id_len: usize,
    pub payload_len: usize,
}

impl RecordHeader {
    /// Parse the fixed header, validating magic and the payload cap
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self, TornReason> {
        if bytes[0..4] != RECORD_MAGIC {
            return Err(TornReason::BadMagic);
        }

        let header = Self {
            kind: bytes[4],
            flags: bytes[5],
            lsn: u64::from_le_bytes(le_array(&bytes[8..16])),
            timestamp: u64::from_le_bytes(le_array(&bytes[16..24])),
            task_id_len: u16::from_le_bytes(le_array(&bytes[24..26])) as usize,
            payload_len: u32::from_le_bytes(le_array(&bytes[26..30])) as usize,
        };

        if header.payload_len > MAX_PAYLOAD_LEN {
            return Err(TornReason::OversizedLength);
        }
        Ok(header)
    }

    /// Bytes following the fixed header: task id, payload and checksum
    pub fn body_len(&self) -> usize {
        self.task_id_len + self.payload_len + CHECKSUM_LEN
    }

    /// Validate the checksum over `header_bytes ++ body` and build the record
    pub fn finish(
        &self,
        header_bytes: &[u8; HEADER_LEN],
        body: &[u8],
    ) -> Result<Record, TornReason> {
        if body.len() != self.body_len() {
            return Err(TornReason::Truncated);
        }

        let (content, stored) = body.split_at(body.len() - CHECKSUM_LEN);
        let stored = u32::from_le_bytes(le_array(stored));
        let computed = crc32c::crc32c_append(crc32c::crc32c(header_bytes), content);
        if stored != computed {
            return Err(TornReason::ChecksumMismatch);
        }

        let (task, payload) = content.split_at(self.task_id_len);
        let task_id = if task.is_empty() {
            None
        } else {
            Some(
                std::str::from_utf8(task)
                    .map_err(|_| TornReason::InvalidTaskId)?
                    .to_string(),
            )
        };

        Ok(Record {
            lsn: self.lsn,
            kind: RecordKind::from_code(self.kind),
            flags: self.flags,
            task_id,
            timestamp: self.timestamp,
            payload: payload.to_vec(),
        })
    }
}

/// Decode one record from the front of `buf`
///
/// Returns the record and the number of bytes it occupied.
pub fn decode_record(buf: &[u8]) -> Result<(Record, usize), TornReason> {
    if buf.len() < HEADER_LEN {
        return Err(TornReason::Truncated);
    }

    let mut header_bytes = [0u8; HEADER_LEN];
    header_bytes.copy_from_slice(&buf[..HEADER_LEN]);
    let header = RecordHeader::parse(&header_bytes)?;

    let total = HEADER_LEN + header.body_len();
    if buf.len() < total {
        return Err(TornReason::Truncated);
    }

    let record = header.finish(&header_bytes, &buf[HEADER_LEN..total])?;
    Ok((record, total))
}

/// Current wall clock in microseconds since the Unix epoch
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record {
            lsn: 42,
            kind: RecordKind::SetGoal,
            flags: 0,
            task_id: Some("t1".to_string()),
            timestamp: 1_700_000_000_000_000,
            payload: b"hello".to_vec(),
        }
    }

    #[test]
    fn test_encode_layout() {
        let record = sample();
        let bytes = record.encode();

        assert_eq!(bytes.len(), HEADER_LEN + 2 + 5 + CHECKSUM_LEN);
        assert_eq!(bytes.len(), record.encoded_len());
        assert_eq!(&bytes[0..4], b"WALR");
        assert_eq!(bytes[4], 1);
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 42);
        assert_eq!(u16::from_le_bytes(bytes[24..26].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(bytes[26..30].try_into().unwrap()), 5);
        assert_eq!(&bytes[30..32], b"t1");
        assert_eq!(&bytes[32..37], b"hello");

        let stored = u32::from_le_bytes(bytes[37..41].try_into().unwrap());
        assert_eq!(stored, crc32c::crc32c(&bytes[..37]));
    }

    #[test]
    fn test_decode_roundtrip() {
        let record = sample();
        let bytes = record.encode();

        let (decoded, used) = decode_record(&bytes).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(used, bytes.len());
        assert!(!decoded.kind_unknown());
    }

    #[test]
    fn test_absent_task_id() {
        let mut record = sample();
        record.task_id = None;
        let bytes = record.encode();

        assert_eq!(u16::from_le_bytes(bytes[24..26].try_into().unwrap()), 0);
        let (decoded, _) = decode_record(&bytes).unwrap();
        assert_eq!(decoded.task_id, None);
    }

    #[test]
    fn test_decode_consumes_only_first_record() {
        let mut buf = sample().encode();
        let first_len = buf.len();
        let mut second = sample();
        second.lsn = 43;
        second.encode_into(&mut buf);

        let (first, used) = decode_record(&buf).unwrap();
        assert_eq!(first.lsn, 42);
        assert_eq!(used, first_len);

        let (next, _) = decode_record(&buf[used..]).unwrap();
        assert_eq!(next.lsn, 43);
    }

    #[test]
    fn test_truncated_record_is_torn() {
        let bytes = sample().encode();
        assert_eq!(decode_record(&bytes[..10]), Err(TornReason::Truncated));
        assert_eq!(
            decode_record(&bytes[..bytes.len() - 1]),
            Err(TornReason::Truncated)
        );
    }

    #[test]
    fn test_bad_magic_is_torn() {
        let mut bytes = sample().encode();
        bytes[0] = b'X';
        assert_eq!(decode_record(&bytes), Err(TornReason::BadMagic));
    }

    #[test]
    fn test_checksum_mismatch_is_torn() {
        let mut bytes = sample().encode();
        bytes[33] ^= 0x01;
        assert_eq!(decode_record(&bytes), Err(TornReason::ChecksumMismatch));
    }

    #[test]
    fn test_oversized_length_is_torn() {
        let mut bytes = sample().encode();
        bytes[26..30].copy_from_slice(&((MAX_PAYLOAD_LEN as u32) + 1).to_le_bytes());
        assert_eq!(decode_record(&bytes), Err(TornReason::OversizedLength));
    }

    #[test]
    fn test_unknown_kind_decodes() {
        let mut record = sample();
        record.kind = RecordKind::Unknown(0xFE);
        let bytes = record.encode();

        let (decoded, _) = decode_record(&bytes).unwrap();
        assert_eq!(decoded.kind, RecordKind::Unknown(0xFE));
        assert!(decoded.kind_unknown());
    }

    #[test]
    fn test_kind_codes_are_stable() {
        for code in 1..=8u8 {
            let kind = RecordKind::from_code(code);
            assert!(kind.is_known());
            assert_eq!(kind.code(), code);
        }
        assert_eq!(RecordKind::from_code(0), RecordKind::Unknown(0));
        assert_eq!(RecordKind::Checkpoint.to_string(), "CHECKPOINT");
        assert_eq!(RecordKind::Unknown(0xFE).to_string(), "UNKNOWN(0xfe)");
    }
}
