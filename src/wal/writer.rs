//! WAL Writer
//!
//! Single-threaded writer for the Write-Ahead Log. Each append is encoded
//! into a user-space buffer that only ever holds whole records and is handed
//! to the OS before `append` returns, so a crash can tear at most the record
//! being written. Durability follows the fsync policy.

use std::path::{Path, PathBuf};
use std::time::Instant;

use super::directory::SegmentDirectory;
use super::lock::DirLock;
use super::record::{Lsn, Record, RecordKind, MAX_PAYLOAD_LEN, MAX_TASK_ID_LEN};
use super::segment::{truncate_segment, ActiveSegment, SegmentMeta};
use super::WalPaths;
use crate::config::WalConfig;
use crate::context;
use crate::error::{Error, Result};
use crate::notify::{EventSink, WalEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    /// An I/O error was observed; only `close` is accepted
    Poisoned,
    Closed,
}

/// WAL writer handle
///
/// Not safe for concurrent use; wrap it in a mutex to share it.
pub struct WalWriter {
    /// WAL paths
    paths: WalPaths,
    /// Configuration
    config: WalConfig,
    /// Held until close
    lock: Option<DirLock>,
    /// Sealed segments, oldest first
    sealed: Vec<SegmentMeta>,
    /// Current active segment
    active: ActiveSegment,
    /// Record assembly buffer; empty between calls
    buffer: Vec<u8>,
    /// LSN the next append receives
    next_lsn: Lsn,
    /// Highest LSN written to the OS
    flushed_lsn: Lsn,
    /// Highest LSN fsynced
    durable_lsn: Lsn,
    /// Last successful sync
    last_sync: Instant,
    state: WriterState,
    events: Option<EventSink>,
}

impl WalWriter {
    /// Open the WAL in `dir`, creating it if needed
    pub fn open(dir: impl Into<PathBuf>, config: WalConfig) -> Result<Self> {
        Self::open_inner(dir.into(), config, None)
    }

    /// Open the WAL and report operational events to `events`
    pub fn open_with_events(
        dir: impl Into<PathBuf>,
        config: WalConfig,
        events: EventSink,
    ) -> Result<Self> {
        Self::open_inner(dir.into(), config, Some(events))
    }

    fn open_inner(dir: PathBuf, config: WalConfig, events: Option<EventSink>) -> Result<Self> {
        config.validate()?;

        let paths = WalPaths::new(dir);
        paths.ensure_dirs()?;
        let lock = DirLock::acquire(&paths.lock_path())?;

        let scanned = SegmentDirectory::scan(&paths.base_dir)?;
        let last_lsn = scanned.last_lsn();
        let sealed = scanned.sealed;
        let active = match scanned.active {
            Some(scan) => {
                if let Some(torn) = scan.torn {
                    let file_len = std::fs::metadata(&scan.meta.path)?.len();
                    truncate_segment(&scan.meta.path, torn.offset)?;

                    let bytes_discarded = file_len - torn.offset;
                    tracing::warn!(
                        segment = ?scan.meta.path,
                        offset = torn.offset,
                        bytes = bytes_discarded,
                        reason = %torn.reason,
                        "Truncated torn tail of active WAL segment"
                    );
                    if let Some(events) = &events {
                        events.emit(WalEvent::TornTailTruncated {
                            segment: scan.meta.path.clone(),
                            offset: torn.offset,
                            bytes_discarded,
                        });
                    }
                }

                let active = ActiveSegment::open(&scan.meta)?;
                // Surviving bytes may only be in the page cache
                active.sync()?;
                active
            }
            None => {
                let active = ActiveSegment::create(paths.segment_path(1), 1)?;
                paths.sync_dir()?;
                active
            }
        };

        tracing::info!(
            dir = ?paths.base_dir,
            sealed = sealed.len(),
            active = ?active.path(),
            last_lsn,
            "Opened WAL"
        );

        Ok(Self {
            buffer: Vec::with_capacity(config.buffer_bytes),
            paths,
            config,
            lock: Some(lock),
            sealed,
            active,
            next_lsn: last_lsn + 1,
            flushed_lsn: last_lsn,
            durable_lsn: last_lsn,
            last_sync: Instant::now(),
            state: WriterState::Open,
            events,
        })
    }

    /// Append a record and return its LSN
    ///
    /// Without an explicit `task_id` the current request context's task is
    /// recorded. On return the record has been written to the OS; it is
    /// durable once `durable_lsn()` reaches the returned LSN.
    pub fn append(&mut self, kind: RecordKind, task_id: Option<&str>, payload: &[u8]) -> Result<Lsn> {
        self.check_writable()?;

        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::OversizedRecord {
                field: "payload",
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let task_id = match task_id {
            Some(task) => Some(task.to_string()),
            None => context::current_task_id(),
        };
        if let Some(task) = &task_id {
            if task.len() > MAX_TASK_ID_LEN {
                return Err(Error::OversizedRecord {
                    field: "task_id",
                    len: task.len(),
                    max: MAX_TASK_ID_LEN,
                });
            }
        }

        let lsn = self.next_lsn;
        let record = Record::new(lsn, kind, task_id, payload.to_vec());
        let result = self.append_record(&record);
        self.poison_on_io(result)?;
        Ok(lsn)
    }

    /// Hand any buffered records to the OS without fsync
    ///
    /// Appends already write through, so this only reports the highest LSN
    /// written to the OS.
    pub fn flush(&mut self) -> Result<Lsn> {
        self.check_writable()?;
        let result = self.flush_buffer();
        self.poison_on_io(result)
    }

    /// Flush and fsync the active segment, returning the durable LSN
    pub fn sync(&mut self) -> Result<Lsn> {
        self.check_writable()?;
        let result = self.sync_active();
        self.poison_on_io(result)
    }

    /// Seal the active segment and start a new one
    ///
    /// A no-op while the active segment holds no records.
    pub fn rotate(&mut self) -> Result<()> {
        self.check_writable()?;
        let result = self.rotate_segment();
        self.poison_on_io(result)
    }

    /// Delete every sealed segment whose records all have `lsn <= through`
    ///
    /// The active segment is never deleted. Returns how many segments were
    /// removed; repeating the call removes nothing further.
    pub fn truncate_through(&mut self, through: Lsn) -> Result<usize> {
        self.check_writable()?;
        let result = self.remove_sealed_through(through);
        self.poison_on_io(result)
    }

    /// Flush, sync and release the directory
    ///
    /// A poisoned writer is closed without flushing.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            WriterState::Closed => return Err(Error::Closed),
            WriterState::Open => {
                let result = self.sync_active();
                if let Err(e) = self.poison_on_io(result) {
                    let _ = self.release();
                    return Err(e);
                }
            }
            WriterState::Poisoned => {
                tracing::warn!(
                    dir = ?self.paths.base_dir,
                    discarded_bytes = self.buffer.len(),
                    "Closing poisoned WAL writer"
                );
            }
        }
        self.release()
    }

    /// LSN the next append will receive
    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    /// Last assigned LSN, or 0 for an empty log
    pub fn last_lsn(&self) -> Lsn {
        self.next_lsn - 1
    }

    /// Highest LSN handed to the OS
    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn
    }

    /// Highest LSN known to be on stable storage
    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn
    }

    /// Sealed segments followed by the active one
    pub fn segments(&self) -> Vec<SegmentMeta> {
        let mut segments = self.sealed.clone();
        segments.push(self.active.meta());
        segments
    }

    /// Metadata of the active segment as handed to the OS
    pub fn active_segment(&self) -> SegmentMeta {
        self.active.meta()
    }

    pub fn is_poisoned(&self) -> bool {
        self.state == WriterState::Poisoned
    }

    pub fn is_closed(&self) -> bool {
        self.state == WriterState::Closed
    }

    /// WAL directory
    pub fn dir(&self) -> &Path {
        &self.paths.base_dir
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    fn check_writable(&self) -> Result<()> {
        match self.state {
            WriterState::Open => Ok(()),
            WriterState::Poisoned => Err(Error::Poisoned),
            WriterState::Closed => Err(Error::Closed),
        }
    }

    fn append_record(&mut self, record: &Record) -> Result<()> {
        let record_len = record.encoded_len() as u64;
        let segment_len = self.active.len();
        let active_has_records = self.next_lsn > self.active.first_lsn();
        if active_has_records && segment_len + record_len > self.config.max_segment_bytes {
            self.rotate_segment()?;
        }

        record.encode_into(&mut self.buffer);
        self.next_lsn += 1;

        // A returned LSN is at least in the page cache
        self.flush_buffer()?;

        if self.config.fsync.sync_due(self.last_sync.elapsed()) {
            self.sync_active()?;
        }

        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<Lsn> {
        if !self.buffer.is_empty() {
            let last = self.next_lsn - 1;
            self.active.write_records(&self.buffer, last)?;
            tracing::trace!(lsn = last, bytes = self.buffer.len(), "Flushed WAL buffer");
            self.buffer.clear();
            // An oversized record must not pin its allocation
            self.buffer.shrink_to(self.config.buffer_bytes);
            self.flushed_lsn = last;
        }
        Ok(self.flushed_lsn)
    }

    fn sync_active(&mut self) -> Result<Lsn> {
        let flushed = self.flush_buffer()?;
        if flushed > self.durable_lsn {
            self.active.sync()?;
            tracing::debug!(from = self.durable_lsn, to = flushed, "Synced WAL segment");
            self.durable_lsn = flushed;
        }
        self.last_sync = Instant::now();
        Ok(self.durable_lsn)
    }

    fn rotate_segment(&mut self) -> Result<()> {
        if self.next_lsn == self.active.first_lsn() {
            return Ok(());
        }

        self.sync_active()?;
        self.paths.sync_dir()?;

        let next_first = self.durable_lsn + 1;
        let next = ActiveSegment::create(self.paths.segment_path(next_first), next_first)?;
        self.paths.sync_dir()?;

        let sealed = std::mem::replace(&mut self.active, next).meta();
        tracing::info!(
            sealed = ?sealed.path,
            first_lsn = sealed.first_lsn,
            last_lsn = sealed.last_lsn,
            bytes = sealed.len,
            "Rotated WAL segment"
        );
        if let Some(events) = &self.events {
            events.emit(WalEvent::SegmentRotated {
                sealed: sealed.path.clone(),
                sealed_last_lsn: sealed.last_lsn,
                active_first_lsn: next_first,
            });
        }
        self.sealed.push(sealed);
        Ok(())
    }

    fn remove_sealed_through(&mut self, through: Lsn) -> Result<usize> {
        let mut removed = 0;

        // Oldest first, so a crash midway still leaves a contiguous log
        while let Some(oldest) = self.sealed.first() {
            if oldest.last_lsn > through {
                break;
            }
            match std::fs::remove_file(&oldest.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tracing::debug!(segment = ?oldest.path, last_lsn = oldest.last_lsn, "Deleted WAL segment");
            self.sealed.remove(0);
            removed += 1;
        }

        if removed > 0 {
            self.paths.sync_dir()?;
            tracing::info!(through, removed, "Truncated WAL");
        }
        Ok(removed)
    }

    fn poison_on_io<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.poisons_writer() && self.state == WriterState::Open {
                self.state = WriterState::Poisoned;
                tracing::error!(dir = ?self.paths.base_dir, "WAL writer poisoned: {}", e);
                if let Some(events) = &self.events {
                    events.emit(WalEvent::Poisoned {
                        dir: self.paths.base_dir.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        result
    }

    fn release(&mut self) -> Result<()> {
        self.state = WriterState::Closed;
        self.buffer.clear();
        if let Some(lock) = self.lock.take() {
            lock.release()?;
        }
        tracing::info!(dir = ?self.paths.base_dir, durable_lsn = self.durable_lsn, "Closed WAL");
        Ok(())
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if self.state != WriterState::Closed {
            if let Err(e) = self.close() {
                tracing::error!("Failed to close WAL writer cleanly: {}", e);
            }
        }
    }
}
