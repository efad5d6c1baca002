//! Single-file append-only recovery log.
//!
//! The log is one file (`kiln.wal`) holding an 8-byte file header
//! followed by checksummed records. Appends assign monotonically
//! increasing LSNs; reopening an existing log resumes after the last
//! complete record. The log also tracks which hot index builds are in
//! progress: a begin record registers the build's run files, and an
//! end, commit, or abort record for the same transaction clears the
//! registration. The registration survives restart, which is how an
//! interrupted build's files are found again.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use parking_lot::Mutex;

use kiln_common::constants::WAL_MAGIC;
use kiln_common::types::{FileId, Lsn, TxnId};

use crate::config::{SyncPolicy, WalConfig};
use crate::error::{WalError, WalResult};
use crate::record::{RecordHeader, WalPayload, WalRecord};

/// Size of the log file header: magic (4) + version (4).
const FILE_HEADER_SIZE: usize = 8;

/// On-disk format version.
const LOG_FORMAT_VERSION: u32 = 1;

/// Statistics about the recovery log.
#[derive(Debug, Default)]
pub struct WalStats {
    /// Records appended.
    pub records_appended: AtomicU64,
    /// Bytes appended (headers + payloads).
    pub bytes_appended: AtomicU64,
    /// Syncs performed.
    pub syncs: AtomicU64,
    /// Commit records logged.
    pub commits_logged: AtomicU64,
    /// Abort records logged.
    pub aborts_logged: AtomicU64,
}

impl WalStats {
    /// Creates new stats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// State behind the log's write lock.
struct LogInner {
    file: File,
    next_lsn: u64,
    closed: bool,
}

/// Append-only recovery log over a single file.
pub struct RecoveryLog {
    config: WalConfig,
    path: PathBuf,
    inner: Mutex<LogInner>,
    /// Hot index builds currently in progress, by owning transaction.
    hot_indexes: Mutex<BTreeMap<TxnId, Vec<FileId>>>,
    stats: WalStats,
}

impl RecoveryLog {
    /// Opens the log file, creating it if absent.
    ///
    /// An existing log is scanned to find the next LSN and to rebuild
    /// the in-progress hot index registrations.
    pub fn open(config: WalConfig) -> WalResult<Self> {
        config.validate().map_err(WalError::config_error)?;
        let path = config.log_path();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let (next_lsn, hot_indexes) = if len == 0 {
            let mut header = [0u8; FILE_HEADER_SIZE];
            header[..4].copy_from_slice(&WAL_MAGIC.to_be_bytes());
            header[4..].copy_from_slice(&LOG_FORMAT_VERSION.to_be_bytes());
            file.write_all(&header)?;
            file.sync_data()?;
            (Lsn::FIRST.as_u64(), BTreeMap::new())
        } else {
            let data = std::fs::read(&path)?;
            let (records, valid_len) = scan_records(&data, config.max_record_size)?;
            if (valid_len as u64) < len {
                // Drop the torn tail so appends continue from the
                // last complete record.
                file.set_len(valid_len as u64)?;
                file.sync_data()?;
            }
            let next_lsn = records
                .last()
                .map_or(Lsn::FIRST.as_u64(), |r| r.lsn().as_u64() + 1);
            (next_lsn, rebuild_hot_indexes(&records))
        };

        Ok(Self {
            config,
            path,
            inner: Mutex::new(LogInner {
                file,
                next_lsn,
                closed: false,
            }),
            hot_indexes: Mutex::new(hot_indexes),
            stats: WalStats::new(),
        })
    }

    /// Appends a transaction commit record. Always syncs.
    pub fn append_commit(&self, txn_id: TxnId) -> WalResult<Lsn> {
        let lsn = self.append(|lsn| Ok(WalRecord::txn_commit(lsn, txn_id)), true)?;
        self.hot_indexes.lock().remove(&txn_id);
        self.stats.commits_logged.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(lsn)
    }

    /// Appends a transaction abort record.
    pub fn append_abort(&self, txn_id: TxnId) -> WalResult<Lsn> {
        let lsn = self.append(|lsn| Ok(WalRecord::txn_abort(lsn, txn_id)), false)?;
        self.hot_indexes.lock().remove(&txn_id);
        self.stats.aborts_logged.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(lsn)
    }

    /// Registers a hot index build: appends the begin record listing
    /// the build's run files. Always syncs, so the files are claimed
    /// before any of them is written.
    pub fn register_hot_index(&self, txn_id: TxnId, file_ids: Vec<FileId>) -> WalResult<Lsn> {
        let lsn = self.append(
            |lsn| WalRecord::hot_index_begin(lsn, txn_id, file_ids.clone()),
            true,
        )?;
        self.hot_indexes.lock().insert(txn_id, file_ids);
        Ok(lsn)
    }

    /// Closes a hot index registration with an end record.
    pub fn hot_index_end(&self, txn_id: TxnId) -> WalResult<Lsn> {
        let lsn = self.append(|lsn| Ok(WalRecord::hot_index_end(lsn, txn_id)), false)?;
        self.hot_indexes.lock().remove(&txn_id);
        Ok(lsn)
    }

    /// Appends a checkpoint begin record listing live transactions.
    pub fn append_checkpoint_begin(&self, live_txns: Vec<TxnId>) -> WalResult<Lsn> {
        self.append(|lsn| WalRecord::checkpoint_begin(lsn, live_txns), false)
    }

    /// Appends a checkpoint end record. Always syncs.
    pub fn append_checkpoint_end(&self) -> WalResult<Lsn> {
        self.append(|lsn| Ok(WalRecord::checkpoint_end(lsn)), true)
    }

    /// Re-reads and validates the whole log.
    ///
    /// A torn tail (an interrupted final append) ends the read
    /// quietly; any other damage is an error.
    pub fn records(&self) -> WalResult<Vec<WalRecord>> {
        let _inner = self.inner.lock();
        read_records(&self.path, self.config.max_record_size)
    }

    /// Returns the hot index builds currently registered as in
    /// progress, with their run files.
    #[must_use]
    pub fn open_hot_indexes(&self) -> Vec<(TxnId, Vec<FileId>)> {
        self.hot_indexes
            .lock()
            .iter()
            .map(|(txn, files)| (*txn, files.clone()))
            .collect()
    }

    /// Syncs the log file to disk.
    pub fn sync(&self) -> WalResult<()> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(WalError::Closed);
        }
        inner.file.sync_data()?;
        self.stats.syncs.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    /// Closes the log after a final sync. Further appends fail.
    pub fn close(&self) -> WalResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.file.sync_data()?;
        inner.closed = true;
        self.stats.syncs.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    /// Returns the LSN the next append will be assigned.
    #[must_use]
    pub fn next_lsn(&self) -> Lsn {
        Lsn::new(self.inner.lock().next_lsn)
    }

    /// Returns the log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns statistics about the log.
    #[must_use]
    pub const fn stats(&self) -> &WalStats {
        &self.stats
    }

    /// Serializes one record at the next LSN and writes it out.
    fn append(
        &self,
        build: impl FnOnce(Lsn) -> WalResult<WalRecord>,
        force_sync: bool,
    ) -> WalResult<Lsn> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(WalError::Closed);
        }

        let lsn = Lsn::new(inner.next_lsn);
        let record = build(lsn)?;
        let bytes = record.serialize()?;
        if bytes.len() > self.config.max_record_size {
            return Err(WalError::record_too_large(
                bytes.len(),
                self.config.max_record_size,
            ));
        }

        inner.file.write_all(&bytes)?;
        inner.next_lsn += 1;

        if force_sync || self.config.sync_policy == SyncPolicy::EveryWrite {
            inner.file.sync_data()?;
            self.stats.syncs.fetch_add(1, AtomicOrdering::Relaxed);
        }

        self.stats
            .records_appended
            .fetch_add(1, AtomicOrdering::Relaxed);
        self.stats
            .bytes_appended
            .fetch_add(bytes.len() as u64, AtomicOrdering::Relaxed);
        Ok(lsn)
    }
}

impl Drop for RecoveryLog {
    fn drop(&mut self) {
        // Best-effort final sync for the OnClose policy.
        let inner = self.inner.lock();
        if !inner.closed {
            let _ = inner.file.sync_data();
        }
    }
}

impl std::fmt::Debug for RecoveryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryLog")
            .field("path", &self.path)
            .field("next_lsn", &self.next_lsn())
            .finish()
    }
}

/// Reads and validates every complete record in the log file.
fn read_records(path: &Path, max_record_size: usize) -> WalResult<Vec<WalRecord>> {
    let data = std::fs::read(path)?;
    let (records, _) = scan_records(&data, max_record_size)?;
    Ok(records)
}

/// Parses records out of raw log bytes. Returns the records and the
/// offset where valid content ends (before any torn tail).
fn scan_records(data: &[u8], max_record_size: usize) -> WalResult<(Vec<WalRecord>, usize)> {
    if data.len() < FILE_HEADER_SIZE {
        return Err(WalError::deserialization_error(
            "recovery log shorter than its file header",
        ));
    }

    let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    if magic != WAL_MAGIC {
        return Err(WalError::InvalidMagic {
            expected: WAL_MAGIC,
            found: magic,
        });
    }
    let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if version != LOG_FORMAT_VERSION {
        return Err(WalError::UnsupportedVersion {
            expected: LOG_FORMAT_VERSION,
            found: version,
        });
    }

    let mut records = Vec::new();
    let mut offset = FILE_HEADER_SIZE;
    while data.len() - offset >= RecordHeader::SIZE {
        let header = RecordHeader::from_bytes(&data[offset..offset + RecordHeader::SIZE])?;
        if header.payload_length as usize > max_record_size {
            return Err(WalError::corrupted(
                header.lsn,
                format!(
                    "payload length {} exceeds configured maximum",
                    header.payload_length
                ),
            ));
        }

        let total = header.total_size();
        if data.len() - offset < total {
            // Torn tail: the final append never finished.
            break;
        }

        let payload = &data[offset + RecordHeader::SIZE..offset + total];
        if !header.verify_checksum(payload) {
            return Err(WalError::checksum_mismatch(
                header.lsn,
                header.checksum,
                header.compute_checksum(payload),
            ));
        }

        records.push(WalRecord::deserialize(&mut &data[offset..offset + total])?);
        offset += total;
    }

    Ok((records, offset))
}

/// Replays registrations: begins open a build, and an end, commit, or
/// abort for the same transaction closes it.
fn rebuild_hot_indexes(records: &[WalRecord]) -> BTreeMap<TxnId, Vec<FileId>> {
    let mut open = BTreeMap::new();
    for record in records {
        match &record.payload {
            WalPayload::HotIndexBegin(p) => {
                open.insert(record.txn_id(), p.file_ids.clone());
            }
            WalPayload::HotIndexEnd | WalPayload::TxnCommit | WalPayload::TxnAbort => {
                open.remove(&record.txn_id());
            }
            WalPayload::CheckpointBegin(_) | WalPayload::CheckpointEnd => {}
        }
    }
    open
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordType;
    use tempfile::TempDir;

    fn open_log(dir: &TempDir) -> RecoveryLog {
        RecoveryLog::open(WalConfig::new(dir.path())).unwrap()
    }

    #[test]
    fn test_open_creates_log_file() {
        let tmp = TempDir::new().unwrap();
        let log = open_log(&tmp);

        assert!(log.path().exists());
        assert_eq!(log.next_lsn(), Lsn::FIRST);
        assert!(log.records().unwrap().is_empty());
    }

    #[test]
    fn test_append_and_read_records() {
        let tmp = TempDir::new().unwrap();
        let log = open_log(&tmp);

        let l1 = log.append_commit(TxnId::new(1)).unwrap();
        let l2 = log.append_abort(TxnId::new(2)).unwrap();
        let l3 = log
            .register_hot_index(TxnId::new(3), vec![FileId::new(10)])
            .unwrap();
        let l4 = log.hot_index_end(TxnId::new(3)).unwrap();
        assert!(l1 < l2 && l2 < l3 && l3 < l4);

        let records = log.records().unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].record_type(), RecordType::TxnCommit);
        assert_eq!(records[0].txn_id(), TxnId::new(1));
        assert_eq!(records[1].record_type(), RecordType::TxnAbort);
        assert_eq!(records[2].record_type(), RecordType::HotIndexBegin);
        assert_eq!(records[3].record_type(), RecordType::HotIndexEnd);
    }

    #[test]
    fn test_reopen_resumes_lsn() {
        let tmp = TempDir::new().unwrap();
        {
            let log = open_log(&tmp);
            log.append_commit(TxnId::new(1)).unwrap();
            log.append_commit(TxnId::new(2)).unwrap();
        }

        let log = open_log(&tmp);
        assert_eq!(log.next_lsn(), Lsn::new(3));

        log.append_abort(TxnId::new(3)).unwrap();
        let records = log.records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].lsn(), Lsn::new(3));
    }

    #[test]
    fn test_hot_index_registration_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let log = open_log(&tmp);
        let txn = TxnId::new(7);

        assert!(log.open_hot_indexes().is_empty());

        log.register_hot_index(txn, vec![FileId::new(1), FileId::new(2)])
            .unwrap();
        let open = log.open_hot_indexes();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].0, txn);
        assert_eq!(open[0].1, vec![FileId::new(1), FileId::new(2)]);

        log.hot_index_end(txn).unwrap();
        assert!(log.open_hot_indexes().is_empty());
    }

    #[test]
    fn test_abort_clears_registration() {
        let tmp = TempDir::new().unwrap();
        let log = open_log(&tmp);
        let txn = TxnId::new(7);

        log.register_hot_index(txn, vec![FileId::new(1)]).unwrap();
        log.append_abort(txn).unwrap();
        assert!(log.open_hot_indexes().is_empty());
    }

    #[test]
    fn test_interrupted_hot_index_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let txn = TxnId::new(9);
        {
            let log = open_log(&tmp);
            log.register_hot_index(txn, vec![FileId::new(4)]).unwrap();
            // No end record: the build was interrupted.
        }

        let log = open_log(&tmp);
        let open = log.open_hot_indexes();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0], (txn, vec![FileId::new(4)]));
    }

    #[test]
    fn test_torn_tail_tolerated() {
        let tmp = TempDir::new().unwrap();
        let log = open_log(&tmp);
        log.append_commit(TxnId::new(1)).unwrap();
        log.append_commit(TxnId::new(2)).unwrap();
        drop(log);

        // Simulate a crash partway through an append.
        let path = tmp.path().join("kiln.wal");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xAB; 10]).unwrap();
        drop(file);

        let log = open_log(&tmp);
        assert_eq!(log.records().unwrap().len(), 2);
        assert_eq!(log.next_lsn(), Lsn::new(3));

        // The torn bytes were dropped, so appends keep the log readable.
        log.append_commit(TxnId::new(3)).unwrap();
        let records = log.records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].lsn(), Lsn::new(3));
    }

    #[test]
    fn test_corrupt_payload_detected() {
        let tmp = TempDir::new().unwrap();
        let log = open_log(&tmp);
        log.register_hot_index(TxnId::new(1), vec![FileId::new(5)])
            .unwrap();
        drop(log);

        // Flip the last payload byte.
        let path = tmp.path().join("kiln.wal");
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        std::fs::write(&path, data).unwrap();

        let err = RecoveryLog::open(WalConfig::new(tmp.path())).unwrap_err();
        assert!(matches!(err, WalError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("kiln.wal"), [0u8; 64]).unwrap();

        let err = RecoveryLog::open(WalConfig::new(tmp.path())).unwrap_err();
        assert!(matches!(err, WalError::InvalidMagic { .. }));
    }

    #[test]
    fn test_append_after_close_fails() {
        let tmp = TempDir::new().unwrap();
        let log = open_log(&tmp);

        log.close().unwrap();
        assert!(matches!(
            log.append_commit(TxnId::new(1)),
            Err(WalError::Closed)
        ));
        // Closing again is a no-op.
        log.close().unwrap();
    }

    #[test]
    fn test_stats_track_appends() {
        let tmp = TempDir::new().unwrap();
        let log = open_log(&tmp);

        log.append_commit(TxnId::new(1)).unwrap();
        log.append_abort(TxnId::new(2)).unwrap();

        let stats = log.stats();
        assert_eq!(stats.records_appended.load(AtomicOrdering::Relaxed), 2);
        assert_eq!(stats.commits_logged.load(AtomicOrdering::Relaxed), 1);
        assert_eq!(stats.aborts_logged.load(AtomicOrdering::Relaxed), 1);
        assert!(stats.bytes_appended.load(AtomicOrdering::Relaxed) >= 64);
    }
}
