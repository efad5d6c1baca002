//! Run files: the on-disk form of a finished destination build.
//!
//! A run file holds one table's rows in key order:
//!
//! ```text
//! +--------------------------------------------------+
//! | header (32 bytes)                                |
//! |   magic (4) | version (4) | table_id (8)         |
//! |   row_count (8) | payload checksum (4) | pad (4) |
//! +--------------------------------------------------+
//! | row_count x ( key_len u32 | key bytes            |
//! |               value_len u32 | value bytes )      |
//! +--------------------------------------------------+
//! ```
//!
//! Writers stage the file under a `.tmp` name and rename it into place
//! on finish, so a half-written run is never observed under its final
//! name. Leftover `.tmp` files are orphans from a crashed build and are
//! removed by [`sweep_orphans`] when the engine opens.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};

use kiln_common::constants::{
    RUN_FILE_EXT, RUN_FILE_HEADER_SIZE, RUN_FILE_MAGIC, RUN_FILE_VERSION, RUN_TMP_EXT,
};
use kiln_common::error::{KilnError, KilnResult};
use kiln_common::types::{Key, TableId, Value};

/// A finished run file on disk.
#[derive(Debug, Clone)]
pub struct FinishedRun {
    /// Final path of the run file.
    pub path: PathBuf,
    /// Number of rows written.
    pub row_count: u64,
    /// Total bytes written, header included.
    pub bytes_written: u64,
}

/// The decoded contents of a run file.
#[derive(Debug)]
pub struct RunContents {
    /// The table the run was built for.
    pub table_id: TableId,
    /// Rows in key order.
    pub rows: Vec<(Key, Value)>,
}

/// Buffers rows for one destination and writes them as a run file.
///
/// Rows are staged in a sorted map, so `finish` writes them in key
/// order without a separate sort pass. Without uniqueness enforcement a
/// repeated key overwrites the earlier row (last write wins, matching
/// how the live store resolves repeated writes).
#[derive(Debug)]
pub struct RunWriter {
    table_id: TableId,
    enforce_unique: bool,
    rows: BTreeMap<Key, Value>,
    bytes_buffered: usize,
}

impl RunWriter {
    /// Creates a writer for `table_id`.
    #[must_use]
    pub fn new(table_id: TableId, enforce_unique: bool) -> Self {
        Self {
            table_id,
            enforce_unique,
            rows: BTreeMap::new(),
            bytes_buffered: 0,
        }
    }

    /// Returns the table this writer builds.
    #[inline]
    #[must_use]
    pub const fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Returns the number of rows buffered.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Returns the number of row bytes buffered.
    #[must_use]
    pub const fn bytes_buffered(&self) -> usize {
        self.bytes_buffered
    }

    /// Returns the buffered rows in key order.
    ///
    /// The clones are cheap; keys and values are reference-counted
    /// byte buffers.
    #[must_use]
    pub fn rows(&self) -> Vec<(Key, Value)> {
        self.rows
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Buffers one row.
    ///
    /// With uniqueness enforcement, a repeated key fails with
    /// [`KilnError::DuplicateKey`] and the writer keeps the first row.
    pub fn push(&mut self, key: Key, value: Value) -> KilnResult<()> {
        if self.enforce_unique && self.rows.contains_key(&key) {
            return Err(KilnError::DuplicateKey {
                table_id: self.table_id,
                key,
            });
        }
        let key_len = key.len();
        self.bytes_buffered += key_len + value.len();
        if let Some(old) = self.rows.insert(key, value) {
            self.bytes_buffered -= key_len + old.len();
        }
        Ok(())
    }

    /// Writes the buffered rows to `path` and returns the finished run.
    ///
    /// The data is staged under a `.tmp` sibling and renamed into place
    /// after the write (and, if `sync` is set, after an fsync).
    pub fn finish(self, path: &Path, sync: bool) -> KilnResult<FinishedRun> {
        debug_assert_eq!(
            path.extension().and_then(|e| e.to_str()),
            Some(RUN_FILE_EXT)
        );

        let row_count = self.rows.len() as u64;
        let payload = encode_payload(&self.rows);
        let header = encode_header(self.table_id, row_count, crc32fast::hash(&payload));

        let tmp_path = path.with_extension(RUN_TMP_EXT);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&header)?;
        file.write_all(&payload)?;
        if sync {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&tmp_path, path)?;

        Ok(FinishedRun {
            path: path.to_path_buf(),
            row_count,
            bytes_written: (header.len() + payload.len()) as u64,
        })
    }
}

/// Writes a run file with no rows.
///
/// Empty runs are what error-path redirects bind destination tables to.
pub fn write_empty_run(path: &Path, table_id: TableId, sync: bool) -> KilnResult<FinishedRun> {
    RunWriter::new(table_id, false).finish(path, sync)
}

/// Reads and verifies a run file.
pub fn read_run(path: &Path) -> KilnResult<RunContents> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    if bytes.len() < RUN_FILE_HEADER_SIZE {
        return Err(KilnError::corruption(format!(
            "run file {} is shorter than its header",
            path.display()
        )));
    }

    let (header, payload) = bytes.split_at(RUN_FILE_HEADER_SIZE);
    let mut header = header;

    let magic = header.get_u32();
    if magic != RUN_FILE_MAGIC {
        return Err(KilnError::corruption(format!(
            "run file {} has bad magic {magic:#010x}",
            path.display()
        )));
    }
    let version = header.get_u32();
    if version != RUN_FILE_VERSION {
        return Err(KilnError::corruption(format!(
            "run file {} has unsupported version {version}",
            path.display()
        )));
    }
    let table_id = TableId::new(header.get_u64());
    let row_count = header.get_u64();
    let expected_crc = header.get_u32();

    let actual_crc = crc32fast::hash(payload);
    if actual_crc != expected_crc {
        return Err(KilnError::ChecksumMismatch {
            expected: expected_crc,
            actual: actual_crc,
        });
    }

    let rows = decode_payload(payload, row_count, path)?;
    Ok(RunContents { table_id, rows })
}

/// Removes leftover `.tmp` files from `dir`.
///
/// Returns the paths that were removed.
pub fn sweep_orphans(dir: &Path) -> KilnResult<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if !dir.exists() {
        return Ok(removed);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some(RUN_TMP_EXT) {
            fs::remove_file(&path)?;
            removed.push(path);
        }
    }
    Ok(removed)
}

fn encode_header(table_id: TableId, row_count: u64, crc: u32) -> BytesMut {
    let mut header = BytesMut::with_capacity(RUN_FILE_HEADER_SIZE);
    header.put_u32(RUN_FILE_MAGIC);
    header.put_u32(RUN_FILE_VERSION);
    header.put_u64(table_id.as_u64());
    header.put_u64(row_count);
    header.put_u32(crc);
    header.resize(RUN_FILE_HEADER_SIZE, 0);
    header
}

fn encode_payload(rows: &BTreeMap<Key, Value>) -> BytesMut {
    let size: usize = rows.iter().map(|(k, v)| 8 + k.len() + v.len()).sum();
    let mut payload = BytesMut::with_capacity(size);
    for (key, value) in rows {
        payload.put_u32(key.len() as u32);
        payload.put_slice(key.as_bytes());
        payload.put_u32(value.len() as u32);
        payload.put_slice(value.as_bytes());
    }
    payload
}

fn decode_payload(mut payload: &[u8], row_count: u64, path: &Path) -> KilnResult<Vec<(Key, Value)>> {
    let truncated = || {
        KilnError::corruption(format!(
            "run file {} payload is truncated",
            path.display()
        ))
    };

    let mut rows = Vec::with_capacity(row_count as usize);
    for _ in 0..row_count {
        if payload.remaining() < 4 {
            return Err(truncated());
        }
        let key_len = payload.get_u32() as usize;
        if payload.remaining() < key_len {
            return Err(truncated());
        }
        let key = Key::from_bytes(&payload[..key_len]);
        payload.advance(key_len);

        if payload.remaining() < 4 {
            return Err(truncated());
        }
        let value_len = payload.get_u32() as usize;
        if payload.remaining() < value_len {
            return Err(truncated());
        }
        let value = Value::from_bytes(&payload[..value_len]);
        payload.advance(value_len);

        rows.push((key, value));
    }
    if payload.has_remaining() {
        return Err(KilnError::corruption(format!(
            "run file {} has {} trailing bytes",
            path.display(),
            payload.remaining()
        )));
    }
    Ok(rows)
}
