//! Recovery log record header.
//!
//! The header is a fixed 32-byte structure that precedes every record.

use bytes::{Buf, BufMut};

use kiln_common::constants::WAL_RECORD_HEADER_SIZE;
use kiln_common::types::{Lsn, TxnId};

use super::types::RecordType;
use crate::error::{WalError, WalResult};

/// Record header (32 bytes).
///
/// Layout:
/// - lsn: 8 bytes
/// - txn_id: 8 bytes
/// - record_type: 1 byte
/// - reserved: 1 byte (alignment)
/// - payload_length: 4 bytes
/// - checksum: 4 bytes (CRC32 of header + payload)
/// - padding: 6 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct RecordHeader {
    /// Log sequence number of this record.
    pub lsn: Lsn,
    /// Transaction that generated this record.
    pub txn_id: TxnId,
    /// Type of record.
    pub record_type: RecordType,
    /// Length of the payload in bytes.
    pub payload_length: u32,
    /// CRC32 checksum of header + payload.
    pub checksum: u32,
}

impl RecordHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = WAL_RECORD_HEADER_SIZE;

    /// Creates a new record header.
    pub fn new(lsn: Lsn, txn_id: TxnId, record_type: RecordType, payload_length: u32) -> Self {
        Self {
            lsn,
            txn_id,
            record_type,
            payload_length,
            checksum: 0,
        }
    }

    /// Serializes the header to bytes.
    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.lsn.as_u64());
        buf.put_u64(self.txn_id.as_u64());
        buf.put_u8(self.record_type.as_u8());
        buf.put_u8(0); // reserved
        buf.put_u32(self.payload_length);
        buf.put_u32(self.checksum);
        buf.put_u32(0); // padding to 32 bytes
        buf.put_u16(0);
    }

    /// Serializes the header to a byte array.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut cursor = &mut buf[..];
        self.serialize(&mut cursor);
        buf
    }

    /// Deserializes a header from bytes.
    pub fn deserialize(buf: &mut impl Buf) -> WalResult<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(WalError::deserialization_error(format!(
                "not enough bytes for header: {} < {}",
                buf.remaining(),
                Self::SIZE
            )));
        }

        let lsn = Lsn::new(buf.get_u64());
        let txn_id = TxnId::new(buf.get_u64());
        let record_type = RecordType::from_u8(buf.get_u8())?;
        let _reserved = buf.get_u8();
        let payload_length = buf.get_u32();
        let checksum = buf.get_u32();
        let _padding = buf.get_u32();
        let _padding = buf.get_u16();

        Ok(Self {
            lsn,
            txn_id,
            record_type,
            payload_length,
            checksum,
        })
    }

    /// Deserializes a header from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> WalResult<Self> {
        Self::deserialize(&mut &bytes[..])
    }

    /// Returns the total record size (header + payload).
    pub fn total_size(&self) -> usize {
        Self::SIZE + self.payload_length as usize
    }

    /// Computes the checksum for this header and the given payload.
    pub fn compute_checksum(&self, payload: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();

        // Hash header fields (excluding the checksum field itself)
        hasher.update(&self.lsn.as_u64().to_le_bytes());
        hasher.update(&self.txn_id.as_u64().to_le_bytes());
        hasher.update(&[self.record_type.as_u8()]);
        hasher.update(&[0u8]); // reserved
        hasher.update(&self.payload_length.to_le_bytes());

        hasher.update(payload);

        hasher.finalize()
    }

    /// Sets the checksum based on the payload.
    pub fn set_checksum(&mut self, payload: &[u8]) {
        self.checksum = self.compute_checksum(payload);
    }

    /// Verifies the checksum against the payload.
    pub fn verify_checksum(&self, payload: &[u8]) -> bool {
        self.checksum == self.compute_checksum(payload)
    }
}
