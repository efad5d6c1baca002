//! Record types and the assembled record.

use bytes::{Buf, Bytes, BytesMut};

use kiln_common::types::{FileId, Lsn, TxnId};

use super::header::RecordHeader;
use super::payload::{CheckpointBeginPayload, HotIndexBeginPayload, Payload};
use crate::error::{WalError, WalResult};

/// Record type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// Transaction commit.
    TxnCommit = 1,
    /// Transaction abort.
    TxnAbort = 2,
    /// A hot index build started; lists its run files.
    HotIndexBegin = 3,
    /// A hot index build finished cleanly.
    HotIndexEnd = 4,
    /// Begin checkpoint; lists live transactions.
    CheckpointBegin = 5,
    /// End checkpoint.
    CheckpointEnd = 6,
}

impl RecordType {
    /// Converts the record type to a u8.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Creates a record type from a u8.
    pub fn from_u8(value: u8) -> WalResult<Self> {
        match value {
            1 => Ok(Self::TxnCommit),
            2 => Ok(Self::TxnAbort),
            3 => Ok(Self::HotIndexBegin),
            4 => Ok(Self::HotIndexEnd),
            5 => Ok(Self::CheckpointBegin),
            6 => Ok(Self::CheckpointEnd),
            _ => Err(WalError::deserialization_error(format!(
                "unknown record type: {value}"
            ))),
        }
    }

    /// Returns true if this record resolves a transaction.
    pub const fn is_transaction_record(self) -> bool {
        matches!(self, Self::TxnCommit | Self::TxnAbort)
    }

    /// Returns true if this record brackets a hot index build.
    pub const fn is_hot_index_record(self) -> bool {
        matches!(self, Self::HotIndexBegin | Self::HotIndexEnd)
    }

    /// Returns true if this record brackets a checkpoint.
    pub const fn is_checkpoint_record(self) -> bool {
        matches!(self, Self::CheckpointBegin | Self::CheckpointEnd)
    }
}

/// A complete record with header and typed payload.
#[derive(Debug, Clone)]
pub struct WalRecord {
    /// Record header.
    pub header: RecordHeader,
    /// Record payload.
    pub payload: WalPayload,
}

/// Record payload variants.
#[derive(Debug, Clone)]
pub enum WalPayload {
    /// Transaction commit (no payload).
    TxnCommit,
    /// Transaction abort (no payload).
    TxnAbort,
    /// Hot index begin payload.
    HotIndexBegin(HotIndexBeginPayload),
    /// Hot index end (no payload).
    HotIndexEnd,
    /// Checkpoint begin payload.
    CheckpointBegin(CheckpointBeginPayload),
    /// Checkpoint end (no payload).
    CheckpointEnd,
}

impl WalRecord {
    /// Creates a transaction commit record.
    pub fn txn_commit(lsn: Lsn, txn_id: TxnId) -> Self {
        Self {
            header: RecordHeader::new(lsn, txn_id, RecordType::TxnCommit, 0),
            payload: WalPayload::TxnCommit,
        }
    }

    /// Creates a transaction abort record.
    pub fn txn_abort(lsn: Lsn, txn_id: TxnId) -> Self {
        Self {
            header: RecordHeader::new(lsn, txn_id, RecordType::TxnAbort, 0),
            payload: WalPayload::TxnAbort,
        }
    }

    /// Creates a hot index begin record.
    pub fn hot_index_begin(lsn: Lsn, txn_id: TxnId, file_ids: Vec<FileId>) -> WalResult<Self> {
        let payload = HotIndexBeginPayload { file_ids };
        let payload_bytes = payload.serialize()?;
        Ok(Self {
            header: RecordHeader::new(
                lsn,
                txn_id,
                RecordType::HotIndexBegin,
                payload_bytes.len() as u32,
            ),
            payload: WalPayload::HotIndexBegin(payload),
        })
    }

    /// Creates a hot index end record.
    pub fn hot_index_end(lsn: Lsn, txn_id: TxnId) -> Self {
        Self {
            header: RecordHeader::new(lsn, txn_id, RecordType::HotIndexEnd, 0),
            payload: WalPayload::HotIndexEnd,
        }
    }

    /// Creates a checkpoint begin record.
    pub fn checkpoint_begin(lsn: Lsn, live_txns: Vec<TxnId>) -> WalResult<Self> {
        let payload = CheckpointBeginPayload { live_txns };
        let payload_bytes = payload.serialize()?;
        Ok(Self {
            header: RecordHeader::new(
                lsn,
                TxnId::INVALID,
                RecordType::CheckpointBegin,
                payload_bytes.len() as u32,
            ),
            payload: WalPayload::CheckpointBegin(payload),
        })
    }

    /// Creates a checkpoint end record.
    pub fn checkpoint_end(lsn: Lsn) -> Self {
        Self {
            header: RecordHeader::new(lsn, TxnId::INVALID, RecordType::CheckpointEnd, 0),
            payload: WalPayload::CheckpointEnd,
        }
    }

    /// Returns the LSN of this record.
    pub fn lsn(&self) -> Lsn {
        self.header.lsn
    }

    /// Returns the transaction ID of this record.
    pub fn txn_id(&self) -> TxnId {
        self.header.txn_id
    }

    /// Returns the record type.
    pub fn record_type(&self) -> RecordType {
        self.header.record_type
    }

    /// Serializes the entire record (header + payload) to bytes.
    pub fn serialize(&self) -> WalResult<Bytes> {
        let payload_bytes = self.serialize_payload()?;
        let mut header = self.header;
        header.payload_length = payload_bytes.len() as u32;
        header.set_checksum(&payload_bytes);

        let mut buf = BytesMut::with_capacity(RecordHeader::SIZE + payload_bytes.len());
        header.serialize(&mut buf);
        buf.extend_from_slice(&payload_bytes);

        Ok(buf.freeze())
    }

    /// Serializes just the payload.
    fn serialize_payload(&self) -> WalResult<Bytes> {
        match &self.payload {
            WalPayload::TxnCommit
            | WalPayload::TxnAbort
            | WalPayload::HotIndexEnd
            | WalPayload::CheckpointEnd => Ok(Bytes::new()),
            WalPayload::HotIndexBegin(p) => p.serialize(),
            WalPayload::CheckpointBegin(p) => p.serialize(),
        }
    }

    /// Deserializes a record from bytes.
    pub fn deserialize(mut buf: impl Buf) -> WalResult<Self> {
        let header = RecordHeader::deserialize(&mut buf)?;

        if buf.remaining() < header.payload_length as usize {
            return Err(WalError::deserialization_error(format!(
                "not enough bytes for payload: {} < {}",
                buf.remaining(),
                header.payload_length
            )));
        }

        let payload_bytes = buf.copy_to_bytes(header.payload_length as usize);
        let payload = Self::deserialize_payload(header.record_type, &payload_bytes)?;

        Ok(Self { header, payload })
    }

    /// Deserializes the payload based on record type.
    fn deserialize_payload(record_type: RecordType, bytes: &[u8]) -> WalResult<WalPayload> {
        match record_type {
            RecordType::TxnCommit => Ok(WalPayload::TxnCommit),
            RecordType::TxnAbort => Ok(WalPayload::TxnAbort),
            RecordType::HotIndexBegin => Ok(WalPayload::HotIndexBegin(
                HotIndexBeginPayload::deserialize(bytes)?,
            )),
            RecordType::HotIndexEnd => Ok(WalPayload::HotIndexEnd),
            RecordType::CheckpointBegin => Ok(WalPayload::CheckpointBegin(
                CheckpointBeginPayload::deserialize(bytes)?,
            )),
            RecordType::CheckpointEnd => Ok(WalPayload::CheckpointEnd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_roundtrip() {
        for rt in [
            RecordType::TxnCommit,
            RecordType::TxnAbort,
            RecordType::HotIndexBegin,
            RecordType::HotIndexEnd,
            RecordType::CheckpointBegin,
            RecordType::CheckpointEnd,
        ] {
            let byte = rt.as_u8();
            let decoded = RecordType::from_u8(byte).unwrap();
            assert_eq!(rt, decoded);
        }
    }

    #[test]
    fn test_invalid_record_type() {
        assert!(RecordType::from_u8(0).is_err());
        assert!(RecordType::from_u8(255).is_err());
    }

    #[test]
    fn test_record_type_categories() {
        assert!(RecordType::TxnCommit.is_transaction_record());
        assert!(RecordType::TxnAbort.is_transaction_record());
        assert!(RecordType::HotIndexBegin.is_hot_index_record());
        assert!(RecordType::CheckpointEnd.is_checkpoint_record());
        assert!(!RecordType::HotIndexEnd.is_transaction_record());
    }

    #[test]
    fn test_commit_record_roundtrip() {
        let record = WalRecord::txn_commit(Lsn::new(1000), TxnId::new(42));

        let bytes = record.serialize().unwrap();
        let decoded = WalRecord::deserialize(&mut bytes.as_ref()).unwrap();

        assert_eq!(decoded.lsn(), Lsn::new(1000));
        assert_eq!(decoded.txn_id(), TxnId::new(42));
        assert_eq!(decoded.record_type(), RecordType::TxnCommit);
        assert!(matches!(decoded.payload, WalPayload::TxnCommit));
    }

    #[test]
    fn test_hot_index_begin_roundtrip() {
        let record = WalRecord::hot_index_begin(
            Lsn::new(5),
            TxnId::new(3),
            vec![FileId::new(10), FileId::new(20)],
        )
        .unwrap();

        let bytes = record.serialize().unwrap();
        let decoded = WalRecord::deserialize(&mut bytes.as_ref()).unwrap();

        assert_eq!(decoded.record_type(), RecordType::HotIndexBegin);
        if let WalPayload::HotIndexBegin(p) = decoded.payload {
            assert_eq!(p.file_ids, vec![FileId::new(10), FileId::new(20)]);
        } else {
            panic!("expected HotIndexBegin payload");
        }
    }

    #[test]
    fn test_checkpoint_begin_roundtrip() {
        let record =
            WalRecord::checkpoint_begin(Lsn::new(9), vec![TxnId::new(1), TxnId::new(2)]).unwrap();

        let bytes = record.serialize().unwrap();
        let decoded = WalRecord::deserialize(&mut bytes.as_ref()).unwrap();

        assert_eq!(decoded.txn_id(), TxnId::INVALID);
        if let WalPayload::CheckpointBegin(p) = decoded.payload {
            assert_eq!(p.live_txns.len(), 2);
        } else {
            panic!("expected CheckpointBegin payload");
        }
    }

    #[test]
    fn test_serialized_checksum_verifies() {
        let record = WalRecord::hot_index_begin(Lsn::new(1), TxnId::new(1), vec![FileId::new(2)])
            .unwrap();
        let bytes = record.serialize().unwrap();

        let header = RecordHeader::from_bytes(&bytes[..RecordHeader::SIZE]).unwrap();
        assert!(header.verify_checksum(&bytes[RecordHeader::SIZE..]));
    }
}
