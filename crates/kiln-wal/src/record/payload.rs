//! Record payload serialization.
//!
//! Most record types carry no payload; the header's `txn_id` says
//! everything. The two begin records carry lists: the run files a hot
//! index is writing, and the transactions live at a checkpoint.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use kiln_common::types::{FileId, TxnId};

use crate::error::{WalError, WalResult};

/// Trait for record payloads.
pub trait Payload: Sized {
    /// Serializes the payload to bytes.
    fn serialize(&self) -> WalResult<Bytes>;

    /// Deserializes the payload from bytes.
    fn deserialize(bytes: &[u8]) -> WalResult<Self>;
}

/// Payload for a hot index begin record.
///
/// Lists the run files the build is writing, so an interrupted build's
/// files can be identified after restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotIndexBeginPayload {
    /// Run files bound to the build's destinations.
    pub file_ids: Vec<FileId>,
}

impl Payload for HotIndexBeginPayload {
    fn serialize(&self) -> WalResult<Bytes> {
        let mut buf = BytesMut::with_capacity(4 + self.file_ids.len() * 8);
        buf.put_u32(self.file_ids.len() as u32);
        for file_id in &self.file_ids {
            buf.put_u64(file_id.as_u64());
        }
        Ok(buf.freeze())
    }

    fn deserialize(bytes: &[u8]) -> WalResult<Self> {
        let mut buf = bytes;
        if buf.remaining() < 4 {
            return Err(WalError::deserialization_error(
                "hot index begin payload too short",
            ));
        }
        let count = buf.get_u32() as usize;
        if buf.remaining() < count * 8 {
            return Err(WalError::deserialization_error(format!(
                "hot index begin payload truncated: {} file ids expected",
                count
            )));
        }
        let mut file_ids = Vec::with_capacity(count);
        for _ in 0..count {
            file_ids.push(FileId::new(buf.get_u64()));
        }
        Ok(Self { file_ids })
    }
}

/// Payload for a checkpoint begin record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointBeginPayload {
    /// Transactions live when the checkpoint started.
    pub live_txns: Vec<TxnId>,
}

impl Payload for CheckpointBeginPayload {
    fn serialize(&self) -> WalResult<Bytes> {
        let mut buf = BytesMut::with_capacity(4 + self.live_txns.len() * 8);
        buf.put_u32(self.live_txns.len() as u32);
        for txn in &self.live_txns {
            buf.put_u64(txn.as_u64());
        }
        Ok(buf.freeze())
    }

    fn deserialize(bytes: &[u8]) -> WalResult<Self> {
        let mut buf = bytes;
        if buf.remaining() < 4 {
            return Err(WalError::deserialization_error(
                "checkpoint begin payload too short",
            ));
        }
        let count = buf.get_u32() as usize;
        if buf.remaining() < count * 8 {
            return Err(WalError::deserialization_error(format!(
                "checkpoint begin payload truncated: {} txn ids expected",
                count
            )));
        }
        let mut live_txns = Vec::with_capacity(count);
        for _ in 0..count {
            live_txns.push(TxnId::new(buf.get_u64()));
        }
        Ok(Self { live_txns })
    }
}
