//! Record types and serialization for the recovery log.
//!
//! Records are serialized with a fixed-size header followed by a
//! variable-length payload.

pub mod header;
pub mod payload;
pub mod types;

pub use header::RecordHeader;
pub use payload::{CheckpointBeginPayload, HotIndexBeginPayload, Payload};
pub use types::{RecordType, WalPayload, WalRecord};
