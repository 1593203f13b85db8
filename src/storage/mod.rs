//! Persistence adapter for quota rows.
//!
//! Encodes STATUS, INFO, LIMIT and RELATION rows, seals them with a
//! key-bound CRC32 and hands them to a [`QuotaTree`] in atomic batches.

/// Order-preserving row keys.
pub mod keys;

/// Row payloads and their checksummed encoding.
pub mod items;

/// Tree boundary plus in-memory and file-backed implementations.
pub mod tree;

pub use items::{
    InfoItem, LimitItem, RelationItem, StatusItem, ValCodec, QUOTA_STATUS_VERSION,
};
pub use keys::{KeyCodec, QuotaKey};
pub use tree::{read_row, FileQuotaTree, MemQuotaTree, QuotaBatch, QuotaTree};
