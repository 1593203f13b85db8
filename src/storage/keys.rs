#![forbid(unsafe_code)]

use std::cmp::Ordering;

use crate::primitives::bytes::{buf::Cursor, ord};
use crate::types::{QgroupId, QuotaError, Result};

/// Trait implemented by key types stored in the quota tree.
pub trait KeyCodec: Sized {
    /// Encode `key` into `out` using the order-preserving representation.
    fn encode_key(key: &Self, out: &mut Vec<u8>);

    /// Compare two encoded keys.
    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering;

    /// Decode a key from its encoded representation.
    fn decode_key(bytes: &[u8]) -> Result<Self>;
}

const TAG_STATUS: u8 = 0xF0;
const TAG_INFO: u8 = 0xF2;
const TAG_LIMIT: u8 = 0xF4;
const TAG_RELATION: u8 = 0xF6;

/// Key of one persisted quota row.
///
/// Rows sort by kind first, then by group id, so a full scan yields STATUS,
/// every INFO, every LIMIT and finally the relation pairs.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum QuotaKey {
    /// Singleton status row.
    Status,
    /// Counters of one group.
    Info(QgroupId),
    /// Limits of one group.
    Limit(QgroupId),
    /// One direction of a membership edge.
    ///
    /// Both `(member, parent)` and `(parent, member)` are stored; the primary
    /// direction is the one whose first id sorts lower.
    Relation(QgroupId, QgroupId),
}

impl QuotaKey {
    /// Encodes the key into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(21);
        Self::encode_key(self, &mut out);
        out
    }

    /// Returns whether this relation row is the primary `(member, parent)` direction.
    pub fn is_primary_relation(&self) -> bool {
        matches!(self, QuotaKey::Relation(a, b) if a < b)
    }
}

fn push_id(out: &mut Vec<u8>, id: QgroupId) {
    ord::push_u16_be(out, id.level);
    ord::push_u64_be(out, id.subid);
}

fn read_id(cur: &mut Cursor<'_>) -> Result<QgroupId> {
    let level = cur.u16()?;
    let subid = cur.u64()?;
    Ok(QgroupId::new(level, subid))
}

impl KeyCodec for QuotaKey {
    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        match *key {
            QuotaKey::Status => out.push(TAG_STATUS),
            QuotaKey::Info(id) => {
                out.push(TAG_INFO);
                push_id(out, id);
            }
            QuotaKey::Limit(id) => {
                out.push(TAG_LIMIT);
                push_id(out, id);
            }
            QuotaKey::Relation(a, b) => {
                out.push(TAG_RELATION);
                push_id(out, a);
                push_id(out, b);
            }
        }
    }

    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(bytes);
        let key = match cur.u8()? {
            TAG_STATUS => QuotaKey::Status,
            TAG_INFO => QuotaKey::Info(read_id(&mut cur)?),
            TAG_LIMIT => QuotaKey::Limit(read_id(&mut cur)?),
            TAG_RELATION => {
                let a = read_id(&mut cur)?;
                let b = read_id(&mut cur)?;
                QuotaKey::Relation(a, b)
            }
            _ => return Err(QuotaError::Corruption("unknown quota key tag")),
        };
        cur.finish()?;
        Ok(key)
    }
}
