#![forbid(unsafe_code)]

use crate::primitives::bytes::{buf::Cursor, ord};
use crate::types::checksum::record_crc32;
use crate::types::{QuotaError, Result};

/// Trait implemented by value types stored in the quota tree.
pub trait ValCodec: Sized {
    /// Encode `value` into `out`.
    fn encode_val(value: &Self, out: &mut Vec<u8>);

    /// Decode a value from `src`.
    fn decode_val(src: &[u8]) -> Result<Self>;
}

/// On-disk format version of the quota rows.
pub const QUOTA_STATUS_VERSION: u64 = 1;

/// Persisted singleton status row.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StatusItem {
    /// Format version; rows from another version are not trusted.
    pub version: u64,
    /// Generation of the transaction that last wrote this row.
    pub generation: u64,
    /// Persisted status flag bits.
    pub flags: u64,
    /// Rescan progress cursor.
    pub rescan: u64,
}

/// Persisted counters of one group.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct InfoItem {
    /// Generation of the transaction that last wrote this row.
    pub generation: u64,
    /// Referenced bytes.
    pub rfer: u64,
    /// Referenced bytes, compressed.
    pub rfer_cmpr: u64,
    /// Exclusive bytes.
    pub excl: u64,
    /// Exclusive bytes, compressed.
    pub excl_cmpr: u64,
}

/// Persisted limits of one group.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LimitItem {
    /// Which of the limit fields are in force.
    pub flags: u64,
    /// Referenced-bytes limit.
    pub max_rfer: u64,
    /// Exclusive-bytes limit.
    pub max_excl: u64,
    /// Referenced-bytes reserve.
    pub rsv_rfer: u64,
    /// Exclusive-bytes reserve.
    pub rsv_excl: u64,
}

/// Empty marker stored under both directions of a relation.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RelationItem;

fn decode_words<const N: usize>(src: &[u8]) -> Result<[u64; N]> {
    let mut cur = Cursor::new(src);
    let mut words = [0u64; N];
    for word in words.iter_mut() {
        *word = cur.u64()?;
    }
    cur.finish()?;
    Ok(words)
}

impl ValCodec for StatusItem {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        for word in [value.version, value.generation, value.flags, value.rescan] {
            ord::push_u64_be(out, word);
        }
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        let [version, generation, flags, rescan] = decode_words::<4>(src)?;
        Ok(Self {
            version,
            generation,
            flags,
            rescan,
        })
    }
}

impl ValCodec for InfoItem {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        for word in [
            value.generation,
            value.rfer,
            value.rfer_cmpr,
            value.excl,
            value.excl_cmpr,
        ] {
            ord::push_u64_be(out, word);
        }
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        let [generation, rfer, rfer_cmpr, excl, excl_cmpr] = decode_words::<5>(src)?;
        Ok(Self {
            generation,
            rfer,
            rfer_cmpr,
            excl,
            excl_cmpr,
        })
    }
}

impl ValCodec for LimitItem {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        for word in [
            value.flags,
            value.max_rfer,
            value.max_excl,
            value.rsv_rfer,
            value.rsv_excl,
        ] {
            ord::push_u64_be(out, word);
        }
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        let [flags, max_rfer, max_excl, rsv_rfer, rsv_excl] = decode_words::<5>(src)?;
        Ok(Self {
            flags,
            max_rfer,
            max_excl,
            rsv_rfer,
            rsv_excl,
        })
    }
}

impl ValCodec for RelationItem {
    fn encode_val(_value: &Self, _out: &mut Vec<u8>) {}

    fn decode_val(src: &[u8]) -> Result<Self> {
        if src.is_empty() {
            Ok(RelationItem)
        } else {
            Err(QuotaError::Corruption("relation row carries a payload"))
        }
    }
}

/// Encodes `value` and appends a CRC32 bound to `key`.
pub fn seal<V: ValCodec>(key: &[u8], value: &V) -> Vec<u8> {
    let mut out = Vec::with_capacity(44);
    V::encode_val(value, &mut out);
    let crc = record_crc32(key, &out);
    ord::push_u32_be(&mut out, crc);
    out
}

/// Verifies the trailing checksum of a stored row and decodes its payload.
pub fn unseal<V: ValCodec>(key: &[u8], stored: &[u8]) -> Result<V> {
    let split = stored
        .len()
        .checked_sub(4)
        .ok_or(QuotaError::Corruption("quota row shorter than its checksum"))?;
    let (payload, tail) = stored.split_at(split);
    if ord::get_u32_be(tail) != record_crc32(key, payload) {
        return Err(QuotaError::Corruption("quota row checksum mismatch"));
    }
    V::decode_val(payload)
}
