#![forbid(unsafe_code)]
//! Encoding and buffer utilities shared by the quota record codecs.

pub mod ord {
    //! Order-preserving encoders for fixed-width key components.

    use core::convert::TryInto;

    const U64_LEN: usize = core::mem::size_of::<u64>();
    const U32_LEN: usize = core::mem::size_of::<u32>();
    const U16_LEN: usize = core::mem::size_of::<u16>();

    /// Appends `v` big-endian so byte order matches numeric order.
    pub fn push_u64_be(dst: &mut Vec<u8>, v: u64) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends `v` big-endian so byte order matches numeric order.
    pub fn push_u16_be(dst: &mut Vec<u8>, v: u16) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Decodes a u64 from big-endian byte order.
    pub fn get_u64_be(src: &[u8]) -> u64 {
        let head = src
            .get(..U64_LEN)
            .unwrap_or_else(|| panic!("u64 source shorter than 8 bytes (have {})", src.len()));
        let bytes: [u8; U64_LEN] = head.try_into().unwrap();
        u64::from_be_bytes(bytes)
    }

    /// Appends `v` big-endian so byte order matches numeric order.
    pub fn push_u32_be(dst: &mut Vec<u8>, v: u32) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Decodes a u32 from big-endian byte order.
    pub fn get_u32_be(src: &[u8]) -> u32 {
        let head = src
            .get(..U32_LEN)
            .unwrap_or_else(|| panic!("u32 source shorter than 4 bytes (have {})", src.len()));
        let bytes: [u8; U32_LEN] = head.try_into().unwrap();
        u32::from_be_bytes(bytes)
    }

    /// Decodes a u16 from big-endian byte order.
    pub fn get_u16_be(src: &[u8]) -> u16 {
        let head = src
            .get(..U16_LEN)
            .unwrap_or_else(|| panic!("u16 source shorter than 2 bytes (have {})", src.len()));
        let bytes: [u8; U16_LEN] = head.try_into().unwrap();
        u16::from_be_bytes(bytes)
    }
}

pub mod buf {
    //! A slice-backed cursor that reports truncation as corruption.

    use core::fmt;

    use crate::types::{QuotaError, Result};

    /// A cursor for reading bytes from a slice with offset tracking.
    pub struct Cursor<'a> {
        /// The underlying byte slice.
        pub buf: &'a [u8],
        /// Current read offset.
        pub off: usize,
    }

    impl<'a> Cursor<'a> {
        /// Creates a new cursor starting at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Takes the next `n` bytes, failing when the record is truncated.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .ok_or(QuotaError::Corruption("record offset overflow"))?;
            if end > self.buf.len() {
                return Err(QuotaError::Corruption("record truncated"));
            }
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Reads a big-endian u64.
        pub fn u64(&mut self) -> Result<u64> {
            Ok(super::ord::get_u64_be(self.take(8)?))
        }

        /// Reads a big-endian u32.
        pub fn u32(&mut self) -> Result<u32> {
            Ok(super::ord::get_u32_be(self.take(4)?))
        }

        /// Reads a big-endian u16.
        pub fn u16(&mut self) -> Result<u16> {
            Ok(super::ord::get_u16_be(self.take(2)?))
        }

        /// Reads a single byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }

        /// Fails unless every byte has been consumed.
        pub fn finish(&self) -> Result<()> {
            if self.remaining() == 0 {
                Ok(())
            } else {
                Err(QuotaError::Corruption("trailing bytes after record"))
            }
        }
    }

    impl<'a> fmt::Debug for Cursor<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Cursor")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}
