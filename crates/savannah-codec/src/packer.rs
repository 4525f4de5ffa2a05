//! Big-endian byte packing.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PackError {
    #[error("packer overflow: need {needed} bytes but max is {max}")]
    Overflow { needed: usize, max: usize },

    #[error("length {0} does not fit in a u32 prefix")]
    LengthOverflow(usize),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnpackError {
    #[error("insufficient bytes: need {needed} but only {remaining} remaining")]
    InsufficientBytes { needed: usize, remaining: usize },

    #[error("invalid boolean value: {0}")]
    InvalidBool(u8),
}

/// Serializes values into a growable buffer capped at `max_size`.
///
/// The first error latches: later writes become no-ops and
/// [`Packer::into_bytes`] reports it.
#[derive(Debug)]
pub struct Packer {
    bytes: Vec<u8>,
    max_size: usize,
    error: Option<PackError>,
}

impl Packer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_max_size(capacity, usize::MAX)
    }

    #[must_use]
    pub fn with_max_size(capacity: usize, max_size: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity.min(max_size)),
            max_size,
            error: None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn errored(&self) -> bool {
        self.error.is_some()
    }

    /// # Errors
    ///
    /// Returns the first error hit while packing.
    pub fn into_bytes(self) -> Result<Vec<u8>, PackError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.bytes),
        }
    }

    fn reserve(&mut self, n: usize) -> bool {
        if self.error.is_some() {
            return false;
        }
        let needed = self.bytes.len().saturating_add(n);
        if needed > self.max_size {
            self.error = Some(PackError::Overflow {
                needed,
                max: self.max_size,
            });
            return false;
        }
        true
    }

    pub fn pack_byte(&mut self, val: u8) {
        if self.reserve(1) {
            self.bytes.push(val);
        }
    }

    pub fn pack_short(&mut self, val: u16) {
        self.pack_fixed_bytes(&val.to_be_bytes());
    }

    pub fn pack_int(&mut self, val: u32) {
        self.pack_fixed_bytes(&val.to_be_bytes());
    }

    pub fn pack_long(&mut self, val: u64) {
        self.pack_fixed_bytes(&val.to_be_bytes());
    }

    pub fn pack_bool(&mut self, val: bool) {
        self.pack_byte(u8::from(val));
    }

    /// Writes a `u32` length prefix.
    pub fn pack_len(&mut self, len: usize) {
        match u32::try_from(len) {
            Ok(len) => self.pack_int(len),
            Err(_) => {
                if self.error.is_none() {
                    self.error = Some(PackError::LengthOverflow(len));
                }
            }
        }
    }

    /// Writes bytes with no length prefix.
    pub fn pack_fixed_bytes(&mut self, val: &[u8]) {
        if self.reserve(val.len()) {
            self.bytes.extend_from_slice(val);
        }
    }

    /// Writes a `u32` length prefix followed by the bytes.
    pub fn pack_bytes(&mut self, val: &[u8]) {
        self.pack_len(val.len());
        self.pack_fixed_bytes(val);
    }
}

/// Reads values back out of a byte slice.
#[derive(Debug)]
pub struct Unpacker<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Unpacker<'a> {
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], UnpackError> {
        let remaining = self.remaining();
        if remaining < n {
            return Err(UnpackError::InsufficientBytes {
                needed: n,
                remaining,
            });
        }
        let out = &self.bytes[self.offset..self.offset + n];
        self.offset += n;
        Ok(out)
    }

    pub fn unpack_byte(&mut self) -> Result<u8, UnpackError> {
        Ok(self.take(1)?[0])
    }

    pub fn unpack_short(&mut self) -> Result<u16, UnpackError> {
        Ok(u16::from_be_bytes(self.unpack_fixed_bytes::<2>()?))
    }

    pub fn unpack_int(&mut self) -> Result<u32, UnpackError> {
        Ok(u32::from_be_bytes(self.unpack_fixed_bytes::<4>()?))
    }

    pub fn unpack_long(&mut self) -> Result<u64, UnpackError> {
        Ok(u64::from_be_bytes(self.unpack_fixed_bytes::<8>()?))
    }

    pub fn unpack_bool(&mut self) -> Result<bool, UnpackError> {
        match self.unpack_byte()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(UnpackError::InvalidBool(other)),
        }
    }

    pub fn unpack_fixed_bytes<const N: usize>(&mut self) -> Result<[u8; N], UnpackError> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N)?);
        Ok(arr)
    }

    pub fn unpack_bytes(&mut self) -> Result<Vec<u8>, UnpackError> {
        let len = self.unpack_int()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_layout() {
        let mut packer = Packer::new(16);
        packer.pack_short(0x1234);
        packer.pack_int(0xdead_beef);
        packer.pack_bool(true);
        let bytes = packer.into_bytes().unwrap();
        assert_eq!(bytes, vec![0x12, 0x34, 0xde, 0xad, 0xbe, 0xef, 0x01]);
    }

    #[test]
    fn test_overflow_latches() {
        let mut packer = Packer::with_max_size(4, 4);
        packer.pack_int(1);
        packer.pack_byte(2);
        assert!(packer.errored());
        assert_eq!(
            packer.into_bytes(),
            Err(PackError::Overflow { needed: 5, max: 4 })
        );
    }

    #[test]
    fn test_unpack_truncated() {
        let mut unpacker = Unpacker::new(&[0, 0, 0]);
        assert_eq!(
            unpacker.unpack_int(),
            Err(UnpackError::InsufficientBytes {
                needed: 4,
                remaining: 3
            })
        );
    }

    #[test]
    fn test_unpack_bytes() {
        let mut packer = Packer::new(16);
        packer.pack_bytes(b"abc");
        packer.pack_long(7);
        let bytes = packer.into_bytes().unwrap();

        let mut unpacker = Unpacker::new(&bytes);
        assert_eq!(unpacker.unpack_bytes().unwrap(), b"abc");
        assert_eq!(unpacker.unpack_long().unwrap(), 7);
        assert!(unpacker.is_empty());
    }

    #[test]
    fn test_invalid_bool() {
        assert_eq!(
            Unpacker::new(&[2]).unpack_bool(),
            Err(UnpackError::InvalidBool(2))
        );
    }
}
