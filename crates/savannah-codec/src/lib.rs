//! Versioned binary codec.
//!
//! All multi-byte integers are big-endian:
//!
//! - `u8`/`bool`: 1 byte
//! - `u16`, `u32`, `u64`: 2, 4, 8 bytes
//! - `Vec<T>`: `u32` length followed by the elements
//! - [`Id`]: 32 raw bytes
//!
//! A [`CodecManager`] is built once at startup and handed to whatever needs
//! to encode; there is no global registry.

mod manager;
mod packer;

pub use manager::{finish, Codec, CodecError, CodecManager, TypeId, DEFAULT_MAX_SIZE};
pub use packer::{PackError, Packer, UnpackError, Unpacker};

use savannah_ids::{Id, ID_LEN};

/// Types that can be written by a [`Packer`].
pub trait Pack {
    fn pack(&self, packer: &mut Packer);
}

/// Types that can be read back from an [`Unpacker`].
pub trait Unpack: Sized {
    /// # Errors
    ///
    /// Fails when the input is truncated or malformed.
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, UnpackError>;
}

impl Pack for u8 {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_byte(*self);
    }
}

impl Pack for u16 {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_short(*self);
    }
}

impl Pack for u32 {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_int(*self);
    }
}

impl Pack for u64 {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_long(*self);
    }
}

impl Pack for bool {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_bool(*self);
    }
}

impl Pack for Id {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_fixed_bytes(self.as_bytes());
    }
}

impl<T: Pack> Pack for [T] {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_len(self.len());
        for item in self {
            item.pack(packer);
        }
    }
}

impl<T: Pack> Pack for Vec<T> {
    fn pack(&self, packer: &mut Packer) {
        self.as_slice().pack(packer);
    }
}

impl Unpack for u8 {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, UnpackError> {
        unpacker.unpack_byte()
    }
}

impl Unpack for u16 {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, UnpackError> {
        unpacker.unpack_short()
    }
}

impl Unpack for u32 {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, UnpackError> {
        unpacker.unpack_int()
    }
}

impl Unpack for u64 {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, UnpackError> {
        unpacker.unpack_long()
    }
}

impl Unpack for bool {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, UnpackError> {
        unpacker.unpack_bool()
    }
}

impl Unpack for Id {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, UnpackError> {
        Ok(Id::from_bytes(unpacker.unpack_fixed_bytes::<ID_LEN>()?))
    }
}

impl<T: Unpack> Unpack for Vec<T> {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, UnpackError> {
        let len = unpacker.unpack_int()? as usize;
        // Never trust the length prefix for the allocation size.
        let mut out = Vec::with_capacity(len.min(unpacker.remaining()));
        for _ in 0..len {
            out.push(T::unpack(unpacker)?);
        }
        Ok(out)
    }
}
