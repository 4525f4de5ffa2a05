//! Codec versions and type registration.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::{Pack, PackError, Packer, Unpack, UnpackError, Unpacker};

/// Default cap on an encoded value: 1 MiB.
pub const DEFAULT_MAX_SIZE: usize = 1 << 20;

/// Identifier assigned to a registered type within one codec version.
pub type TypeId = u32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error(transparent)]
    Pack(#[from] PackError),

    #[error(transparent)]
    Unpack(#[from] UnpackError),

    #[error("unknown codec version {0}")]
    UnknownVersion(u16),

    #[error("codec version {0} registered twice")]
    DuplicateVersion(u16),

    #[error("type {name:?} registered twice")]
    DuplicateType { name: &'static str },

    #[error("unknown type {0:?}")]
    UnknownTypeName(String),

    #[error("unknown type id {0}")]
    UnknownTypeId(TypeId),

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
}

/// Type registry for one codec version.
///
/// Type IDs are assigned in registration order, so every node must register
/// the same types in the same order.
#[derive(Debug, Default, Clone)]
pub struct Codec {
    names: Vec<&'static str>,
}

impl Codec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Fails if `name` is already registered.
    pub fn register_type(&mut self, name: &'static str) -> Result<TypeId, CodecError> {
        if self.names.contains(&name) {
            return Err(CodecError::DuplicateType { name });
        }
        self.names.push(name);
        Ok((self.names.len() - 1) as TypeId)
    }

    #[must_use]
    pub fn type_id(&self, name: &str) -> Option<TypeId> {
        self.names
            .iter()
            .position(|n| *n == name)
            .map(|i| i as TypeId)
    }

    #[must_use]
    pub fn type_name(&self, id: TypeId) -> Option<&'static str> {
        self.names.get(id as usize).copied()
    }
}

/// The set of codec versions a component understands.
///
/// Every encoding starts with the 2-byte version it was written with.
#[derive(Debug, Clone)]
pub struct CodecManager {
    codecs: BTreeMap<u16, Codec>,
    max_size: usize,
}

impl Default for CodecManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

impl CodecManager {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            codecs: BTreeMap::new(),
            max_size,
        }
    }

    /// # Errors
    ///
    /// Fails if `version` is already registered.
    pub fn register_codec(&mut self, version: u16, codec: Codec) -> Result<(), CodecError> {
        if self.codecs.contains_key(&version) {
            return Err(CodecError::DuplicateVersion(version));
        }
        self.codecs.insert(version, codec);
        Ok(())
    }

    /// # Errors
    ///
    /// Fails if `version` is not registered.
    pub fn codec(&self, version: u16) -> Result<&Codec, CodecError> {
        self.codecs
            .get(&version)
            .ok_or(CodecError::UnknownVersion(version))
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Encodes `value` with a version prefix.
    ///
    /// # Errors
    ///
    /// Fails for an unregistered version or when the encoding exceeds the
    /// size cap.
    pub fn marshal<T: Pack + ?Sized>(&self, version: u16, value: &T) -> Result<Vec<u8>, CodecError> {
        self.codec(version)?;
        let mut packer = Packer::with_max_size(128, self.max_size);
        packer.pack_short(version);
        value.pack(&mut packer);
        Ok(packer.into_bytes()?)
    }

    /// Encodes `value` with a version prefix and the type ID registered for
    /// `type_name` in that version.
    ///
    /// # Errors
    ///
    /// Fails if the version or type is unknown, or the encoding is too large.
    pub fn marshal_typed<T: Pack + ?Sized>(
        &self,
        version: u16,
        type_name: &str,
        value: &T,
    ) -> Result<Vec<u8>, CodecError> {
        let type_id = self
            .codec(version)?
            .type_id(type_name)
            .ok_or_else(|| CodecError::UnknownTypeName(type_name.to_string()))?;
        let mut packer = Packer::with_max_size(128, self.max_size);
        packer.pack_short(version);
        packer.pack_int(type_id);
        value.pack(&mut packer);
        Ok(packer.into_bytes()?)
    }

    /// Decodes a value written by [`CodecManager::marshal`], returning the
    /// version it was written with.
    ///
    /// # Errors
    ///
    /// Fails on an unknown version, malformed input, or trailing bytes.
    pub fn unmarshal<T: Unpack>(&self, bytes: &[u8]) -> Result<(u16, T), CodecError> {
        let mut unpacker = Unpacker::new(bytes);
        let version = unpacker.unpack_short()?;
        self.codec(version)?;
        let value = T::unpack(&mut unpacker)?;
        finish(&unpacker)?;
        Ok((version, value))
    }

    /// Reads the header of a value written by [`CodecManager::marshal_typed`]
    /// and returns `(version, type name, payload)`.
    ///
    /// # Errors
    ///
    /// Fails on an unknown version or type ID.
    pub fn unmarshal_typed<'a>(
        &self,
        bytes: &'a [u8],
    ) -> Result<(u16, &'static str, Unpacker<'a>), CodecError> {
        let mut unpacker = Unpacker::new(bytes);
        let version = unpacker.unpack_short()?;
        let type_id = unpacker.unpack_int()?;
        let name = self
            .codec(version)?
            .type_name(type_id)
            .ok_or(CodecError::UnknownTypeId(type_id))?;
        Ok((version, name, unpacker))
    }
}

/// Checks that an unpacker was fully consumed.
///
/// # Errors
///
/// Returns [`CodecError::TrailingBytes`] when input remains.
pub fn finish(unpacker: &Unpacker<'_>) -> Result<(), CodecError> {
    match unpacker.remaining() {
        0 => Ok(()),
        n => Err(CodecError::TrailingBytes(n)),
    }
}
