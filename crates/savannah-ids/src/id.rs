//! 32-byte identifier.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::cb58::{decode_cb58, encode_cb58};
use crate::{IdError, ID_LEN};

/// A 32-byte identifier, normally the SHA-256 hash of the thing it names.
///
/// ```
/// use savannah_ids::Id;
///
/// let id = Id::from_hash(b"genesis");
/// let parsed: Id = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Id([u8; ID_LEN]);

impl Id {
    /// The all-zero ID.
    pub const EMPTY: Self = Self([0u8; ID_LEN]);

    #[must_use]
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// # Errors
    ///
    /// Returns [`IdError::InvalidLength`] unless `bytes` is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdError> {
        let arr: [u8; ID_LEN] = bytes.try_into().map_err(|_| IdError::InvalidLength {
            expected: ID_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// Hashes `bytes` with SHA-256.
    #[must_use]
    pub fn from_hash(bytes: &[u8]) -> Self {
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(&Sha256::digest(bytes));
        Self(out)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; ID_LEN]
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Derives a new ID by hashing `prefixes` (big-endian) followed by this ID.
    #[must_use]
    pub fn prefix(&self, prefixes: &[u64]) -> Self {
        let mut buf = Vec::with_capacity(prefixes.len() * 8 + ID_LEN);
        for p in prefixes {
            buf.extend_from_slice(&p.to_be_bytes());
        }
        buf.extend_from_slice(&self.0);
        Self::from_hash(&buf)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_cb58(&self.0))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_slice(&decode_cb58(s)?)
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; ID_LEN]> for Id {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            let bytes = <Vec<u8>>::deserialize(deserializer)?;
            Self::from_slice(&bytes).map_err(serde::de::Error::custom)
        }
    }
}
