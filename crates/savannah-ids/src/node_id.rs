//! Peer and validator identifier.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::cb58::{decode_cb58, encode_cb58};
use crate::{IdError, NODE_ID_LEN};

/// Prefix of a node ID's text form.
pub const NODE_ID_PREFIX: &str = "NodeID-";

/// A 20-byte node identifier, displayed as `NodeID-<cb58>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub const EMPTY: Self = Self([0u8; NODE_ID_LEN]);

    #[must_use]
    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// # Errors
    ///
    /// Returns [`IdError::InvalidLength`] unless `bytes` is exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdError> {
        let arr: [u8; NODE_ID_LEN] = bytes.try_into().map_err(|_| IdError::InvalidLength {
            expected: NODE_ID_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; NODE_ID_LEN]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{NODE_ID_PREFIX}{}", encode_cb58(&self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl FromStr for NodeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix(NODE_ID_PREFIX)
            .ok_or(IdError::MissingPrefix(NODE_ID_PREFIX))?;
        Self::from_slice(&decode_cb58(body)?)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for NodeId {
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
