//! Identifier types shared by every savannah crate.
//!
//! - [`Id`]: a 32-byte SHA-256 content hash identifying blocks, vertices,
//!   transactions, chains, and subnets.
//! - [`NodeId`]: a 20-byte identifier for a peer or validator.
//!
//! Both render as CB58 (Base58 with a 4-byte SHA-256 checksum); node IDs
//! carry a `NodeID-` prefix.

mod cb58;
mod id;
mod node_id;

pub use cb58::{decode_cb58, encode_cb58, Cb58Error};
pub use id::Id;
pub use node_id::{NodeId, NODE_ID_PREFIX};

use thiserror::Error;

/// Length of an [`Id`] in bytes.
pub const ID_LEN: usize = 32;

/// Length of a [`NodeId`] in bytes.
pub const NODE_ID_LEN: usize = 20;

/// Errors produced while parsing identifiers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("cb58 decoding failed: {0}")]
    Cb58(#[from] Cb58Error),

    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("missing {0} prefix")]
    MissingPrefix(&'static str),
}
