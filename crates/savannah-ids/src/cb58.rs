//! CB58: Base58 with a trailing 4-byte SHA-256 checksum.

use sha2::{Digest, Sha256};
use thiserror::Error;

const CHECKSUM_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Cb58Error {
    #[error("base58 decoding error: {0}")]
    Base58(String),

    #[error("input is shorter than the checksum")]
    MissingChecksum,

    #[error("invalid checksum")]
    BadChecksum,
}

fn checksum(bytes: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::digest(bytes);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[digest.len() - CHECKSUM_LEN..]);
    out
}

/// Encodes `bytes` as CB58.
#[must_use]
pub fn encode_cb58(bytes: &[u8]) -> String {
    let mut checked = Vec::with_capacity(bytes.len() + CHECKSUM_LEN);
    checked.extend_from_slice(bytes);
    checked.extend_from_slice(&checksum(bytes));
    bs58::encode(checked).into_string()
}

/// Decodes a CB58 string, verifying its checksum.
///
/// # Errors
///
/// Fails when the input is not Base58, is too short, or the checksum does
/// not match.
pub fn decode_cb58(s: &str) -> Result<Vec<u8>, Cb58Error> {
    let mut decoded = bs58::decode(s)
        .into_vec()
        .map_err(|e| Cb58Error::Base58(e.to_string()))?;
    if decoded.len() < CHECKSUM_LEN {
        return Err(Cb58Error::MissingChecksum);
    }
    let provided = decoded.split_off(decoded.len() - CHECKSUM_LEN);
    if provided[..] != checksum(&decoded)[..] {
        return Err(Cb58Error::BadChecksum);
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let data = vec![0, 1, 2, 3, 250];
        assert_eq!(decode_cb58(&encode_cb58(&data)).unwrap(), data);
    }

    #[test]
    fn test_bad_checksum() {
        let mut encoded = bs58::decode(encode_cb58(b"abc")).into_vec().unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        let tampered = bs58::encode(encoded).into_string();
        assert_eq!(decode_cb58(&tampered), Err(Cb58Error::BadChecksum));
    }

    #[test]
    fn test_too_short() {
        let short = bs58::encode([1u8, 2]).into_string();
        assert_eq!(decode_cb58(&short), Err(Cb58Error::MissingChecksum));
    }
}
