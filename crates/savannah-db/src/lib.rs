//! Key-value database adapters.
//!
//! The storage engine itself is pluggable; this crate provides the traits
//! consensus code is written against plus the wrappers it layers on top:
//!
//! - [`MemDb`]: in-memory store, used for tests and ephemeral chains
//! - [`PrefixDb`]: namespaces a shared database by key prefix
//! - [`VersionDb`]: buffers writes until [`Commitable::commit`] flushes them
//!   as one atomic batch
//!
//! ```
//! use savannah_db::{KeyValueReader, KeyValueWriter, MemDb};
//!
//! let db = MemDb::new();
//! db.put(b"key", b"value").unwrap();
//! assert_eq!(db.get(b"key").unwrap(), Some(b"value".to_vec()));
//! ```

mod error;
mod memdb;
mod prefixdb;
mod versiondb;

pub use error::{DatabaseError, Result};
pub use memdb::MemDb;
pub use prefixdb::PrefixDb;
pub use versiondb::VersionDb;

pub trait KeyValueReader: Send + Sync {
    fn has(&self, key: &[u8]) -> Result<bool>;

    /// Returns `Ok(None)` for a missing key.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Like [`KeyValueReader::get`], but a missing key is an error.
    fn get_required(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.get(key)?
            .ok_or_else(|| DatabaseError::NotFound(key.to_vec()))
    }
}

pub trait KeyValueWriter: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
}

pub trait KeyValueDeleter: Send + Sync {
    fn delete(&self, key: &[u8]) -> Result<()>;
}

/// Ordered scans.
pub trait Iteratee: Send + Sync {
    /// Returns every pair whose key starts with `prefix`, in key order.
    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// A single write inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// The full database interface.
pub trait Database: KeyValueReader + KeyValueWriter + KeyValueDeleter + Iteratee {
    /// Applies every op or none of them.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()>;

    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// A database that buffers writes until they are committed.
pub trait Commitable: Database {
    /// Flushes buffered writes to the underlying database atomically.
    fn commit(&self) -> Result<()>;

    /// Discards buffered writes.
    fn abort(&self);
}
