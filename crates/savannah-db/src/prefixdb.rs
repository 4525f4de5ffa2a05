//! Key-prefix namespacing.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::{
    BatchOp, Database, Iteratee, KeyValueDeleter, KeyValueReader, KeyValueWriter, Result,
};

/// Prepends a fixed prefix to every key of an underlying database.
pub struct PrefixDb {
    prefix: Vec<u8>,
    db: Arc<dyn Database>,
}

impl PrefixDb {
    /// Uses `sha256(prefix)` as the key prefix, so no namespace can be a
    /// prefix of another.
    pub fn new(db: Arc<dyn Database>, prefix: &[u8]) -> Self {
        Self::new_raw(db, Sha256::digest(prefix).to_vec())
    }

    /// Uses `prefix` verbatim.
    pub fn new_raw(db: Arc<dyn Database>, prefix: Vec<u8>) -> Self {
        Self { prefix, db }
    }

    #[must_use]
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn key(&self, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.prefix.len() + key.len());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(key);
        out
    }
}

impl KeyValueReader for PrefixDb {
    fn has(&self, key: &[u8]) -> Result<bool> {
        self.db.has(&self.key(key))
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db.get(&self.key(key))
    }
}

impl KeyValueWriter for PrefixDb {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put(&self.key(key), value)
    }
}

impl KeyValueDeleter for PrefixDb {
    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.delete(&self.key(key))
    }
}

impl Iteratee for PrefixDb {
    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let strip = self.prefix.len();
        Ok(self
            .db
            .iter_prefix(&self.key(prefix))?
            .into_iter()
            .map(|(k, v)| (k[strip..].to_vec(), v))
            .collect())
    }
}

impl Database for PrefixDb {
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let ops = ops
            .into_iter()
            .map(|op| match op {
                BatchOp::Put(k, v) => BatchOp::Put(self.key(&k), v),
                BatchOp::Delete(k) => BatchOp::Delete(self.key(&k)),
            })
            .collect();
        self.db.write_batch(ops)
    }

    /// Closing a namespace leaves the shared database open.
    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.db.is_closed()
    }
}
