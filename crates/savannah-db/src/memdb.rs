//! In-memory database.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::{
    BatchOp, Database, DatabaseError, Iteratee, KeyValueDeleter, KeyValueReader, KeyValueWriter,
    Result,
};

/// A `BTreeMap` behind a read-write lock.
#[derive(Debug, Default)]
pub struct MemDb {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    closed: AtomicBool,
}

impl MemDb {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(DatabaseError::Closed)
        } else {
            Ok(())
        }
    }
}

impl KeyValueReader for MemDb {
    fn has(&self, key: &[u8]) -> Result<bool> {
        self.check_closed()?;
        Ok(self.data.read().contains_key(key))
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_closed()?;
        Ok(self.data.read().get(key).cloned())
    }
}

impl KeyValueWriter for MemDb {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_closed()?;
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

impl KeyValueDeleter for MemDb {
    fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_closed()?;
        self.data.write().remove(key);
        Ok(())
    }
}

impl Iteratee for MemDb {
    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_closed()?;
        Ok(self
            .data
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

impl Database for MemDb {
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        self.check_closed()?;
        let mut data = self.data.write();
        for op in ops {
            match op {
                BatchOp::Put(k, v) => {
                    data.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    data.remove(&k);
                }
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(DatabaseError::Closed);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
