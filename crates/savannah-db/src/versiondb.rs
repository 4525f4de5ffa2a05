//! Copy-on-write transaction layer.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    BatchOp, Commitable, Database, Iteratee, KeyValueDeleter, KeyValueReader, KeyValueWriter,
    Result,
};

/// Buffers writes in memory; reads see the buffer first, then the
/// underlying database. `None` in the buffer marks a pending delete.
pub struct VersionDb {
    mem: Mutex<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    db: Arc<dyn Database>,
}

impl VersionDb {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            mem: Mutex::new(BTreeMap::new()),
            db,
        }
    }

    /// Number of buffered, uncommitted writes.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.mem.lock().len()
    }
}

impl KeyValueReader for VersionDb {
    fn has(&self, key: &[u8]) -> Result<bool> {
        if let Some(state) = self.mem.lock().get(key) {
            return Ok(state.is_some());
        }
        self.db.has(key)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(state) = self.mem.lock().get(key) {
            return Ok(state.clone());
        }
        self.db.get(key)
    }
}

impl KeyValueWriter for VersionDb {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.mem.lock().insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }
}

impl KeyValueDeleter for VersionDb {
    fn delete(&self, key: &[u8]) -> Result<()> {
        self.mem.lock().insert(key.to_vec(), None);
        Ok(())
    }
}

impl Iteratee for VersionDb {
    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.db.iter_prefix(prefix)?.into_iter().collect();
        let mem = self.mem.lock();
        for (k, v) in mem
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            match v {
                Some(v) => {
                    merged.insert(k.clone(), v.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}

impl Database for VersionDb {
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut mem = self.mem.lock();
        for op in ops {
            match op {
                BatchOp::Put(k, v) => mem.insert(k, Some(v)),
                BatchOp::Delete(k) => mem.insert(k, None),
            };
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.abort();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.db.is_closed()
    }
}

impl Commitable for VersionDb {
    fn commit(&self) -> Result<()> {
        let mut mem = self.mem.lock();
        if mem.is_empty() {
            return Ok(());
        }
        let ops = mem
            .iter()
            .map(|(k, v)| match v {
                Some(v) => BatchOp::Put(k.clone(), v.clone()),
                None => BatchOp::Delete(k.clone()),
            })
            .collect();
        // The buffer survives a failed write so the caller can retry.
        self.db.write_batch(ops)?;
        mem.clear();
        Ok(())
    }

    fn abort(&self) {
        self.mem.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DatabaseError, MemDb};

    #[test]
    fn test_reads_see_buffer_first() {
        let base = Arc::new(MemDb::new());
        base.put(b"k", b"old").unwrap();
        let db = VersionDb::new(base.clone());
        db.put(b"k", b"new").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"new".to_vec()));
        assert_eq!(base.get(b"k").unwrap(), Some(b"old".to_vec()));

        db.delete(b"k").unwrap();
        assert!(!db.has(b"k").unwrap());
        assert!(db.iter_prefix(b"").unwrap().is_empty());
    }

    #[test]
    fn test_commit_and_abort() {
        let base = Arc::new(MemDb::new());
        let db = VersionDb::new(base.clone());
        db.put(b"a", b"1").unwrap();
        db.commit().unwrap();
        assert_eq!(base.get(b"a").unwrap(), Some(b"1".to_vec()));

        db.put(b"b", b"2").unwrap();
        db.abort();
        assert_eq!(db.get(b"b").unwrap(), None);
        assert_eq!(db.pending(), 0);
    }

    #[test]
    fn test_failed_commit_keeps_buffer() {
        let base = Arc::new(MemDb::new());
        let db = VersionDb::new(base.clone());
        db.put(b"a", b"1").unwrap();
        base.close().unwrap();
        assert_eq!(db.commit(), Err(DatabaseError::Closed));
        assert_eq!(db.pending(), 1);
    }
}
