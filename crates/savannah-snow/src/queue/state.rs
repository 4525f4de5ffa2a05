//! On-disk layout of a job queue.

use std::sync::Arc;

use savannah_codec::{finish, Pack, Packer};
use savannah_db::{
    Database, Iteratee, KeyValueDeleter, KeyValueReader, KeyValueWriter, PrefixDb, VersionDb,
};
use savannah_ids::{Id, ID_LEN};

use super::{Job, Parser};
use crate::codec::{Codecs, CODEC_VERSION};
use crate::{ConsensusError, Result};

const RUNNABLE_PREFIX: &[u8] = b"runnable";
const JOBS_PREFIX: &[u8] = b"jobs";
const DEPENDENCIES_PREFIX: &[u8] = b"dependencies";
const MISSING_PREFIX: &[u8] = b"missing job IDs";
const METADATA_PREFIX: &[u8] = b"metadata";
const NUM_JOBS_KEY: &[u8] = b"numJobs";

struct JobBytes<'a>(&'a [u8]);

impl Pack for JobBytes<'_> {
    fn pack(&self, packer: &mut Packer) {
        packer.pack_bytes(self.0);
    }
}

fn id_from_key(key: &[u8]) -> Result<Id> {
    Id::from_slice(key).map_err(|e| {
        ConsensusError::Database(savannah_db::DatabaseError::Corruption(e.to_string()))
    })
}

/// Namespaced views of a queue's versioned database.
pub(super) struct State {
    db: Arc<VersionDb>,
    /// Jobs with no missing dependencies
    runnable: PrefixDb,
    /// Encoded records of every queued job
    jobs: PrefixDb,
    /// `dependency || job` for each job waiting on `dependency`
    dependencies: PrefixDb,
    /// IDs the bootstrapper still has to fetch
    missing: PrefixDb,
    metadata: PrefixDb,
    parser: Arc<dyn Parser>,
    codecs: Arc<Codecs>,
}

impl State {
    pub fn new(db: Arc<VersionDb>, parser: Arc<dyn Parser>, codecs: Arc<Codecs>) -> Self {
        let base: Arc<dyn Database> = db.clone();
        Self {
            runnable: PrefixDb::new(Arc::clone(&base), RUNNABLE_PREFIX),
            jobs: PrefixDb::new(Arc::clone(&base), JOBS_PREFIX),
            dependencies: PrefixDb::new(Arc::clone(&base), DEPENDENCIES_PREFIX),
            missing: PrefixDb::new(Arc::clone(&base), MISSING_PREFIX),
            metadata: PrefixDb::new(base, METADATA_PREFIX),
            db,
            parser,
            codecs,
        }
    }

    pub fn db(&self) -> &Arc<VersionDb> {
        &self.db
    }

    pub fn num_jobs(&self) -> Result<u64> {
        match self.metadata.get(NUM_JOBS_KEY)? {
            None => Ok(0),
            Some(bytes) => {
                let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    ConsensusError::Database(savannah_db::DatabaseError::Corruption(
                        "malformed job count".into(),
                    ))
                })?;
                Ok(u64::from_be_bytes(bytes))
            }
        }
    }

    pub fn set_num_jobs(&self, n: u64) -> Result<()> {
        self.metadata.put(NUM_JOBS_KEY, &n.to_be_bytes())?;
        Ok(())
    }

    pub fn has_job(&self, id: &Id) -> Result<bool> {
        Ok(self.jobs.has(id.as_bytes())?)
    }

    pub fn put_job(&self, job: &dyn Job) -> Result<()> {
        let bytes = job.bytes();
        let record = self.codecs.jobs().marshal_typed(
            CODEC_VERSION,
            self.parser.type_name(),
            &JobBytes(&bytes),
        )?;
        self.jobs.put(job.id().as_bytes(), &record)?;
        Ok(())
    }

    /// Loads a queued job, or `None` if it was removed.
    pub fn get_job(&self, id: &Id) -> Result<Option<Box<dyn Job>>> {
        let Some(record) = self.jobs.get(id.as_bytes())? else {
            return Ok(None);
        };
        let (_, type_name, mut unpacker) = self.codecs.jobs().unmarshal_typed(&record)?;
        if type_name != self.parser.type_name() {
            return Err(ConsensusError::UnknownJobType(type_name.to_string()));
        }
        let bytes = unpacker
            .unpack_bytes()
            .map_err(savannah_codec::CodecError::from)?;
        finish(&unpacker)?;
        self.parser.parse(&bytes).map(Some)
    }

    pub fn delete_job(&self, id: &Id) -> Result<()> {
        self.jobs.delete(id.as_bytes())?;
        Ok(())
    }

    pub fn add_runnable(&self, id: &Id) -> Result<()> {
        self.runnable.put(id.as_bytes(), &[])?;
        Ok(())
    }

    pub fn remove_runnable(&self, id: &Id) -> Result<()> {
        self.runnable.delete(id.as_bytes())?;
        Ok(())
    }

    /// The runnable job with the smallest ID.
    pub fn first_runnable(&self) -> Result<Option<Id>> {
        match self.runnable.iter_prefix(&[])?.into_iter().next() {
            Some((key, _)) => id_from_key(&key).map(Some),
            None => Ok(None),
        }
    }

    pub fn add_dependency(&self, dependency: &Id, job: &Id) -> Result<()> {
        self.dependencies.put(&dependency_key(dependency, job), &[])?;
        Ok(())
    }

    /// Jobs waiting on `dependency`.
    pub fn dependents(&self, dependency: &Id) -> Result<Vec<Id>> {
        self.dependencies
            .iter_prefix(dependency.as_bytes())?
            .into_iter()
            .map(|(key, _)| id_from_key(&key[ID_LEN..]))
            .collect()
    }

    pub fn remove_dependency(&self, dependency: &Id, job: &Id) -> Result<()> {
        self.dependencies.delete(&dependency_key(dependency, job))?;
        Ok(())
    }

    pub fn add_missing(&self, id: &Id) -> Result<()> {
        self.missing.put(id.as_bytes(), &[])?;
        Ok(())
    }

    pub fn remove_missing(&self, id: &Id) -> Result<()> {
        self.missing.delete(id.as_bytes())?;
        Ok(())
    }

    pub fn missing_ids(&self) -> Result<Vec<Id>> {
        self.missing
            .iter_prefix(&[])?
            .into_iter()
            .map(|(key, _)| id_from_key(&key))
            .collect()
    }

    /// Deletes every key of every namespace.
    pub fn clear(&self) -> Result<()> {
        for db in [
            &self.runnable,
            &self.jobs,
            &self.dependencies,
            &self.missing,
            &self.metadata,
        ] {
            for (key, _) in db.iter_prefix(&[])? {
                db.delete(&key)?;
            }
        }
        Ok(())
    }
}

fn dependency_key(dependency: &Id, job: &Id) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 * ID_LEN);
    key.extend_from_slice(dependency.as_bytes());
    key.extend_from_slice(job.as_bytes());
    key
}
