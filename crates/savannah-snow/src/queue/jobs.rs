//! Job queues.

use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use savannah_db::{Commitable, Database, VersionDb};
use savannah_ids::Id;
use savannah_utils::timer::{estimate_eta, Timer};
use tracing::{debug, info, warn};

use super::state::State;
use super::{Job, Parser};
use crate::codec::Codecs;
use crate::common::Halter;
use crate::metrics::BootstrapMetrics;
use crate::{ConsensusError, Result};

/// How many executed jobs pass between progress log lines.
pub(crate) const STATUS_UPDATE_FREQUENCY: usize = 5000;

/// A persistent queue of jobs blocked on their dependencies.
pub struct Jobs {
    state: State,
    /// Queued jobs, mirrored from the metadata namespace
    num_jobs: u64,
}

impl Jobs {
    /// Opens the queue stored in `db`, picking up any jobs left by an earlier
    /// run.
    pub fn new(db: Arc<dyn Database>, parser: Arc<dyn Parser>, codecs: Arc<Codecs>) -> Result<Self> {
        let state = State::new(Arc::new(VersionDb::new(db)), parser, codecs);
        let num_jobs = state.num_jobs()?;
        Ok(Self { state, num_jobs })
    }

    pub fn num_jobs(&self) -> u64 {
        self.num_jobs
    }

    /// Whether a job with this ID is queued.
    pub fn has(&self, id: &Id) -> Result<bool> {
        self.state.has_job(id)
    }

    /// Queues `job`. Returns false if a job with its ID is already queued.
    pub fn push(&mut self, job: Box<dyn Job>) -> Result<bool> {
        let id = job.id();
        if self.state.has_job(&id)? {
            return Ok(false);
        }

        let deps = job.missing_dependencies()?;
        if deps.is_empty() {
            self.state.add_runnable(&id)?;
        } else {
            for dep in &deps {
                self.state.add_dependency(dep, &id)?;
            }
        }
        self.state.put_job(job.as_ref())?;
        self.num_jobs += 1;
        self.state.set_num_jobs(self.num_jobs)?;
        Ok(true)
    }

    /// Runs every job whose dependencies are accepted, in dependency order,
    /// until none is runnable or `halter` fires. Returns how many jobs ran.
    ///
    /// Each job's removal and the unblocking of its dependents are committed
    /// before the next job starts.
    pub fn execute_all(
        &mut self,
        halter: &Halter,
        restarted: bool,
        metrics: &BootstrapMetrics,
    ) -> Result<usize> {
        let timer = Timer::start();
        let total = self.num_jobs;
        let mut executed = 0usize;
        let mut next_log = STATUS_UPDATE_FREQUENCY;
        if restarted {
            debug!(num_jobs = total, "executing jobs");
        } else {
            info!(num_jobs = total, "executing jobs");
        }

        loop {
            if halter.halted() {
                info!(executed, "interrupted execution");
                return Ok(executed);
            }
            let Some(id) = self.state.first_runnable()? else {
                break;
            };
            self.state.remove_runnable(&id)?;
            let Some(job) = self.state.get_job(&id)? else {
                self.commit()?;
                continue;
            };
            self.remove_job(&id)?;

            match job.execute() {
                Ok(()) => {
                    executed += 1;
                    BootstrapMetrics::inc(&metrics.accepted);
                    self.unblock_dependents(&id)?;
                }
                Err(err @ ConsensusError::JobDropped { .. }) => {
                    warn!(job_id = %id, error = %err, "dropping job");
                    BootstrapMetrics::inc(&metrics.dropped);
                    self.drop_dependents(&id, metrics)?;
                }
                Err(err) => return Err(err),
            }
            self.commit()?;

            if executed >= next_log {
                next_log += STATUS_UPDATE_FREQUENCY;
                let eta = estimate_eta(timer.elapsed(), executed as u64, total);
                if restarted {
                    debug!(executed, num_jobs = total, ?eta, "executing jobs");
                } else {
                    info!(executed, num_jobs = total, ?eta, "executing jobs");
                }
            }
        }

        if restarted {
            debug!(executed, elapsed = ?timer.elapsed(), "executed jobs");
        } else {
            info!(executed, elapsed = ?timer.elapsed(), "executed jobs");
        }
        Ok(executed)
    }

    fn remove_job(&mut self, id: &Id) -> Result<()> {
        self.state.delete_job(id)?;
        self.num_jobs = self.num_jobs.saturating_sub(1);
        self.state.set_num_jobs(self.num_jobs)
    }

    fn unblock_dependents(&mut self, id: &Id) -> Result<()> {
        for dependent in self.state.dependents(id)? {
            self.state.remove_dependency(id, &dependent)?;
            let Some(job) = self.state.get_job(&dependent)? else {
                continue;
            };
            if !job.has_missing_dependencies()? {
                self.state.add_runnable(&dependent)?;
            }
        }
        Ok(())
    }

    /// Removes every job transitively waiting on the dropped job `id`.
    fn drop_dependents(&mut self, id: &Id, metrics: &BootstrapMetrics) -> Result<()> {
        let mut stack = vec![*id];
        while let Some(cur) = stack.pop() {
            for dependent in self.state.dependents(&cur)? {
                self.state.remove_dependency(&cur, &dependent)?;
                if !self.state.has_job(&dependent)? {
                    continue;
                }
                debug!(job_id = %dependent, dropped_dependency = %cur, "dropping dependent job");
                self.state.remove_runnable(&dependent)?;
                self.remove_job(&dependent)?;
                BootstrapMetrics::inc(&metrics.dropped);
                stack.push(dependent);
            }
        }
        Ok(())
    }

    /// Writes pending changes to the underlying database atomically.
    pub fn commit(&self) -> Result<()> {
        self.state.db().commit()?;
        Ok(())
    }

    /// Drops uncommitted changes.
    pub fn abort(&self) {
        self.state.db().abort();
    }

    /// Removes every job and committed record.
    pub fn clear(&mut self) -> Result<()> {
        self.state.clear()?;
        self.num_jobs = 0;
        self.commit()
    }
}

/// A [`Jobs`] queue that also tracks the IDs the bootstrapper still has to
/// fetch.
///
/// Changes to the missing set are buffered in memory and written by
/// [`JobsWithMissing::commit`], so after a crash the set is exactly the one
/// last committed.
pub struct JobsWithMissing {
    jobs: Jobs,
    missing: BTreeSet<Id>,
    add_to_missing: BTreeSet<Id>,
    remove_from_missing: BTreeSet<Id>,
}

impl JobsWithMissing {
    pub fn new(db: Arc<dyn Database>, parser: Arc<dyn Parser>, codecs: Arc<Codecs>) -> Result<Self> {
        let jobs = Jobs::new(db, parser, codecs)?;
        let missing = jobs.state.missing_ids()?.into_iter().collect();
        Ok(Self {
            jobs,
            missing,
            add_to_missing: BTreeSet::new(),
            remove_from_missing: BTreeSet::new(),
        })
    }

    pub fn add_missing_id(&mut self, id: Id) {
        if self.missing.insert(id) {
            self.add_to_missing.insert(id);
            self.remove_from_missing.remove(&id);
        }
    }

    pub fn remove_missing_id(&mut self, id: &Id) {
        if self.missing.remove(id) {
            self.remove_from_missing.insert(*id);
            self.add_to_missing.remove(id);
        }
    }

    pub fn missing_ids(&self) -> Vec<Id> {
        self.missing.iter().copied().collect()
    }

    pub fn num_missing_ids(&self) -> usize {
        self.missing.len()
    }

    pub fn has_missing_ids(&self) -> bool {
        !self.missing.is_empty()
    }

    /// Flushes the buffered missing-ID changes along with the queue's other
    /// pending writes.
    pub fn commit(&mut self) -> Result<()> {
        for id in &self.add_to_missing {
            self.jobs.state.add_missing(id)?;
        }
        for id in &self.remove_from_missing {
            self.jobs.state.remove_missing(id)?;
        }
        self.add_to_missing.clear();
        self.remove_from_missing.clear();
        self.jobs.commit()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.missing.clear();
        self.add_to_missing.clear();
        self.remove_from_missing.clear();
        self.jobs.clear()
    }
}

impl Deref for JobsWithMissing {
    type Target = Jobs;

    fn deref(&self) -> &Jobs {
        &self.jobs
    }
}

impl DerefMut for JobsWithMissing {
    fn deref_mut(&mut self) -> &mut Jobs {
        &mut self.jobs
    }
}
