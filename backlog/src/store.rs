//! The single source of truth for every job of a queue.
//!
//! All operations take one mutex around the internal maps and never hold it
//! across an `.await`, so no torn record is ever observable.

use crate::JobId;
use crate::JobRecord;
use crate::JobState;
use crate::QueueError;
use chrono::{DateTime, Utc};
use serde_derive::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// Number of stored jobs in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn total(&self) -> usize {
        self.pending + self.delayed + self.active + self.completed + self.failed
    }
}

struct Entry<P> {
    /// insertion order, kept across retries
    seq: u64,
    record: JobRecord<P>,
}

struct Inner<P> {
    jobs: HashMap<JobId, Entry<P>>,
    /// pending jobs and delayed jobs whose time has come, by insertion order
    ready: BTreeMap<u64, JobId>,
    /// delayed jobs that are not yet eligible
    delayed: BTreeMap<(DateTime<Utc>, u64), JobId>,
    /// ids of removed unique jobs, so the same name and key can not be enqueued again.
    /// Random ids never collide and are not kept
    retired: HashSet<JobId>,
    next_seq: u64,
}

/// In-memory job store.
pub struct Store<P> {
    inner: Mutex<Inner<P>>,
}

impl<P> Default for Store<P> {
    fn default() -> Self {
        Store::new()
    }
}

impl<P> Store<P> {
    pub fn new() -> Self {
        Store {
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                ready: BTreeMap::new(),
                delayed: BTreeMap::new(),
                retired: HashSet::new(),
                next_seq: 0,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner<P>>, QueueError> {
        self.inner
            .lock()
            .map_err(|_| QueueError::SharedStatePoisoned)
    }

    /// Adds a new `pending` or `delayed` record.
    pub fn insert(&self, record: JobRecord<P>) -> Result<(), QueueError> {
        let mut inner = self.lock()?;

        if inner.jobs.contains_key(&record.id) || inner.retired.contains(&record.id) {
            return Err(QueueError::DuplicateId(record.id));
        }

        let seq = inner.next_seq;

        match record.state {
            JobState::Pending => {
                inner.ready.insert(seq, record.id.clone());
            }
            JobState::Delayed => {
                inner
                    .delayed
                    .insert((record.available_at, seq), record.id.clone());
            }
            state => {
                return Err(QueueError::InvalidInitialState {
                    id: record.id,
                    state,
                })
            }
        }

        inner.next_seq += 1;
        inner.jobs.insert(record.id.clone(), Entry { seq, record });

        Ok(())
    }

    /// The earliest inserted job that may be dispatched at `now`, if any.
    ///
    /// The job is not claimed; call [`Store::mark_active`] to claim it.
    pub fn next_ready(&self, now: DateTime<Utc>) -> Result<Option<JobRecord<P>>, QueueError> {
        let mut inner = self.lock()?;

        inner.promote_delayed(now);

        let next = inner
            .ready
            .values()
            .next()
            .and_then(|id| inner.jobs.get(id))
            .map(|entry| entry.record.clone());

        Ok(next)
    }

    pub fn mark_active(&self, id: &JobId) -> Result<JobRecord<P>, QueueError> {
        self.lock()?.activate(id)
    }

    /// Takes the job [`Store::next_ready`] would return and marks it active,
    /// under a single lock, so nothing can remove it in between.
    pub fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<JobRecord<P>>, QueueError> {
        let mut inner = self.lock()?;

        inner.promote_delayed(now);

        let Some(id) = inner.ready.values().next().cloned() else {
            return Ok(None);
        };

        inner.activate(&id).map(Some)
    }

    pub fn mark_completed(&self, id: &JobId) -> Result<JobRecord<P>, QueueError> {
        let mut inner = self.lock()?;
        inner.check_transition(id, JobState::Completed)?;

        inner.update(id, |record| {
            record.state = JobState::Completed;
        })
    }

    pub fn mark_failed(&self, id: &JobId, error: &str) -> Result<JobRecord<P>, QueueError> {
        let mut inner = self.lock()?;
        inner.check_transition(id, JobState::Failed)?;

        inner.update(id, |record| {
            record.state = JobState::Failed;
            record.last_error = Some(error.to_string());
        })
    }

    pub fn mark_delayed(
        &self,
        id: &JobId,
        until: DateTime<Utc>,
        error: &str,
    ) -> Result<JobRecord<P>, QueueError> {
        let mut inner = self.lock()?;
        let (seq, _) = inner.check_transition(id, JobState::Delayed)?;

        inner.delayed.insert((until, seq), id.clone());

        inner.update(id, |record| {
            record.state = JobState::Delayed;
            record.available_at = until;
            record.last_error = Some(error.to_string());
        })
    }

    /// Retrieve a job by its `id`.
    pub fn get(&self, id: &JobId) -> Result<JobRecord<P>, QueueError> {
        let inner = self.lock()?;

        inner
            .jobs
            .get(id)
            .map(|entry| entry.record.clone())
            .ok_or_else(|| QueueError::NotFound(id.clone()))
    }

    /// Remove a job that is not active. The id of a unique job stays reserved.
    pub fn remove(&self, id: &JobId) -> Result<JobRecord<P>, QueueError> {
        let mut inner = self.lock()?;

        let entry = inner
            .jobs
            .get(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;

        if entry.record.state == JobState::Active {
            return Err(QueueError::JobActive(id.clone()));
        }

        let seq = entry.seq;
        let available_at = entry.record.available_at;
        let unique = entry.record.unique_key.is_some();

        inner.ready.remove(&seq);
        inner.delayed.remove(&(available_at, seq));

        if unique {
            inner.retired.insert(id.clone());
        }

        inner
            .jobs
            .remove(id)
            .map(|entry| entry.record)
            .ok_or_else(|| QueueError::NotFound(id.clone()))
    }

    /// The earliest `available_at` among delayed jobs that are not yet eligible.
    pub fn next_delayed_at(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
        let inner = self.lock()?;

        Ok(inner.delayed.keys().next().map(|(at, _)| *at))
    }

    pub fn counts(&self) -> Result<JobCounts, QueueError> {
        let inner = self.lock()?;
        let mut counts = JobCounts::default();

        for entry in inner.jobs.values() {
            match entry.record.state {
                JobState::Pending => counts.pending += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }

        Ok(counts)
    }

    pub fn len(&self) -> Result<usize, QueueError> {
        Ok(self.lock()?.jobs.len())
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }
}

impl<P> Inner<P> {
    fn promote_delayed(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }

            let ((_, seq), id) = entry.remove_entry();
            self.ready.insert(seq, id);
        }
    }

    fn activate(&mut self, id: &JobId) -> Result<JobRecord<P>, QueueError> {
        let (seq, available_at) = self.check_transition(id, JobState::Active)?;

        self.ready.remove(&seq);
        self.delayed.remove(&(available_at, seq));

        self.update(id, |record| {
            record.state = JobState::Active;
            record.attempts += 1;
        })
    }

    /// Returns the sequence number and `available_at` of the job if moving it to `to` is legal.
    fn check_transition(
        &self,
        id: &JobId,
        to: JobState,
    ) -> Result<(u64, DateTime<Utc>), QueueError> {
        let entry = self
            .jobs
            .get(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;

        let from = entry.record.state;

        if !from.can_transition_to(to) {
            return Err(QueueError::InvalidTransition {
                id: id.clone(),
                from,
                to,
            });
        }

        Ok((entry.seq, entry.record.available_at))
    }

    fn update<F>(&mut self, id: &JobId, change: F) -> Result<JobRecord<P>, QueueError>
    where
        F: FnOnce(&mut JobRecord<P>),
    {
        let entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;

        change(&mut entry.record);
        entry.record.updated_at = Utc::now();

        Ok(entry.record.clone())
    }
}
