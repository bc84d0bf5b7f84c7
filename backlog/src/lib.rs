#![doc = include_str!("../README.md")]

use chrono::{DateTime, Utc};
use serde_derive::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use typed_builder::TypedBuilder;
use uuid::Uuid;

pub mod config;
mod dispatcher;
pub mod error;
pub mod events;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod store;
mod worker_pool;

pub use config::QueueConfig;
pub use error::QueueError;
pub use events::{ChannelSink, EventKind, EventSink, JobEvent, LogSink};
pub use processor::{JobContext, Processor, Registry, TaggedPayload};
pub use queue::{EnqueueOptions, Queue, QueueBuilder};
pub use retry::RetryPolicy;
pub use store::{JobCounts, Store};

#[doc(hidden)]
pub use async_trait::async_trait;

#[doc(hidden)]
pub extern crate chrono;

#[cfg(feature = "derive-error")]
pub use backlog_derive_error::ToJobError;

/// Opaque, never reused identifier of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// A fresh random id.
    pub fn generate() -> Self {
        JobId(Uuid::new_v4().to_string())
    }

    /// Deterministic id for a unique job: the hex SHA-256 of its name and key.
    pub fn from_unique_key(name: &str, key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(key.as_bytes());
        JobId(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        JobId(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        JobId(id.to_string())
    }
}

/// Possible states of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// The job is waiting for a free worker slot
    Pending,
    /// The job may not run before its `available_at`.
    ///
    /// Either it was enqueued with a delay or it failed and waits for a retry
    Delayed,
    /// A worker slot is executing the job
    Active,
    /// The job finished successfully
    Completed,
    /// The job failed and no attempts are left
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, next),
            (Pending, Active)
                | (Delayed, Active)
                | (Active, Completed)
                | (Active, Delayed)
                | (Active, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work together with its lifecycle state.
///
/// Records handed out by the [`Store`] are snapshots. The payload is shared
/// behind an `Arc` so snapshots stay cheap.
#[derive(Debug, TypedBuilder)]
pub struct JobRecord<P> {
    #[builder(setter(into))]
    pub id: JobId,
    #[builder(setter(into))]
    pub name: String,
    #[builder(setter(into))]
    pub payload: Arc<P>,
    #[builder(default = JobState::Pending)]
    pub state: JobState,
    #[builder(default = 0)]
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
    #[builder(default, setter(into))]
    pub last_error: Option<String>,
    /// Set when the id was derived from a unique key, see [`JobId::from_unique_key`]
    #[builder(default, setter(into))]
    pub unique_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<P> Clone for JobRecord<P> {
    fn clone(&self) -> Self {
        JobRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            payload: Arc::clone(&self.payload),
            state: self.state,
            attempts: self.attempts,
            available_at: self.available_at,
            last_error: self.last_error.clone(),
            unique_key: self.unique_key.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// An error returned by a processor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{description}")]
pub struct JobError {
    /// A description of an error
    pub description: String,
}

impl JobError {
    pub fn new(description: impl Into<String>) -> Self {
        JobError {
            description: description.into(),
        }
    }
}

/// All possible options for retaining jobs in the store after they reach a terminal state.
///
/// The default mode is [`RetentionMode::KeepAll`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RetentionMode {
    /// Keep all jobs
    #[default]
    KeepAll,
    /// Remove completed and failed jobs
    RemoveAll,
    /// Remove only successfully completed jobs
    RemoveFinished,
}

impl RetentionMode {
    pub(crate) fn should_remove(&self, state: JobState) -> bool {
        match self {
            RetentionMode::KeepAll => false,
            RetentionMode::RemoveAll => state.is_terminal(),
            RetentionMode::RemoveFinished => state == JobState::Completed,
        }
    }
}

/// Configuration parameters for the dispatcher's idle tick
/// while it doesn't have any jobs to dispatch
#[derive(Clone, Debug, TypedBuilder)]
pub struct SleepParams {
    /// the current sleep period
    pub sleep_period: Duration,
    /// the maximum period the dispatcher is allowed to sleep.
    /// After this value is reached, `sleep_period` is not increased anymore
    pub max_sleep_period: Duration,
    /// the initial value of the `sleep_period`
    pub min_sleep_period: Duration,
    /// the step that `sleep_period` is increased by on every idle iteration
    pub sleep_step: Duration,
}

impl SleepParams {
    /// Reset the `sleep_period` if `sleep_period` > `min_sleep_period`
    pub fn maybe_reset_sleep_period(&mut self) {
        if self.sleep_period != self.min_sleep_period {
            self.sleep_period = self.min_sleep_period;
        }
    }

    /// Increase the `sleep_period` by the `sleep_step` if the `max_sleep_period` is not reached
    pub fn maybe_increase_sleep_period(&mut self) {
        if self.sleep_period < self.max_sleep_period {
            self.sleep_period = (self.sleep_period + self.sleep_step).min(self.max_sleep_period);
        }
    }
}

impl Default for SleepParams {
    fn default() -> Self {
        SleepParams {
            sleep_period: Duration::from_millis(100),
            max_sleep_period: Duration::from_secs(1),
            min_sleep_period: Duration::from_millis(100),
            sleep_step: Duration::from_millis(100),
        }
    }
}
