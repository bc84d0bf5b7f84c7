#[cfg(test)]
mod queue_tests;

use crate::dispatcher::Dispatcher;
use crate::events::{EventKind, EventSink, JobEvent, LogSink};
use crate::processor::{Processor, Registry, TaggedPayload};
use crate::worker_pool::WorkerPool;
use crate::JobCounts;
use crate::JobId;
use crate::JobRecord;
use crate::JobState;
use crate::QueueConfig;
use crate::QueueError;
use crate::Store;
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use typed_builder::TypedBuilder;

/// Per-job options accepted by [`Queue::enqueue_with`].
#[derive(Clone, Debug, Default, TypedBuilder)]
pub struct EnqueueOptions {
    /// The job may not run before this instant
    #[builder(default, setter(strip_option))]
    pub delay_until: Option<DateTime<Utc>>,
    /// The job may not run before `now + delay`
    #[builder(default, setter(strip_option))]
    pub delay: Option<Duration>,
    /// Derive the job id from this key, so the same name and key can only be enqueued once
    #[builder(default, setter(strip_option, into))]
    pub unique_key: Option<String>,
}

impl EnqueueOptions {
    fn available_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let after_delay = self
            .delay
            .and_then(|delay| chrono::Duration::from_std(delay).ok())
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(now);

        match self.delay_until {
            Some(until) => until.max(after_delay),
            None => after_delay,
        }
    }
}

enum Lifecycle {
    Idle,
    Running {
        shutdown: watch::Sender<bool>,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// Builds a [`Queue`]. Processors can only be registered here.
pub struct QueueBuilder<P> {
    name: String,
    config: QueueConfig,
    processors: Registry<P>,
    events: Arc<dyn EventSink>,
    error: Option<QueueError>,
}

impl<P> QueueBuilder<P>
where
    P: Send + Sync + 'static,
{
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers the processor for jobs named `name`. One processor per name.
    pub fn register<R>(mut self, name: impl Into<String>, processor: R) -> Self
    where
        R: Processor<P> + 'static,
    {
        if let Err(error) = self.processors.register(name, Arc::new(processor)) {
            self.error.get_or_insert(error);
        }

        self
    }

    pub fn event_sink<S>(mut self, sink: S) -> Self
    where
        S: EventSink + 'static,
    {
        self.events = Arc::new(sink);
        self
    }

    pub fn build(self) -> Result<Queue<P>, QueueError> {
        if let Some(error) = self.error {
            return Err(error);
        }

        self.config.validate()?;

        Ok(Queue {
            name: self.name,
            store: Arc::new(Store::new()),
            processors: Arc::new(self.processors),
            config: self.config,
            events: self.events,
            wake: Arc::new(Notify::new()),
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }
}

/// A queue of jobs with payload `P`, processed by a bounded pool of workers.
///
///    ```rust
///         let queue = Queue::builder("mailer")
///             .config(QueueConfig::builder().concurrency(4_usize).build())
///             .register("welcome", SendWelcome)
///             .build()?;
///
///         queue.start()?;
///         let id = queue.enqueue("welcome", email)?;
///     ```
///
pub struct Queue<P> {
    name: String,
    store: Arc<Store<P>>,
    processors: Arc<Registry<P>>,
    config: QueueConfig,
    events: Arc<dyn EventSink>,
    wake: Arc<Notify>,
    lifecycle: Mutex<Lifecycle>,
}

impl<P> Queue<P>
where
    P: Send + Sync + 'static,
{
    pub fn builder(name: impl Into<String>) -> QueueBuilder<P> {
        QueueBuilder {
            name: name.into(),
            config: QueueConfig::default(),
            processors: Registry::default(),
            events: Arc::new(LogSink::plain()),
            error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue a job that is available right away.
    pub fn enqueue(&self, name: &str, payload: P) -> Result<JobId, QueueError> {
        self.enqueue_with(name, payload, EnqueueOptions::default())
    }

    pub fn enqueue_with(
        &self,
        name: &str,
        payload: P,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        if !self.processors.contains(name) {
            return Err(QueueError::UnknownJobName(name.to_string()));
        }

        let now = Utc::now();
        let available_at = options.available_at(now);
        let state = if available_at > now {
            JobState::Delayed
        } else {
            JobState::Pending
        };

        let id = match &options.unique_key {
            Some(key) => JobId::from_unique_key(name, key),
            None => JobId::generate(),
        };

        let record = JobRecord::builder()
            .id(id.clone())
            .name(name)
            .payload(Arc::new(payload))
            .state(state)
            .available_at(available_at)
            .unique_key(options.unique_key)
            .created_at(now)
            .updated_at(now)
            .build();

        let event = JobEvent::new(EventKind::Enqueued, &record);

        self.store.insert(record)?;

        debug!("Enqueued job {} ({}) on queue {} as {}", id, name, self.name, state);

        self.events.emit(&event);
        self.wake.notify_one();

        Ok(id)
    }

    /// Enqueue a payload under the job name it reports.
    pub fn enqueue_tagged(&self, payload: P, options: EnqueueOptions) -> Result<JobId, QueueError>
    where
        P: TaggedPayload,
    {
        let name = payload.job_name().to_string();

        self.enqueue_with(&name, payload, options)
    }

    /// Starts dispatching jobs. Calling it on a running queue does nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), QueueError> {
        let mut lifecycle = self
            .lifecycle
            .lock()
            .map_err(|_| QueueError::SharedStatePoisoned)?;

        match *lifecycle {
            Lifecycle::Running { .. } => return Ok(()),
            Lifecycle::Stopped => return Err(QueueError::ShutDown),
            Lifecycle::Idle => {}
        }

        let (completions_sender, completions) = mpsc::unbounded_channel();
        let (shutdown, shutdown_receiver) = watch::channel(false);

        let pool = WorkerPool::new(
            self.config.concurrency,
            Arc::clone(&self.processors),
            self.config.job_timeout,
            completions_sender,
        );

        let dispatcher = Dispatcher::builder()
            .queue_name(self.name.clone())
            .store(Arc::clone(&self.store))
            .pool(pool)
            .completions(completions)
            .retry_policy(self.config.retry_policy.clone())
            .retention_mode(self.config.retention_mode.clone())
            .sleep_params(self.config.sleep_params.clone())
            .events(Arc::clone(&self.events))
            .wake(Arc::clone(&self.wake))
            .shutdown(shutdown_receiver)
            .build();

        let handle = tokio::spawn(dispatcher.run());

        info!(
            "Queue {} started with concurrency {}",
            self.name, self.config.concurrency
        );

        *lifecycle = Lifecycle::Running { shutdown, handle };

        Ok(())
    }

    /// Stops dispatching new jobs.
    ///
    /// With `graceful` it waits until the active jobs have finished and their
    /// outcome is recorded. Otherwise it returns right away and the active
    /// jobs finish in the background, still updating the store.
    pub async fn stop(&self, graceful: bool) -> Result<(), QueueError> {
        let previous = {
            let mut lifecycle = self
                .lifecycle
                .lock()
                .map_err(|_| QueueError::SharedStatePoisoned)?;

            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        };

        let Lifecycle::Running { shutdown, handle } = previous else {
            return Ok(());
        };

        // the dispatcher may already be gone, that is fine
        let _ = shutdown.send(true);

        info!("Queue {} stopping, graceful: {}", self.name, graceful);

        if graceful {
            if let Err(join_error) = handle.await {
                error!("Dispatcher of queue {} crashed {:?}", self.name, join_error);
            }
        }

        Ok(())
    }

    /// Whether the queue was started, not stopped, and its dispatcher is still alive.
    pub fn is_running(&self) -> bool {
        matches!(
            self.lifecycle.lock().as_deref(),
            Ok(Lifecycle::Running { handle, .. }) if !handle.is_finished()
        )
    }

    /// Retrieve a job by its `id`.
    pub fn job(&self, id: &JobId) -> Result<JobRecord<P>, QueueError> {
        self.store.get(id)
    }

    /// Remove a job that is not active.
    pub fn remove(&self, id: &JobId) -> Result<JobRecord<P>, QueueError> {
        self.store.remove(id)
    }

    pub fn counts(&self) -> Result<JobCounts, QueueError> {
        self.store.counts()
    }
}
