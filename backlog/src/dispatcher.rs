use crate::events::{EventKind, EventSink, JobEvent};
use crate::worker_pool::{Completion, WorkerPool};
use crate::JobId;
use crate::JobRecord;
use crate::QueueError;
use crate::RetentionMode;
use crate::RetryPolicy;
use crate::SleepParams;
use crate::Store;
use chrono::Utc;
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{watch, Notify};
use typed_builder::TypedBuilder;

enum Wake {
    Shutdown,
    Completed(Completion),
    Signal,
    Tick,
}

/// Moves ready jobs from the store onto free worker slots and records
/// their outcomes. It is the only writer of `active`, `completed`,
/// `delayed`-after-failure and `failed` states.
#[derive(TypedBuilder)]
pub(crate) struct Dispatcher<P> {
    queue_name: String,
    store: Arc<Store<P>>,
    pool: WorkerPool<P>,
    completions: UnboundedReceiver<Completion>,
    retry_policy: RetryPolicy,
    retention_mode: RetentionMode,
    sleep_params: SleepParams,
    events: Arc<dyn EventSink>,
    wake: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
    /// a claimed job the pool refused
    #[builder(default, setter(skip))]
    unsubmitted: Option<JobRecord<P>>,
}

impl<P> Dispatcher<P>
where
    P: Send + Sync + 'static,
{
    pub(crate) async fn run(mut self) {
        debug!(
            "Dispatcher of queue {} started with {} slots",
            self.queue_name,
            self.pool.concurrency()
        );

        loop {
            if self.stopping() {
                break;
            }

            while let Ok(done) = self.completions.try_recv() {
                self.complete(done);
            }

            // backpressure: the store is not even looked at while all slots are busy
            if self.pool.has_free_slot() {
                match self.dispatch_next() {
                    Ok(true) => {
                        self.sleep_params.maybe_reset_sleep_period();
                        continue;
                    }
                    Ok(false) => {}
                    Err(error) => error!("Failed to dispatch a job {:?}", error),
                }
            }

            match self.idle().await {
                Wake::Shutdown => break,
                Wake::Completed(done) => self.complete(done),
                Wake::Signal => {}
                Wake::Tick => self.sleep_params.maybe_increase_sleep_period(),
            }
        }

        debug!(
            "Dispatcher of queue {} stopping, waiting for {} active jobs",
            self.queue_name,
            self.pool.busy()
        );

        if let Some(job) = self.unsubmitted.take() {
            error!(
                "Job {} was claimed but never started, it stays active",
                job.id
            );
        }

        while !self.pool.is_idle() {
            match self.completions.recv().await {
                Some(done) => self.complete(done),
                None => break,
            }
        }

        debug!("Dispatcher of queue {} stopped", self.queue_name);
    }

    fn stopping(&self) -> bool {
        // a dropped sender means the queue handle is gone
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    /// Returns `Ok(true)` if a job was handed to a slot.
    ///
    /// The job is claimed in the store before it is handed over, so a job that
    /// runs is always `active` and can not be removed while it runs.
    fn dispatch_next(&mut self) -> Result<bool, QueueError> {
        let job = match self.unsubmitted.take() {
            Some(job) => job,
            None => {
                let Some(job) = self.store.claim_next(Utc::now())? else {
                    return Ok(false);
                };

                debug!(
                    "Claimed job {} ({}) attempt {} on queue {}",
                    job.id, job.name, job.attempts, self.queue_name
                );

                self.emit(EventKind::Started, &job);
                job
            }
        };

        if let Err(error) = self.pool.submit(job.clone()) {
            // kept aside and handed over again on a later tick
            error!(
                "Worker pool refused job {} although a slot looked free: {:?}",
                job.id, error
            );

            self.unsubmitted = Some(job);

            return Ok(false);
        }

        Ok(true)
    }

    async fn idle(&mut self) -> Wake {
        let period = self.idle_period();

        tokio::select! {
            changed = self.shutdown.changed() => match changed {
                Ok(()) if !*self.shutdown.borrow() => Wake::Signal,
                _ => Wake::Shutdown,
            },
            done = self.completions.recv() => match done {
                Some(done) => Wake::Completed(done),
                None => Wake::Shutdown,
            },
            _ = self.wake.notified() => Wake::Signal,
            _ = tokio::time::sleep(period) => Wake::Tick,
        }
    }

    /// How long to sleep when nothing can be dispatched right now.
    fn idle_period(&self) -> Duration {
        let period = self.sleep_params.sleep_period;

        if !self.pool.has_free_slot() {
            return period;
        }

        match self.store.next_delayed_at() {
            Ok(Some(at)) => (at - Utc::now())
                .to_std()
                .map_or(Duration::ZERO, |until| until.min(period)),
            _ => period,
        }
    }

    fn complete(&mut self, done: Completion) {
        self.pool.release();

        let result = match done.outcome {
            Ok(()) => self.store.mark_completed(&done.id).map(|record| {
                self.emit(EventKind::Completed, &record);
                record
            }),
            Err(error) => self.fail(&done.id, error),
        };

        match result {
            Ok(record) => self.retain(&record),
            Err(error) => error!("Failed to record the outcome of job {} {:?}", done.id, error),
        }
    }

    fn fail(&self, id: &JobId, error: QueueError) -> Result<JobRecord<P>, QueueError> {
        let message = error.to_string();
        let attempts = self.store.get(id)?.attempts;

        if error.is_recoverable() && self.retry_policy.should_retry(attempts) {
            let until = self.retry_policy.retry_at(attempts, Utc::now());
            let record = self.store.mark_delayed(id, until, &message)?;

            warn!(
                "Job {} ({}) failed attempt {}, retrying at {}: {}",
                record.id, record.name, attempts, until, message
            );

            self.emit(EventKind::Retrying, &record);

            return Ok(record);
        }

        let record = self.store.mark_failed(id, &message)?;

        error!(
            "Job {} ({}) failed after {} attempts: {}",
            record.id, record.name, attempts, message
        );

        self.emit(EventKind::Failed, &record);

        Ok(record)
    }

    fn retain(&self, record: &JobRecord<P>) {
        if !self.retention_mode.should_remove(record.state) {
            return;
        }

        if let Err(error) = self.store.remove(&record.id) {
            error!("Failed to remove job {} {:?}", record.id, error);
        }
    }

    fn emit(&self, kind: EventKind, record: &JobRecord<P>) {
        self.events.emit(&JobEvent::new(kind, record));
    }
}
