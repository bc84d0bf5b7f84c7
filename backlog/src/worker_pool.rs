use crate::processor::{JobContext, Processor, Registry};
use crate::JobError;
use crate::JobId;
use crate::JobRecord;
use crate::QueueError;
use log::{error, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;

/// The outcome of one attempt, sent by a slot back to the dispatcher.
#[derive(Debug)]
pub(crate) struct Completion {
    pub id: JobId,
    pub outcome: Result<(), QueueError>,
}

/// A fixed number of execution slots.
///
/// The pool only counts busy slots. A slot stays busy until the dispatcher
/// has received its [`Completion`] and calls [`WorkerPool::release`], so a
/// slot is never reused before the store knows the job's outcome.
pub(crate) struct WorkerPool<P> {
    concurrency: usize,
    busy: usize,
    processors: Arc<Registry<P>>,
    job_timeout: Option<Duration>,
    completions: UnboundedSender<Completion>,
}

impl<P> WorkerPool<P>
where
    P: Send + Sync + 'static,
{
    pub fn new(
        concurrency: usize,
        processors: Arc<Registry<P>>,
        job_timeout: Option<Duration>,
        completions: UnboundedSender<Completion>,
    ) -> Self {
        WorkerPool {
            concurrency,
            busy: 0,
            processors,
            job_timeout,
            completions,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn busy(&self) -> usize {
        self.busy
    }

    pub fn has_free_slot(&self) -> bool {
        self.busy < self.concurrency
    }

    pub fn is_idle(&self) -> bool {
        self.busy == 0
    }

    /// Starts an already claimed `job` on a free slot. `job.attempts` counts the attempt being made.
    pub fn submit(&mut self, job: JobRecord<P>) -> Result<(), QueueError> {
        if !self.has_free_slot() {
            return Err(QueueError::PoolSaturated {
                concurrency: self.concurrency,
            });
        }

        self.busy += 1;

        let processor = self.processors.get(&job.name);
        let job_timeout = self.job_timeout;
        let completions = self.completions.clone();

        tokio::spawn(async move {
            let id = job.id.clone();
            let outcome = match processor {
                Some(processor) => Self::execute(processor, job, job_timeout).await,
                None => Err(QueueError::UnknownJobName(job.name)),
            };

            if completions.send(Completion { id, outcome }).is_err() {
                error!("Dispatcher is gone, the outcome of a job is lost");
            }
        });

        Ok(())
    }

    /// Frees the slot of a job whose completion has been handled.
    pub fn release(&mut self) {
        if self.busy == 0 {
            error!("Released a slot while none was busy");
            return;
        }

        self.busy -= 1;
    }

    async fn execute(
        processor: Arc<dyn Processor<P>>,
        job: JobRecord<P>,
        job_timeout: Option<Duration>,
    ) -> Result<(), QueueError> {
        let (cancel, cancel_receiver) = watch::channel(false);
        let ctx = JobContext::new(job.id.clone(), job.name.clone(), job.attempts, cancel_receiver);
        let payload = Arc::clone(&job.payload);

        // the processor runs in its own task so a timed out job can keep
        // unwinding after its slot is reclaimed, and a panic stays contained
        let mut handle = tokio::spawn(async move { processor.run(&payload, &ctx).await });

        let joined = match job_timeout {
            None => handle.await,
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        "Job {} ({}) timed out after {:?}, requesting cancellation",
                        job.id, job.name, limit
                    );

                    let _ = cancel.send(true);

                    return Err(QueueError::Timeout(limit));
                }
            },
        };

        match joined {
            Ok(result) => result.map_err(QueueError::Processing),
            Err(join_error) => {
                error!("Processor of job {} ({}) panicked: {:?}", job.id, job.name, join_error);

                Err(QueueError::Processing(JobError::new(format!(
                    "processor panicked: {join_error}"
                ))))
            }
        }
    }
}
