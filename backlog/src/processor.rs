use crate::JobError;
use crate::JobId;
use crate::QueueError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Implement this trait to process jobs of one name.
///
///    ```rust
///         struct SendEmail;
///
///         #[async_trait]
///         impl Processor<Email> for SendEmail {
///             async fn run(&self, email: &Email, _ctx: &JobContext) -> Result<(), JobError> {
///                 mailer::send(email).await?;
///                 Ok(())
///             }
///         }
///     ```
///
#[async_trait]
pub trait Processor<P>: Send + Sync {
    /// Execute the job. An `Err` is routed through the queue's retry policy.
    async fn run(&self, payload: &P, ctx: &JobContext) -> Result<(), JobError>;
}

/// Payloads that know which processor handles them.
///
/// Implement it on an enum payload to tie each variant to a job name,
/// then enqueue with [`Queue::enqueue_tagged`](crate::Queue::enqueue_tagged).
pub trait TaggedPayload {
    fn job_name(&self) -> &str;
}

/// What a processor knows about the job it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    id: JobId,
    name: String,
    attempt: u32,
    cancel: watch::Receiver<bool>,
}

impl JobContext {
    pub(crate) fn new(id: JobId, name: String, attempt: u32, cancel: watch::Receiver<bool>) -> Self {
        JobContext {
            id,
            name,
            attempt,
            cancel,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The attempt being executed, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the queue asked this job to stop, after its timeout expired.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();

        loop {
            if *cancel.borrow_and_update() {
                return;
            }

            if cancel.changed().await.is_err() {
                // nobody can cancel the job anymore
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Immutable mapping from job name to its processor, fixed when the queue is built.
pub struct Registry<P> {
    processors: HashMap<String, Arc<dyn Processor<P>>>,
}

impl<P> Default for Registry<P> {
    fn default() -> Self {
        Registry {
            processors: HashMap::new(),
        }
    }
}

impl<P> Registry<P> {
    /// Adds a processor; a name can only be registered once.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        processor: Arc<dyn Processor<P>>,
    ) -> Result<(), QueueError> {
        let name = name.into();

        if self.processors.contains_key(&name) {
            return Err(QueueError::InvalidConfig(format!(
                "a processor for `{name}` is already registered"
            )));
        }

        self.processors.insert(name, processor);

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Processor<P>>> {
        self.processors.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.processors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.processors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl Processor<u8> for Noop {
        async fn run(&self, _payload: &u8, _ctx: &JobContext) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[test]
    fn registry_rejects_second_processor_for_a_name() {
        let mut registry: Registry<u8> = Registry::default();

        registry.register("noop", Arc::new(Noop)).unwrap();
        let result = registry.register("noop", Arc::new(Noop));

        assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
        assert_eq!(1, registry.len());
        assert!(registry.contains("noop"));
        assert!(registry.get("other").is_none());
    }

    #[tokio::test]
    async fn context_observes_cancellation() {
        let (cancel, receiver) = watch::channel(false);
        let ctx = JobContext::new(JobId::from("job"), "noop".to_string(), 1, receiver);

        assert!(!ctx.is_cancelled());

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.cancelled().await })
        };

        cancel.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(ctx.is_cancelled());
    }
}
