use super::EnqueueOptions;
use super::Queue;
use crate::events::{ChannelSink, EventKind, EventSink, JobEvent};
use crate::processor::{JobContext, Processor, TaggedPayload};
use crate::JobError;
use crate::JobId;
use crate::JobRecord;
use crate::JobState;
use crate::QueueConfig;
use crate::QueueError;
use crate::RetentionMode;
use crate::RetryPolicy;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<u32>>>,
}

#[async_trait]
impl Processor<u32> for Recorder {
    async fn run(&self, payload: &u32, _ctx: &JobContext) -> Result<(), JobError> {
        self.seen.lock().unwrap().push(*payload);
        Ok(())
    }
}

struct AlwaysFails;

#[async_trait]
impl Processor<u32> for AlwaysFails {
    async fn run(&self, _payload: &u32, _ctx: &JobContext) -> Result<(), JobError> {
        Err(JobError::new("always fails"))
    }
}

struct FailsFirstAttempt;

#[async_trait]
impl Processor<u32> for FailsFirstAttempt {
    async fn run(&self, _payload: &u32, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.attempt() == 1 {
            return Err(JobError::new("cold cache"));
        }

        Ok(())
    }
}

#[derive(Clone)]
struct Slow {
    delay: Duration,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Slow {
    fn new(delay: Duration) -> Self {
        Slow {
            delay,
            running: Arc::default(),
            peak: Arc::default(),
        }
    }
}

#[async_trait]
impl Processor<u32> for Slow {
    async fn run(&self, _payload: &u32, _ctx: &JobContext) -> Result<(), JobError> {
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

fn retry_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(max_attempts)
        .base(Duration::from_millis(10))
        .max_delay(Duration::from_millis(40))
        .build()
}

fn with_events<P>(
    builder: super::QueueBuilder<P>,
) -> (super::QueueBuilder<P>, UnboundedReceiver<JobEvent>)
where
    P: Send + Sync + 'static,
{
    let (sender, receiver) = unbounded_channel();

    (builder.event_sink(ChannelSink::new(sender)), receiver)
}

fn drain(events: &mut UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
    let mut drained = Vec::new();

    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }

    drained
}

fn count(events: &[JobEvent], kind: EventKind) -> usize {
    events.iter().filter(|event| event.kind == kind).count()
}

async fn wait_for<P>(queue: &Queue<P>, id: &JobId, state: JobState) -> JobRecord<P>
where
    P: Send + Sync + 'static,
{
    let poll = async {
        loop {
            if let Ok(job) = queue.job(id) {
                if job.state == state {
                    return job;
                }
            }

            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };

    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .unwrap_or_else(|_| panic!("job {id} did not become {state}"))
}

#[tokio::test]
async fn enqueue_creates_pending_job() {
    let queue = Queue::<u32>::builder("test")
        .register("record", Recorder::default())
        .build()
        .unwrap();

    let id = queue.enqueue("record", 7).unwrap();
    let job = queue.job(&id).unwrap();

    assert_eq!(JobState::Pending, job.state);
    assert_eq!(0, job.attempts);
    assert_eq!(7, *job.payload);
    assert_eq!("record", job.name);
    assert_eq!(None, job.last_error);
}

#[tokio::test]
async fn unknown_name_is_rejected_without_touching_the_store() {
    let (builder, mut events) = with_events(Queue::<u32>::builder("test").register("record", Recorder::default()));
    let queue = builder.build().unwrap();

    let result = queue.enqueue("nonexistent", 1);

    assert!(matches!(result, Err(QueueError::UnknownJobName(name)) if name == "nonexistent"));
    assert_eq!(0, queue.counts().unwrap().total());
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn processes_enqueued_jobs() {
    let recorder = Recorder::default();
    let (builder, mut events) =
        with_events(Queue::<u32>::builder("test").register("record", recorder.clone()));
    let queue = builder.build().unwrap();

    queue.start().unwrap();
    let id = queue.enqueue("record", 42).unwrap();

    let job = wait_for(&queue, &id, JobState::Completed).await;

    assert_eq!(1, job.attempts);
    assert_eq!(vec![42], *recorder.seen.lock().unwrap());

    let kinds: Vec<EventKind> = drain(&mut events).iter().map(|event| event.kind).collect();
    assert_eq!(
        vec![EventKind::Enqueued, EventKind::Started, EventKind::Completed],
        kinds
    );

    queue.stop(true).await.unwrap();
}

#[tokio::test]
async fn start_is_idempotent() {
    let recorder = Recorder::default();
    let (builder, mut events) =
        with_events(Queue::<u32>::builder("test").register("record", recorder.clone()));
    let queue = builder.build().unwrap();

    queue.start().unwrap();
    queue.start().unwrap();
    assert!(queue.is_running());

    let first = queue.enqueue("record", 1).unwrap();
    let second = queue.enqueue("record", 2).unwrap();
    wait_for(&queue, &first, JobState::Completed).await;
    wait_for(&queue, &second, JobState::Completed).await;

    queue.stop(true).await.unwrap();

    let events = drain(&mut events);
    assert_eq!(2, count(&events, EventKind::Started));
    assert_eq!(vec![1, 2], *recorder.seen.lock().unwrap());
}

#[tokio::test]
async fn exhausted_retries_end_in_failed() {
    let (builder, mut events) = with_events(
        Queue::<u32>::builder("test")
            .config(QueueConfig::builder().retry_policy(retry_policy(3)).build())
            .register("doomed", AlwaysFails),
    );
    let queue = builder.build().unwrap();

    queue.start().unwrap();
    let id = queue.enqueue("doomed", 1).unwrap();

    let job = wait_for(&queue, &id, JobState::Failed).await;
    queue.stop(true).await.unwrap();

    assert_eq!(3, job.attempts);
    assert_eq!(Some("always fails".to_string()), job.last_error);

    let events = drain(&mut events);
    assert_eq!(3, count(&events, EventKind::Started));
    assert_eq!(2, count(&events, EventKind::Retrying));
    assert_eq!(1, count(&events, EventKind::Failed));

    let failed = events
        .iter()
        .find(|event| event.kind == EventKind::Failed)
        .unwrap();
    assert_eq!(Some("always fails".to_string()), failed.error);
    assert_eq!(JobState::Failed, failed.state);
}

#[tokio::test]
async fn failed_attempt_is_retried_after_backoff() {
    let queue = Queue::<u32>::builder("test")
        .config(QueueConfig::builder().retry_policy(retry_policy(3)).build())
        .register("flaky", FailsFirstAttempt)
        .build()
        .unwrap();

    queue.start().unwrap();
    let id = queue.enqueue("flaky", 1).unwrap();

    let job = wait_for(&queue, &id, JobState::Completed).await;
    queue.stop(true).await.unwrap();

    assert_eq!(2, job.attempts);
    assert_eq!(Some("cold cache".to_string()), job.last_error);
}

#[tokio::test]
async fn never_runs_more_jobs_than_slots() {
    let slow = Slow::new(Duration::from_millis(30));
    let (builder, mut events) = with_events(
        Queue::<u32>::builder("test")
            .config(QueueConfig::builder().concurrency(2_usize).build())
            .register("slow", slow.clone()),
    );
    let queue = builder.build().unwrap();

    let ids: Vec<JobId> = (0..5)
        .map(|number| queue.enqueue("slow", number).unwrap())
        .collect();

    queue.start().unwrap();

    for id in &ids {
        wait_for(&queue, id, JobState::Completed).await;
    }
    queue.stop(true).await.unwrap();

    assert_eq!(2, slow.peak.load(Ordering::SeqCst));

    let mut active = 0i32;
    for event in drain(&mut events) {
        match event.kind {
            EventKind::Started => active += 1,
            EventKind::Completed => active -= 1,
            _ => {}
        }

        assert!(active <= 2, "{active} jobs active at once");
    }
}

#[tokio::test]
async fn dispatches_in_enqueue_order() {
    let recorder = Recorder::default();
    let queue = Queue::<u32>::builder("test")
        .register("record", recorder.clone())
        .build()
        .unwrap();

    let ids: Vec<JobId> = (1..=5)
        .map(|number| queue.enqueue("record", number).unwrap())
        .collect();

    queue.start().unwrap();
    wait_for(&queue, &ids[4], JobState::Completed).await;
    queue.stop(true).await.unwrap();

    assert_eq!(vec![1, 2, 3, 4, 5], *recorder.seen.lock().unwrap());
}

#[tokio::test]
async fn delayed_job_waits_for_its_time() {
    let recorder = Recorder::default();
    let queue = Queue::<u32>::builder("test")
        .register("record", recorder.clone())
        .build()
        .unwrap();

    queue.start().unwrap();

    let options = EnqueueOptions::builder()
        .delay(Duration::from_millis(150))
        .build();
    let id = queue.enqueue_with("record", 9, options).unwrap();

    assert_eq!(JobState::Delayed, queue.job(&id).unwrap().state);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(JobState::Delayed, queue.job(&id).unwrap().state);
    assert!(recorder.seen.lock().unwrap().is_empty());

    let job = wait_for(&queue, &id, JobState::Completed).await;
    assert!(job.updated_at >= job.available_at);

    queue.stop(true).await.unwrap();
}

#[tokio::test]
async fn delay_until_in_the_past_is_pending() {
    let queue = Queue::<u32>::builder("test")
        .register("record", Recorder::default())
        .build()
        .unwrap();

    let options = EnqueueOptions::builder()
        .delay_until(chrono::Utc::now() - chrono::Duration::seconds(5))
        .build();
    let id = queue.enqueue_with("record", 1, options).unwrap();

    assert_eq!(JobState::Pending, queue.job(&id).unwrap().state);
}

#[tokio::test]
async fn later_of_delay_and_delay_until_wins() {
    let queue = Queue::<u32>::builder("test")
        .register("record", Recorder::default())
        .build()
        .unwrap();

    let now = chrono::Utc::now();
    let until = now + chrono::Duration::seconds(60);

    let options = EnqueueOptions::builder()
        .delay(Duration::from_millis(10))
        .delay_until(until)
        .build();
    assert_eq!(until, options.available_at(now));

    let id = queue.enqueue_with("record", 1, options).unwrap();
    let job = queue.job(&id).unwrap();
    assert_eq!(JobState::Delayed, job.state);
    assert_eq!(until, job.available_at);

    let options = EnqueueOptions::builder()
        .delay(Duration::from_secs(3600))
        .delay_until(until)
        .build();
    assert_eq!(
        now + chrono::Duration::seconds(3600),
        options.available_at(now)
    );

    let id = queue.enqueue_with("record", 2, options).unwrap();
    assert!(queue.job(&id).unwrap().available_at >= now + chrono::Duration::seconds(3600));
}

#[tokio::test]
async fn graceful_stop_waits_for_active_jobs() {
    let (builder, mut events) = with_events(
        Queue::<u32>::builder("test").register("slow", Slow::new(Duration::from_millis(100))),
    );
    let queue = builder.build().unwrap();

    queue.start().unwrap();
    let id = queue.enqueue("slow", 1).unwrap();
    wait_for(&queue, &id, JobState::Active).await;

    queue.stop(true).await.unwrap();

    assert!(!queue.is_running());
    assert_eq!(JobState::Completed, queue.job(&id).unwrap().state);
    assert_eq!(1, count(&drain(&mut events), EventKind::Completed));
}

#[tokio::test]
async fn hard_stop_returns_while_jobs_still_run() {
    let queue = Queue::<u32>::builder("test")
        .register("slow", Slow::new(Duration::from_millis(200)))
        .build()
        .unwrap();

    queue.start().unwrap();
    let running = queue.enqueue("slow", 1).unwrap();
    wait_for(&queue, &running, JobState::Active).await;

    queue.stop(false).await.unwrap();

    assert_eq!(JobState::Active, queue.job(&running).unwrap().state);

    let waiting = queue.enqueue("slow", 2).unwrap();

    wait_for(&queue, &running, JobState::Completed).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(JobState::Pending, queue.job(&waiting).unwrap().state);
}

#[tokio::test]
async fn dropping_the_queue_stops_dispatching() {
    let queue = Queue::<u32>::builder("test")
        .register("slow", Slow::new(Duration::from_millis(100)))
        .build()
        .unwrap();
    let store = Arc::clone(&queue.store);

    queue.start().unwrap();
    let running = queue.enqueue("slow", 1).unwrap();
    let waiting = queue.enqueue("slow", 2).unwrap();
    wait_for(&queue, &running, JobState::Active).await;

    drop(queue);

    let finished = async {
        while store.get(&running).unwrap().state != JobState::Completed {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), finished)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(JobState::Pending, store.get(&waiting).unwrap().state);
}

#[tokio::test]
async fn stopped_queue_can_not_restart() {
    let queue = Queue::<u32>::builder("test")
        .register("record", Recorder::default())
        .build()
        .unwrap();

    queue.start().unwrap();
    queue.stop(true).await.unwrap();
    queue.stop(true).await.unwrap();

    assert!(matches!(queue.start(), Err(QueueError::ShutDown)));
}

#[tokio::test]
async fn timed_out_jobs_are_retried_then_failed() {
    let queue = Queue::<u32>::builder("test")
        .config(
            QueueConfig::builder()
                .retry_policy(retry_policy(2))
                .job_timeout(Duration::from_millis(30))
                .build(),
        )
        .register("stuck", Slow::new(Duration::from_secs(10)))
        .build()
        .unwrap();

    queue.start().unwrap();
    let id = queue.enqueue("stuck", 1).unwrap();

    let job = wait_for(&queue, &id, JobState::Failed).await;

    assert_eq!(2, job.attempts);
    assert_eq!(
        Some("job timed out after 30ms".to_string()),
        job.last_error
    );

    queue.stop(false).await.unwrap();
}

#[tokio::test]
async fn remove_finished_retention_drops_completed_jobs() {
    let queue = Queue::<u32>::builder("test")
        .config(
            QueueConfig::builder()
                .retention_mode(RetentionMode::RemoveFinished)
                .retry_policy(retry_policy(1))
                .build(),
        )
        .register("record", Recorder::default())
        .register("doomed", AlwaysFails)
        .build()
        .unwrap();

    queue.start().unwrap();
    let failing = queue.enqueue("doomed", 1).unwrap();
    let succeeding = queue.enqueue("record", 2).unwrap();

    wait_for(&queue, &failing, JobState::Failed).await;

    let removed = async {
        while queue.job(&succeeding).is_ok() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), removed)
        .await
        .unwrap();

    queue.stop(true).await.unwrap();

    assert!(matches!(queue.job(&succeeding), Err(QueueError::NotFound(_))));
    assert_eq!(1, queue.counts().unwrap().failed);
}

#[tokio::test]
async fn unique_key_prevents_duplicates() {
    let queue = Queue::<u32>::builder("test")
        .register("record", Recorder::default())
        .build()
        .unwrap();

    let options = EnqueueOptions::builder().unique_key("user-1").build();

    let id = queue.enqueue_with("record", 1, options.clone()).unwrap();
    let again = queue.enqueue_with("record", 2, options);

    assert_eq!(JobId::from_unique_key("record", "user-1"), id);
    assert!(matches!(again, Err(QueueError::DuplicateId(dup)) if dup == id));
    assert_eq!(1, *queue.job(&id).unwrap().payload);
}

#[tokio::test]
async fn active_jobs_can_not_be_removed() {
    let queue = Queue::<u32>::builder("test")
        .register("slow", Slow::new(Duration::from_millis(100)))
        .build()
        .unwrap();

    queue.start().unwrap();
    let id = queue.enqueue("slow", 1).unwrap();
    wait_for(&queue, &id, JobState::Active).await;

    assert!(matches!(queue.remove(&id), Err(QueueError::JobActive(_))));

    wait_for(&queue, &id, JobState::Completed).await;
    queue.stop(true).await.unwrap();

    assert_eq!(JobState::Completed, queue.remove(&id).unwrap().state);
}

#[tokio::test]
async fn registering_a_name_twice_fails_the_build() {
    let result = Queue::<u32>::builder("test")
        .register("record", Recorder::default())
        .register("record", AlwaysFails)
        .build();

    assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
}

#[tokio::test]
async fn invalid_config_fails_the_build() {
    let result = Queue::<u32>::builder("test")
        .config(QueueConfig::builder().concurrency(0_usize).build())
        .build();

    assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
}

enum Notification {
    Email(String),
    Sms(String),
}

impl TaggedPayload for Notification {
    fn job_name(&self) -> &str {
        match self {
            Notification::Email(_) => "email",
            Notification::Sms(_) => "sms",
        }
    }
}

#[derive(Clone, Default)]
struct Outbox {
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Processor<Notification> for Outbox {
    async fn run(&self, payload: &Notification, ctx: &JobContext) -> Result<(), JobError> {
        let line = match payload {
            Notification::Email(to) => format!("{} email {to}", ctx.name()),
            Notification::Sms(to) => format!("{} sms {to}", ctx.name()),
        };

        self.sent.lock().unwrap().push(line);
        Ok(())
    }
}

#[tokio::test]
async fn tagged_payloads_pick_their_processor() {
    let outbox = Outbox::default();
    let queue = Queue::builder("notifications")
        .register("email", outbox.clone())
        .register("sms", outbox.clone())
        .build()
        .unwrap();

    queue.start().unwrap();

    let email = queue
        .enqueue_tagged(Notification::Email("a@b.c".to_string()), EnqueueOptions::default())
        .unwrap();
    let sms = queue
        .enqueue_tagged(Notification::Sms("555".to_string()), EnqueueOptions::default())
        .unwrap();

    wait_for(&queue, &email, JobState::Completed).await;
    wait_for(&queue, &sms, JobState::Completed).await;
    queue.stop(true).await.unwrap();

    assert_eq!("email", queue.job(&email).unwrap().name);
    assert_eq!(
        vec!["email email a@b.c".to_string(), "sms sms 555".to_string()],
        *outbox.sent.lock().unwrap()
    );
}

#[tokio::test]
async fn removed_jobs_never_run() {
    let recorder = Recorder::default();
    let queue = Arc::new(
        Queue::<u32>::builder("test")
            .config(QueueConfig::builder().concurrency(8_usize).build())
            .register("record", recorder.clone())
            .build()
            .unwrap(),
    );

    queue.start().unwrap();

    let producer = {
        let queue = Arc::clone(&queue);

        tokio::task::spawn_blocking(move || {
            let mut removed_while_waiting = Vec::new();

            for number in 0..2000 {
                let id = queue.enqueue("record", number).unwrap();

                match queue.remove(&id) {
                    Ok(job) if !job.state.is_terminal() => removed_while_waiting.push(number),
                    Ok(_) | Err(QueueError::JobActive(_)) => {}
                    Err(error) => panic!("unexpected error {error:?}"),
                }
            }

            removed_while_waiting
        })
    };

    let removed = producer.await.unwrap();
    queue.stop(true).await.unwrap();

    let seen = recorder.seen.lock().unwrap();

    for number in &removed {
        assert!(!seen.contains(number), "removed job {number} ran");
    }
    assert_eq!(2000, removed.len() + seen.len());
}

struct ExplodingSink;

impl EventSink for ExplodingSink {
    fn emit(&self, event: &JobEvent) {
        if event.kind == EventKind::Started {
            panic!("sink exploded");
        }
    }
}

#[tokio::test]
async fn crashed_dispatcher_is_not_running() {
    let queue = Queue::<u32>::builder("test")
        .register("record", Recorder::default())
        .event_sink(ExplodingSink)
        .build()
        .unwrap();

    queue.start().unwrap();
    assert!(queue.is_running());

    queue.enqueue("record", 1).unwrap();

    let crashed = async {
        while queue.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), crashed)
        .await
        .unwrap();

    queue.stop(true).await.unwrap();
}
