use backlog::EnqueueOptions;
use backlog::LogSink;
use backlog::Queue;
use backlog::QueueConfig;
use simple_worker::DigestMailer;
use simple_worker::Notification;
use simple_worker::WelcomeMailer;
use std::time::Duration;

#[tokio::main]
async fn main() {
    env_logger::init();

    log::info!("Starting...");

    let config = QueueConfig::from_env().unwrap();

    let queue = Queue::builder("notifications")
        .config(config)
        .register("welcome", WelcomeMailer)
        .register("digest", DigestMailer)
        .event_sink(LogSink::json())
        .build()
        .unwrap();

    queue.start().unwrap();
    log::info!("Queue started ...");

    for user in ["ann", "bob", "cid"] {
        queue
            .enqueue_tagged(
                Notification::Welcome {
                    user: user.to_string(),
                },
                EnqueueOptions::default(),
            )
            .unwrap();
    }

    let later = EnqueueOptions::builder()
        .delay(Duration::from_secs(2))
        .unique_key("digest-ann")
        .build();

    queue
        .enqueue_tagged(
            Notification::Digest {
                user: "ann".to_string(),
                items: 3,
            },
            later,
        )
        .unwrap();

    queue
        .enqueue_tagged(
            Notification::Digest {
                user: "bob".to_string(),
                items: 0,
            },
            EnqueueOptions::default(),
        )
        .unwrap();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("Interrupted"),
        _ = tokio::time::sleep(Duration::from_secs(10)) => {}
    }

    queue.stop(true).await.unwrap();

    log::info!("Final counts {:?}", queue.counts().unwrap());
}
