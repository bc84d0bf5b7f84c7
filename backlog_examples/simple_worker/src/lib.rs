use async_trait::async_trait;
use backlog::JobContext;
use backlog::JobError;
use backlog::Processor;
use backlog::TaggedPayload;
use backlog::ToJobError;
use std::time::Duration;

pub enum Notification {
    Welcome { user: String },
    Digest { user: String, items: u16 },
}

impl TaggedPayload for Notification {
    fn job_name(&self) -> &str {
        match self {
            Notification::Welcome { .. } => "welcome",
            Notification::Digest { .. } => "digest",
        }
    }
}

#[derive(Debug, ToJobError)]
pub enum MailerError {
    Throttled(u32),
    EmptyDigest(String),
}

pub struct WelcomeMailer;

#[async_trait]
impl Processor<Notification> for WelcomeMailer {
    async fn run(&self, payload: &Notification, ctx: &JobContext) -> Result<(), JobError> {
        let Notification::Welcome { user } = payload else {
            return Err(JobError::new("welcome mailer got a digest"));
        };

        // the first attempt is always throttled, the retry goes through
        if ctx.attempt() == 1 {
            Err(MailerError::Throttled(ctx.attempt()))?
        }

        log::info!("sent welcome email to {user} on attempt {}", ctx.attempt());
        tokio::time::sleep(Duration::from_millis(500)).await;

        Ok(())
    }
}

pub struct DigestMailer;

#[async_trait]
impl Processor<Notification> for DigestMailer {
    async fn run(&self, payload: &Notification, ctx: &JobContext) -> Result<(), JobError> {
        let Notification::Digest { user, items } = payload else {
            return Err(JobError::new("digest mailer got a welcome"));
        };

        if *items == 0 {
            Err(MailerError::EmptyDigest(user.clone()))?
        }

        for item in 0..*items {
            if ctx.is_cancelled() {
                return Err(JobError::new("cancelled"));
            }

            log::info!("digest item {item} for {user}");
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        Ok(())
    }
}
