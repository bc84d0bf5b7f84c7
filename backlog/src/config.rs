use crate::QueueError;
use crate::RetentionMode;
use crate::RetryPolicy;
use crate::SleepParams;
use std::str::FromStr;
use std::time::Duration;
use typed_builder::TypedBuilder;

pub const CONCURRENCY_VAR: &str = "BACKLOG_CONCURRENCY";
pub const MAX_ATTEMPTS_VAR: &str = "BACKLOG_MAX_ATTEMPTS";
pub const BACKOFF_BASE_MS_VAR: &str = "BACKLOG_BACKOFF_BASE_MS";
pub const BACKOFF_MAX_MS_VAR: &str = "BACKLOG_BACKOFF_MAX_MS";
pub const BACKOFF_JITTER_VAR: &str = "BACKLOG_BACKOFF_JITTER";
pub const JOB_TIMEOUT_MS_VAR: &str = "BACKLOG_JOB_TIMEOUT_MS";
pub const RETENTION_VAR: &str = "BACKLOG_RETENTION";

/// Per-queue settings.
///
///    ```rust
///         let config = QueueConfig::builder()
///             .concurrency(4_usize)
///             .job_timeout(Duration::from_secs(30))
///             .build();
///     ```
///
#[derive(Clone, Debug, TypedBuilder)]
pub struct QueueConfig {
    /// Maximum number of jobs running at the same time
    #[builder(default = 1)]
    pub concurrency: usize,
    #[builder(default, setter(into))]
    pub retry_policy: RetryPolicy,
    #[builder(default, setter(into))]
    pub sleep_params: SleepParams,
    #[builder(default, setter(into))]
    pub retention_mode: RetentionMode,
    /// A job running longer than this is failed and its slot reclaimed
    #[builder(default, setter(strip_option))]
    pub job_timeout: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig::builder().build()
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.concurrency == 0 {
            return Err(invalid("concurrency must be at least 1"));
        }

        let policy = &self.retry_policy;

        if policy.max_attempts == 0 {
            return Err(invalid("max_attempts must be at least 1"));
        }

        if policy.base > policy.max_delay {
            return Err(invalid("backoff base can not be larger than max_delay"));
        }

        if !(0.0..=1.0).contains(&policy.jitter) {
            return Err(invalid("jitter must be between 0 and 1"));
        }

        if self.job_timeout == Some(Duration::ZERO) {
            return Err(invalid("job_timeout must be positive"));
        }

        Ok(())
    }

    /// Reads the configuration from `BACKLOG_*` environment variables,
    /// loading a `.env` file first if there is one.
    pub fn from_env() -> Result<Self, QueueError> {
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, QueueError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = QueueConfig::default();

        if let Some(concurrency) = parse(&lookup, CONCURRENCY_VAR)? {
            config.concurrency = concurrency;
        }

        if let Some(max_attempts) = parse(&lookup, MAX_ATTEMPTS_VAR)? {
            config.retry_policy.max_attempts = max_attempts;
        }

        if let Some(base) = parse(&lookup, BACKOFF_BASE_MS_VAR)? {
            config.retry_policy.base = Duration::from_millis(base);
        }

        if let Some(max_delay) = parse(&lookup, BACKOFF_MAX_MS_VAR)? {
            config.retry_policy.max_delay = Duration::from_millis(max_delay);
        }

        if let Some(jitter) = parse(&lookup, BACKOFF_JITTER_VAR)? {
            config.retry_policy.jitter = jitter;
        }

        if let Some(timeout) = parse(&lookup, JOB_TIMEOUT_MS_VAR)? {
            config.job_timeout = Some(Duration::from_millis(timeout));
        }

        if let Some(retention) = lookup(RETENTION_VAR) {
            config.retention_mode = match retention.trim() {
                "keep_all" => RetentionMode::KeepAll,
                "remove_all" => RetentionMode::RemoveAll,
                "remove_finished" => RetentionMode::RemoveFinished,
                other => {
                    return Err(invalid(format!(
                        "{RETENTION_VAR} must be keep_all, remove_all or remove_finished, got `{other}`"
                    )))
                }
            };
        }

        config.validate()?;

        Ok(config)
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> Result<Option<T>, QueueError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(format!("can not parse {key}=`{raw}`"))),
    }
}

fn invalid(message: impl Into<String>) -> QueueError {
    QueueError::InvalidConfig(message.into())
}
