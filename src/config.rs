//! Driver configuration.
//!
//! Every blocking operation in the driver has an explicit deadline. The
//! defaults are sized for a test harness; callers tighten or loosen them
//! with the `with_*` builders or through `MIGRATION_DRIVER_*` environment
//! variables.

use std::time::Duration;

use crate::error::Error;

/// Environment variable holding the poll interval in milliseconds.
pub const ENV_POLL_INTERVAL_MS: &str = "MIGRATION_DRIVER_POLL_INTERVAL_MS";
/// Environment variable holding the wait timeout in seconds.
pub const ENV_WAIT_TIMEOUT_SECS: &str = "MIGRATION_DRIVER_WAIT_TIMEOUT_SECS";
/// Environment variable holding the command retry deadline in seconds.
pub const ENV_COMMAND_RETRY_DEADLINE_SECS: &str = "MIGRATION_DRIVER_COMMAND_RETRY_DEADLINE_SECS";
/// Environment variable holding the server-side command time limit in milliseconds.
pub const ENV_COMMAND_MAX_TIME_MS: &str = "MIGRATION_DRIVER_COMMAND_MAX_TIME_MS";

/// Configuration shared by the command client, waiters, and verifiers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverConfig {
    /// Fixed sleep between polls of a wait loop.
    pub poll_interval: Duration,
    /// Upper bound for every `wait_for_*` operation.
    pub wait_timeout: Duration,
    /// Upper bound for transient-error retries of a single command.
    pub command_retry_deadline: Duration,
    /// First backoff between command retries.
    pub retry_initial_backoff: Duration,
    /// Cap on the exponential command retry backoff.
    pub retry_max_backoff: Duration,
    /// Server-side execution limit forwarded as `maxTimeMS`.
    pub command_max_time: Option<Duration>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            wait_timeout: Duration::from_secs(600),
            command_retry_deadline: Duration::from_secs(60),
            retry_initial_backoff: Duration::from_millis(100),
            retry_max_backoff: Duration::from_secs(2),
            command_max_time: None,
        }
    }
}

impl DriverConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the wait timeout.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Set the command retry deadline.
    pub fn with_command_retry_deadline(mut self, deadline: Duration) -> Self {
        self.command_retry_deadline = deadline;
        self
    }

    /// Set the command retry backoff bounds.
    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial_backoff = initial;
        self.retry_max_backoff = max;
        self
    }

    /// Set the server-side command time limit.
    pub fn with_command_max_time(mut self, max_time: Duration) -> Self {
        self.command_max_time = Some(max_time);
        self
    }

    /// Build a configuration from defaults overridden by environment variables.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from defaults overridden by `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| -> Result<Option<u64>, Error> {
            lookup(key)
                .map(|v| {
                    v.trim().parse::<u64>().map_err(|_| {
                        Error::InvalidConfig(format!("{} must be an integer, got {:?}", key, v))
                    })
                })
                .transpose()
        };

        let mut config = Self::default();
        if let Some(ms) = parse(ENV_POLL_INTERVAL_MS)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse(ENV_WAIT_TIMEOUT_SECS)? {
            config.wait_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(ENV_COMMAND_RETRY_DEADLINE_SECS)? {
            config.command_retry_deadline = Duration::from_secs(secs);
        }
        if let Some(ms) = parse(ENV_COMMAND_MAX_TIME_MS)? {
            config.command_max_time = Some(Duration::from_millis(ms));
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make every wait time out immediately
    /// or spin without sleeping.
    pub fn validate(&self) -> Result<(), Error> {
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.wait_timeout < self.poll_interval {
            return Err(Error::InvalidConfig(format!(
                "wait_timeout ({:?}) is shorter than poll_interval ({:?})",
                self.wait_timeout, self.poll_interval
            )));
        }
        if self.retry_initial_backoff > self.retry_max_backoff {
            return Err(Error::InvalidConfig(format!(
                "retry_initial_backoff ({:?}) exceeds retry_max_backoff ({:?})",
                self.retry_initial_backoff, self.retry_max_backoff
            )));
        }
        Ok(())
    }

    /// `maxTimeMS` value for outgoing commands.
    pub fn max_time_ms(&self) -> Option<u64> {
        self.command_max_time.map(saturating_millis)
    }

    /// Backoff before retry number `attempt` (1-based): doubles from the
    /// initial backoff up to the cap.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.retry_initial_backoff
            .saturating_mul(factor)
            .min(self.retry_max_backoff)
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
