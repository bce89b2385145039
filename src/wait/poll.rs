//! Generic poll driver.
//!
//! Every "retry until condition" loop in the crate is a [`Poller`]: a small
//! state machine whose [`Poller::poll`] reports [`PollOutcome::Pending`],
//! [`PollOutcome::Done`], or [`PollOutcome::Failed`]. [`drive`] owns the
//! loop itself: fixed sleep between polls, optional deadline, metrics.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{DriverConfig, saturating_millis};
use crate::error::{Error, Result};
use crate::metrics::DriverMetrics;

/// Result of one poll.
#[derive(Debug)]
pub enum PollOutcome<T> {
    /// Condition not satisfied yet; poll again.
    Pending,
    /// Condition satisfied.
    Done(T),
    /// The wait cannot succeed; stop now.
    Failed(Error),
}

impl<T> PollOutcome<T> {
    /// Check if polling should continue.
    pub fn is_pending(&self) -> bool {
        matches!(self, PollOutcome::Pending)
    }
}

/// A resumable wait condition.
pub trait Poller {
    /// Value produced once the condition holds.
    type Output;

    /// Name of the operation, used in logs, metrics, and timeout errors.
    fn operation(&self) -> &'static str;

    /// Evaluate the condition once.
    fn poll(&mut self) -> impl Future<Output = PollOutcome<Self::Output>>;

    /// Human-readable description of what is still missing.
    fn pending_reason(&self) -> Option<String> {
        None
    }
}

/// How often to poll and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    /// Sleep between polls.
    pub interval: Duration,
    /// Give up after this long. `None` polls until the caller drops the future.
    pub deadline: Option<Duration>,
}

impl PollSchedule {
    /// Poll every `interval` for at most `deadline`.
    pub fn bounded(interval: Duration, deadline: Duration) -> Self {
        Self {
            interval,
            deadline: Some(deadline),
        }
    }

    /// Poll every `interval` with no deadline.
    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    /// The bounded schedule described by `config`.
    pub fn from_config(config: &DriverConfig) -> Self {
        Self::bounded(config.poll_interval, config.wait_timeout)
    }
}

/// Poll `poller` until it is done, fails, or the schedule's deadline passes.
pub async fn drive<P: Poller>(
    poller: &mut P,
    schedule: PollSchedule,
    metrics: &DriverMetrics,
) -> Result<P::Output> {
    let operation = poller.operation();
    let started = Instant::now();
    let mut polls = 0u64;

    loop {
        polls += 1;
        metrics.record_poll(operation);

        match poller.poll().await {
            PollOutcome::Done(value) => {
                let elapsed = started.elapsed();
                metrics.record_wait_finished(operation, elapsed.as_secs_f64());
                info!(
                    operation,
                    polls,
                    elapsed_ms = saturating_millis(elapsed),
                    "Wait condition satisfied"
                );
                return Ok(value);
            }
            PollOutcome::Failed(e) => {
                metrics.record_wait_finished(operation, started.elapsed().as_secs_f64());
                warn!(operation, polls, error = %e, "Wait aborted");
                return Err(e);
            }
            PollOutcome::Pending => {
                if let Some(deadline) = schedule.deadline
                    && started.elapsed() >= deadline
                {
                    metrics.record_timeout(operation);
                    let reason = poller.pending_reason();
                    warn!(operation, polls, reason = ?reason, "Wait timed out");
                    return Err(Error::Timeout {
                        operation: operation.to_string(),
                        duration: deadline,
                        last_error: reason,
                    });
                }
                debug!(operation, polls, reason = ?poller.pending_reason(), "Condition not yet satisfied");
            }
        }

        tokio::time::sleep(schedule.interval).await;
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap,
    clippy::panic
)]
mod tests {
    use super::*;

    /// Becomes done after a fixed number of polls.
    struct Countdown {
        remaining: u32,
    }

    impl Poller for Countdown {
        type Output = &'static str;

        fn operation(&self) -> &'static str {
            "countdown"
        }

        async fn poll(&mut self) -> PollOutcome<Self::Output> {
            if self.remaining == 0 {
                return PollOutcome::Done("liftoff");
            }
            self.remaining -= 1;
            PollOutcome::Pending
        }

        fn pending_reason(&self) -> Option<String> {
            Some(format!("{} polls left", self.remaining))
        }
    }

    struct AlwaysFails;

    impl Poller for AlwaysFails {
        type Output = ();

        fn operation(&self) -> &'static str {
            "always_fails"
        }

        async fn poll(&mut self) -> PollOutcome<()> {
            PollOutcome::Failed(Error::ProtocolViolation("boom".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_until_done() {
        let metrics = DriverMetrics::new();
        let mut poller = Countdown { remaining: 3 };
        let schedule = PollSchedule::bounded(Duration::from_millis(10), Duration::from_secs(1));

        let value = drive(&mut poller, schedule, &metrics).await.unwrap();
        assert_eq!(value, "liftoff");
        assert_eq!(metrics.polls("countdown"), 4);
        assert_eq!(metrics.timeouts("countdown"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_times_out_with_reason() {
        let metrics = DriverMetrics::new();
        let mut poller = Countdown { remaining: u32::MAX };
        let schedule = PollSchedule::bounded(Duration::from_millis(100), Duration::from_millis(450));

        let err = drive(&mut poller, schedule, &metrics).await.unwrap_err();
        match err {
            Error::Timeout {
                operation,
                duration,
                last_error,
            } => {
                assert_eq!(operation, "countdown");
                assert_eq!(duration, Duration::from_millis(450));
                assert!(last_error.unwrap().contains("polls left"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(metrics.timeouts("countdown"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_stops_on_failure() {
        let metrics = DriverMetrics::new();
        let err = drive(
            &mut AlwaysFails,
            PollSchedule::unbounded(Duration::from_millis(10)),
            &metrics,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
        assert_eq!(metrics.polls("always_fails"), 1);
    }

    #[test]
    fn test_schedule_from_config() {
        let config = DriverConfig::new()
            .with_poll_interval(Duration::from_millis(25))
            .with_wait_timeout(Duration::from_secs(3));
        let schedule = PollSchedule::from_config(&config);
        assert_eq!(schedule.interval, Duration::from_millis(25));
        assert_eq!(schedule.deadline, Some(Duration::from_secs(3)));
    }
}
