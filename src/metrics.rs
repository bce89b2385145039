//! Prometheus metrics for driver activity.
//!
//! Counts command attempts and retries, wait-loop polls, and timeouts, and
//! records how long each wait took. The harness can dump the registry in
//! text exposition format after a run.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

/// Labels for command metrics (command name + outcome)
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct CommandLabels {
    pub command: String,
    pub outcome: String,
}

impl EncodeLabelSet for CommandLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("command", self.command.as_str()).encode(encoder.encode_label())?;
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for wait-loop metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct WaitLabels {
    pub operation: String,
}

impl EncodeLabelSet for WaitLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("operation", self.operation.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Outcome of one command attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Ok,
    Transient,
    Failed,
}

impl CommandOutcome {
    fn as_str(self) -> &'static str {
        match self {
            CommandOutcome::Ok => "ok",
            CommandOutcome::Transient => "transient",
            CommandOutcome::Failed => "failed",
        }
    }
}

/// Shared metrics for the driver
pub struct DriverMetrics {
    /// Command attempts by outcome
    pub command_attempts_total: Family<CommandLabels, Counter>,
    /// Retries issued after a transient failure
    pub command_retries_total: Family<WaitLabels, Counter>,
    /// Predicate evaluations made by wait loops
    pub polls_total: Family<WaitLabels, Counter>,
    /// Waits that hit their deadline
    pub wait_timeouts_total: Family<WaitLabels, Counter>,
    /// Wall time of completed waits
    pub wait_duration_seconds: Family<WaitLabels, Histogram>,
    registry: Registry,
}

impl Default for DriverMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverMetrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let command_attempts_total = Family::<CommandLabels, Counter>::default();
        registry.register(
            "migration_driver_command_attempts",
            "Total number of protocol command attempts",
            command_attempts_total.clone(),
        );

        let command_retries_total = Family::<WaitLabels, Counter>::default();
        registry.register(
            "migration_driver_command_retries",
            "Total number of command retries after transient errors",
            command_retries_total.clone(),
        );

        let polls_total = Family::<WaitLabels, Counter>::default();
        registry.register(
            "migration_driver_polls",
            "Total number of wait-loop polls",
            polls_total.clone(),
        );

        let wait_timeouts_total = Family::<WaitLabels, Counter>::default();
        registry.register(
            "migration_driver_wait_timeouts",
            "Total number of waits that exceeded their deadline",
            wait_timeouts_total.clone(),
        );

        let wait_duration_seconds = Family::<WaitLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.01, 2.0, 16))
        });
        registry.register(
            "migration_driver_wait_duration_seconds",
            "Duration of completed waits in seconds",
            wait_duration_seconds.clone(),
        );

        Self {
            command_attempts_total,
            command_retries_total,
            polls_total,
            wait_timeouts_total,
            wait_duration_seconds,
            registry,
        }
    }

    fn wait_labels(operation: &str) -> WaitLabels {
        WaitLabels {
            operation: operation.to_string(),
        }
    }

    /// Record one command attempt
    pub fn record_command(&self, command: &str, outcome: CommandOutcome) {
        let labels = CommandLabels {
            command: command.to_string(),
            outcome: outcome.as_str().to_string(),
        };
        self.command_attempts_total.get_or_create(&labels).inc();
    }

    /// Record a retry of `command`
    pub fn record_retry(&self, command: &str) {
        self.command_retries_total
            .get_or_create(&Self::wait_labels(command))
            .inc();
    }

    /// Record one poll of `operation`
    pub fn record_poll(&self, operation: &str) {
        self.polls_total
            .get_or_create(&Self::wait_labels(operation))
            .inc();
    }

    /// Record a wait that finished (successfully or not) before its deadline
    pub fn record_wait_finished(&self, operation: &str, duration_secs: f64) {
        self.wait_duration_seconds
            .get_or_create(&Self::wait_labels(operation))
            .observe(duration_secs);
    }

    /// Record a wait that hit its deadline
    pub fn record_timeout(&self, operation: &str) {
        self.wait_timeouts_total
            .get_or_create(&Self::wait_labels(operation))
            .inc();
    }

    /// Number of attempts recorded for `command` with `outcome`
    pub fn command_attempts(&self, command: &str, outcome: CommandOutcome) -> u64 {
        let labels = CommandLabels {
            command: command.to_string(),
            outcome: outcome.as_str().to_string(),
        };
        self.command_attempts_total.get_or_create(&labels).get()
    }

    /// Number of retries recorded for `command`
    pub fn retries(&self, command: &str) -> u64 {
        self.command_retries_total
            .get_or_create(&Self::wait_labels(command))
            .get()
    }

    /// Number of polls recorded for `operation`
    pub fn polls(&self, operation: &str) -> u64 {
        self.polls_total
            .get_or_create(&Self::wait_labels(operation))
            .get()
    }

    /// Number of timeouts recorded for `operation`
    pub fn timeouts(&self, operation: &str) -> u64 {
        self.wait_timeouts_total
            .get_or_create(&Self::wait_labels(operation))
            .get()
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}
