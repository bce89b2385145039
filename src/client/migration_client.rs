//! Protocol command client.
//!
//! Issues start / forget / abort against the donor's *current* primary.
//! Each call is one command; with [`RetryMode::OnTransientErrors`] the call
//! is repeated after NotPrimary-class and Network-class failures, and the
//! donor's primary is re-resolved before every repeat. Anything else goes
//! straight back to the caller.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::command::{AdminCommand, DonorStartMigration, StartMigrationReply, check_reply};
use crate::cluster::types::{MigrationDescriptor, MigrationId};
use crate::cluster::{ClusterHandle, NodeHandle};
use crate::config::{DriverConfig, saturating_millis};
use crate::error::{Error, Result, RpcError};
use crate::metrics::{CommandOutcome, DriverMetrics};

/// Whether a command may be retried after a transient failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryMode {
    /// Return the first response, success or failure.
    #[default]
    Never,
    /// Retry NotPrimary-class and Network-class failures until the
    /// configured retry deadline.
    OnTransientErrors,
}

impl RetryMode {
    /// Whether `error` may be retried under this mode.
    pub fn allows(self, error: &RpcError) -> bool {
        self == RetryMode::OnTransientErrors && error.kind().is_transient()
    }
}

impl From<bool> for RetryMode {
    fn from(retry_on_transient_errors: bool) -> Self {
        if retry_on_transient_errors {
            RetryMode::OnTransientErrors
        } else {
            RetryMode::Never
        }
    }
}

/// Command client bound to one donor cluster.
///
/// Holds no state beyond the donor handle, whose cached primary is the only
/// thing a retry changes.
pub struct MigrationCommandClient<C: ClusterHandle> {
    donor: C,
    config: DriverConfig,
    metrics: Arc<DriverMetrics>,
}

impl<C: ClusterHandle> MigrationCommandClient<C> {
    /// Create a client for `donor`.
    pub fn new(donor: C, config: DriverConfig, metrics: Arc<DriverMetrics>) -> Self {
        Self {
            donor,
            config,
            metrics,
        }
    }

    /// The donor cluster handle.
    pub fn donor(&self) -> &C {
        &self.donor
    }

    /// Mutable access to the donor cluster handle.
    pub fn donor_mut(&mut self) -> &mut C {
        &mut self.donor
    }

    /// The client configuration.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Issue `donorStartMigration` for `descriptor`.
    ///
    /// For a migration id the donor already knows, this returns the current
    /// state without side effects, which is how the waiters probe progress.
    #[instrument(skip_all, fields(migration_id = %descriptor.migration_id, tenant_id = %descriptor.tenant_id, ?retry))]
    pub async fn start_migration(
        &mut self,
        descriptor: &MigrationDescriptor,
        retry: RetryMode,
    ) -> Result<StartMigrationReply> {
        let command = AdminCommand::StartMigration(
            DonorStartMigration::new(descriptor).with_max_time_ms(self.config.max_time_ms()),
        );
        let reply = self.run_command(&command, retry).await?;
        let reply = StartMigrationReply::parse(reply)?;
        debug!(state = %reply.state, "donorStartMigration replied");
        Ok(reply)
    }

    /// Issue `donorForgetMigration`.
    ///
    /// The migration must already be terminal in the durable record.
    /// Forgetting an already-forgotten migration succeeds.
    #[instrument(skip_all, fields(migration_id = %migration_id, ?retry))]
    pub async fn forget_migration(
        &mut self,
        migration_id: &MigrationId,
        retry: RetryMode,
    ) -> Result<()> {
        let command = AdminCommand::forget(*migration_id, self.config.max_time_ms());
        self.run_command(&command, retry).await?;
        info!("Migration forgotten");
        Ok(())
    }

    /// Issue `donorAbortMigration`.
    #[instrument(skip_all, fields(migration_id = %migration_id, ?retry))]
    pub async fn abort_migration(
        &mut self,
        migration_id: &MigrationId,
        retry: RetryMode,
    ) -> Result<()> {
        let command = AdminCommand::abort(*migration_id, self.config.max_time_ms());
        self.run_command(&command, retry).await?;
        info!("Migration abort requested");
        Ok(())
    }

    /// Insert documents into `db.coll` on the donor primary.
    ///
    /// Retrying is only safe when the documents carry their own `_id`, so a
    /// replayed insert lands on the same keys.
    #[instrument(skip_all, fields(db = %db, coll = %coll, count = documents.len(), ?retry))]
    pub async fn insert_documents(
        &mut self,
        db: &str,
        coll: &str,
        documents: &[Value],
        retry: RetryMode,
    ) -> Result<()> {
        let db = db.to_string();
        let coll = coll.to_string();
        let documents = documents.to_vec();
        self.call_primary("insert", retry, move |node| {
            let db = db.clone();
            let coll = coll.clone();
            let documents = documents.clone();
            async move { node.insert_documents(&db, &coll, &documents).await }
        })
        .await
    }

    /// Run one admin command and check its reply.
    pub async fn run_command(&mut self, command: &AdminCommand, retry: RetryMode) -> Result<Value> {
        let name = command.name();
        let command = command.clone();
        self.call_primary(name, retry, move |node| {
            let command = command.clone();
            async move { node.run_command(&command).await.and_then(check_reply) }
        })
        .await
    }

    /// Call `call` against the donor primary, retrying per `retry`.
    ///
    /// The primary is re-resolved before each retry. Retries stop at
    /// `command_retry_deadline`, returning [`Error::Timeout`] with the last
    /// transient error.
    pub async fn call_primary<T, F, Fut>(
        &mut self,
        operation: &str,
        retry: RetryMode,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut(C::Node) -> Fut,
        Fut: Future<Output = std::result::Result<T, RpcError>>,
    {
        let started = Instant::now();
        let deadline = self.config.command_retry_deadline;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let primary = self.donor.primary();
            let host = primary.host().to_string();

            match call(primary).await {
                Ok(value) => {
                    self.metrics.record_command(operation, CommandOutcome::Ok);
                    if attempt > 1 {
                        info!(operation, attempt, host = %host, "Command succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if retry.allows(&e) => {
                    self.metrics
                        .record_command(operation, CommandOutcome::Transient);

                    if started.elapsed() >= deadline {
                        warn!(operation, attempt, error = %e, "Giving up after retry deadline");
                        return Err(Error::Timeout {
                            operation: format!("{} retries", operation),
                            duration: deadline,
                            last_error: Some(e.to_string()),
                        });
                    }

                    let backoff = self.config.retry_backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        host = %host,
                        kind = %e.kind(),
                        error = %e,
                        backoff_ms = saturating_millis(backoff),
                        "Transient error, retrying against re-resolved primary"
                    );
                    tokio::time::sleep(backoff).await;

                    match self.donor.refresh_primary().await {
                        Ok(node) => debug!(primary = %node.host(), "Primary re-resolved"),
                        Err(refresh_err) => {
                            debug!(error = %refresh_err, "Primary re-resolution failed, keeping cached primary")
                        }
                    }
                    self.metrics.record_retry(operation);
                }
                Err(e) => {
                    self.metrics.record_command(operation, CommandOutcome::Failed);
                    debug!(operation, attempt, host = %host, kind = %e.kind(), error = %e, "Command failed");
                    return Err(e.into());
                }
            }
        }
    }
}
