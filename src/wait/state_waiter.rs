//! Blocking waits built on the command client.
//!
//! - [`CompletionPoller`] re-issues `donorStartMigration` as a status probe
//!   until the durable state is terminal.
//! - [`GarbageCollectionPoller`] reads every node until its durable record,
//!   coordinator, and access blocker for the migration are all gone.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::poll::{PollOutcome, PollSchedule, Poller, drive};
use crate::client::command::StartMigrationReply;
use crate::client::migration_client::{MigrationCommandClient, RetryMode};
use crate::cluster::types::{GcProgress, MigrationDescriptor, MigrationId, MigrationState};
use crate::cluster::{ClusterHandle, NodeHandle};
use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::metrics::DriverMetrics;

/// Terminal result of a migration.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationOutcome {
    /// `Committed` or `Aborted`.
    pub state: MigrationState,
    /// The last reply received, which reported `state`.
    pub reply: StartMigrationReply,
    /// Distinct states observed while waiting, in order.
    pub observed_states: Vec<MigrationState>,
}

impl MigrationOutcome {
    /// Check if the migration committed.
    pub fn is_committed(&self) -> bool {
        self.state == MigrationState::Committed
    }

    /// Check if the migration aborted.
    pub fn is_aborted(&self) -> bool {
        self.state == MigrationState::Aborted
    }
}

/// Polls the donor until the migration reaches a terminal state.
///
/// Fails if the reported state ever moves backwards.
pub struct CompletionPoller<'a, C: ClusterHandle> {
    client: &'a mut MigrationCommandClient<C>,
    descriptor: &'a MigrationDescriptor,
    retry: RetryMode,
    observed: Vec<MigrationState>,
}

impl<'a, C: ClusterHandle> CompletionPoller<'a, C> {
    /// Create a poller for an already-started migration. Each probe uses
    /// `retry` for transient failures.
    pub fn new(
        client: &'a mut MigrationCommandClient<C>,
        descriptor: &'a MigrationDescriptor,
        retry: RetryMode,
    ) -> Self {
        Self {
            client,
            descriptor,
            retry,
            observed: Vec::new(),
        }
    }

    /// Distinct states observed so far.
    pub fn observed_states(&self) -> &[MigrationState] {
        &self.observed
    }
}

impl<C: ClusterHandle> Poller for CompletionPoller<'_, C> {
    type Output = MigrationOutcome;

    fn operation(&self) -> &'static str {
        "wait_for_migration_to_complete"
    }

    async fn poll(&mut self) -> PollOutcome<MigrationOutcome> {
        let reply = match self
            .client
            .start_migration(self.descriptor, self.retry)
            .await
        {
            Ok(reply) => reply,
            Err(e) => return PollOutcome::Failed(e),
        };

        if let Some(&previous) = self.observed.last() {
            if !previous.can_advance_to(reply.state) {
                return PollOutcome::Failed(Error::ProtocolViolation(format!(
                    "migration {} moved from {} back to {}",
                    self.descriptor.migration_id, previous, reply.state
                )));
            }
            if previous != reply.state {
                self.observed.push(reply.state);
            }
        } else {
            self.observed.push(reply.state);
        }

        if reply.is_terminal() {
            return PollOutcome::Done(MigrationOutcome {
                state: reply.state,
                reply,
                observed_states: self.observed.clone(),
            });
        }
        PollOutcome::Pending
    }

    fn pending_reason(&self) -> Option<String> {
        self.observed
            .last()
            .map(|state| format!("migration is in state {}", state))
    }
}

/// Polls each node until garbage collection of a migration is complete there.
///
/// Nodes are tracked independently; a node that has completed is not read
/// again. A failed read leaves the node's progress unchanged.
pub struct GarbageCollectionPoller<'a, N: NodeHandle> {
    nodes: &'a [N],
    migration_id: &'a MigrationId,
    tenant_id: &'a str,
    progress: Vec<GcProgress>,
    last_errors: Vec<Option<String>>,
}

impl<'a, N: NodeHandle> GarbageCollectionPoller<'a, N> {
    /// Create a poller over `nodes`.
    pub fn new(nodes: &'a [N], migration_id: &'a MigrationId, tenant_id: &'a str) -> Self {
        Self {
            nodes,
            migration_id,
            tenant_id,
            progress: vec![GcProgress::default(); nodes.len()],
            last_errors: vec![None; nodes.len()],
        }
    }

    /// Per-node progress, in node order.
    pub fn progress(&self) -> &[GcProgress] {
        &self.progress
    }
}

impl<N: NodeHandle> Poller for GarbageCollectionPoller<'_, N> {
    type Output = ();

    fn operation(&self) -> &'static str {
        "wait_for_migration_garbage_collection"
    }

    async fn poll(&mut self) -> PollOutcome<()> {
        for ((node, progress), last_error) in self
            .nodes
            .iter()
            .zip(self.progress.iter_mut())
            .zip(self.last_errors.iter_mut())
        {
            if progress.is_complete() {
                continue;
            }
            match node.read_migration_status(self.migration_id).await {
                Ok(status) => {
                    *progress = status.garbage_collection(self.migration_id, self.tenant_id);
                    *last_error = None;
                    if progress.is_complete() {
                        debug!(node = %node.host(), "Garbage collection complete on node");
                    }
                }
                Err(e) => {
                    debug!(node = %node.host(), error = %e, "Status read failed, will retry");
                    *last_error = Some(e.to_string());
                }
            }
        }

        if self.progress.iter().all(GcProgress::is_complete) {
            PollOutcome::Done(())
        } else {
            PollOutcome::Pending
        }
    }

    fn pending_reason(&self) -> Option<String> {
        let pending: Vec<String> = self
            .nodes
            .iter()
            .zip(&self.progress)
            .zip(&self.last_errors)
            .filter(|((_, progress), _)| !progress.is_complete())
            .map(|((node, progress), last_error)| match last_error {
                Some(e) => format!("{}: unreachable ({})", node.host(), e),
                None => format!("{}: {}", node.host(), progress.pending().join(", ")),
            })
            .collect();
        (!pending.is_empty()).then(|| pending.join("; "))
    }
}

/// Turns one-shot commands and reads into bounded, convergent waits.
pub struct StateWaiter {
    schedule: PollSchedule,
    metrics: Arc<DriverMetrics>,
}

impl StateWaiter {
    /// Create a waiter using the poll interval and wait timeout of `config`.
    pub fn new(config: &DriverConfig, metrics: Arc<DriverMetrics>) -> Self {
        Self {
            schedule: PollSchedule::from_config(config),
            metrics,
        }
    }

    /// Use a custom schedule.
    pub fn with_schedule(mut self, schedule: PollSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Block until the migration is `Committed` or `Aborted`.
    ///
    /// The migration must already have been started. With
    /// [`RetryMode::Never`] the first transient probe failure ends the wait.
    #[instrument(skip_all, fields(migration_id = %descriptor.migration_id, tenant_id = %descriptor.tenant_id, ?retry))]
    pub async fn wait_for_migration_to_complete<C: ClusterHandle>(
        &self,
        client: &mut MigrationCommandClient<C>,
        descriptor: &MigrationDescriptor,
        retry: RetryMode,
    ) -> Result<MigrationOutcome> {
        let mut poller = CompletionPoller::new(client, descriptor, retry);
        let outcome = drive(&mut poller, self.schedule, &self.metrics).await?;
        info!(
            state = %outcome.state,
            observed = ?outcome.observed_states,
            "Migration reached terminal state"
        );
        Ok(outcome)
    }

    /// Block until every node in `nodes` has dropped the migration's durable
    /// record, has no active coordinator, and has no access blocker for
    /// `tenant_id`.
    #[instrument(skip_all, fields(migration_id = %migration_id, tenant_id = %tenant_id, nodes = nodes.len()))]
    pub async fn wait_for_migration_garbage_collection<N: NodeHandle>(
        &self,
        nodes: &[N],
        migration_id: &MigrationId,
        tenant_id: &str,
    ) -> Result<()> {
        let mut poller = GarbageCollectionPoller::new(nodes, migration_id, tenant_id);
        drive(&mut poller, self.schedule, &self.metrics).await?;
        info!("Migration garbage collected on all nodes");
        Ok(())
    }
}
