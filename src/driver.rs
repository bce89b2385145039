//! Migration driver façade.
//!
//! Owns the donor and recipient handles and wires the command client, the
//! waiters, and the verifiers to one shared configuration and metrics set.
//! Operations run one at a time on the caller's task.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, instrument};

use crate::client::command::StartMigrationReply;
use crate::client::migration_client::{MigrationCommandClient, RetryMode};
use crate::cluster::types::{MigrationDescriptor, MigrationId, MigrationState};
use crate::cluster::{ClusterHandle, NodeHandle};
use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::metrics::DriverMetrics;
use crate::verify::consistency::ConsistencyVerifier;
use crate::verify::routing::{RoutingReport, TenantRoutingVerifier};
use crate::wait::state_waiter::{MigrationOutcome, StateWaiter};

/// Options for [`MigrationDriver::run_migration`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Retry the start command and status probes after transient errors.
    pub retry_on_transient_errors: bool,
    /// Forget the migration once it is terminal.
    pub automatic_forget: bool,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_on_transient_errors(mut self, retry: bool) -> Self {
        self.retry_on_transient_errors = retry;
        self
    }

    pub fn with_automatic_forget(mut self, forget: bool) -> Self {
        self.automatic_forget = forget;
        self
    }
}

/// Drives tenant migrations from a donor cluster `D` to a recipient `R`.
pub struct MigrationDriver<D: ClusterHandle, R: ClusterHandle = D> {
    client: MigrationCommandClient<D>,
    recipient: R,
    waiter: StateWaiter,
    consistency: ConsistencyVerifier,
    routing: TenantRoutingVerifier,
    metrics: Arc<DriverMetrics>,
}

impl<D: ClusterHandle, R: ClusterHandle> MigrationDriver<D, R> {
    /// Create a driver after validating `config`.
    pub fn new(donor: D, recipient: R, config: DriverConfig) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(DriverMetrics::new());
        Ok(Self {
            waiter: StateWaiter::new(&config, Arc::clone(&metrics)),
            consistency: ConsistencyVerifier::new(&config, Arc::clone(&metrics)),
            routing: TenantRoutingVerifier::new(),
            client: MigrationCommandClient::new(donor, config, Arc::clone(&metrics)),
            recipient,
            metrics,
        })
    }

    pub fn donor(&self) -> &D {
        self.client.donor()
    }

    pub fn recipient(&self) -> &R {
        &self.recipient
    }

    pub fn config(&self) -> &DriverConfig {
        self.client.config()
    }

    /// Metrics shared by every component of this driver.
    pub fn metrics(&self) -> &Arc<DriverMetrics> {
        &self.metrics
    }

    /// Build a descriptor for `tenant_id` between this driver's clusters.
    pub fn descriptor(&self, tenant_id: impl Into<String>) -> MigrationDescriptor {
        MigrationDescriptor::new(
            tenant_id,
            self.donor().connection_string(),
            self.recipient.connection_string(),
        )
    }

    /// Issue `donorStartMigration` once (or until a non-transient reply).
    pub async fn start_migration(
        &mut self,
        descriptor: &MigrationDescriptor,
        retry: RetryMode,
    ) -> Result<StartMigrationReply> {
        self.client.start_migration(descriptor, retry).await
    }

    /// Start a migration, wait for it to finish, and optionally forget it.
    #[instrument(skip_all, fields(migration_id = %descriptor.migration_id, tenant_id = %descriptor.tenant_id))]
    pub async fn run_migration(
        &mut self,
        descriptor: &MigrationDescriptor,
        options: RunOptions,
    ) -> Result<MigrationOutcome> {
        let retry = RetryMode::from(options.retry_on_transient_errors);
        let reply = self.client.start_migration(descriptor, retry).await?;
        info!(state = %reply.state, "Migration started");

        let outcome = if reply.is_terminal() {
            MigrationOutcome {
                state: reply.state,
                observed_states: vec![reply.state],
                reply,
            }
        } else {
            self.waiter
                .wait_for_migration_to_complete(&mut self.client, descriptor, retry)
                .await?
        };

        if options.automatic_forget {
            self.client
                .forget_migration(&descriptor.migration_id, retry)
                .await?;
        }
        Ok(outcome)
    }

    /// Issue `donorForgetMigration`.
    pub async fn forget_migration(
        &mut self,
        migration_id: &MigrationId,
        retry: RetryMode,
    ) -> Result<()> {
        self.client.forget_migration(migration_id, retry).await
    }

    /// Issue `donorAbortMigration`.
    pub async fn abort_migration(
        &mut self,
        migration_id: &MigrationId,
        retry: RetryMode,
    ) -> Result<()> {
        self.client.abort_migration(migration_id, retry).await
    }

    /// Block until the already-started migration is terminal.
    pub async fn wait_for_migration_to_complete(
        &mut self,
        descriptor: &MigrationDescriptor,
        retry: RetryMode,
    ) -> Result<MigrationOutcome> {
        self.waiter
            .wait_for_migration_to_complete(&mut self.client, descriptor, retry)
            .await
    }

    /// Block until garbage collection of the migration finished on `nodes`.
    pub async fn wait_for_migration_garbage_collection<N: NodeHandle>(
        &self,
        nodes: &[N],
        migration_id: &MigrationId,
        tenant_id: &str,
    ) -> Result<()> {
        self.waiter
            .wait_for_migration_garbage_collection(nodes, migration_id, tenant_id)
            .await
    }

    /// Block until every donor node in `nodes` matches `expected`, judged
    /// against the donor primary's durable record.
    pub async fn wait_for_nodes_to_reach_state(
        &self,
        nodes: &[D::Node],
        migration_id: &MigrationId,
        tenant_id: &str,
        expected: MigrationState,
    ) -> Result<()> {
        let reference = self.donor().primary();
        self.consistency
            .wait_for_nodes_to_reach_state(&reference, nodes, migration_id, tenant_id, expected)
            .await
    }

    /// Check once that every donor node in `nodes` matches `expected`.
    pub async fn assert_nodes_in_expected_state(
        &self,
        nodes: &[D::Node],
        migration_id: &MigrationId,
        tenant_id: &str,
        expected: MigrationState,
    ) -> Result<()> {
        let reference = self.donor().primary();
        self.consistency
            .assert_nodes_in_expected_state(&reference, nodes, migration_id, tenant_id, expected)
            .await
    }

    /// Check that `db_name.coll_name` on the recipient primary holds exactly
    /// what it should for `descriptor`'s tenant.
    pub async fn verify_recipient_data(
        &self,
        descriptor: &MigrationDescriptor,
        db_name: &str,
        coll_name: &str,
        expected: &[Value],
    ) -> Result<RoutingReport> {
        let recipient = self.recipient.primary();
        self.routing
            .verify_recipient_data(&recipient, descriptor, db_name, coll_name, expected)
            .await
    }

    /// Load documents into `db_name.coll_name` on the donor primary.
    ///
    /// Transient errors are retried, so documents should carry an `_id`.
    pub async fn insert_donor_data(
        &mut self,
        db_name: &str,
        coll_name: &str,
        documents: &[Value],
    ) -> Result<()> {
        self.client
            .insert_documents(db_name, coll_name, documents, RetryMode::OnTransientErrors)
            .await
    }

    /// Stop both clusters. The recipient is stopped even if the donor fails.
    pub async fn stop(&mut self) -> Result<()> {
        let donor = self.client.donor_mut().stop().await;
        let recipient = self.recipient.stop().await;
        info!("Donor and recipient stopped");
        donor.map_err(Error::from)?;
        recipient.map_err(Error::from)
    }
}
