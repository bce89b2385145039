//! Durable state vs. access blocker consistency.
//!
//! For a migration in durable state `S`, every node's access blocker for the
//! tenant must be in `S.expected_access_state()`. The durable state is read
//! from a reference node (the donor primary); the blocker from each node.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::cluster::NodeHandle;
use crate::cluster::types::{AccessBlockerState, MigrationId, MigrationState};
use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::metrics::DriverMetrics;
use crate::wait::poll::{PollOutcome, PollSchedule, Poller, drive};

/// Result of checking one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCheck {
    /// Durable state and blocker both match.
    Consistent,
    /// The reference node's durable state is not the expected one.
    DurableStateMismatch {
        expected: MigrationState,
        found: Option<MigrationState>,
    },
    /// The node's blocker is not in the state the durable state implies.
    BlockerMismatch {
        expected: AccessBlockerState,
        found: Option<AccessBlockerState>,
    },
}

impl NodeCheck {
    /// Check if the node is consistent.
    pub fn is_consistent(&self) -> bool {
        matches!(self, NodeCheck::Consistent)
    }

    fn describe(&self, host: &str) -> String {
        match self {
            NodeCheck::Consistent => format!("{}: consistent", host),
            NodeCheck::DurableStateMismatch { expected, found } => format!(
                "{}: durable state is {}, expected {}",
                host,
                found.map_or_else(|| "absent".to_string(), |s| s.to_string()),
                expected
            ),
            NodeCheck::BlockerMismatch { expected, found } => format!(
                "{}: access blocker is {}, expected {}",
                host,
                found.map_or_else(|| "absent".to_string(), |s| s.to_string()),
                expected
            ),
        }
    }
}

/// Checks that nodes agree with the durable migration state.
pub struct ConsistencyVerifier {
    schedule: PollSchedule,
    metrics: Arc<DriverMetrics>,
}

impl ConsistencyVerifier {
    pub fn new(config: &DriverConfig, metrics: Arc<DriverMetrics>) -> Self {
        Self {
            schedule: PollSchedule::from_config(config),
            metrics,
        }
    }

    /// Use a custom schedule for [`Self::wait_for_nodes_to_reach_state`].
    pub fn with_schedule(mut self, schedule: PollSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Check `node` against the durable state read from `reference`.
    ///
    /// A node with no blocker for the tenant never matches.
    pub async fn check_node<N: NodeHandle>(
        &self,
        reference: &N,
        node: &N,
        migration_id: &MigrationId,
        tenant_id: &str,
        expected: MigrationState,
    ) -> Result<NodeCheck> {
        let reference_status = reference.read_migration_status(migration_id).await?;
        let durable = reference_status.record_for(migration_id).map(|r| r.state);
        if durable != Some(expected) {
            return Ok(NodeCheck::DurableStateMismatch {
                expected,
                found: durable,
            });
        }

        let expected_access = expected.expected_access_state();
        let found = node
            .read_migration_status(migration_id)
            .await?
            .access_blocker(tenant_id);
        if found != Some(expected_access) {
            return Ok(NodeCheck::BlockerMismatch {
                expected: expected_access,
                found,
            });
        }
        Ok(NodeCheck::Consistent)
    }

    /// Whether `node` is in `expected`, judged against `reference`.
    pub async fn is_node_in_expected_state<N: NodeHandle>(
        &self,
        reference: &N,
        node: &N,
        migration_id: &MigrationId,
        tenant_id: &str,
        expected: MigrationState,
    ) -> Result<bool> {
        let check = self
            .check_node(reference, node, migration_id, tenant_id, expected)
            .await?;
        Ok(check.is_consistent())
    }

    /// Block until every node in `nodes` is in `expected`.
    #[instrument(skip_all, fields(migration_id = %migration_id, tenant_id = %tenant_id, expected = %expected, nodes = nodes.len()))]
    pub async fn wait_for_nodes_to_reach_state<N: NodeHandle>(
        &self,
        reference: &N,
        nodes: &[N],
        migration_id: &MigrationId,
        tenant_id: &str,
        expected: MigrationState,
    ) -> Result<()> {
        let mut poller = NodeStatePoller {
            verifier: self,
            reference,
            nodes,
            migration_id,
            tenant_id,
            expected,
            reached: vec![false; nodes.len()],
            last_seen: vec![None; nodes.len()],
        };
        drive(&mut poller, self.schedule, &self.metrics).await
    }

    /// Check every node once; fail on the first node that is not in `expected`.
    #[instrument(skip_all, fields(migration_id = %migration_id, tenant_id = %tenant_id, expected = %expected, nodes = nodes.len()))]
    pub async fn assert_nodes_in_expected_state<N: NodeHandle>(
        &self,
        reference: &N,
        nodes: &[N],
        migration_id: &MigrationId,
        tenant_id: &str,
        expected: MigrationState,
    ) -> Result<()> {
        for node in nodes {
            let check = self
                .check_node(reference, node, migration_id, tenant_id, expected)
                .await?;
            if !check.is_consistent() {
                return Err(Error::Consistency(check.describe(node.host())));
            }
        }
        Ok(())
    }
}

/// Polls nodes until each one is consistent with the expected state.
struct NodeStatePoller<'a, N: NodeHandle> {
    verifier: &'a ConsistencyVerifier,
    reference: &'a N,
    nodes: &'a [N],
    migration_id: &'a MigrationId,
    tenant_id: &'a str,
    expected: MigrationState,
    reached: Vec<bool>,
    last_seen: Vec<Option<String>>,
}

impl<N: NodeHandle> Poller for NodeStatePoller<'_, N> {
    type Output = ();

    fn operation(&self) -> &'static str {
        "wait_for_nodes_to_reach_state"
    }

    async fn poll(&mut self) -> PollOutcome<()> {
        for ((node, reached), last_seen) in self
            .nodes
            .iter()
            .zip(self.reached.iter_mut())
            .zip(self.last_seen.iter_mut())
        {
            if *reached {
                continue;
            }
            match self
                .verifier
                .check_node(
                    self.reference,
                    node,
                    self.migration_id,
                    self.tenant_id,
                    self.expected,
                )
                .await
            {
                Ok(NodeCheck::Consistent) => *reached = true,
                Ok(check) => *last_seen = Some(check.describe(node.host())),
                Err(e) => {
                    debug!(node = %node.host(), error = %e, "Status read failed, will retry");
                    *last_seen = Some(format!("{}: unreachable ({})", node.host(), e));
                }
            }
        }

        if self.reached.iter().all(|r| *r) {
            PollOutcome::Done(())
        } else {
            PollOutcome::Pending
        }
    }

    fn pending_reason(&self) -> Option<String> {
        let pending: Vec<&str> = self
            .reached
            .iter()
            .zip(&self.last_seen)
            .filter(|(reached, _)| !**reached)
            .filter_map(|(_, seen)| seen.as_deref())
            .collect();
        (!pending.is_empty()).then(|| pending.join("; "))
    }
}
