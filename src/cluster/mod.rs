//! Cluster and node handles.
//!
//! The driver never provisions clusters. The harness hands it one
//! [`ClusterHandle`] for the donor and one for the recipient, and the driver
//! talks to their nodes through [`NodeHandle`].
//!
//! ## Architecture
//!
//! - [`types`]: descriptor, durable record, access blocker and status types
//! - [`ClusterHandle`]: "current primary" and "all data-bearing nodes" of one
//!   logical cluster, with an explicit primary cache refreshed on failover
//! - [`NodeHandle`]: one node's command and read surface

use std::future::Future;

use serde_json::Value;

use crate::client::command::AdminCommand;
use crate::error::RpcError;

pub mod types;

pub use types::{
    AbortReason, AccessBlockerState, DurableMigrationRecord, GcProgress, MigrationDescriptor,
    MigrationId, MigrationState, NodeMigrationStatus, ParseError, ReadPreference,
    ReadPreferenceMode, is_tenant_database, tenant_database_name,
};

/// One node of a cluster.
///
/// Implementations are cheap handles (clone freely). Every method is a
/// single synchronous-in-spirit round trip with no retries of its own.
pub trait NodeHandle: Clone + Send + Sync + std::fmt::Debug {
    /// Address used in logs and error messages.
    fn host(&self) -> &str;

    /// Run an admin command and return the raw reply document.
    ///
    /// A reply with `ok: 0` may be returned either as `Ok(reply)` or as
    /// [`RpcError::CommandFailed`]; the client normalises both.
    fn run_command(
        &self,
        command: &AdminCommand,
    ) -> impl Future<Output = Result<Value, RpcError>> + Send;

    /// Read this node's local view of a migration: durable record, access
    /// blockers, and the active coordinator count.
    fn read_migration_status(
        &self,
        migration_id: &MigrationId,
    ) -> impl Future<Output = Result<NodeMigrationStatus, RpcError>> + Send;

    /// Return every document of `db.coll`. A missing collection is empty.
    fn find_documents(
        &self,
        db: &str,
        coll: &str,
    ) -> impl Future<Output = Result<Vec<Value>, RpcError>> + Send;

    /// Insert documents into `db.coll`.
    fn insert_documents(
        &self,
        db: &str,
        coll: &str,
        documents: &[Value],
    ) -> impl Future<Output = Result<(), RpcError>> + Send;
}

/// One logical cluster (donor or recipient).
///
/// The resolved primary is cached on the handle. It only changes when the
/// retry path calls [`ClusterHandle::refresh_primary`].
pub trait ClusterHandle: Send + Sync {
    /// Node handle type of this cluster.
    type Node: NodeHandle;

    /// Name used in logs.
    fn name(&self) -> &str;

    /// Connection string other clusters use to reach this one.
    fn connection_string(&self) -> String;

    /// The cached primary.
    fn primary(&self) -> Self::Node;

    /// Re-resolve the primary and update the cache.
    fn refresh_primary(&mut self) -> impl Future<Output = Result<Self::Node, RpcError>> + Send;

    /// All data-bearing nodes, primary included.
    fn all_nodes(&self) -> Vec<Self::Node>;

    /// Run an admin command once against the cached primary, without
    /// checking `ok` or retrying.
    fn admin_command(
        &self,
        command: &AdminCommand,
    ) -> impl Future<Output = Result<Value, RpcError>> + Send {
        let primary = self.primary();
        let command = command.clone();
        async move { primary.run_command(&command).await }
    }

    /// Stop every node of the cluster.
    fn stop(&mut self) -> impl Future<Output = Result<(), RpcError>> + Send;
}
