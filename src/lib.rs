//! tenant-migration-driver library crate
//!
//! Drives donor-to-recipient tenant migrations through the
//! `donorStartMigration` / `donorForgetMigration` / `donorAbortMigration`
//! protocol, waits for the durable state to settle, and checks that every
//! node and the recipient's data agree with the outcome.
//!
//! ## Architecture
//!
//! - [`cluster`]: handles onto the donor and recipient clusters and their nodes
//! - [`client`]: typed protocol commands and the retrying command client
//! - [`wait`]: the generic poll driver and the migration waits built on it
//! - [`verify`]: access-blocker consistency and tenant data routing checks
//! - [`driver`]: the [`MigrationDriver`] façade
//!
//! Ambient pieces: [`config`], [`error`], [`metrics`], [`telemetry`].

pub mod client;
pub mod cluster;
pub mod config;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod telemetry;
pub mod verify;
pub mod wait;

pub use client::{MigrationCommandClient, RetryMode};
pub use cluster::{
    AccessBlockerState, ClusterHandle, MigrationDescriptor, MigrationId, MigrationState,
    NodeHandle, NodeMigrationStatus,
};
pub use config::DriverConfig;
pub use driver::{MigrationDriver, RunOptions};
pub use error::{Error, ErrorKind, Result, RpcError};
pub use metrics::DriverMetrics;
pub use wait::MigrationOutcome;
