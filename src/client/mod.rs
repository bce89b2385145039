//! Donor command client.
//!
//! ## Architecture
//!
//! - `command`: typed request structs and reply parsing
//! - `migration_client`: start / forget / abort with opt-in transient retry
//!
//! ## Example
//!
//! ```rust,ignore
//! use tenant_migration_driver::client::{MigrationCommandClient, RetryMode};
//!
//! let mut client = MigrationCommandClient::new(donor, config, metrics);
//! let reply = client.start_migration(&descriptor, RetryMode::OnTransientErrors).await?;
//! println!("migration is in state {}", reply.state);
//! ```

pub mod command;
pub mod migration_client;

pub use command::{
    AdminCommand, DonorAbortMigration, DonorForgetMigration, DonorStartMigration,
    StartMigrationReply, check_reply,
};
pub use migration_client::{MigrationCommandClient, RetryMode};
