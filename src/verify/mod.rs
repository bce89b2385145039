//! Post-migration verification.
//!
//! - [`consistency`]: durable state vs. per-node access blockers
//! - [`routing`]: which tenant data reached the recipient

pub mod consistency;
pub mod routing;

pub use consistency::{ConsistencyVerifier, NodeCheck};
pub use routing::{RoutingReport, TenantRoutingVerifier};
