//! Data model shared by the command client, waiters, and verifiers.
//!
//! These types mirror what the execution engine persists (the durable
//! migration record) and what each node holds in memory (access blockers),
//! plus the caller-owned [`MigrationDescriptor`].

use std::collections::BTreeMap;
use std::str::FromStr;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when parsing state names.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown migration state: {0}")]
    UnknownMigrationState(String),
    #[error("Unknown access blocker state: {0}")]
    UnknownAccessBlockerState(String),
    #[error("Unknown read preference mode: {0}")]
    UnknownReadPreferenceMode(String),
}

/// Opaque, caller-supplied identifier of one migration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigrationId(Uuid);

impl MigrationId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MigrationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MigrationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MigrationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Durable, donor-side state of a migration.
///
/// Progress is monotonic: `Uninitialized < AbortingIndexBuilds < DataSync <
/// Blocking < {Committed | Aborted}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationState {
    /// Record created but the coordinator has not started work.
    #[default]
    #[serde(rename = "uninitialized")]
    Uninitialized,
    /// Index builds on the tenant's collections are being aborted.
    #[serde(rename = "aborting index builds")]
    AbortingIndexBuilds,
    /// Recipient is cloning and catching up.
    #[serde(rename = "data sync")]
    DataSync,
    /// Donor is blocking writes while the recipient reaches consistency.
    #[serde(rename = "blocking")]
    Blocking,
    /// Migration succeeded; the recipient now owns the tenant.
    #[serde(rename = "committed")]
    Committed,
    /// Migration failed or was cancelled.
    #[serde(rename = "aborted")]
    Aborted,
}

impl MigrationState {
    /// Check if this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationState::Committed | MigrationState::Aborted)
    }

    /// Position of this state along the protocol. Both terminal states share
    /// the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            MigrationState::Uninitialized => 0,
            MigrationState::AbortingIndexBuilds => 1,
            MigrationState::DataSync => 2,
            MigrationState::Blocking => 3,
            MigrationState::Committed | MigrationState::Aborted => 4,
        }
    }

    /// Whether observing `next` after `self` is a legal (non-regressing)
    /// progression. Terminal states never change.
    pub fn can_advance_to(&self, next: MigrationState) -> bool {
        if self.is_terminal() {
            return *self == next;
        }
        next.rank() >= self.rank()
    }

    /// The access blocker state every donor node must converge to while the
    /// durable record is in this state.
    pub fn expected_access_state(&self) -> AccessBlockerState {
        match self {
            MigrationState::Committed => AccessBlockerState::Reject,
            MigrationState::Aborted => AccessBlockerState::Aborted,
            MigrationState::Blocking => AccessBlockerState::BlockWritesAndReads,
            MigrationState::Uninitialized
            | MigrationState::AbortingIndexBuilds
            | MigrationState::DataSync => AccessBlockerState::Allow,
        }
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationState::Uninitialized => write!(f, "uninitialized"),
            MigrationState::AbortingIndexBuilds => write!(f, "aborting index builds"),
            MigrationState::DataSync => write!(f, "data sync"),
            MigrationState::Blocking => write!(f, "blocking"),
            MigrationState::Committed => write!(f, "committed"),
            MigrationState::Aborted => write!(f, "aborted"),
        }
    }
}

impl FromStr for MigrationState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "uninitialized" => Ok(MigrationState::Uninitialized),
            "aborting index builds" => Ok(MigrationState::AbortingIndexBuilds),
            "data sync" => Ok(MigrationState::DataSync),
            "blocking" => Ok(MigrationState::Blocking),
            "committed" => Ok(MigrationState::Committed),
            "aborted" => Ok(MigrationState::Aborted),
            _ => Err(ParseError::UnknownMigrationState(s.to_string())),
        }
    }
}

/// Per-node, in-memory access state for a tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessBlockerState {
    /// Reads and writes are served normally.
    #[default]
    Allow,
    /// Writes are blocked, reads are served.
    BlockWrites,
    /// Both reads and writes are blocked.
    BlockWritesAndReads,
    /// The tenant moved away; all access is rejected.
    Reject,
    /// The migration aborted; access is served again.
    Aborted,
}

impl AccessBlockerState {
    /// Check if this is a state the blocker settles in after the migration ends.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AccessBlockerState::Reject | AccessBlockerState::Aborted)
    }
}

impl std::fmt::Display for AccessBlockerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessBlockerState::Allow => write!(f, "allow"),
            AccessBlockerState::BlockWrites => write!(f, "blockWrites"),
            AccessBlockerState::BlockWritesAndReads => write!(f, "blockWritesAndReads"),
            AccessBlockerState::Reject => write!(f, "reject"),
            AccessBlockerState::Aborted => write!(f, "aborted"),
        }
    }
}

impl FromStr for AccessBlockerState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "allow" => Ok(AccessBlockerState::Allow),
            "blockWrites" => Ok(AccessBlockerState::BlockWrites),
            "blockWritesAndReads" => Ok(AccessBlockerState::BlockWritesAndReads),
            "reject" => Ok(AccessBlockerState::Reject),
            "aborted" => Ok(AccessBlockerState::Aborted),
            _ => Err(ParseError::UnknownAccessBlockerState(s.to_string())),
        }
    }
}

/// Read preference mode forwarded to the donor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPreferenceMode {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl FromStr for ReadPreferenceMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "primary" => Ok(ReadPreferenceMode::Primary),
            "primaryPreferred" => Ok(ReadPreferenceMode::PrimaryPreferred),
            "secondary" => Ok(ReadPreferenceMode::Secondary),
            "secondaryPreferred" => Ok(ReadPreferenceMode::SecondaryPreferred),
            "nearest" => Ok(ReadPreferenceMode::Nearest),
            _ => Err(ParseError::UnknownReadPreferenceMode(s.to_string())),
        }
    }
}

/// Which donor nodes may serve the recipient's reads. Never interpreted by
/// the driver, only forwarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadPreference {
    pub mode: ReadPreferenceMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<BTreeMap<String, String>>,
}

impl ReadPreference {
    /// Create a read preference with the given mode and no tags.
    pub fn new(mode: ReadPreferenceMode) -> Self {
        Self {
            mode,
            tags: Vec::new(),
        }
    }

    /// Add a tag set.
    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags.push(tags);
        self
    }
}

/// Identifies one migration attempt. Owned by the caller; the driver only
/// ever borrows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationDescriptor {
    /// Unique id, never reused within a run.
    pub migration_id: MigrationId,
    /// Tenant whose databases move.
    pub tenant_id: String,
    /// Locator of the donor cluster.
    pub donor_connection_string: String,
    /// Locator of the recipient cluster.
    pub recipient_connection_string: String,
    /// Forwarded verbatim to the donor.
    pub read_preference: ReadPreference,
}

impl MigrationDescriptor {
    /// Create a descriptor with a fresh migration id and primary read preference.
    pub fn new(
        tenant_id: impl Into<String>,
        donor_connection_string: impl Into<String>,
        recipient_connection_string: impl Into<String>,
    ) -> Self {
        Self {
            migration_id: MigrationId::new(),
            tenant_id: tenant_id.into(),
            donor_connection_string: donor_connection_string.into(),
            recipient_connection_string: recipient_connection_string.into(),
            read_preference: ReadPreference::default(),
        }
    }

    /// Use a specific migration id.
    pub fn with_migration_id(mut self, migration_id: MigrationId) -> Self {
        self.migration_id = migration_id;
        self
    }

    /// Set the read preference.
    pub fn with_read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.read_preference = read_preference;
        self
    }

    /// Whether `db_name` belongs to this descriptor's tenant.
    pub fn owns_database(&self, db_name: &str) -> bool {
        is_tenant_database(&self.tenant_id, db_name)
    }
}

/// Why a migration aborted, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortReason {
    pub code: i32,
    #[serde(default)]
    pub code_name: String,
    #[serde(default)]
    pub errmsg: String,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code_name, self.code, self.errmsg)
    }
}

/// The replicated record the engine keeps for each migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableMigrationRecord {
    #[serde(rename = "_id", alias = "migrationId")]
    pub migration_id: MigrationId,
    pub tenant_id: String,
    pub state: MigrationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<AbortReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<Timestamp>,
}

/// Snapshot of one node's view of a migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMigrationStatus {
    /// The durable record, if this node has it.
    #[serde(default)]
    pub durable_record: Option<DurableMigrationRecord>,
    /// In-memory blockers keyed by tenant id.
    #[serde(default)]
    pub access_blockers: BTreeMap<String, AccessBlockerState>,
    /// Number of live donor coordinator instances on this node.
    #[serde(default)]
    pub active_coordinator_count: u32,
}

impl NodeMigrationStatus {
    /// The access blocker for `tenant_id`, if one is installed.
    pub fn access_blocker(&self, tenant_id: &str) -> Option<AccessBlockerState> {
        self.access_blockers.get(tenant_id).copied()
    }

    /// The durable record, if it belongs to `migration_id`.
    pub fn record_for(&self, migration_id: &MigrationId) -> Option<&DurableMigrationRecord> {
        self.durable_record
            .as_ref()
            .filter(|r| &r.migration_id == migration_id)
    }

    /// Evaluate the three garbage-collection predicates for this node.
    pub fn garbage_collection(&self, migration_id: &MigrationId, tenant_id: &str) -> GcProgress {
        GcProgress {
            record_removed: self.record_for(migration_id).is_none(),
            coordinators_idle: self.active_coordinator_count == 0,
            blocker_removed: !self.access_blockers.contains_key(tenant_id),
        }
    }
}

/// Which garbage-collection conditions hold on a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcProgress {
    /// The durable record is gone.
    pub record_removed: bool,
    /// No coordinator instance is running.
    pub coordinators_idle: bool,
    /// The tenant's access blocker is gone.
    pub blocker_removed: bool,
}

impl GcProgress {
    /// Check if all conditions hold.
    pub fn is_complete(&self) -> bool {
        self.record_removed && self.coordinators_idle && self.blocker_removed
    }

    /// Names of the conditions that do not hold yet.
    pub fn pending(&self) -> Vec<&'static str> {
        let mut pending = Vec::new();
        if !self.record_removed {
            pending.push("durable record present");
        }
        if !self.coordinators_idle {
            pending.push("coordinator still active");
        }
        if !self.blocker_removed {
            pending.push("access blocker present");
        }
        pending
    }
}

/// Whether `db_name` belongs to `tenant_id` by the `<tenant>_` prefix rule.
pub fn is_tenant_database(tenant_id: &str, db_name: &str) -> bool {
    db_name
        .strip_prefix(tenant_id)
        .is_some_and(|rest| rest.starts_with('_'))
}

/// Build the database name `<tenant>_<db>`.
pub fn tenant_database_name(tenant_id: &str, db_name: &str) -> String {
    format!("{}_{}", tenant_id, db_name)
}
