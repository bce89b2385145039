//! Typed protocol commands and reply parsing.
//!
//! Requests are plain structs; optional fields are `Option`s and are left
//! out of the wire document when unset. Replies come back as JSON documents
//! and are checked for `ok` here, so everything above this module sees
//! either a typed reply or an [`RpcError`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cluster::types::{AbortReason, MigrationDescriptor, MigrationId, MigrationState, ReadPreference};
use crate::error::RpcError;

/// Generic failure code used when a failed reply carries none.
const UNKNOWN_ERROR_CODE: i32 = 8;

/// Begin a migration, or probe the state of one that already exists.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DonorStartMigration {
    pub migration_id: MigrationId,
    pub tenant_id: String,
    pub recipient_connection_string: String,
    pub read_preference: ReadPreference,
    #[serde(rename = "maxTimeMS", skip_serializing_if = "Option::is_none")]
    pub max_time_ms: Option<u64>,
}

impl DonorStartMigration {
    /// Build the request for a descriptor.
    pub fn new(descriptor: &MigrationDescriptor) -> Self {
        Self {
            migration_id: descriptor.migration_id,
            tenant_id: descriptor.tenant_id.clone(),
            recipient_connection_string: descriptor.recipient_connection_string.clone(),
            read_preference: descriptor.read_preference.clone(),
            max_time_ms: None,
        }
    }

    /// Bound the server-side execution time.
    pub fn with_max_time_ms(mut self, max_time_ms: Option<u64>) -> Self {
        self.max_time_ms = max_time_ms;
        self
    }
}

/// Tell the donor the caller no longer needs the migration's record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DonorForgetMigration {
    pub migration_id: MigrationId,
    #[serde(rename = "maxTimeMS", skip_serializing_if = "Option::is_none")]
    pub max_time_ms: Option<u64>,
}

/// Ask the donor to abort a migration that has not reached a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DonorAbortMigration {
    pub migration_id: MigrationId,
    #[serde(rename = "maxTimeMS", skip_serializing_if = "Option::is_none")]
    pub max_time_ms: Option<u64>,
}

/// Every command the driver sends to a donor primary.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    StartMigration(DonorStartMigration),
    ForgetMigration(DonorForgetMigration),
    AbortMigration(DonorAbortMigration),
}

impl AdminCommand {
    /// Build a forget command.
    pub fn forget(migration_id: MigrationId, max_time_ms: Option<u64>) -> Self {
        AdminCommand::ForgetMigration(DonorForgetMigration {
            migration_id,
            max_time_ms,
        })
    }

    /// Build an abort command.
    pub fn abort(migration_id: MigrationId, max_time_ms: Option<u64>) -> Self {
        AdminCommand::AbortMigration(DonorAbortMigration {
            migration_id,
            max_time_ms,
        })
    }

    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            AdminCommand::StartMigration(_) => "donorStartMigration",
            AdminCommand::ForgetMigration(_) => "donorForgetMigration",
            AdminCommand::AbortMigration(_) => "donorAbortMigration",
        }
    }

    /// Migration the command targets.
    pub fn migration_id(&self) -> MigrationId {
        match self {
            AdminCommand::StartMigration(c) => c.migration_id,
            AdminCommand::ForgetMigration(c) => c.migration_id,
            AdminCommand::AbortMigration(c) => c.migration_id,
        }
    }

    /// Render the command document: `{ <name>: 1, ...fields }`.
    pub fn to_document(&self) -> Result<Value, serde_json::Error> {
        let body = match self {
            AdminCommand::StartMigration(c) => serde_json::to_value(c)?,
            AdminCommand::ForgetMigration(c) => serde_json::to_value(c)?,
            AdminCommand::AbortMigration(c) => serde_json::to_value(c)?,
        };

        let mut document = Map::new();
        document.insert(self.name().to_string(), Value::from(1));
        if let Value::Object(fields) = body {
            document.extend(fields);
        }
        Ok(Value::Object(document))
    }
}

/// Turn a raw reply into `Ok(reply)` or the command failure it describes.
pub fn check_reply(reply: Value) -> Result<Value, RpcError> {
    let ok = match reply.get("ok") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        Some(other) => {
            return Err(RpcError::MalformedReply(format!(
                "unexpected ok value: {}",
                other
            )));
        }
        None => return Err(RpcError::MalformedReply("reply has no ok field".to_string())),
    };

    if ok {
        return Ok(reply);
    }

    let code = reply
        .get("code")
        .and_then(Value::as_i64)
        .and_then(|c| i32::try_from(c).ok())
        .unwrap_or(UNKNOWN_ERROR_CODE);
    let code_name = reply
        .get("codeName")
        .and_then(Value::as_str)
        .unwrap_or("UnknownError");
    let errmsg = reply.get("errmsg").and_then(Value::as_str).unwrap_or_default();

    Err(RpcError::command_failed(code, code_name, errmsg))
}

/// Parsed reply of [`DonorStartMigration`].
#[derive(Debug, Clone, PartialEq)]
pub struct StartMigrationReply {
    /// Current durable state of the migration.
    pub state: MigrationState,
    /// Present once the migration aborted.
    pub abort_reason: Option<AbortReason>,
    /// The full reply document.
    pub raw: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartMigrationFields {
    state: MigrationState,
    #[serde(default)]
    abort_reason: Option<AbortReason>,
}

impl StartMigrationReply {
    /// Parse a raw start reply, including the `ok` check.
    pub fn parse(reply: Value) -> Result<Self, RpcError> {
        let reply = check_reply(reply)?;
        let fields: StartMigrationFields = serde_json::from_value(reply.clone())
            .map_err(|e| RpcError::MalformedReply(format!("donorStartMigration reply: {}", e)))?;
        Ok(Self {
            state: fields.state,
            abort_reason: fields.abort_reason,
            raw: reply,
        })
    }

    /// Check if the migration has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
