//! Error types for the migration driver.
//!
//! Failures are classified once, at the RPC boundary, into a closed
//! [`ErrorKind`]. Only [`ErrorKind::NotPrimary`] and [`ErrorKind::Network`]
//! are ever retried, and only when the caller opts in.

use std::time::Duration;

use thiserror::Error;

/// Server error codes the classifier knows about.
pub mod codes {
    pub const HOST_UNREACHABLE: i32 = 6;
    pub const HOST_NOT_FOUND: i32 = 7;
    pub const NETWORK_TIMEOUT: i32 = 89;
    pub const SHUTDOWN_IN_PROGRESS: i32 = 91;
    pub const PRIMARY_STEPPED_DOWN: i32 = 189;
    pub const NO_SUCH_TENANT_MIGRATION: i32 = 327;
    pub const TENANT_MIGRATION_ABORTED: i32 = 325;
    pub const CONFLICTING_OPERATION_IN_PROGRESS: i32 = 117;
    pub const SOCKET_EXCEPTION: i32 = 9001;
    pub const NOT_WRITABLE_PRIMARY: i32 = 10107;
    pub const INTERRUPTED_AT_SHUTDOWN: i32 = 11600;
    pub const INTERRUPTED_DUE_TO_REPL_STATE_CHANGE: i32 = 11602;
    pub const NOT_PRIMARY_NO_SECONDARY_OK: i32 = 13435;
    pub const NOT_PRIMARY_OR_SECONDARY: i32 = 13436;
}

/// Retry classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The addressed node lost (or never had) the primary role.
    NotPrimary,
    /// Transport-level failure: reset, unreachable, timed out.
    Network,
    /// The engine rejected the command; retrying will not help.
    Protocol,
    /// Anything the driver cannot interpret.
    Fatal,
}

impl ErrorKind {
    /// Map a server error code onto its retry class.
    pub fn from_code(code: i32) -> Self {
        match code {
            codes::NOT_WRITABLE_PRIMARY
            | codes::NOT_PRIMARY_NO_SECONDARY_OK
            | codes::NOT_PRIMARY_OR_SECONDARY
            | codes::PRIMARY_STEPPED_DOWN
            | codes::INTERRUPTED_DUE_TO_REPL_STATE_CHANGE => ErrorKind::NotPrimary,
            codes::HOST_UNREACHABLE
            | codes::HOST_NOT_FOUND
            | codes::NETWORK_TIMEOUT
            | codes::SOCKET_EXCEPTION
            | codes::SHUTDOWN_IN_PROGRESS
            | codes::INTERRUPTED_AT_SHUTDOWN => ErrorKind::Network,
            _ => ErrorKind::Protocol,
        }
    }

    /// Whether a failure of this kind is safe to retry.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::NotPrimary | ErrorKind::Network)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotPrimary => write!(f, "not-primary"),
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::Protocol => write!(f, "protocol"),
            ErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Failure of a single call against a node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The transport failed before a reply was received.
    #[error("Network error talking to {host}: {message}")]
    Network { host: String, message: String },

    /// The node answered with `ok: 0`.
    #[error("Command failed with {code_name} ({code}): {errmsg}")]
    CommandFailed {
        code: i32,
        code_name: String,
        errmsg: String,
    },

    /// The reply could not be decoded.
    #[error("Malformed reply: {0}")]
    MalformedReply(String),
}

impl RpcError {
    /// Build a command failure from its parts.
    pub fn command_failed(code: i32, code_name: impl Into<String>, errmsg: impl Into<String>) -> Self {
        RpcError::CommandFailed {
            code,
            code_name: code_name.into(),
            errmsg: errmsg.into(),
        }
    }

    /// Build a transport failure.
    pub fn network(host: impl Into<String>, message: impl Into<String>) -> Self {
        RpcError::Network {
            host: host.into(),
            message: message.into(),
        }
    }

    /// The single classifier used by every retry decision in the crate.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Network { .. } => ErrorKind::Network,
            RpcError::CommandFailed { code, .. } => ErrorKind::from_code(*code),
            RpcError::MalformedReply(_) => ErrorKind::Fatal,
        }
    }

    /// Server error code, if the node produced one.
    pub fn code(&self) -> Option<i32> {
        match self {
            RpcError::CommandFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Error type for driver operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A command or read against a node failed.
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// A bounded wait or retry loop ran out of time.
    #[error("Timeout after {duration:?}: {operation}{}", last_error_suffix(.last_error))]
    Timeout {
        operation: String,
        duration: Duration,
        last_error: Option<String>,
    },

    /// Durable and in-memory migration state disagree.
    #[error("Consistency check failed: {0}")]
    Consistency(String),

    /// Recipient data does not respect tenant boundaries.
    #[error("Tenant routing check failed: {0}")]
    Routing(String),

    /// The engine reported something that contradicts the protocol.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid driver configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Retry class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Rpc(e) => e.kind(),
            Error::Timeout { .. } | Error::Consistency(_) | Error::Routing(_) => ErrorKind::Fatal,
            Error::ProtocolViolation(_) => ErrorKind::Protocol,
            Error::InvalidConfig(_) | Error::Serialization(_) => ErrorKind::Fatal,
        }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        self.kind().is_transient()
    }

    /// Check if this error means the addressed node is not primary
    pub fn is_not_primary(&self) -> bool {
        self.kind() == ErrorKind::NotPrimary
    }

    /// Server error code carried by this error, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Rpc(e) => e.code(),
            _ => None,
        }
    }
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(" (last error: {e})"))
        .unwrap_or_default()
}

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, Error>;
