//! Error taxonomy for the bridge and its JSON-RPC code mapping.
//!
//! `Unavailable`, `PermissionDenied` and `RateLimited` are terminal for the
//! call. `BackendTimeout` and `BackendFailure` move the router on to the next
//! backend in the fallback list.

use serde::{Deserialize, Serialize};

use crate::types::{BackendId, OperationClass};

/// JSON-RPC 2.0 reserved codes.
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("No usable {0} backend on this host")]
    Unavailable(OperationClass),

    #[error("Monitor {0} not found")]
    MonitorNotFound(u32),

    #[error("Invalid coordinate: {0}")]
    CoordinateInvalid(String),

    #[error("Permission denied: {0} actions are disabled")]
    PermissionDenied(OperationClass),

    #[error("Rate limit exceeded: {limit} {class} actions per {window_secs}s (retry in {retry_after_ms}ms)")]
    RateLimited {
        class: OperationClass,
        limit: u32,
        window_secs: u64,
        retry_after_ms: u64,
    },

    #[error("Backend {backend} timed out after {after_ms}ms")]
    BackendTimeout { backend: BackendId, after_ms: u64 },

    #[error("Backend {backend} failed: {reason}")]
    BackendFailure { backend: BackendId, reason: String },

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable, serializable discriminant of [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unavailable,
    MonitorNotFound,
    CoordinateInvalid,
    PermissionDenied,
    RateLimited,
    BackendTimeout,
    BackendFailure,
    InvalidParams,
    Internal,
}

impl ErrorKind {
    pub fn rpc_code(self) -> i32 {
        match self {
            Self::Unavailable => -32001,
            Self::PermissionDenied => -32002,
            Self::RateLimited => -32003,
            Self::MonitorNotFound => -32004,
            Self::BackendFailure => -32005,
            Self::BackendTimeout => -32006,
            Self::CoordinateInvalid | Self::InvalidParams => INVALID_PARAMS,
            Self::Internal => INTERNAL_ERROR,
        }
    }
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::MonitorNotFound(_) => ErrorKind::MonitorNotFound,
            Self::CoordinateInvalid(_) => ErrorKind::CoordinateInvalid,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::BackendTimeout { .. } => ErrorKind::BackendTimeout,
            Self::BackendFailure { .. } => ErrorKind::BackendFailure,
            Self::InvalidParams(_) => ErrorKind::InvalidParams,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn rpc_code(&self) -> i32 {
        self.kind().rpc_code()
    }
}
