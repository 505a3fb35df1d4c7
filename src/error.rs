//! Crate-wide error taxonomy.
//!
//! Each subsystem owns a typed error enum for its public boundary (see
//! `acf::kv::KvError`, `acf::broker::BrokerError`, `acf::tool_registry::ToolError`); this module
//! holds the cross-cutting kinds referenced from more than one subsystem plus a catch-all
//! used by application-level (non-library) code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("unknown metric: {0}")]
    UnknownMetric(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u64, found: u64 },

    #[error("lock held by another agent")]
    LockHeld,

    #[error("queue full")]
    QueueFull,

    #[error("operation timed out")]
    Timeout,

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
