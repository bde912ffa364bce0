//! Error types for the multus meta-plugin

use std::io;
use thiserror::Error;

/// CNI well-known error code for invalid environment variables
pub const CODE_INVALID_ENV: u32 = 4;
/// CNI well-known error code for an invalid network config
pub const CODE_INVALID_CONFIG: u32 = 7;
/// Plugin-specific catch-all code
pub const CODE_INTERNAL: u32 = 999;

/// Errors that can occur while handling one CNI invocation
#[derive(Debug, Error)]
pub enum MultusError {
    /// Malformed or structurally invalid NetConf/delegate. Always raised
    /// before any side effect.
    #[error("{0}")]
    Config(String),

    /// Saving, loading or removing the persisted delegate file failed
    #[error("{context}: {source}")]
    Persistence {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A delegate plugin returned an error or could not be executed
    #[error("delegate \"{plugin}\" failed: {msg}")]
    Delegate {
        plugin: String,
        code: Option<u32>,
        msg: String,
    },

    /// The invocation environment is unusable
    #[error("{0}")]
    Protocol(String),
}

impl MultusError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn persistence(context: impl Into<String>, source: io::Error) -> Self {
        Self::Persistence {
            context: context.into(),
            source,
        }
    }

    /// True when the persisted delegate set did not exist. Detach treats this
    /// as a successful no-op.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Persistence { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }

    /// CNI error code reported on the wire
    pub fn code(&self) -> u32 {
        match self {
            Self::Config(_) => CODE_INVALID_CONFIG,
            Self::Protocol(_) => CODE_INVALID_ENV,
            Self::Persistence { .. } => CODE_INTERNAL,
            Self::Delegate { code, .. } => code.unwrap_or(CODE_INTERNAL),
        }
    }
}

pub type Result<T> = std::result::Result<T, MultusError>;
