//! Error kinds surfaced by the broker

use crate::platform::PlatformError;
use crate::secure::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Which kind of name a request was denied for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameKind {
    Signals,
    Controls,
}

impl fmt::Display for NameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameKind::Signals => write!(f, "signals"),
            NameKind::Controls => write!(f, "controls"),
        }
    }
}

/// Errors returned by broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Operation {operation} not allowed without an open session. Client PID: {client_pid}")]
    NotActiveSession {
        operation: &'static str,
        client_pid: i32,
    },

    #[error("Requested {kind} that are not in allowed list: {names:?}")]
    AccessDenied { kind: NameKind, names: Vec<String> },

    #[error("The PID {client_pid} requested write access, but the broker already has write mode client with PID or SID of {holder}")]
    WriteConflict { client_pid: i32, holder: i32 },

    #[error("Invalid session state in {path}: {reason}")]
    InvalidState { path: String, reason: String },

    #[error("PlatformService: Implementation incomplete")]
    NotImplemented,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Wire-level classification of a [`BrokerError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotActiveSession,
    AccessDenied,
    WriteConflict,
    NotImplemented,
    InvalidArgument,
    Unauthorized,
    Platform,
    Internal,
}

impl BrokerError {
    /// Build an access denied error from an arbitrary collection of names.
    ///
    /// Names are sorted and deduplicated so the report is stable.
    pub fn access_denied<I, S>(kind: NameKind, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();
        BrokerError::AccessDenied { kind, names }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::NotActiveSession { .. } => ErrorKind::NotActiveSession,
            BrokerError::AccessDenied { .. } => ErrorKind::AccessDenied,
            BrokerError::WriteConflict { .. } => ErrorKind::WriteConflict,
            BrokerError::NotImplemented => ErrorKind::NotImplemented,
            BrokerError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            BrokerError::Unauthorized(_) => ErrorKind::Unauthorized,
            BrokerError::Platform(_) => ErrorKind::Platform,
            BrokerError::InvalidState { .. } | BrokerError::Store(_) => ErrorKind::Internal,
        }
    }
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
