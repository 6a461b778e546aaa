//! Error types for the SyncDB server and client.

use std::path::PathBuf;
use syncdb_core::CoreError;
use syncdb_nsf::NsfError;
use syncdb_protocol::{MessageType, ProtocolError, ResultCode};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the server or the client library.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Table engine error.
    #[error("table error: {0}")]
    Core(#[from] CoreError),

    /// Malformed datagram.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Replication error.
    #[error("nsf error: {0}")]
    Nsf(#[from] NsfError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Another server owns the run directory.
    #[error("run directory {} is locked by another server", path.display())]
    Locked {
        /// Run directory.
        path: PathBuf,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The server answered a request with a failure code.
    #[error("{request:?} rejected: {}", result.as_str())]
    Rejected {
        /// Request type.
        request: MessageType,
        /// Result code returned.
        result: ResultCode,
    },

    /// The server answered with something that does not fit the request.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl ServerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns true if the error must stop the server.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Core(err) => err.is_fatal(),
            Self::Nsf(err) => err.is_fatal(),
            _ => false,
        }
    }

    /// Returns the result code if the server rejected a request.
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            Self::Rejected { result, .. } => Some(*result),
            _ => None,
        }
    }
}
