//! Error types for the NSF replicator.

use syncdb_core::CoreError;
use syncdb_protocol::ProtocolError;
use thiserror::Error;

/// Result type for NSF operations.
pub type NsfResult<T> = Result<T, NsfError>;

/// Errors raised by the replicator.
///
/// Transport failures are not fatal to replication: the window is kept and
/// retransmitted. Only [`NsfError::Core`] with a fatal inner error means the
/// local tables are inconsistent.
#[derive(Error, Debug)]
pub enum NsfError {
    /// Table engine error.
    #[error("table error: {0}")]
    Core(#[from] CoreError),

    /// Message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The agent socket failed.
    #[error("agent transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl NsfError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns true if the error means local state is corrupt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Core(err) if err.is_fatal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_core_invariants_are_fatal() {
        assert!(NsfError::from(CoreError::invariant("lost window")).is_fatal());
        assert!(!NsfError::from(CoreError::NotFound).is_fatal());
        assert!(!NsfError::config("bad").is_fatal());
        let io = std::io::Error::new(std::io::ErrorKind::WouldBlock, "full");
        assert!(!NsfError::from(io).is_fatal());
    }
}
