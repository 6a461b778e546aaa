//! Error types for SyncDB core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in table and registry operations.
///
/// Every variant except [`CoreError::Invariant`] is a semantic error that is
/// reported back to the requesting client. `Invariant` means the engine's own
/// bookkeeping is inconsistent and the server must stop.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The referenced table does not exist.
    #[error("no such table: {name}")]
    NoTable {
        /// Name of the missing table.
        name: String,
    },

    /// A table with this name already exists.
    #[error("duplicate table name: {name}")]
    DuplicateName {
        /// The conflicting name.
        name: String,
    },

    /// Record size in the request does not match the table.
    #[error("record size mismatch: table uses {expected} bytes, request has {actual}")]
    SizeMismatch {
        /// Table record size.
        expected: usize,
        /// Request record size.
        actual: usize,
    },

    /// The table cannot hold another live record.
    #[error("table {name} is full")]
    TableFull {
        /// Table name.
        name: String,
    },

    /// No record matches the key, or the scan ran past the end.
    #[error("record not found")]
    NotFound,

    /// A live record with this key exists and the table rejects overwrites.
    #[error("entry already exists")]
    EntryExists,

    /// All client slots are taken.
    #[error("client capacity exhausted ({max} clients)")]
    MaxClients {
        /// Size of the client id space.
        max: usize,
    },

    /// The request is well-formed but its arguments are invalid.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What is wrong with the argument.
        message: String,
    },

    /// The operation is not supported for this table kind.
    #[error("operation {operation} is not supported on {kind} tables")]
    Unsupported {
        /// Operation name.
        operation: &'static str,
        /// Table kind.
        kind: &'static str,
    },

    /// Persisted snapshot could not be encoded or decoded.
    #[error("snapshot error: {message}")]
    Snapshot {
        /// Description of the failure.
        message: String,
    },

    /// I/O error during persistence.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal bookkeeping is inconsistent. Never caused by client input.
    #[error("invariant violated: {message}")]
    Invariant {
        /// Description of the violated invariant.
        message: String,
    },
}

impl CoreError {
    /// Creates a no-such-table error.
    pub fn no_table(name: impl Into<String>) -> Self {
        Self::NoTable { name: name.into() }
    }

    /// Creates a duplicate-name error.
    pub fn duplicate_name(name: impl Into<String>) -> Self {
        Self::DuplicateName { name: name.into() }
    }

    /// Creates a table-full error.
    pub fn table_full(name: impl Into<String>) -> Self {
        Self::TableFull { name: name.into() }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a snapshot error.
    pub fn snapshot(message: impl Into<String>) -> Self {
        Self::Snapshot {
            message: message.into(),
        }
    }

    /// Creates an invariant violation.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    /// Returns true if the error is an unrecoverable programming fault.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_invariant_is_fatal() {
        assert!(CoreError::invariant("lost node").is_fatal());
        assert!(!CoreError::NotFound.is_fatal());
        assert!(!CoreError::table_full("T").is_fatal());
    }

    #[test]
    fn error_display() {
        let err = CoreError::SizeMismatch {
            expected: 8,
            actual: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains('8'));
        assert!(msg.contains('4'));
    }
}
