//! Error types for wire decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// A datagram could not be decoded.
///
/// The server drops such datagrams without replying.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The datagram ended before a field.
    #[error("truncated: need {needed} bytes for {field}, {remaining} left")]
    Truncated {
        /// Field being read.
        field: &'static str,
        /// Bytes the field needs.
        needed: usize,
        /// Bytes left in the datagram.
        remaining: usize,
    },

    /// Unknown tag in a discriminant field.
    #[error("unknown {field} tag {tag}")]
    UnknownTag {
        /// Field being read.
        field: &'static str,
        /// Offending value.
        tag: u8,
    },

    /// A field holds an impossible value.
    #[error("invalid {field}: {message}")]
    InvalidField {
        /// Field being read.
        field: &'static str,
        /// What is wrong.
        message: String,
    },

    /// Bytes left over after the last field.
    #[error("{0} trailing bytes")]
    Trailing(usize),

    /// A value is too large for its length prefix or message limit.
    #[error("{field} of {len} bytes exceeds limit {limit}")]
    TooLarge {
        /// Field being written.
        field: &'static str,
        /// Actual length.
        len: usize,
        /// Largest allowed length.
        limit: usize,
    },
}

impl ProtocolError {
    /// Creates an invalid field error.
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            message: message.into(),
        }
    }

    /// Creates an unknown tag error.
    pub fn unknown_tag(field: &'static str, tag: u8) -> Self {
        Self::UnknownTag { field, tag }
    }
}
