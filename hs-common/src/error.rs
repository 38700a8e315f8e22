//! # Protocol Errors
//!
//! Failures raised while framing or decoding response lines. Encoding never
//! fails, so every variant here describes bytes received from the server.

use thiserror::Error;

/// Result type for codec operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Decoding invariant violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The line carried no status field.
    #[error("response line has no status field")]
    MissingStatus,

    /// No line terminator within the configured bound.
    #[error("response line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    /// Find payload does not split into whole rows.
    #[error("find payload has {values} values, not a multiple of {columns} columns")]
    RaggedRows { columns: usize, values: usize },

    /// A field expected to hold a decimal count did not.
    #[error("invalid numeric field `{0}`")]
    InvalidNumber(String),

    /// `0x01` not followed by a byte in `0x40..=0x4F`.
    #[error("invalid escape sequence 0x01 0x{0:02x}")]
    BadEscape(u8),

    /// Unescaped field bytes are not valid UTF-8.
    #[error("response field is not valid utf-8")]
    InvalidUtf8,

    /// Server returned more columns than the index was opened with.
    #[error("server returned {returned} columns but the index binds {bound}")]
    ColumnMismatch { returned: usize, bound: usize },

    /// A positional field the operation needs is absent.
    #[error("response is missing the {0} field")]
    MissingField(&'static str),
}
