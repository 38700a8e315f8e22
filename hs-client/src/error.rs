//! # Client Errors
//!
//! One enum for everything a client call can fail with. Variants fall into
//! four families: usage mistakes caught before any I/O, connection failures,
//! malformed responses, and non-zero statuses reported by the server.

use thiserror::Error;

use hs_common::{IndexId, ProtocolError};

use crate::connection::Direction;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    // -------------------------------------------------------------------------
    // Usage errors (no network I/O was performed)
    // -------------------------------------------------------------------------
    /// Missing or invalid caller-supplied parameters.
    #[error("invalid usage: {0}")]
    Usage(String),

    /// Operation referenced an index id with no binding on this client.
    #[error("index {0} has not been opened on this client")]
    UnregisteredIndex(IndexId),

    #[error("client is not connected")]
    NotConnected,

    #[error("client is already connected")]
    AlreadyConnected,

    // -------------------------------------------------------------------------
    // Transport errors
    // -------------------------------------------------------------------------
    /// Dial failure, socket failure, or a response cut off mid-line.
    #[error("{direction} connection error: {message}")]
    Connection { direction: Direction, message: String },

    /// No response before the caller's deadline.
    #[error("{direction} request timed out")]
    Timeout { direction: Direction },

    /// Response violated the line grammar.
    #[error("malformed response: {0}")]
    Malformed(#[from] ProtocolError),

    // -------------------------------------------------------------------------
    // Server-reported failures
    // -------------------------------------------------------------------------
    /// Non-zero status outside a more specific operation error.
    #[error("server returned status {status}: {message}")]
    Server { status: String, message: String },

    /// `open_index` failed on one or both connections.
    #[error("failed to open index {index_id} ({})", describe_sides(.read, .write))]
    IndexOpen {
        index_id: IndexId,
        read: Option<Box<ClientError>>,
        write: Option<Box<ClientError>>,
    },

    /// Insert status `1`: the key already exists.
    #[error("duplicate key on index {index_id}")]
    DuplicateKey { index_id: IndexId },

    #[error("insert on index {index_id} failed with status {status}: {message}")]
    Insert {
        index_id: IndexId,
        status: String,
        message: String,
    },

    #[error("modify on index {index_id} failed with status {status}: {message}")]
    Modify {
        index_id: IndexId,
        status: String,
        message: String,
    },
}

impl ClientError {
    /// True for errors raised before any request reached the network.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            ClientError::Usage(_)
                | ClientError::UnregisteredIndex(_)
                | ClientError::NotConnected
                | ClientError::AlreadyConnected
        )
    }

    /// True for non-zero statuses reported by the server.
    pub fn is_server(&self) -> bool {
        matches!(
            self,
            ClientError::Server { .. }
                | ClientError::IndexOpen { .. }
                | ClientError::DuplicateKey { .. }
                | ClientError::Insert { .. }
                | ClientError::Modify { .. }
        )
    }

    pub(crate) fn connection(direction: Direction, message: impl Into<String>) -> Self {
        ClientError::Connection {
            direction,
            message: message.into(),
        }
    }
}

fn describe_sides(read: &Option<Box<ClientError>>, write: &Option<Box<ClientError>>) -> String {
    match (read, write) {
        (Some(read), Some(write)) => format!("read: {read}; write: {write}"),
        (Some(read), None) => format!("read: {read}"),
        (None, Some(write)) => format!("write: {write}"),
        (None, None) => "no side reported a failure".to_string(),
    }
}
