//! # Command and Response Types
//!
//! Typed model of the HandlerSocket request/response exchange.
//!
//! ## Design Principles
//!
//! 1. **Closed Vocabulary**: Operators and modify kinds are enums, so an
//!    unsupported token can never reach the encoder.
//! 2. **Caller-Chosen Ids**: Index ids are picked by the client, not assigned
//!    by the server, and stay small.
//! 3. **Stringly Values**: Column values travel as text; typing them is the
//!    caller's business.

use std::fmt;
use std::str::FromStr;

/// Default port for read-only lookups.
pub const DEFAULT_READ_PORT: u16 = 9998;

/// Default port for mutating operations.
pub const DEFAULT_WRITE_PORT: u16 = 9999;

/// Index name that opens the table's primary key.
pub const PRIMARY_INDEX: &str = "PRIMARY";

/// Upper bound on a single response line (16 MiB).
pub const MAX_LINE_LEN: usize = 1 << 24;

/// Status code the server sends on success.
pub const STATUS_OK: &str = "0";

/// Identifier under which an index is opened on a connection.
pub type IndexId = u32;

/// Comparison applied to index key values by `Find` and `Modify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Operator {
    /// Wire token for this operator.
    pub const fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" => Ok(Operator::Eq),
            ">" => Ok(Operator::Gt),
            ">=" => Ok(Operator::Ge),
            "<" => Ok(Operator::Lt),
            "<=" => Ok(Operator::Le),
            other => Err(UnknownToken(other.to_string())),
        }
    }
}

/// What a `Modify` does to the rows it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModifyOp {
    /// Overwrite matched rows with new values (`U`).
    Update,
    /// Remove matched rows (`D`).
    Delete,
}

impl ModifyOp {
    /// Wire token for this modify kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            ModifyOp::Update => "U",
            ModifyOp::Delete => "D",
        }
    }
}

impl fmt::Display for ModifyOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModifyOp {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "U" => Ok(ModifyOp::Update),
            "D" => Ok(ModifyOp::Delete),
            other => Err(UnknownToken(other.to_string())),
        }
    }
}

/// Token that names no known operator or modify kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown protocol token `{0}`")]
pub struct UnknownToken(pub String);

/// A request line, before encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Declare an index on the connection under `index_id`.
    OpenIndex {
        index_id: IndexId,
        database: String,
        table: String,
        index_name: String,
        columns: Vec<String>,
    },

    /// Look up rows by (possibly partial) key.
    Find {
        index_id: IndexId,
        op: Operator,
        values: Vec<String>,
        limit: u32,
        offset: u32,
    },

    /// Insert one row; `values` follow the opened column order.
    Insert {
        index_id: IndexId,
        values: Vec<String>,
    },

    /// Update or delete the rows a `Find` with the same key would return.
    Modify {
        index_id: IndexId,
        op: Operator,
        values: Vec<String>,
        limit: u32,
        offset: u32,
        modify_op: ModifyOp,
        new_values: Vec<String>,
    },
}

impl Command {
    /// Index the command targets.
    pub fn index_id(&self) -> IndexId {
        match self {
            Command::OpenIndex { index_id, .. }
            | Command::Find { index_id, .. }
            | Command::Insert { index_id, .. }
            | Command::Modify { index_id, .. } => *index_id,
        }
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::OpenIndex { .. } => "open_index",
            Command::Find { .. } => "find",
            Command::Insert { .. } => "insert",
            Command::Modify { .. } => "modify",
        }
    }
}

/// A decoded response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// First field of the line; `"0"` on success.
    pub status: String,
    /// Everything after the status, in order.
    pub fields: Vec<String>,
}

impl Response {
    pub fn new(status: impl Into<String>, fields: Vec<String>) -> Self {
        Response {
            status: status.into(),
            fields,
        }
    }

    /// True when the server reported success.
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Trailing fields joined for error messages.
    ///
    /// Failure lines carry a column count followed by a short reason, e.g.
    /// `2\t1\tstmtnum`; the count is skipped when present.
    pub fn message(&self) -> String {
        let rest = match self.fields.first() {
            Some(first) if first.parse::<usize>().is_ok() && self.fields.len() > 1 => {
                &self.fields[1..]
            }
            _ => &self.fields[..],
        };
        rest.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_tokens_roundtrip() {
        for op in [Operator::Eq, Operator::Gt, Operator::Ge, Operator::Lt, Operator::Le] {
            assert_eq!(op.as_str().parse::<Operator>(), Ok(op));
        }
        assert_eq!(
            "!=".parse::<Operator>(),
            Err(UnknownToken("!=".to_string()))
        );
    }

    #[test]
    fn modify_op_tokens() {
        assert_eq!(ModifyOp::Update.to_string(), "U");
        assert_eq!("D".parse::<ModifyOp>(), Ok(ModifyOp::Delete));
        assert!("+".parse::<ModifyOp>().is_err());
    }

    #[test]
    fn command_reports_target_index() {
        let insert = Command::Insert {
            index_id: 4,
            values: vec!["k".into()],
        };
        assert_eq!(insert.index_id(), 4);
        assert_eq!(insert.name(), "insert");

        let open = Command::OpenIndex {
            index_id: 9,
            database: "db".into(),
            table: "t".into(),
            index_name: PRIMARY_INDEX.into(),
            columns: vec!["k".into()],
        };
        assert_eq!(open.index_id(), 9);
        assert_eq!(open.name(), "open_index");
    }

    #[test]
    fn response_message_skips_count() {
        let response = Response::new("2", vec!["1".into(), "stmtnum".into()]);
        assert!(!response.is_ok());
        assert_eq!(response.message(), "stmtnum");

        let bare = Response::new("1", vec!["open_table".into()]);
        assert_eq!(bare.message(), "open_table");
    }
}
