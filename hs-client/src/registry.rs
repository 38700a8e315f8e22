//! # Index Registry and Row Materializer
//!
//! Purpose: Remember which columns each index id was opened with, and use that
//! to turn the flat value list of a `Find` response into named rows.
//!
//! ## Design Principles
//! 1. **Per-Client Ownership**: Each client owns its registry. Two clients in
//!    one process never see each other's bindings.
//! 2. **Atomic Replacement**: Bindings are `Arc`s swapped under a write lock,
//!    so a reader sees either the old or the new column list, never a mix.
//! 3. **Shared Column Lists**: Rows point at the binding's column list instead
//!    of copying names per row.

use std::collections::HashMap;
use std::ops::Index;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::ser::{Serialize, SerializeMap, Serializer};

use hs_common::{decode_find_payload, Command, IndexId, ProtocolError};

use crate::error::ClientResult;

/// Columns an index id was opened with, plus what is needed to reopen it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBinding {
    pub index_id: IndexId,
    pub database: String,
    pub table: String,
    pub index_name: String,
    pub columns: Arc<[String]>,
}

impl IndexBinding {
    /// The `open_index` command that declares this binding on a connection.
    pub fn open_command(&self) -> Command {
        Command::OpenIndex {
            index_id: self.index_id,
            database: self.database.clone(),
            table: self.table.clone(),
            index_name: self.index_name.clone(),
            columns: self.columns.to_vec(),
        }
    }
}

/// Mapping from index id to its current binding.
#[derive(Debug, Default)]
pub(crate) struct IndexRegistry {
    bindings: RwLock<HashMap<IndexId, Arc<IndexBinding>>>,
}

impl IndexRegistry {
    pub(crate) fn get(&self, index_id: IndexId) -> Option<Arc<IndexBinding>> {
        self.bindings.read().get(&index_id).cloned()
    }

    /// Installs `binding`, replacing any earlier one for the same id.
    pub(crate) fn install(&self, binding: IndexBinding) {
        self.bindings
            .write()
            .insert(binding.index_id, Arc::new(binding));
    }

    pub(crate) fn clear(&self) {
        self.bindings.write().clear();
    }

    /// Current bindings ordered by index id.
    pub(crate) fn snapshot(&self) -> Vec<Arc<IndexBinding>> {
        let mut bindings: Vec<_> = self.bindings.read().values().cloned().collect();
        bindings.sort_by_key(|binding| binding.index_id);
        bindings
    }
}

/// One result tuple, labeled with the binding's column names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<String>,
}

impl Row {
    /// Value of `column`, if the row has it.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .position(|name| name == column)
            .and_then(|idx| self.values.get(idx))
            .map(String::as_str)
    }

    /// Column names in index order.
    pub fn columns(&self) -> &[String] {
        &self.columns[..self.values.len()]
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn into_values(self) -> Vec<String> {
        self.values
    }

    /// `(column, value)` pairs in index order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns
            .iter()
            .zip(&self.values)
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Index<&str> for Row {
    type Output = str;

    fn index(&self, column: &str) -> &str {
        match self.get(column) {
            Some(value) => value,
            None => panic!("row has no column `{column}`"),
        }
    }
}

// Serialized as a map in column order.
impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Builds rows from the fields of a successful `Find` response.
///
/// `fields[0]` is the per-row column count `k`; the rest are `k` values per
/// row. Row `r`, column `c` is `fields[1 + r*k + c]`, labeled with the
/// binding's `c`-th column.
pub(crate) fn materialize(binding: &IndexBinding, fields: &[String]) -> ClientResult<Vec<Row>> {
    let payload = decode_find_payload(fields)?;
    if payload.columns > binding.columns.len() {
        return Err(ProtocolError::ColumnMismatch {
            returned: payload.columns,
            bound: binding.columns.len(),
        }
        .into());
    }

    Ok(payload
        .rows()
        .map(|values| Row {
            columns: binding.columns.clone(),
            values: values.to_vec(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;

    fn binding(index_id: IndexId, columns: &[&str]) -> IndexBinding {
        IndexBinding {
            index_id,
            database: "hstest".into(),
            table: "hstest_table1".into(),
            index_name: "PRIMARY".into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn fields(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn materializes_named_rows() {
        let binding = binding(1, &["k", "v"]);
        let rows = materialize(&binding, &fields(&["2", "blue1", "hello", "blue2", "world"])).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("k"), Some("blue1"));
        assert_eq!(rows[0].get("v"), Some("hello"));
        assert_eq!(&rows[1]["k"], "blue2");
        assert_eq!(&rows[1]["v"], "world");
        assert_eq!(rows[1].get("missing"), None);
        assert_eq!(
            rows[0].iter().collect::<Vec<_>>(),
            vec![("k", "blue1"), ("v", "hello")]
        );
    }

    #[test]
    fn ragged_payload_is_malformed() {
        let binding = binding(1, &["k", "v"]);
        let err = materialize(&binding, &fields(&["2", "blue1", "hello", "blue2"])).unwrap_err();
        assert_eq!(
            err,
            ClientError::Malformed(ProtocolError::RaggedRows {
                columns: 2,
                values: 3
            })
        );
    }

    #[test]
    fn zero_columns_means_no_match() {
        let binding = binding(1, &["k", "v"]);
        assert!(materialize(&binding, &fields(&["0"])).unwrap().is_empty());
    }

    #[test]
    fn more_columns_than_bound_is_malformed() {
        let binding = binding(1, &["k"]);
        let err = materialize(&binding, &fields(&["2", "a", "b"])).unwrap_err();
        assert_eq!(
            err,
            ClientError::Malformed(ProtocolError::ColumnMismatch {
                returned: 2,
                bound: 1
            })
        );
    }

    #[test]
    fn later_binding_replaces_earlier() {
        let registry = IndexRegistry::default();
        registry.install(binding(1, &["a", "b"]));
        let earlier = registry.get(1).unwrap();
        registry.install(binding(1, &["x", "y", "z"]));

        let current = registry.get(1).unwrap();
        assert_eq!(&current.columns[..], &fields(&["x", "y", "z"])[..]);
        // Holders of the old binding keep a consistent view.
        assert_eq!(&earlier.columns[..], &fields(&["a", "b"])[..]);

        let rows = materialize(&current, &fields(&["3", "1", "2", "3"])).unwrap();
        assert_eq!(rows[0].columns(), &fields(&["x", "y", "z"])[..]);
    }

    #[test]
    fn registries_are_independent() {
        let first = IndexRegistry::default();
        let second = IndexRegistry::default();
        first.install(binding(4, &["k"]));
        assert!(second.get(4).is_none());

        first.clear();
        assert!(first.snapshot().is_empty());
    }

    #[test]
    fn open_command_reproduces_binding() {
        let command = binding(2, &["k", "v"]).open_command();
        assert_eq!(
            command,
            Command::OpenIndex {
                index_id: 2,
                database: "hstest".into(),
                table: "hstest_table1".into(),
                index_name: "PRIMARY".into(),
                columns: fields(&["k", "v"]),
            }
        );
    }

    #[test]
    fn row_serializes_in_column_order() {
        let binding = binding(1, &["v", "k"]);
        let rows = materialize(&binding, &fields(&["2", "hello", "blue1"])).unwrap();
        let json = serde_json::to_string(&rows[0]).unwrap();
        assert_eq!(json, r#"{"v":"hello","k":"blue1"}"#);
    }
}
