//! Prepared statements and the session-wide cache.

use std::sync::Arc;

use cassie_proto::{ColumnSpec, Prepared};
use dashmap::DashMap;

/// A statement registered with the server.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStatement {
    id: Vec<u8>,
    query: String,
    bind_columns: Vec<ColumnSpec>,
    pk_indexes: Vec<u16>,
    result_columns: Arc<[ColumnSpec]>,
}

impl PreparedStatement {
    pub(crate) fn from_response(query: impl Into<String>, prepared: Prepared) -> Self {
        Self {
            id: prepared.id,
            query: query.into(),
            bind_columns: prepared.bind.columns,
            pk_indexes: prepared.bind.pk_indexes,
            result_columns: prepared.result.columns.into(),
        }
    }

    /// Server-issued id.
    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Bind markers, in order.
    pub fn bind_columns(&self) -> &[ColumnSpec] {
        &self.bind_columns
    }

    /// Bind marker positions of the partition key components.
    pub fn pk_indexes(&self) -> &[u16] {
        &self.pk_indexes
    }

    /// Result columns; empty for statements that return no rows.
    pub fn result_columns(&self) -> &[ColumnSpec] {
        &self.result_columns
    }

    pub(crate) fn shared_result_columns(&self) -> Arc<[ColumnSpec]> {
        Arc::clone(&self.result_columns)
    }
}

/// Prepared statements keyed by exact query text.
///
/// Entries live as long as the owning session and are only replaced when the
/// server reports an id unknown and the statement is prepared again.
#[derive(Debug, Default)]
pub struct PreparedCache {
    entries: DashMap<String, Arc<PreparedStatement>>,
}

impl PreparedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.entries.get(query).map(|entry| Arc::clone(entry.value()))
    }

    pub fn insert(&self, statement: Arc<PreparedStatement>) {
        self.entries.insert(statement.query().to_string(), statement);
    }

    /// Drops the entry for `query` if it still carries `id`.
    ///
    /// An entry already replaced by a concurrent re-prepare is kept.
    pub fn invalidate(&self, query: &str, id: &[u8]) -> bool {
        self.entries
            .remove_if(query, |_, cached| cached.id() == id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cassie_proto::{ColumnType, RowsMetadata};

    fn prepared(query: &str, id: &[u8]) -> Arc<PreparedStatement> {
        let bind = RowsMetadata::from_columns(vec![ColumnSpec::new(
            "ks",
            "users",
            "id",
            ColumnType::Int,
        )]);
        Arc::new(PreparedStatement::from_response(
            query,
            Prepared {
                id: id.to_vec(),
                bind,
                result: RowsMetadata::default(),
            },
        ))
    }

    #[test]
    fn test_cache_by_query_text() {
        let cache = PreparedCache::new();
        let query = "SELECT * FROM users WHERE id = ?";
        cache.insert(prepared(query, b"\x01"));

        assert_eq!(cache.get(query).unwrap().id(), b"\x01");
        assert!(cache.get("SELECT * FROM users WHERE id=?").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_only_matching_id() {
        let cache = PreparedCache::new();
        let query = "SELECT * FROM users WHERE id = ?";
        cache.insert(prepared(query, b"\x02"));

        assert!(!cache.invalidate(query, b"\x01"));
        assert!(cache.get(query).is_some());
        assert!(cache.invalidate(query, b"\x02"));
        assert!(cache.is_empty());
    }
}
