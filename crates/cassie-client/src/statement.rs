//! Statements accepted by the session.

use std::sync::Arc;

use cassie_proto::{codec, BatchType, ProtocolVersion, Value, Values};

use crate::error::Error;
use crate::prepared::PreparedStatement;

/// Arguments of a simple statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Arguments {
    #[default]
    None,
    Positional(Vec<Value>),
    /// Named arguments; requires protocol v3 or later.
    Named(Vec<(String, Value)>),
}

/// Query text plus arguments, sent as a QUERY message.
///
/// Without server metadata the arguments are encoded as their natural types
/// (see [`Value::natural_type`]).
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleStatement {
    query: String,
    arguments: Arguments,
}

impl SimpleStatement {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            arguments: Arguments::None,
        }
    }

    /// Bind positional arguments.
    pub fn with_values(mut self, values: Vec<Value>) -> Self {
        self.arguments = Arguments::Positional(values);
        self
    }

    /// Bind named arguments.
    pub fn with_named_values<S: Into<String>>(
        mut self,
        values: impl IntoIterator<Item = (S, Value)>,
    ) -> Self {
        self.arguments = Arguments::Named(
            values
                .into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
        );
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    pub(crate) fn encode_values(&self, version: ProtocolVersion) -> Result<Values, Error> {
        Ok(match &self.arguments {
            Arguments::None => Values::Empty,
            Arguments::Positional(values) if values.is_empty() => Values::Empty,
            Arguments::Positional(values) => Values::Positional(
                values
                    .iter()
                    .map(|v| encode_natural(v, version))
                    .collect::<Result<_, _>>()?,
            ),
            Arguments::Named(values) if values.is_empty() => Values::Empty,
            Arguments::Named(values) => Values::Named(
                values
                    .iter()
                    .map(|(name, v)| Ok((name.clone(), encode_natural(v, version)?)))
                    .collect::<Result<_, Error>>()?,
            ),
        })
    }

    /// Positional payloads for a batch entry, which has no named form.
    pub(crate) fn encode_positional(
        &self,
        version: ProtocolVersion,
    ) -> Result<Vec<Option<Vec<u8>>>, Error> {
        match &self.arguments {
            Arguments::None => Ok(Vec::new()),
            Arguments::Positional(values) => values
                .iter()
                .map(|v| encode_natural(v, version))
                .collect(),
            Arguments::Named(_) => Err(Error::InvalidArgument(
                "batch entries do not accept named arguments".to_string(),
            )),
        }
    }
}

impl From<&str> for SimpleStatement {
    fn from(query: &str) -> Self {
        SimpleStatement::new(query)
    }
}

impl From<String> for SimpleStatement {
    fn from(query: String) -> Self {
        SimpleStatement::new(query)
    }
}

fn encode_natural(value: &Value, version: ProtocolVersion) -> Result<Option<Vec<u8>>, Error> {
    if value.is_null() {
        return Ok(None);
    }
    let ty = value.natural_type().ok_or_else(|| {
        Error::TypeEncode(format!(
            "{} has no natural column type; bind it through a prepared statement",
            value
        ))
    })?;
    Ok(codec::encode(value, &ty, version)?)
}

/// A prepared statement with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    prepared: Arc<PreparedStatement>,
    values: Vec<Value>,
}

impl BoundStatement {
    /// Binds `values` to the statement's markers. Only the count is checked
    /// here; types are checked when the statement is encoded.
    pub fn new(prepared: Arc<PreparedStatement>, values: Vec<Value>) -> Result<Self, Error> {
        check_arity(&prepared, values.len())?;
        Ok(Self { prepared, values })
    }

    pub fn prepared(&self) -> &Arc<PreparedStatement> {
        &self.prepared
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Encodes the values against the bind markers of `prepared`, which is
    /// the statement this was bound to or its re-prepared replacement.
    pub(crate) fn encode_values(
        &self,
        prepared: &PreparedStatement,
        version: ProtocolVersion,
    ) -> Result<Vec<Option<Vec<u8>>>, Error> {
        check_arity(prepared, self.values.len())?;
        prepared
            .bind_columns()
            .iter()
            .zip(&self.values)
            .map(|(column, value)| {
                codec::encode(value, &column.ty, version).map_err(|e| match Error::from(e) {
                    Error::TypeEncode(msg) => {
                        Error::TypeEncode(format!("bind marker '{}': {}", column.name, msg))
                    }
                    other => other,
                })
            })
            .collect()
    }
}

fn check_arity(prepared: &PreparedStatement, given: usize) -> Result<(), Error> {
    let expected = prepared.bind_columns().len();
    if expected != given {
        return Err(Error::InvalidArgument(format!(
            "statement expects {} values, got {}",
            expected, given
        )));
    }
    Ok(())
}

/// One statement inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchStatementEntry {
    Simple(SimpleStatement),
    Bound(BoundStatement),
}

impl From<SimpleStatement> for BatchStatementEntry {
    fn from(statement: SimpleStatement) -> Self {
        BatchStatementEntry::Simple(statement)
    }
}

impl From<BoundStatement> for BatchStatementEntry {
    fn from(statement: BoundStatement) -> Self {
        BatchStatementEntry::Bound(statement)
    }
}

/// Several modifications applied as one BATCH message.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchStatement {
    batch_type: BatchType,
    entries: Vec<BatchStatementEntry>,
}

impl BatchStatement {
    pub fn new(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            entries: Vec::new(),
        }
    }

    pub fn logged() -> Self {
        Self::new(BatchType::Logged)
    }

    pub fn unlogged() -> Self {
        Self::new(BatchType::Unlogged)
    }

    pub fn counter() -> Self {
        Self::new(BatchType::Counter)
    }

    pub fn with(mut self, entry: impl Into<BatchStatementEntry>) -> Self {
        self.push(entry);
        self
    }

    pub fn push(&mut self, entry: impl Into<BatchStatementEntry>) {
        self.entries.push(entry.into());
    }

    pub fn batch_type(&self) -> BatchType {
        self.batch_type
    }

    pub fn entries(&self) -> &[BatchStatementEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Anything the session can execute.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Simple(SimpleStatement),
    Bound(BoundStatement),
    Batch(BatchStatement),
}

impl Statement {
    /// Query text for logging; batches report their size.
    pub fn describe(&self) -> String {
        match self {
            Statement::Simple(s) => s.query().to_string(),
            Statement::Bound(b) => b.prepared().query().to_string(),
            Statement::Batch(b) => format!("BATCH of {} statements", b.len()),
        }
    }
}

impl From<SimpleStatement> for Statement {
    fn from(statement: SimpleStatement) -> Self {
        Statement::Simple(statement)
    }
}

impl From<BoundStatement> for Statement {
    fn from(statement: BoundStatement) -> Self {
        Statement::Bound(statement)
    }
}

impl From<BatchStatement> for Statement {
    fn from(statement: BatchStatement) -> Self {
        Statement::Batch(statement)
    }
}

impl From<&str> for Statement {
    fn from(query: &str) -> Self {
        Statement::Simple(SimpleStatement::new(query))
    }
}

impl From<String> for Statement {
    fn from(query: String) -> Self {
        Statement::Simple(SimpleStatement::new(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cassie_proto::{ColumnSpec, ColumnType, Prepared, RowsMetadata};

    fn prepared() -> Arc<PreparedStatement> {
        let bind = RowsMetadata::from_columns(vec![
            ColumnSpec::new("ks", "t", "id", ColumnType::Int),
            ColumnSpec::new("ks", "t", "flag", ColumnType::TinyInt),
        ]);
        Arc::new(PreparedStatement::from_response(
            "INSERT INTO t (id, flag) VALUES (?, ?)",
            Prepared {
                id: vec![7],
                bind,
                result: RowsMetadata::default(),
            },
        ))
    }

    #[test]
    fn test_simple_values_use_natural_types() {
        let statement = SimpleStatement::new("SELECT * FROM t WHERE id = ? AND name = ?")
            .with_values(vec![Value::Int(42), Value::Null]);
        let values = statement.encode_values(ProtocolVersion::V4).unwrap();
        assert_eq!(
            values,
            Values::Positional(vec![Some(vec![0, 0, 0, 42]), None])
        );
    }

    #[test]
    fn test_named_values() {
        let statement = SimpleStatement::new("SELECT * FROM t WHERE id = :id")
            .with_named_values([("id", Value::TinyInt(-128))]);
        let values = statement.encode_values(ProtocolVersion::V4).unwrap();
        assert_eq!(
            values,
            Values::Named(vec![("id".to_string(), Some(vec![0x80]))])
        );
        assert!(statement.encode_positional(ProtocolVersion::V4).is_err());
    }

    #[test]
    fn test_udt_needs_declared_type() {
        let statement = SimpleStatement::new("INSERT INTO t (addr) VALUES (?)")
            .with_values(vec![Value::Udt(vec![("street".into(), Value::Text("x".into()))])]);
        assert!(matches!(
            statement.encode_values(ProtocolVersion::V4),
            Err(Error::TypeEncode(_))
        ));
    }

    #[test]
    fn test_bound_arity_checked() {
        assert!(matches!(
            BoundStatement::new(prepared(), vec![Value::Int(1)]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_bound_encodes_against_declared_types() {
        let prepared = prepared();
        let bound =
            BoundStatement::new(Arc::clone(&prepared), vec![Value::Int(1), Value::TinyInt(127)])
                .unwrap();
        let values = bound.encode_values(&prepared, ProtocolVersion::V4).unwrap();
        assert_eq!(values, vec![Some(vec![0, 0, 0, 1]), Some(vec![0x7F])]);

        let wrong =
            BoundStatement::new(Arc::clone(&prepared), vec![Value::Int(1), Value::Int(300)])
                .unwrap();
        match wrong.encode_values(&prepared, ProtocolVersion::V4) {
            Err(Error::TypeEncode(msg)) => assert!(msg.contains("flag")),
            other => panic!("expected encode error, got {:?}", other),
        }
    }

    #[test]
    fn test_batch_builder() {
        let batch = BatchStatement::unlogged()
            .with(SimpleStatement::new("DELETE FROM t WHERE id = 1"))
            .with(BoundStatement::new(prepared(), vec![Value::Int(2), Value::TinyInt(0)]).unwrap());
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.batch_type(), BatchType::Unlogged);
        assert_eq!(Statement::from(batch).describe(), "BATCH of 2 statements");
    }
}
