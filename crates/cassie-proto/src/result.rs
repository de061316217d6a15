//! RESULT message bodies.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::codec;
use crate::event::SchemaChange;
use crate::frame::ProtocolVersion;
use crate::types::ColumnType;
use crate::value::Value;
use crate::wire::{self, Reader};
use crate::Error;

/// RESULT kinds.
pub mod result_kinds {
    pub const VOID: i32 = 0x0001;
    pub const ROWS: i32 = 0x0002;
    pub const SET_KEYSPACE: i32 = 0x0003;
    pub const PREPARED: i32 = 0x0004;
    pub const SCHEMA_CHANGE: i32 = 0x0005;
}

/// Metadata flag bits.
pub mod metadata_flags {
    pub const GLOBAL_TABLES_SPEC: i32 = 0x0001;
    pub const HAS_MORE_PAGES: i32 = 0x0002;
    pub const NO_METADATA: i32 = 0x0004;
}

/// Description of one result column or bind marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnSpec {
    pub keyspace: String,
    pub table: String,
    pub name: String,
    pub ty: ColumnType,
}

impl ColumnSpec {
    pub fn new(
        keyspace: impl Into<String>,
        table: impl Into<String>,
        name: impl Into<String>,
        ty: ColumnType,
    ) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
            name: name.into(),
            ty,
        }
    }
}

/// Rows metadata as sent by the server.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowsMetadata {
    pub column_count: usize,
    /// Empty when the server was asked to skip metadata.
    pub columns: Vec<ColumnSpec>,
    pub paging_state: Option<Vec<u8>>,
    /// Partition key bind marker indexes; prepared metadata on v4 only.
    pub pk_indexes: Vec<u16>,
}

impl RowsMetadata {
    pub fn from_columns(columns: Vec<ColumnSpec>) -> Self {
        Self {
            column_count: columns.len(),
            columns,
            paging_state: None,
            pk_indexes: Vec::new(),
        }
    }

    fn read(r: &mut Reader<'_>, with_pk: bool) -> Result<Self, Error> {
        let flags = r.read_int()?;
        let count = r.read_int()?;
        let column_count = usize::try_from(count)
            .map_err(|_| Error::invalid(format!("negative column count {}", count)))?;

        let mut pk_indexes = Vec::new();
        if with_pk {
            let pk_count = r.read_int()?;
            let pk_count = usize::try_from(pk_count).unwrap_or(0);
            pk_indexes.reserve(pk_count.min(r.remaining() / 2));
            for _ in 0..pk_count {
                pk_indexes.push(r.read_short()?);
            }
        }

        let paging_state = if flags & metadata_flags::HAS_MORE_PAGES != 0 {
            r.read_bytes()?.map(<[u8]>::to_vec)
        } else {
            None
        };

        if flags & metadata_flags::NO_METADATA != 0 {
            return Ok(Self {
                column_count,
                columns: Vec::new(),
                paging_state,
                pk_indexes,
            });
        }

        let global = if flags & metadata_flags::GLOBAL_TABLES_SPEC != 0 {
            Some((r.read_string()?.to_owned(), r.read_string()?.to_owned()))
        } else {
            None
        };
        // Each column spec takes at least a name and a type id.
        let mut columns = Vec::with_capacity(column_count.min(r.remaining() / 4));
        for _ in 0..column_count {
            let (keyspace, table) = match &global {
                Some((ks, table)) => (ks.clone(), table.clone()),
                None => (r.read_string()?.to_owned(), r.read_string()?.to_owned()),
            };
            let name = r.read_string()?.to_owned();
            let ty = ColumnType::read(r)?;
            columns.push(ColumnSpec {
                keyspace,
                table,
                name,
                ty,
            });
        }

        Ok(Self {
            column_count,
            columns,
            paging_state,
            pk_indexes,
        })
    }

    fn write(&self, buf: &mut BytesMut, with_pk: bool) -> Result<(), Error> {
        let global = match self.columns.split_first() {
            Some((first, rest)) => rest
                .iter()
                .all(|c| c.keyspace == first.keyspace && c.table == first.table)
                .then(|| (first.keyspace.as_str(), first.table.as_str())),
            None => None,
        };

        let mut flags = 0;
        if global.is_some() {
            flags |= metadata_flags::GLOBAL_TABLES_SPEC;
        }
        if self.paging_state.is_some() {
            flags |= metadata_flags::HAS_MORE_PAGES;
        }
        if self.columns.is_empty() && self.column_count > 0 {
            flags |= metadata_flags::NO_METADATA;
        }
        wire::put_int(buf, flags);
        wire::put_int(buf, wire::int_len(self.column_count, "columns")?);
        if with_pk {
            wire::put_int(buf, wire::int_len(self.pk_indexes.len(), "pk indexes")?);
            for idx in &self.pk_indexes {
                wire::put_short(buf, *idx);
            }
        }
        if let Some(state) = &self.paging_state {
            wire::put_bytes(buf, Some(state.as_slice()))?;
        }
        if let Some((ks, table)) = global {
            wire::put_string(buf, ks)?;
            wire::put_string(buf, table)?;
        }
        for col in &self.columns {
            if global.is_none() {
                wire::put_string(buf, &col.keyspace)?;
                wire::put_string(buf, &col.table)?;
            }
            wire::put_string(buf, &col.name)?;
            col.ty.write(buf)?;
        }
        Ok(())
    }
}

/// One result row. Values are in column order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[ColumnSpec]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[ColumnSpec]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Looks a value up by column name. Quoted names are matched exactly,
    /// unquoted ones case-insensitively.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        let index = match name.strip_prefix('"').and_then(|n| n.strip_suffix('"')) {
            Some(exact) => self.columns.iter().position(|c| c.name == exact),
            None => self
                .columns
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(name)),
        }?;
        self.values.get(index)
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl std::ops::Index<usize> for Row {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.values[index]
    }
}

/// A page of rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Rows {
    columns: Arc<[ColumnSpec]>,
    rows: Vec<Row>,
    paging_state: Option<Vec<u8>>,
}

impl Rows {
    pub fn new(columns: Vec<ColumnSpec>, rows: Vec<Vec<Value>>) -> Self {
        let columns: Arc<[ColumnSpec]> = columns.into();
        let rows = rows
            .into_iter()
            .map(|values| Row::new(columns.clone(), values))
            .collect();
        Self {
            columns,
            rows,
            paging_state: None,
        }
    }

    pub fn with_paging_state(mut self, state: Option<Vec<u8>>) -> Self {
        self.paging_state = state;
        self
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    /// Opaque state to fetch the next page; `None` on the last page.
    pub fn paging_state(&self) -> Option<&[u8]> {
        self.paging_state.as_deref()
    }

    pub fn has_more_pages(&self) -> bool {
        self.paging_state.is_some()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Reads a rows body. `known_columns` supplies column types when the
    /// server omitted metadata (prepared executions with skip-metadata).
    fn read(
        r: &mut Reader<'_>,
        version: ProtocolVersion,
        known_columns: Option<&[ColumnSpec]>,
    ) -> Result<Self, Error> {
        let metadata = RowsMetadata::read(r, false)?;
        let columns: Vec<ColumnSpec> = if metadata.columns.is_empty() && metadata.column_count > 0
        {
            let known = known_columns.ok_or_else(|| {
                Error::invalid("rows without metadata and no cached column types")
            })?;
            if known.len() != metadata.column_count {
                return Err(Error::invalid(format!(
                    "cached metadata has {} columns, result has {}",
                    known.len(),
                    metadata.column_count
                )));
            }
            known.to_vec()
        } else {
            metadata.columns
        };
        let columns: Arc<[ColumnSpec]> = columns.into();

        let count = usize::try_from(r.read_int()?).unwrap_or(0);
        if count > 0 && columns.is_empty() {
            return Err(Error::invalid(format!("{} rows with no columns", count)));
        }
        // Every cell carries at least its 4-byte length.
        let min_row_len = 4 * columns.len().max(1);
        let mut rows = Vec::with_capacity(count.min(r.remaining() / min_row_len));
        for _ in 0..count {
            let mut values = Vec::with_capacity(columns.len());
            for col in columns.iter() {
                let cell = r.read_bytes()?;
                values.push(codec::decode(cell, &col.ty, version)?);
            }
            rows.push(Row::new(columns.clone(), values));
        }

        Ok(Self {
            columns,
            rows,
            paging_state: metadata.paging_state,
        })
    }

    fn write(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), Error> {
        let metadata = RowsMetadata {
            column_count: self.columns.len(),
            columns: self.columns.to_vec(),
            paging_state: self.paging_state.clone(),
            pk_indexes: Vec::new(),
        };
        metadata.write(buf, false)?;
        wire::put_int(buf, wire::int_len(self.rows.len(), "rows")?);
        for row in &self.rows {
            for (value, col) in row.values.iter().zip(self.columns.iter()) {
                codec::write_value(buf, value, &col.ty, version)?;
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Rows {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// Server response to PREPARE.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub id: Vec<u8>,
    /// Bind markers, in order.
    pub bind: RowsMetadata,
    /// Result columns; empty for statements that return no rows.
    pub result: RowsMetadata,
}

impl Prepared {
    fn read(r: &mut Reader<'_>, version: ProtocolVersion) -> Result<Self, Error> {
        let id = r.read_short_bytes()?.to_vec();
        let bind = RowsMetadata::read(r, version >= ProtocolVersion::V4)?;
        let result = if version == ProtocolVersion::V2 && r.is_empty() {
            RowsMetadata::default()
        } else {
            RowsMetadata::read(r, false)?
        };
        Ok(Self { id, bind, result })
    }

    fn write(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), Error> {
        wire::put_short_bytes(buf, &self.id)?;
        self.bind.write(buf, version >= ProtocolVersion::V4)?;
        self.result.write(buf, false)
    }
}

/// A decoded RESULT message.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Void,
    Rows(Rows),
    SetKeyspace(String),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

impl QueryResult {
    pub fn parse(
        body: &[u8],
        version: ProtocolVersion,
        known_columns: Option<&[ColumnSpec]>,
    ) -> Result<Self, Error> {
        use result_kinds::*;

        let mut r = Reader::new(body);
        let kind = r.read_int()?;
        let result = match kind {
            VOID => QueryResult::Void,
            ROWS => QueryResult::Rows(Rows::read(&mut r, version, known_columns)?),
            SET_KEYSPACE => QueryResult::SetKeyspace(r.read_string()?.to_owned()),
            PREPARED => QueryResult::Prepared(Prepared::read(&mut r, version)?),
            SCHEMA_CHANGE => QueryResult::SchemaChange(SchemaChange::read(&mut r, version)?),
            other => return Err(Error::invalid(format!("unknown result kind {}", other))),
        };
        r.finish("result body")?;
        Ok(result)
    }

    pub fn write(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), Error> {
        use result_kinds::*;

        match self {
            QueryResult::Void => buf.put_i32(VOID),
            QueryResult::Rows(rows) => {
                buf.put_i32(ROWS);
                rows.write(buf, version)?;
            }
            QueryResult::SetKeyspace(ks) => {
                buf.put_i32(SET_KEYSPACE);
                wire::put_string(buf, ks)?;
            }
            QueryResult::Prepared(prepared) => {
                buf.put_i32(PREPARED);
                prepared.write(buf, version)?;
            }
            QueryResult::SchemaChange(change) => {
                buf.put_i32(SCHEMA_CHANGE);
                change.write(buf, version)?;
            }
        }
        Ok(())
    }

    pub fn rows(&self) -> Option<&Rows> {
        match self {
            QueryResult::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn into_rows(self) -> Option<Rows> {
        match self {
            QueryResult::Rows(rows) => Some(rows),
            _ => None,
        }
    }
}
