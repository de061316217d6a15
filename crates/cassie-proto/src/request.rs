//! Client-to-server messages.
//!
//! Bound values are carried pre-encoded: the caller runs them through the
//! codec against their declared types before building the request, so a
//! request body can always be serialized without type information.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};

use crate::consistency::Consistency;
use crate::event::EventType;
use crate::frame::{Opcode, ProtocolVersion};
use crate::wire::{self, Reader};
use crate::Error;

/// CQL version announced in STARTUP.
pub const CQL_VERSION: &str = "3.0.0";

/// QUERY/EXECUTE parameter flag bits.
pub mod query_flags {
    pub const VALUES: u8 = 0x01;
    pub const SKIP_METADATA: u8 = 0x02;
    pub const PAGE_SIZE: u8 = 0x04;
    pub const PAGING_STATE: u8 = 0x08;
    pub const SERIAL_CONSISTENCY: u8 = 0x10;
    pub const DEFAULT_TIMESTAMP: u8 = 0x20;
    pub const NAMED_VALUES: u8 = 0x40;
}

/// Encoded bound values; `None` entries are nulls.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Values {
    #[default]
    Empty,
    Positional(Vec<Option<Vec<u8>>>),
    Named(Vec<(String, Option<Vec<u8>>)>),
}

impl Values {
    pub fn len(&self) -> usize {
        match self {
            Values::Empty => 0,
            Values::Positional(v) => v.len(),
            Values::Named(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parameters shared by QUERY and EXECUTE.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryParameters {
    pub consistency: Consistency,
    pub values: Values,
    pub skip_metadata: bool,
    pub page_size: Option<i32>,
    pub paging_state: Option<Vec<u8>>,
    pub serial_consistency: Option<Consistency>,
    /// Client-side default timestamp in microseconds.
    pub timestamp: Option<i64>,
}

impl QueryParameters {
    fn flags(&self) -> u8 {
        use query_flags::*;
        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= VALUES;
            if matches!(self.values, Values::Named(_)) {
                flags |= NAMED_VALUES;
            }
        }
        if self.skip_metadata {
            flags |= SKIP_METADATA;
        }
        if self.page_size.is_some() {
            flags |= PAGE_SIZE;
        }
        if self.paging_state.is_some() {
            flags |= PAGING_STATE;
        }
        if self.serial_consistency.is_some() {
            flags |= SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= DEFAULT_TIMESTAMP;
        }
        flags
    }

    pub fn write(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), Error> {
        let flags = self.flags();
        if version == ProtocolVersion::V2
            && flags & (query_flags::DEFAULT_TIMESTAMP | query_flags::NAMED_VALUES) != 0
        {
            return Err(Error::invalid(
                "named values and client timestamps require protocol v3 or later",
            ));
        }

        wire::put_short(buf, self.consistency.code());
        buf.put_u8(flags);
        match &self.values {
            Values::Empty => {}
            Values::Positional(values) => {
                wire::put_short(buf, wire::short_len(values.len(), "values")?);
                for v in values {
                    wire::put_bytes(buf, v.as_deref())?;
                }
            }
            Values::Named(values) => {
                wire::put_short(buf, wire::short_len(values.len(), "values")?);
                for (name, v) in values {
                    wire::put_string(buf, name)?;
                    wire::put_bytes(buf, v.as_deref())?;
                }
            }
        }
        if let Some(size) = self.page_size {
            wire::put_int(buf, size);
        }
        if let Some(state) = &self.paging_state {
            wire::put_bytes(buf, Some(state.as_slice()))?;
        }
        if let Some(serial) = self.serial_consistency {
            wire::put_short(buf, serial.code());
        }
        if let Some(ts) = self.timestamp {
            wire::put_long(buf, ts);
        }
        Ok(())
    }

    pub fn read(r: &mut Reader<'_>) -> Result<Self, Error> {
        use query_flags::*;
        let consistency = Consistency::from_code(r.read_short()?)?;
        let flags = r.read_u8()?;

        let values = if flags & VALUES != 0 {
            let n = r.read_short()?;
            if flags & NAMED_VALUES != 0 {
                let mut named = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let name = r.read_string()?.to_owned();
                    named.push((name, r.read_bytes()?.map(<[u8]>::to_vec)));
                }
                Values::Named(named)
            } else {
                let positional = (0..n)
                    .map(|_| r.read_bytes().map(|v| v.map(<[u8]>::to_vec)))
                    .collect::<Result<_, _>>()?;
                Values::Positional(positional)
            }
        } else {
            Values::Empty
        };
        let page_size = if flags & PAGE_SIZE != 0 {
            Some(r.read_int()?)
        } else {
            None
        };
        let paging_state = if flags & PAGING_STATE != 0 {
            r.read_bytes()?.map(<[u8]>::to_vec)
        } else {
            None
        };
        let serial_consistency = if flags & SERIAL_CONSISTENCY != 0 {
            Some(Consistency::from_code(r.read_short()?)?)
        } else {
            None
        };
        let timestamp = if flags & DEFAULT_TIMESTAMP != 0 {
            Some(r.read_long()?)
        } else {
            None
        };

        Ok(Self {
            consistency,
            values,
            skip_metadata: flags & SKIP_METADATA != 0,
            page_size,
            paging_state,
            serial_consistency,
            timestamp,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchType {
    #[default]
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

impl BatchType {
    fn from_byte(b: u8) -> Result<Self, Error> {
        match b {
            0 => Ok(BatchType::Logged),
            1 => Ok(BatchType::Unlogged),
            2 => Ok(BatchType::Counter),
            other => Err(Error::invalid(format!("unknown batch type {}", other))),
        }
    }
}

/// What a batch entry runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchQuery {
    Query(String),
    Prepared(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub query: BatchQuery,
    pub values: Vec<Option<Vec<u8>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchRequest {
    pub batch_type: BatchType,
    pub entries: Vec<BatchEntry>,
    pub consistency: Consistency,
    pub serial_consistency: Option<Consistency>,
    pub timestamp: Option<i64>,
}

impl BatchRequest {
    fn write(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), Error> {
        buf.put_u8(self.batch_type as u8);
        wire::put_short(buf, wire::short_len(self.entries.len(), "batch")?);
        for entry in &self.entries {
            match &entry.query {
                BatchQuery::Query(text) => {
                    buf.put_u8(0);
                    wire::put_long_string(buf, text)?;
                }
                BatchQuery::Prepared(id) => {
                    buf.put_u8(1);
                    wire::put_short_bytes(buf, id)?;
                }
            }
            wire::put_short(buf, wire::short_len(entry.values.len(), "values")?);
            for v in &entry.values {
                wire::put_bytes(buf, v.as_deref())?;
            }
        }
        wire::put_short(buf, self.consistency.code());

        if version == ProtocolVersion::V2 {
            if self.serial_consistency.is_some() || self.timestamp.is_some() {
                return Err(Error::invalid(
                    "batch serial consistency and timestamp require protocol v3 or later",
                ));
            }
            return Ok(());
        }

        let mut flags = 0u8;
        if self.serial_consistency.is_some() {
            flags |= query_flags::SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= query_flags::DEFAULT_TIMESTAMP;
        }
        buf.put_u8(flags);
        if let Some(serial) = self.serial_consistency {
            wire::put_short(buf, serial.code());
        }
        if let Some(ts) = self.timestamp {
            wire::put_long(buf, ts);
        }
        Ok(())
    }

    fn read(r: &mut Reader<'_>, version: ProtocolVersion) -> Result<Self, Error> {
        let batch_type = BatchType::from_byte(r.read_u8()?)?;
        let n = r.read_short()?;
        let mut entries = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let query = match r.read_u8()? {
                0 => BatchQuery::Query(r.read_long_string()?.to_owned()),
                1 => BatchQuery::Prepared(r.read_short_bytes()?.to_vec()),
                other => return Err(Error::invalid(format!("unknown batch entry kind {}", other))),
            };
            let count = r.read_short()?;
            let values = (0..count)
                .map(|_| r.read_bytes().map(|v| v.map(<[u8]>::to_vec)))
                .collect::<Result<_, _>>()?;
            entries.push(BatchEntry { query, values });
        }
        let consistency = Consistency::from_code(r.read_short()?)?;
        let mut batch = BatchRequest {
            batch_type,
            entries,
            consistency,
            serial_consistency: None,
            timestamp: None,
        };
        if version == ProtocolVersion::V2 {
            return Ok(batch);
        }
        let flags = r.read_u8()?;
        if flags & query_flags::SERIAL_CONSISTENCY != 0 {
            batch.serial_consistency = Some(Consistency::from_code(r.read_short()?)?);
        }
        if flags & query_flags::DEFAULT_TIMESTAMP != 0 {
            batch.timestamp = Some(r.read_long()?);
        }
        Ok(batch)
    }
}

/// A request message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Startup { options: HashMap<String, String> },
    Options,
    Query { query: String, params: QueryParameters },
    Prepare { query: String },
    Execute { id: Vec<u8>, params: QueryParameters },
    Batch(BatchRequest),
    Register { events: Vec<EventType> },
    AuthResponse { token: Option<Vec<u8>> },
}

impl Request {
    /// STARTUP announcing the CQL version and, optionally, a compression.
    pub fn startup(compression: Option<crate::frame::Compression>) -> Self {
        let mut options = HashMap::new();
        options.insert("CQL_VERSION".to_string(), CQL_VERSION.to_string());
        if let Some(c) = compression {
            options.insert("COMPRESSION".to_string(), c.as_str().to_string());
        }
        Request::Startup { options }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Startup { .. } => Opcode::Startup,
            Request::Options => Opcode::Options,
            Request::Query { .. } => Opcode::Query,
            Request::Prepare { .. } => Opcode::Prepare,
            Request::Execute { .. } => Opcode::Execute,
            Request::Batch(_) => Opcode::Batch,
            Request::Register { .. } => Opcode::Register,
            Request::AuthResponse { .. } => Opcode::AuthResponse,
        }
    }

    /// Serializes the message body.
    pub fn serialize(&self, version: ProtocolVersion) -> Result<Vec<u8>, Error> {
        let mut buf = BytesMut::new();
        match self {
            Request::Startup { options } => wire::put_string_map(&mut buf, options)?,
            Request::Options => {}
            Request::Query { query, params } => {
                wire::put_long_string(&mut buf, query)?;
                params.write(&mut buf, version)?;
            }
            Request::Prepare { query } => wire::put_long_string(&mut buf, query)?,
            Request::Execute { id, params } => {
                wire::put_short_bytes(&mut buf, id)?;
                params.write(&mut buf, version)?;
            }
            Request::Batch(batch) => batch.write(&mut buf, version)?,
            Request::Register { events } => {
                let names: Vec<String> = events.iter().map(|e| e.as_str().to_string()).collect();
                wire::put_string_list(&mut buf, &names)?;
            }
            Request::AuthResponse { token } => wire::put_bytes(&mut buf, token.as_deref())?,
        }
        Ok(buf.to_vec())
    }

    /// Parses a request body; the server side of the codec.
    pub fn parse(opcode: Opcode, body: &[u8], version: ProtocolVersion) -> Result<Self, Error> {
        let mut r = Reader::new(body);
        let request = match opcode {
            Opcode::Startup => Request::Startup {
                options: r.read_string_map()?,
            },
            Opcode::Options => Request::Options,
            Opcode::Query => Request::Query {
                query: r.read_long_string()?.to_owned(),
                params: QueryParameters::read(&mut r)?,
            },
            Opcode::Prepare => Request::Prepare {
                query: r.read_long_string()?.to_owned(),
            },
            Opcode::Execute => Request::Execute {
                id: r.read_short_bytes()?.to_vec(),
                params: QueryParameters::read(&mut r)?,
            },
            Opcode::Batch => Request::Batch(BatchRequest::read(&mut r, version)?),
            Opcode::Register => Request::Register {
                events: r
                    .read_string_list()?
                    .iter()
                    .map(|s| EventType::parse(s))
                    .collect::<Result<_, _>>()?,
            },
            Opcode::AuthResponse => Request::AuthResponse {
                token: r.read_bytes()?.map(<[u8]>::to_vec),
            },
            other => {
                return Err(Error::invalid(format!("{:?} is not a request opcode", other)));
            }
        };
        r.finish("request body")?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(request: &Request, version: ProtocolVersion) -> Request {
        let body = request.serialize(version).unwrap();
        Request::parse(request.opcode(), &body, version).unwrap()
    }

    #[test]
    fn test_query_layout() {
        let request = Request::Query {
            query: "SELECT 1".into(),
            params: QueryParameters {
                consistency: Consistency::One,
                values: Values::Positional(vec![Some(vec![0, 0, 0, 42]), None]),
                ..Default::default()
            },
        };
        let body = request.serialize(ProtocolVersion::V4).unwrap();
        let mut expected = vec![0, 0, 0, 8];
        expected.extend_from_slice(b"SELECT 1");
        expected.extend_from_slice(&[0x00, 0x01, query_flags::VALUES, 0x00, 0x02]);
        expected.extend_from_slice(&[0, 0, 0, 4, 0, 0, 0, 42]);
        expected.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(body, expected);
    }

    #[test]
    fn test_full_parameters_roundtrip() {
        let request = Request::Execute {
            id: vec![1, 2, 3],
            params: QueryParameters {
                consistency: Consistency::LocalQuorum,
                values: Values::Named(vec![("id".into(), Some(vec![7]))]),
                skip_metadata: true,
                page_size: Some(100),
                paging_state: Some(vec![9, 9]),
                serial_consistency: Some(Consistency::LocalSerial),
                timestamp: Some(1_700_000_000_000_000),
            },
        };
        assert_eq!(roundtrip(&request, ProtocolVersion::V4), request);
    }

    #[test]
    fn test_v2_rejects_named_values() {
        let request = Request::Query {
            query: "SELECT * FROM t WHERE id = :id".into(),
            params: QueryParameters {
                values: Values::Named(vec![("id".into(), None)]),
                ..Default::default()
            },
        };
        assert!(request.serialize(ProtocolVersion::V2).is_err());
        assert!(request.serialize(ProtocolVersion::V3).is_ok());
    }

    #[test]
    fn test_batch_roundtrip_by_version() {
        let batch = BatchRequest {
            batch_type: BatchType::Unlogged,
            entries: vec![
                BatchEntry {
                    query: BatchQuery::Query("INSERT INTO t (k) VALUES (?)".into()),
                    values: vec![Some(vec![0, 0, 0, 1])],
                },
                BatchEntry {
                    query: BatchQuery::Prepared(vec![0xAB]),
                    values: vec![None],
                },
            ],
            consistency: Consistency::Quorum,
            serial_consistency: None,
            timestamp: None,
        };
        let request = Request::Batch(batch.clone());
        assert_eq!(roundtrip(&request, ProtocolVersion::V2), request);

        let request = Request::Batch(BatchRequest {
            timestamp: Some(5),
            ..batch
        });
        assert_eq!(roundtrip(&request, ProtocolVersion::V4), request);
        assert!(request.serialize(ProtocolVersion::V2).is_err());
    }

    #[test]
    fn test_startup_options() {
        let request = Request::startup(Some(crate::frame::Compression::Lz4));
        match roundtrip(&request, ProtocolVersion::V4) {
            Request::Startup { options } => {
                assert_eq!(options.get("CQL_VERSION").map(String::as_str), Some(CQL_VERSION));
                assert_eq!(options.get("COMPRESSION").map(String::as_str), Some("lz4"));
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_register_roundtrip() {
        let request = Request::Register {
            events: vec![EventType::StatusChange, EventType::SchemaChange],
        };
        assert_eq!(roundtrip(&request, ProtocolVersion::V3), request);
    }
}
