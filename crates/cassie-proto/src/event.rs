//! Server-pushed events and schema change descriptions.

use std::net::SocketAddr;

use bytes::BytesMut;

use crate::frame::ProtocolVersion;
use crate::wire::{self, Reader};
use crate::Error;

/// Event categories a client can REGISTER for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    TopologyChange,
    StatusChange,
    SchemaChange,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::TopologyChange => "TOPOLOGY_CHANGE",
            EventType::StatusChange => "STATUS_CHANGE",
            EventType::SchemaChange => "SCHEMA_CHANGE",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "TOPOLOGY_CHANGE" => Ok(EventType::TopologyChange),
            "STATUS_CHANGE" => Ok(EventType::StatusChange),
            "SCHEMA_CHANGE" => Ok(EventType::SchemaChange),
            other => Err(Error::invalid(format!("unknown event type '{}'", other))),
        }
    }
}

/// Description of a schema modification.
///
/// Protocol v2 only reports keyspace and table; later versions add a target
/// kind and, for functions and aggregates, argument types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    /// `CREATED`, `UPDATED` or `DROPPED`.
    pub change: String,
    /// `KEYSPACE`, `TABLE`, `TYPE`, `FUNCTION` or `AGGREGATE`.
    pub target: String,
    pub keyspace: String,
    /// Name of the changed object; `None` for keyspace changes.
    pub name: Option<String>,
    pub arguments: Vec<String>,
}

impl SchemaChange {
    pub fn read(r: &mut Reader<'_>, version: ProtocolVersion) -> Result<Self, Error> {
        let change = r.read_string()?.to_owned();
        if version == ProtocolVersion::V2 {
            let keyspace = r.read_string()?.to_owned();
            let table = r.read_string()?.to_owned();
            let (target, name) = if table.is_empty() {
                ("KEYSPACE".to_string(), None)
            } else {
                ("TABLE".to_string(), Some(table))
            };
            return Ok(Self {
                change,
                target,
                keyspace,
                name,
                arguments: Vec::new(),
            });
        }

        let target = r.read_string()?.to_owned();
        let keyspace = r.read_string()?.to_owned();
        let (name, arguments) = match target.as_str() {
            "KEYSPACE" => (None, Vec::new()),
            "TABLE" | "TYPE" => (Some(r.read_string()?.to_owned()), Vec::new()),
            "FUNCTION" | "AGGREGATE" => {
                let name = r.read_string()?.to_owned();
                (Some(name), r.read_string_list()?)
            }
            other => {
                return Err(Error::invalid(format!(
                    "unknown schema change target '{}'",
                    other
                )))
            }
        };
        Ok(Self {
            change,
            target,
            keyspace,
            name,
            arguments,
        })
    }

    pub fn write(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), Error> {
        wire::put_string(buf, &self.change)?;
        if version == ProtocolVersion::V2 {
            wire::put_string(buf, &self.keyspace)?;
            return wire::put_string(buf, self.name.as_deref().unwrap_or(""));
        }
        wire::put_string(buf, &self.target)?;
        wire::put_string(buf, &self.keyspace)?;
        if let Some(name) = &self.name {
            wire::put_string(buf, name)?;
        }
        if matches!(self.target.as_str(), "FUNCTION" | "AGGREGATE") {
            wire::put_string_list(buf, &self.arguments)?;
        }
        Ok(())
    }
}

/// A decoded EVENT message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TopologyChange { change: String, address: SocketAddr },
    StatusChange { change: String, address: SocketAddr },
    SchemaChange(SchemaChange),
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::TopologyChange { .. } => EventType::TopologyChange,
            Event::StatusChange { .. } => EventType::StatusChange,
            Event::SchemaChange(_) => EventType::SchemaChange,
        }
    }

    pub fn parse(body: &[u8], version: ProtocolVersion) -> Result<Self, Error> {
        let mut r = Reader::new(body);
        let kind = EventType::parse(r.read_string()?)?;
        Ok(match kind {
            EventType::TopologyChange => Event::TopologyChange {
                change: r.read_string()?.to_owned(),
                address: r.read_inet()?,
            },
            EventType::StatusChange => Event::StatusChange {
                change: r.read_string()?.to_owned(),
                address: r.read_inet()?,
            },
            EventType::SchemaChange => Event::SchemaChange(SchemaChange::read(&mut r, version)?),
        })
    }

    pub fn write(&self, buf: &mut BytesMut, version: ProtocolVersion) -> Result<(), Error> {
        wire::put_string(buf, self.event_type().as_str())?;
        match self {
            Event::TopologyChange { change, address } | Event::StatusChange { change, address } => {
                wire::put_string(buf, change)?;
                wire::put_inet(buf, address);
                Ok(())
            }
            Event::SchemaChange(change) => change.write(buf, version),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_change_event() {
        let event = Event::StatusChange {
            change: "DOWN".into(),
            address: "127.0.0.2:9042".parse().unwrap(),
        };
        let mut buf = BytesMut::new();
        event.write(&mut buf, ProtocolVersion::V4).unwrap();
        assert_eq!(Event::parse(&buf, ProtocolVersion::V4).unwrap(), event);
    }

    #[test]
    fn test_schema_change_function() {
        let change = SchemaChange {
            change: "CREATED".into(),
            target: "FUNCTION".into(),
            keyspace: "ks".into(),
            name: Some("plus".into()),
            arguments: vec!["int".into(), "int".into()],
        };
        let event = Event::SchemaChange(change);
        let mut buf = BytesMut::new();
        event.write(&mut buf, ProtocolVersion::V4).unwrap();
        assert_eq!(Event::parse(&buf, ProtocolVersion::V4).unwrap(), event);
    }

    #[test]
    fn test_schema_change_v2_keyspace() {
        let mut buf = BytesMut::new();
        wire::put_string(&mut buf, "DROPPED").unwrap();
        wire::put_string(&mut buf, "ks").unwrap();
        wire::put_string(&mut buf, "").unwrap();

        let change = SchemaChange::read(&mut Reader::new(&buf), ProtocolVersion::V2).unwrap();
        assert_eq!(change.target, "KEYSPACE");
        assert_eq!(change.name, None);
    }
}
