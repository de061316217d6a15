//! Column types (`[option]` in the protocol notation).

use bytes::{BufMut, BytesMut};

use crate::wire::{self, Reader};
use crate::Error;

/// Type ids as they appear on the wire.
pub mod type_ids {
    pub const CUSTOM: u16 = 0x0000;
    pub const ASCII: u16 = 0x0001;
    pub const BIGINT: u16 = 0x0002;
    pub const BLOB: u16 = 0x0003;
    pub const BOOLEAN: u16 = 0x0004;
    pub const COUNTER: u16 = 0x0005;
    pub const DECIMAL: u16 = 0x0006;
    pub const DOUBLE: u16 = 0x0007;
    pub const FLOAT: u16 = 0x0008;
    pub const INT: u16 = 0x0009;
    pub const TIMESTAMP: u16 = 0x000B;
    pub const UUID: u16 = 0x000C;
    pub const VARCHAR: u16 = 0x000D;
    pub const VARINT: u16 = 0x000E;
    pub const TIMEUUID: u16 = 0x000F;
    pub const INET: u16 = 0x0010;
    pub const DATE: u16 = 0x0011;
    pub const TIME: u16 = 0x0012;
    pub const SMALLINT: u16 = 0x0013;
    pub const TINYINT: u16 = 0x0014;
    pub const LIST: u16 = 0x0020;
    pub const MAP: u16 = 0x0021;
    pub const SET: u16 = 0x0022;
    pub const UDT: u16 = 0x0030;
    pub const TUPLE: u16 = 0x0031;
}

/// Definition of a user-defined type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UdtDef {
    pub keyspace: String,
    pub name: String,
    /// Field names and types, in declaration order.
    pub fields: Vec<(String, ColumnType)>,
}

/// A declared column type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// Server-side custom type, identified by its Java class name.
    Custom(String),
    Ascii,
    BigInt,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Timestamp,
    Uuid,
    Text,
    Varint,
    Timeuuid,
    Inet,
    Date,
    Time,
    SmallInt,
    TinyInt,
    List(Box<ColumnType>),
    Set(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Udt(Box<UdtDef>),
    Tuple(Vec<ColumnType>),
}

impl ColumnType {
    /// Protocol type id.
    pub fn id(&self) -> u16 {
        use type_ids::*;
        match self {
            ColumnType::Custom(_) => CUSTOM,
            ColumnType::Ascii => ASCII,
            ColumnType::BigInt => BIGINT,
            ColumnType::Blob => BLOB,
            ColumnType::Boolean => BOOLEAN,
            ColumnType::Counter => COUNTER,
            ColumnType::Decimal => DECIMAL,
            ColumnType::Double => DOUBLE,
            ColumnType::Float => FLOAT,
            ColumnType::Int => INT,
            ColumnType::Timestamp => TIMESTAMP,
            ColumnType::Uuid => UUID,
            ColumnType::Text => VARCHAR,
            ColumnType::Varint => VARINT,
            ColumnType::Timeuuid => TIMEUUID,
            ColumnType::Inet => INET,
            ColumnType::Date => DATE,
            ColumnType::Time => TIME,
            ColumnType::SmallInt => SMALLINT,
            ColumnType::TinyInt => TINYINT,
            ColumnType::List(_) => LIST,
            ColumnType::Set(_) => SET,
            ColumnType::Map(_, _) => MAP,
            ColumnType::Udt(_) => UDT,
            ColumnType::Tuple(_) => TUPLE,
        }
    }

    pub fn list(element: ColumnType) -> Self {
        ColumnType::List(Box::new(element))
    }

    pub fn set(element: ColumnType) -> Self {
        ColumnType::Set(Box::new(element))
    }

    pub fn map(key: ColumnType, value: ColumnType) -> Self {
        ColumnType::Map(Box::new(key), Box::new(value))
    }

    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            ColumnType::List(_) | ColumnType::Set(_) | ColumnType::Map(_, _)
        )
    }

    /// Reads an `[option]` type descriptor.
    pub fn read(r: &mut Reader<'_>) -> Result<Self, Error> {
        use type_ids::*;
        let id = r.read_short()?;
        Ok(match id {
            CUSTOM => ColumnType::Custom(r.read_string()?.to_owned()),
            ASCII => ColumnType::Ascii,
            BIGINT => ColumnType::BigInt,
            BLOB => ColumnType::Blob,
            BOOLEAN => ColumnType::Boolean,
            COUNTER => ColumnType::Counter,
            DECIMAL => ColumnType::Decimal,
            DOUBLE => ColumnType::Double,
            FLOAT => ColumnType::Float,
            INT => ColumnType::Int,
            TIMESTAMP => ColumnType::Timestamp,
            UUID => ColumnType::Uuid,
            VARCHAR => ColumnType::Text,
            VARINT => ColumnType::Varint,
            TIMEUUID => ColumnType::Timeuuid,
            INET => ColumnType::Inet,
            DATE => ColumnType::Date,
            TIME => ColumnType::Time,
            SMALLINT => ColumnType::SmallInt,
            TINYINT => ColumnType::TinyInt,
            LIST => ColumnType::list(Self::read(r)?),
            SET => ColumnType::set(Self::read(r)?),
            MAP => {
                let key = Self::read(r)?;
                let value = Self::read(r)?;
                ColumnType::map(key, value)
            }
            UDT => {
                let keyspace = r.read_string()?.to_owned();
                let name = r.read_string()?.to_owned();
                let n = r.read_short()?;
                let mut fields = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let field = r.read_string()?.to_owned();
                    fields.push((field, Self::read(r)?));
                }
                ColumnType::Udt(Box::new(UdtDef {
                    keyspace,
                    name,
                    fields,
                }))
            }
            TUPLE => {
                let n = r.read_short()?;
                let elements = (0..n).map(|_| Self::read(r)).collect::<Result<_, _>>()?;
                ColumnType::Tuple(elements)
            }
            // 0x000A was varchar's former alias "text" in protocol v1.
            0x000A => ColumnType::Text,
            other => {
                return Err(Error::invalid(format!("unknown type id 0x{:04x}", other)));
            }
        })
    }

    /// Writes an `[option]` type descriptor.
    pub fn write(&self, buf: &mut BytesMut) -> Result<(), Error> {
        buf.put_u16(self.id());
        match self {
            ColumnType::Custom(class) => wire::put_string(buf, class)?,
            ColumnType::List(e) | ColumnType::Set(e) => e.write(buf)?,
            ColumnType::Map(k, v) => {
                k.write(buf)?;
                v.write(buf)?;
            }
            ColumnType::Udt(def) => {
                wire::put_string(buf, &def.keyspace)?;
                wire::put_string(buf, &def.name)?;
                buf.put_u16(wire::short_len(def.fields.len(), "udt fields")?);
                for (name, ty) in &def.fields {
                    wire::put_string(buf, name)?;
                    ty.write(buf)?;
                }
            }
            ColumnType::Tuple(elements) => {
                buf.put_u16(wire::short_len(elements.len(), "tuple")?);
                for ty in elements {
                    ty.write(buf)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::Custom(class) => write!(f, "'{}'", class),
            ColumnType::Ascii => f.write_str("ascii"),
            ColumnType::BigInt => f.write_str("bigint"),
            ColumnType::Blob => f.write_str("blob"),
            ColumnType::Boolean => f.write_str("boolean"),
            ColumnType::Counter => f.write_str("counter"),
            ColumnType::Decimal => f.write_str("decimal"),
            ColumnType::Double => f.write_str("double"),
            ColumnType::Float => f.write_str("float"),
            ColumnType::Int => f.write_str("int"),
            ColumnType::Timestamp => f.write_str("timestamp"),
            ColumnType::Uuid => f.write_str("uuid"),
            ColumnType::Text => f.write_str("text"),
            ColumnType::Varint => f.write_str("varint"),
            ColumnType::Timeuuid => f.write_str("timeuuid"),
            ColumnType::Inet => f.write_str("inet"),
            ColumnType::Date => f.write_str("date"),
            ColumnType::Time => f.write_str("time"),
            ColumnType::SmallInt => f.write_str("smallint"),
            ColumnType::TinyInt => f.write_str("tinyint"),
            ColumnType::List(e) => write!(f, "list<{}>", e),
            ColumnType::Set(e) => write!(f, "set<{}>", e),
            ColumnType::Map(k, v) => write!(f, "map<{}, {}>", k, v),
            ColumnType::Udt(def) => write!(f, "{}.{}", def.keyspace, def.name),
            ColumnType::Tuple(elements) => {
                f.write_str("tuple<")?;
                for (i, e) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                f.write_str(">")
            }
        }
    }
}
