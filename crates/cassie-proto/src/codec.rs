//! Type codec: conversion between [`Value`]s and their wire payloads.
//!
//! Both directions always work against a declared [`ColumnType`]. Encoding a
//! value that cannot satisfy the declared type fails with `TypeEncode`;
//! decoding fails with `TypeDecode` whenever the byte length disagrees with
//! what the type and its inner length fields predict.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use num_bigint::BigInt;
use uuid::Uuid;

use crate::frame::ProtocolVersion;
use crate::types::ColumnType;
use crate::value::{Date, Decimal, Time, Value};
use crate::wire::Reader;
use crate::Error;

/// Encodes a value as the payload of the declared type. `Null` yields `None`.
pub fn encode(
    value: &Value,
    ty: &ColumnType,
    version: ProtocolVersion,
) -> Result<Option<Vec<u8>>, Error> {
    if value.is_null() {
        return Ok(None);
    }
    let mut buf = BytesMut::new();
    encode_into(&mut buf, value, ty, version)?;
    Ok(Some(buf.to_vec()))
}

/// Decodes a payload of the declared type. `None` (a null cell) yields `Null`.
pub fn decode(
    bytes: Option<&[u8]>,
    ty: &ColumnType,
    version: ProtocolVersion,
) -> Result<Value, Error> {
    match bytes {
        None => Ok(Value::Null),
        Some(b) => decode_payload(b, ty, version),
    }
}

/// Writes `[bytes]` (length prefix + payload) for a bound value.
pub fn write_value(
    buf: &mut BytesMut,
    value: &Value,
    ty: &ColumnType,
    version: ProtocolVersion,
) -> Result<(), Error> {
    if value.is_null() {
        buf.put_i32(-1);
        return Ok(());
    }
    let start = buf.len();
    buf.put_i32(0);
    encode_into(buf, value, ty, version)?;
    let len = payload_len(buf.len() - start - 4)?;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

fn payload_len(len: usize) -> Result<i32, Error> {
    i32::try_from(len).map_err(|_| Error::encode(format!("value too large: {} bytes", len)))
}

fn mismatch(value: &Value, ty: &ColumnType) -> Error {
    Error::encode(format!("cannot encode {:?} as {}", value, ty))
}

/// Minimal big-endian two's-complement bytes of an arbitrary integer.
pub fn varint_bytes(v: &BigInt) -> Vec<u8> {
    v.to_signed_bytes_be()
}

fn encode_into(
    buf: &mut BytesMut,
    value: &Value,
    ty: &ColumnType,
    version: ProtocolVersion,
) -> Result<(), Error> {
    match (ty, value) {
        (ColumnType::Boolean, Value::Boolean(b)) => buf.put_u8(u8::from(*b)),

        (ColumnType::TinyInt, _) => buf.put_i8(narrow_int::<i8>(value, ty)?),
        (ColumnType::SmallInt, _) => buf.put_i16(narrow_int::<i16>(value, ty)?),
        (ColumnType::Int, _) => buf.put_i32(narrow_int::<i32>(value, ty)?),
        (ColumnType::BigInt | ColumnType::Counter, _) => buf.put_i64(narrow_int::<i64>(value, ty)?),
        (ColumnType::Timestamp, Value::Timestamp(ms)) => buf.put_i64(*ms),

        (ColumnType::Float, Value::Float(f)) => buf.put_f32(*f),
        (ColumnType::Double, Value::Double(f)) => buf.put_f64(*f),

        (ColumnType::Varint, _) => {
            let v = match value {
                Value::Varint(v) => v.clone(),
                other => BigInt::from(narrow_int::<i64>(other, ty)?),
            };
            buf.put_slice(&varint_bytes(&v));
        }
        (ColumnType::Decimal, Value::Decimal(d)) => {
            buf.put_i32(d.scale());
            buf.put_slice(&varint_bytes(d.unscaled()));
        }

        (ColumnType::Text, Value::Text(s) | Value::Ascii(s)) => buf.put_slice(s.as_bytes()),
        (ColumnType::Ascii, Value::Text(s) | Value::Ascii(s)) => {
            if !s.is_ascii() {
                return Err(Error::encode(format!("'{}' is not ascii", s)));
            }
            buf.put_slice(s.as_bytes());
        }
        (ColumnType::Blob | ColumnType::Custom(_), Value::Blob(b)) => buf.put_slice(b),

        (ColumnType::Uuid, Value::Uuid(u) | Value::Timeuuid(u)) => buf.put_slice(u.as_bytes()),
        (ColumnType::Timeuuid, Value::Uuid(u) | Value::Timeuuid(u)) => {
            if u.get_version_num() != 1 {
                return Err(Error::encode(format!("{} is not a time-based uuid", u)));
            }
            buf.put_slice(u.as_bytes());
        }

        (ColumnType::Date, Value::Date(d)) => buf.put_u32(d.raw()),
        (ColumnType::Time, Value::Time(t)) => buf.put_i64(t.nanos() as i64),

        (ColumnType::Inet, Value::Inet(IpAddr::V4(ip))) => buf.put_slice(&ip.octets()),
        (ColumnType::Inet, Value::Inet(IpAddr::V6(ip))) => buf.put_slice(&ip.octets()),

        (ColumnType::List(elem), Value::List(items))
        | (ColumnType::Set(elem), Value::Set(items))
        | (ColumnType::Set(elem), Value::List(items)) => {
            write_count(buf, items.len(), version)?;
            for item in items {
                write_element(buf, item, elem, version)?;
            }
        }
        (ColumnType::Map(kt, vt), Value::Map(entries)) => {
            write_count(buf, entries.len(), version)?;
            for (k, v) in entries {
                write_element(buf, k, kt, version)?;
                write_element(buf, v, vt, version)?;
            }
        }

        (ColumnType::Tuple(types), Value::Tuple(items)) => {
            if items.len() > types.len() {
                return Err(Error::encode(format!(
                    "tuple has {} elements, type {} declares {}",
                    items.len(),
                    ty,
                    types.len()
                )));
            }
            for (i, et) in types.iter().enumerate() {
                write_value(buf, items.get(i).unwrap_or(&Value::Null), et, version)?;
            }
        }
        (ColumnType::Udt(def), Value::Udt(fields)) => {
            if let Some((unknown, _)) = fields
                .iter()
                .find(|(name, _)| !def.fields.iter().any(|(f, _)| f == name))
            {
                return Err(Error::encode(format!(
                    "type {} has no field '{}'",
                    ty, unknown
                )));
            }
            for (name, ft) in &def.fields {
                let v = fields
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| v)
                    .unwrap_or(&Value::Null);
                write_value(buf, v, ft, version)?;
            }
        }

        _ => return Err(mismatch(value, ty)),
    }
    Ok(())
}

/// Integer conversion for the fixed-width types: any integer variant whose
/// value fits the declared width is accepted.
fn narrow_int<T: TryFrom<i64>>(value: &Value, ty: &ColumnType) -> Result<T, Error> {
    let wide = match value {
        Value::TinyInt(_) | Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) | Value::Counter(_) => {
            value.as_i64()
        }
        _ => None,
    }
    .ok_or_else(|| mismatch(value, ty))?;
    T::try_from(wide).map_err(|_| Error::encode(format!("{} out of range for {}", wide, ty)))
}

fn write_count(buf: &mut BytesMut, n: usize, version: ProtocolVersion) -> Result<(), Error> {
    if version.uses_wide_collections() {
        buf.put_i32(payload_len(n)?);
    } else {
        let n = u16::try_from(n)
            .map_err(|_| Error::encode(format!("collection of {} elements too large", n)))?;
        buf.put_u16(n);
    }
    Ok(())
}

fn write_element(
    buf: &mut BytesMut,
    value: &Value,
    ty: &ColumnType,
    version: ProtocolVersion,
) -> Result<(), Error> {
    if value.is_null() {
        return Err(Error::encode("collections cannot contain null"));
    }
    if version.uses_wide_collections() {
        return write_value(buf, value, ty, version);
    }
    let start = buf.len();
    buf.put_u16(0);
    encode_into(buf, value, ty, version)?;
    let len = buf.len() - start - 2;
    let len = u16::try_from(len)
        .map_err(|_| Error::encode(format!("collection element too large: {} bytes", len)))?;
    buf[start..start + 2].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

fn fixed<const N: usize>(bytes: &[u8], ty: &ColumnType) -> Result<[u8; N], Error> {
    bytes.try_into().map_err(|_| {
        Error::decode(format!(
            "{} expects {} bytes, got {}",
            ty,
            N,
            bytes.len()
        ))
    })
}

fn decode_payload(bytes: &[u8], ty: &ColumnType, version: ProtocolVersion) -> Result<Value, Error> {
    Ok(match ty {
        ColumnType::Boolean => Value::Boolean(fixed::<1>(bytes, ty)?[0] != 0),
        ColumnType::TinyInt => Value::TinyInt(i8::from_be_bytes(fixed(bytes, ty)?)),
        ColumnType::SmallInt => Value::SmallInt(i16::from_be_bytes(fixed(bytes, ty)?)),
        ColumnType::Int => Value::Int(i32::from_be_bytes(fixed(bytes, ty)?)),
        ColumnType::BigInt => Value::BigInt(i64::from_be_bytes(fixed(bytes, ty)?)),
        ColumnType::Counter => Value::Counter(i64::from_be_bytes(fixed(bytes, ty)?)),
        ColumnType::Timestamp => Value::Timestamp(i64::from_be_bytes(fixed(bytes, ty)?)),
        ColumnType::Float => Value::Float(f32::from_be_bytes(fixed(bytes, ty)?)),
        ColumnType::Double => Value::Double(f64::from_be_bytes(fixed(bytes, ty)?)),
        ColumnType::Varint => Value::Varint(decode_varint(bytes)?),
        ColumnType::Decimal => {
            if bytes.len() < 5 {
                return Err(Error::decode(format!(
                    "decimal needs at least 5 bytes, got {}",
                    bytes.len()
                )));
            }
            let scale = i32::from_be_bytes(fixed(&bytes[..4], &ColumnType::Int)?);
            Value::Decimal(Decimal::new(decode_varint(&bytes[4..])?, scale))
        }
        ColumnType::Text => Value::Text(
            String::from_utf8(bytes.to_vec())
                .map_err(|e| Error::decode(format!("invalid utf-8 text: {}", e)))?,
        ),
        ColumnType::Ascii => {
            if !bytes.is_ascii() {
                return Err(Error::decode("non-ascii bytes in ascii column"));
            }
            Value::Ascii(String::from_utf8_lossy(bytes).into_owned())
        }
        ColumnType::Blob | ColumnType::Custom(_) => Value::Blob(bytes.to_vec()),
        ColumnType::Uuid => Value::Uuid(Uuid::from_bytes(fixed(bytes, ty)?)),
        ColumnType::Timeuuid => Value::Timeuuid(Uuid::from_bytes(fixed(bytes, ty)?)),
        ColumnType::Date => Value::Date(Date::from_raw(u32::from_be_bytes(fixed(bytes, ty)?))),
        ColumnType::Time => {
            let nanos = i64::from_be_bytes(fixed(bytes, ty)?);
            let nanos = u64::try_from(nanos)
                .map_err(|_| Error::decode(format!("negative time {}", nanos)))?;
            Value::Time(Time::from_nanos(nanos).map_err(|e| Error::decode(e.to_string()))?)
        }
        ColumnType::Inet => match bytes.len() {
            4 => Value::Inet(IpAddr::V4(Ipv4Addr::from(fixed::<4>(bytes, ty)?))),
            16 => Value::Inet(IpAddr::V6(Ipv6Addr::from(fixed::<16>(bytes, ty)?))),
            n => return Err(Error::decode(format!("inet expects 4 or 16 bytes, got {}", n))),
        },
        ColumnType::List(elem) => Value::List(decode_elements(bytes, elem, version)?),
        ColumnType::Set(elem) => Value::Set(decode_elements(bytes, elem, version)?),
        ColumnType::Map(kt, vt) => {
            let mut r = Reader::for_value(bytes);
            let n = read_count(&mut r, version)?;
            let mut entries = Vec::with_capacity(n.min(r.remaining()));
            for _ in 0..n {
                let k = read_element(&mut r, kt, version)?;
                let v = read_element(&mut r, vt, version)?;
                entries.push((k, v));
            }
            r.finish("map")?;
            Value::Map(entries)
        }
        ColumnType::Tuple(types) => {
            let mut r = Reader::for_value(bytes);
            let items = types
                .iter()
                .map(|et| decode(r.read_bytes()?, et, version))
                .collect::<Result<Vec<_>, _>>()?;
            r.finish("tuple")?;
            Value::Tuple(items)
        }
        ColumnType::Udt(def) => {
            let mut r = Reader::for_value(bytes);
            let mut fields = Vec::with_capacity(def.fields.len());
            for (name, ft) in &def.fields {
                // Values written before a field was added simply end early.
                let v = if r.is_empty() {
                    Value::Null
                } else {
                    decode(r.read_bytes()?, ft, version)?
                };
                fields.push((name.clone(), v));
            }
            r.finish("udt")?;
            Value::Udt(fields)
        }
    })
}

fn decode_varint(bytes: &[u8]) -> Result<BigInt, Error> {
    if bytes.is_empty() {
        return Err(Error::decode("varint payload is empty"));
    }
    Ok(BigInt::from_signed_bytes_be(bytes))
}

fn read_count(r: &mut Reader<'_>, version: ProtocolVersion) -> Result<usize, Error> {
    if version.uses_wide_collections() {
        let n = r.read_int()?;
        usize::try_from(n).map_err(|_| Error::decode(format!("negative collection size {}", n)))
    } else {
        Ok(r.read_short()? as usize)
    }
}

fn read_element(r: &mut Reader<'_>, ty: &ColumnType, version: ProtocolVersion) -> Result<Value, Error> {
    match r.read_value_bytes(version.uses_wide_collections())? {
        Some(b) => decode_payload(b, ty, version),
        None => Err(Error::decode("null element in collection")),
    }
}

fn decode_elements(bytes: &[u8], elem: &ColumnType, version: ProtocolVersion) -> Result<Vec<Value>, Error> {
    let mut r = Reader::for_value(bytes);
    let n = read_count(&mut r, version)?;
    // Cap the preallocation by what the input could possibly hold.
    let mut items = Vec::with_capacity(n.min(r.remaining()));
    for _ in 0..n {
        items.push(read_element(&mut r, elem, version)?);
    }
    r.finish("collection")?;
    Ok(items)
}
