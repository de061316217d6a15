//! Primitive notation of the native protocol.
//!
//! Every message body is composed from a small set of primitives: `[int]`,
//! `[short]`, `[string]`, `[bytes]`, `[string map]` and friends. Writers append
//! to a [`BytesMut`]; [`Reader`] consumes a borrowed slice and never reads past
//! its end.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};

use crate::Error;

/// Which error a [`Reader`] raises when the input is short or malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    Message,
    Value,
}

/// Bounds-checked cursor over a message or value body.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    context: Context,
}

impl<'a> Reader<'a> {
    /// Reader for message bodies; failures are `InvalidMessage`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            context: Context::Message,
        }
    }

    /// Reader for value payloads; failures are `TypeDecode`.
    pub fn for_value(buf: &'a [u8]) -> Self {
        Self {
            buf,
            context: Context::Value,
        }
    }

    fn fail(&self, msg: String) -> Error {
        match self.context {
            Context::Message => Error::InvalidMessage(msg),
            Context::Value => Error::TypeDecode(msg),
        }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The unconsumed tail.
    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }

    /// Fails unless every byte has been consumed.
    pub fn finish(&self, what: &str) -> Result<(), Error> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(self.fail(format!(
                "{} trailing bytes after {}",
                self.buf.len(),
                what
            )))
        }
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.buf.len() < n {
            return Err(self.fail(format!(
                "need {} bytes, only {} remaining",
                n,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_short(&mut self) -> Result<u16, Error> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_int(&mut self) -> Result<i32, Error> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_long(&mut self) -> Result<i64, Error> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    /// `[string]`: a `[short]` length followed by UTF-8 bytes.
    pub fn read_string(&mut self) -> Result<&'a str, Error> {
        let len = self.read_short()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw).map_err(|e| self.fail(format!("invalid utf-8 string: {}", e)))
    }

    /// `[long string]`: an `[int]` length followed by UTF-8 bytes.
    pub fn read_long_string(&mut self) -> Result<&'a str, Error> {
        let len = self.read_int()?;
        if len < 0 {
            return Err(self.fail(format!("negative long string length {}", len)));
        }
        let raw = self.take(len as usize)?;
        std::str::from_utf8(raw).map_err(|e| self.fail(format!("invalid utf-8 string: {}", e)))
    }

    /// `[bytes]`: an `[int]` length, negative meaning null.
    pub fn read_bytes(&mut self) -> Result<Option<&'a [u8]>, Error> {
        let len = self.read_int()?;
        if len < 0 {
            return Ok(None);
        }
        self.take(len as usize).map(Some)
    }

    /// `[short bytes]`: a `[short]` length followed by bytes.
    pub fn read_short_bytes(&mut self) -> Result<&'a [u8], Error> {
        let len = self.read_short()? as usize;
        self.take(len)
    }

    /// Length-prefixed value whose prefix width depends on the protocol
    /// version: `[short]` before v3, `[int]` after.
    pub fn read_value_bytes(&mut self, wide: bool) -> Result<Option<&'a [u8]>, Error> {
        if wide {
            self.read_bytes()
        } else {
            let len = self.read_short()? as usize;
            self.take(len).map(Some)
        }
    }

    pub fn read_string_list(&mut self) -> Result<Vec<String>, Error> {
        let n = self.read_short()?;
        (0..n).map(|_| self.read_string().map(str::to_owned)).collect()
    }

    pub fn read_string_map(&mut self) -> Result<HashMap<String, String>, Error> {
        let n = self.read_short()?;
        let mut map = HashMap::with_capacity(n as usize);
        for _ in 0..n {
            let key = self.read_string()?.to_owned();
            let value = self.read_string()?.to_owned();
            map.insert(key, value);
        }
        Ok(map)
    }

    pub fn read_string_multimap(&mut self) -> Result<HashMap<String, Vec<String>>, Error> {
        let n = self.read_short()?;
        let mut map = HashMap::with_capacity(n as usize);
        for _ in 0..n {
            let key = self.read_string()?.to_owned();
            let values = self.read_string_list()?;
            map.insert(key, values);
        }
        Ok(map)
    }

    /// `[inetaddr]`: one byte of address length followed by the address.
    pub fn read_inet_addr(&mut self) -> Result<IpAddr, Error> {
        let len = self.read_u8()?;
        match len {
            4 => Ok(IpAddr::V4(Ipv4Addr::from(self.take_array::<4>()?))),
            16 => Ok(IpAddr::V6(Ipv6Addr::from(self.take_array::<16>()?))),
            other => Err(self.fail(format!("invalid inet address length {}", other))),
        }
    }

    /// `[inet]`: an `[inetaddr]` followed by an `[int]` port.
    pub fn read_inet(&mut self) -> Result<SocketAddr, Error> {
        let ip = self.read_inet_addr()?;
        let port = self.read_int()?;
        let port = u16::try_from(port).map_err(|_| self.fail(format!("invalid port {}", port)))?;
        Ok(SocketAddr::new(ip, port))
    }
}

pub fn put_short(buf: &mut BytesMut, v: u16) {
    buf.put_u16(v);
}

pub fn put_int(buf: &mut BytesMut, v: i32) {
    buf.put_i32(v);
}

pub fn put_long(buf: &mut BytesMut, v: i64) {
    buf.put_i64(v);
}

/// Converts a collection length to a `[short]`, failing on overflow.
pub fn short_len(len: usize, what: &str) -> Result<u16, Error> {
    u16::try_from(len).map_err(|_| Error::invalid(format!("{} too long: {} > {}", what, len, u16::MAX)))
}

/// Converts a length to an `[int]`, failing on overflow.
pub fn int_len(len: usize, what: &str) -> Result<i32, Error> {
    i32::try_from(len).map_err(|_| Error::invalid(format!("{} too long: {} > {}", what, len, i32::MAX)))
}

pub fn put_string(buf: &mut BytesMut, s: &str) -> Result<(), Error> {
    buf.put_u16(short_len(s.len(), "string")?);
    buf.put_slice(s.as_bytes());
    Ok(())
}

pub fn put_long_string(buf: &mut BytesMut, s: &str) -> Result<(), Error> {
    buf.put_i32(int_len(s.len(), "long string")?);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// `[bytes]`; `None` is written as length -1.
pub fn put_bytes(buf: &mut BytesMut, v: Option<&[u8]>) -> Result<(), Error> {
    match v {
        Some(b) => {
            buf.put_i32(int_len(b.len(), "bytes")?);
            buf.put_slice(b);
        }
        None => buf.put_i32(-1),
    }
    Ok(())
}

pub fn put_short_bytes(buf: &mut BytesMut, v: &[u8]) -> Result<(), Error> {
    buf.put_u16(short_len(v.len(), "short bytes")?);
    buf.put_slice(v);
    Ok(())
}

pub fn put_string_list(buf: &mut BytesMut, list: &[String]) -> Result<(), Error> {
    buf.put_u16(short_len(list.len(), "string list")?);
    for s in list {
        put_string(buf, s)?;
    }
    Ok(())
}

/// `[string map]` with keys written in sorted order so output is stable.
pub fn put_string_map(buf: &mut BytesMut, map: &HashMap<String, String>) -> Result<(), Error> {
    buf.put_u16(short_len(map.len(), "string map")?);
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort();
    for (k, v) in entries {
        put_string(buf, k)?;
        put_string(buf, v)?;
    }
    Ok(())
}

pub fn put_string_multimap(
    buf: &mut BytesMut,
    map: &HashMap<String, Vec<String>>,
) -> Result<(), Error> {
    buf.put_u16(short_len(map.len(), "string multimap")?);
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort();
    for (k, v) in entries {
        put_string(buf, k)?;
        put_string_list(buf, v)?;
    }
    Ok(())
}

pub fn put_inet(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(16);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_i32(i32::from(addr.port()));
}
