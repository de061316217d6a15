//! Frame layout for the native protocol.
//!
//! A frame is a fixed-size header followed by `length` body bytes:
//!
//! ```text
//! v2:  [version:1][flags:1][stream:1][opcode:1][length:4]
//! v3+: [version:1][flags:1][stream:2][opcode:1][length:4]
//! ```
//!
//! The body length is always explicit, so a reader never has to look into
//! the next frame to find the end of the current one.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::wire::Reader;
use crate::Error;

/// Maximum body size (256 MB), the server's own limit.
pub const MAX_BODY_SIZE: usize = 256 * 1024 * 1024;

/// Set on the version byte of every server-to-client frame.
pub const RESPONSE_DIRECTION: u8 = 0x80;

/// Stream id used by the server for pushed events.
pub const EVENT_STREAM_ID: i16 = -1;

/// Header flag bits.
pub mod flags {
    pub const COMPRESSION: u8 = 0x01;
    pub const TRACING: u8 = 0x02;
    pub const CUSTOM_PAYLOAD: u8 = 0x04;
    pub const WARNING: u8 = 0x08;
}

/// Negotiated protocol version; fixed for the life of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V2 = 2,
    V3 = 3,
    V4 = 4,
}

impl ProtocolVersion {
    pub const LATEST: ProtocolVersion = ProtocolVersion::V4;

    pub fn from_byte(version: u8) -> Result<Self, Error> {
        match version & !RESPONSE_DIRECTION {
            2 => Ok(ProtocolVersion::V2),
            3 => Ok(ProtocolVersion::V3),
            4 => Ok(ProtocolVersion::V4),
            other => Err(Error::UnsupportedVersion(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Header size in bytes.
    pub fn header_len(self) -> usize {
        match self {
            ProtocolVersion::V2 => 8,
            _ => 9,
        }
    }

    /// Collections use `[int]` counts and lengths from v3 on, `[short]` before.
    pub fn uses_wide_collections(self) -> bool {
        self >= ProtocolVersion::V3
    }

    /// Largest stream id a client may allocate.
    pub fn max_stream_id(self) -> i16 {
        match self {
            ProtocolVersion::V2 => i16::from(i8::MAX),
            _ => i16::MAX,
        }
    }

    /// Flags the server may legally set on a response.
    fn allowed_flags(self) -> u8 {
        match self {
            ProtocolVersion::V4 => {
                flags::COMPRESSION | flags::TRACING | flags::CUSTOM_PAYLOAD | flags::WARNING
            }
            _ => flags::COMPRESSION | flags::TRACING,
        }
    }

    /// One step down, used when the server rejects the requested version.
    pub fn downgrade(self) -> Option<Self> {
        match self {
            ProtocolVersion::V4 => Some(ProtocolVersion::V3),
            ProtocolVersion::V3 => Some(ProtocolVersion::V2),
            ProtocolVersion::V2 => None,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_byte())
    }
}

/// Message opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
    Batch = 0x0D,
    AuthChallenge = 0x0E,
    AuthResponse = 0x0F,
    AuthSuccess = 0x10,
}

impl Opcode {
    pub fn from_byte(b: u8) -> Result<Self, Error> {
        Ok(match b {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x03 => Opcode::Authenticate,
            0x05 => Opcode::Options,
            0x06 => Opcode::Supported,
            0x07 => Opcode::Query,
            0x08 => Opcode::Result,
            0x09 => Opcode::Prepare,
            0x0A => Opcode::Execute,
            0x0B => Opcode::Register,
            0x0C => Opcode::Event,
            0x0D => Opcode::Batch,
            0x0E => Opcode::AuthChallenge,
            0x0F => Opcode::AuthResponse,
            0x10 => Opcode::AuthSuccess,
            other => return Err(Error::FrameCorruption(format!("unknown opcode 0x{:02x}", other))),
        })
    }

    /// Whether frames with this opcode are sent by the server.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            Opcode::Error
                | Opcode::Ready
                | Opcode::Authenticate
                | Opcode::Supported
                | Opcode::Result
                | Opcode::Event
                | Opcode::AuthChallenge
                | Opcode::AuthSuccess
        )
    }
}

/// Body compression negotiated at STARTUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Lz4,
}

impl Compression {
    /// Name used in the STARTUP options.
    pub fn as_str(self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
        }
    }

    /// LZ4 bodies carry the uncompressed length as a big-endian `[int]`.
    pub fn compress(self, body: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            Compression::Lz4 => {
                let len = i32::try_from(body.len())
                    .map_err(|_| Error::invalid(format!("body too large to compress: {}", body.len())))?;
                let mut out = Vec::with_capacity(4 + lz4_flex::block::get_maximum_output_size(body.len()));
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(&lz4_flex::block::compress(body));
                Ok(out)
            }
        }
    }

    pub fn decompress(self, body: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            Compression::Lz4 => {
                if body.len() < 4 {
                    return Err(Error::FrameCorruption(
                        "lz4 body shorter than its length prefix".to_string(),
                    ));
                }
                let len = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                let len = usize::try_from(len)
                    .ok()
                    .filter(|l| *l <= MAX_BODY_SIZE)
                    .ok_or_else(|| Error::FrameCorruption(format!("invalid lz4 length {}", len)))?;
                lz4_flex::block::decompress(&body[4..], len)
                    .map_err(|e| Error::FrameCorruption(format!("lz4 decompress: {}", e)))
            }
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lz4" => Ok(Compression::Lz4),
            other => Err(Error::invalid(format!("unsupported compression '{}'", other))),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: ProtocolVersion,
    pub is_response: bool,
    pub flags: u8,
    pub stream: i16,
    pub opcode: Opcode,
    pub length: usize,
}

impl FrameHeader {
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Writes the header.
    pub fn write(&self, buf: &mut BytesMut) -> Result<(), Error> {
        let direction = if self.is_response { RESPONSE_DIRECTION } else { 0 };
        buf.put_u8(self.version.as_byte() | direction);
        buf.put_u8(self.flags);
        match self.version {
            ProtocolVersion::V2 => {
                let stream = i8::try_from(self.stream).map_err(|_| {
                    Error::invalid(format!("stream id {} does not fit protocol v2", self.stream))
                })?;
                buf.put_i8(stream);
            }
            _ => buf.put_i16(self.stream),
        }
        buf.put_u8(self.opcode as u8);
        let length = u32::try_from(self.length)
            .ok()
            .filter(|_| self.length <= MAX_BODY_SIZE)
            .ok_or_else(|| Error::invalid(format!("body size {} exceeds maximum", self.length)))?;
        buf.put_u32(length);
        Ok(())
    }

    /// Parses a header received on a connection negotiated at `expected`.
    ///
    /// `raw` must be exactly `expected.header_len()` bytes. Version-dependent
    /// fields are validated rather than reinterpreted: a version byte other
    /// than the negotiated one, a request-direction frame, or a flag the
    /// version does not define is rejected.
    pub fn parse_response(raw: &[u8], expected: ProtocolVersion) -> Result<Self, Error> {
        Self::parse(raw, expected, true)
    }

    /// Parses a header sent by a client; the server side of the protocol.
    pub fn parse_request(raw: &[u8], expected: ProtocolVersion) -> Result<Self, Error> {
        Self::parse(raw, expected, false)
    }

    fn parse(raw: &[u8], expected: ProtocolVersion, response: bool) -> Result<Self, Error> {
        if raw.len() != expected.header_len() {
            return Err(Error::FrameCorruption(format!(
                "header must be {} bytes, got {}",
                expected.header_len(),
                raw.len()
            )));
        }
        let version_byte = raw[0];
        if (version_byte & RESPONSE_DIRECTION != 0) != response {
            return Err(Error::FrameCorruption(format!(
                "unexpected frame direction in version byte 0x{:02x}",
                version_byte
            )));
        }
        let actual = version_byte & !RESPONSE_DIRECTION;
        if actual != expected.as_byte() {
            return Err(Error::VersionMismatch {
                expected: expected.as_byte(),
                actual,
            });
        }
        let frame_flags = raw[1];
        if frame_flags & !expected.allowed_flags() != 0 {
            return Err(Error::FrameCorruption(format!(
                "flags 0x{:02x} not valid for protocol {}",
                frame_flags, expected
            )));
        }
        let (stream, rest) = match expected {
            ProtocolVersion::V2 => (i16::from(raw[2] as i8), &raw[3..]),
            _ => (i16::from_be_bytes([raw[2], raw[3]]), &raw[4..]),
        };
        let opcode = Opcode::from_byte(rest[0])?;
        let length = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
        if length > MAX_BODY_SIZE {
            return Err(Error::FrameCorruption(format!(
                "frame length {} exceeds maximum {}",
                length, MAX_BODY_SIZE
            )));
        }
        Ok(Self {
            version: expected,
            is_response: response,
            flags: frame_flags,
            stream,
            opcode,
            length,
        })
    }
}

/// A complete request frame ready to be written.
///
/// The stream id is patched in by the connection right before the write, so
/// serialization can happen outside the connection's critical section.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    version: ProtocolVersion,
    data: Vec<u8>,
}

impl RequestFrame {
    /// Builds a frame around an already serialized body, compressing it when
    /// a compression is negotiated and the opcode allows it.
    pub fn new(
        version: ProtocolVersion,
        opcode: Opcode,
        body: &[u8],
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<Self, Error> {
        let mut frame_flags = if tracing { flags::TRACING } else { 0 };
        // STARTUP and OPTIONS precede negotiation and are never compressed.
        let compressed;
        let body = match compression {
            Some(c) if !matches!(opcode, Opcode::Startup | Opcode::Options) => {
                frame_flags |= flags::COMPRESSION;
                compressed = c.compress(body)?;
                compressed.as_slice()
            }
            _ => body,
        };

        let header = FrameHeader {
            version,
            is_response: false,
            flags: frame_flags,
            stream: 0,
            opcode,
            length: body.len(),
        };
        let mut buf = BytesMut::with_capacity(version.header_len() + body.len());
        header.write(&mut buf)?;
        buf.put_slice(body);
        Ok(Self {
            version,
            data: buf.to_vec(),
        })
    }

    /// Sets the stream id in place.
    pub fn set_stream(&mut self, stream: i16) {
        match self.version {
            ProtocolVersion::V2 => self.data[2] = stream as i8 as u8,
            _ => self.data[2..4].copy_from_slice(&stream.to_be_bytes()),
        }
    }

    pub fn opcode(&self) -> Result<Opcode, Error> {
        Opcode::from_byte(self.data[self.version.header_len() - 5])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Builds a complete response frame; the server side of the protocol.
pub fn encode_response(
    version: ProtocolVersion,
    stream: i16,
    opcode: Opcode,
    body: &[u8],
    compression: Option<Compression>,
) -> Result<Vec<u8>, Error> {
    let compressed;
    let (frame_flags, body) = match compression {
        Some(c) if !body.is_empty() => {
            compressed = c.compress(body)?;
            (flags::COMPRESSION, compressed.as_slice())
        }
        _ => (0, body),
    };
    let header = FrameHeader {
        version,
        is_response: true,
        flags: frame_flags,
        stream,
        opcode,
        length: body.len(),
    };
    let mut buf = BytesMut::with_capacity(version.header_len() + body.len());
    header.write(&mut buf)?;
    buf.put_slice(body);
    Ok(buf.to_vec())
}

/// A response frame after decompression and envelope stripping.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub header: FrameHeader,
    pub tracing_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub custom_payload: HashMap<String, Vec<u8>>,
    /// The message body proper.
    pub body: Bytes,
}

impl ResponseFrame {
    /// Assembles a response from its header and raw body bytes.
    ///
    /// A compressed body on a connection without negotiated compression, or a
    /// body that fails to decompress, is `FrameCorruption`.
    pub fn decode(
        header: FrameHeader,
        raw: Bytes,
        compression: Option<Compression>,
    ) -> Result<Self, Error> {
        let body = if header.has_flag(flags::COMPRESSION) {
            let c = compression.ok_or_else(|| {
                Error::FrameCorruption("compressed frame without negotiated compression".to_string())
            })?;
            Bytes::from(c.decompress(&raw)?)
        } else {
            raw
        };

        let mut r = Reader::new(&body);
        let corrupt = |e: Error| Error::FrameCorruption(e.to_string());
        let tracing_id = if header.has_flag(flags::TRACING) {
            let raw_id = r.take(16).map_err(corrupt)?;
            let mut id = [0u8; 16];
            id.copy_from_slice(raw_id);
            Some(Uuid::from_bytes(id))
        } else {
            None
        };
        let warnings = if header.has_flag(flags::WARNING) {
            r.read_string_list().map_err(corrupt)?
        } else {
            Vec::new()
        };
        let mut custom_payload = HashMap::new();
        if header.has_flag(flags::CUSTOM_PAYLOAD) {
            let n = r.read_short().map_err(corrupt)?;
            for _ in 0..n {
                let key = r.read_string().map_err(corrupt)?.to_owned();
                let value = r.read_bytes().map_err(corrupt)?.unwrap_or_default().to_vec();
                custom_payload.insert(key, value);
            }
        }
        let consumed = body.len() - r.remaining();

        Ok(Self {
            header,
            tracing_id,
            warnings,
            custom_payload,
            body: body.slice(consumed..),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_header(version: u8, frame_flags: u8, stream: i16, opcode: u8, len: u32) -> Vec<u8> {
        let mut raw = vec![version | RESPONSE_DIRECTION, frame_flags];
        raw.extend_from_slice(&stream.to_be_bytes());
        raw.push(opcode);
        raw.extend_from_slice(&len.to_be_bytes());
        raw
    }

    #[test]
    fn test_request_frame_layout() {
        let mut frame =
            RequestFrame::new(ProtocolVersion::V4, Opcode::Options, &[], None, false).unwrap();
        frame.set_stream(0x0102);
        assert_eq!(frame.as_bytes(), &[0x04, 0x00, 0x01, 0x02, 0x05, 0, 0, 0, 0]);
        assert_eq!(frame.opcode().unwrap(), Opcode::Options);
    }

    #[test]
    fn test_request_frame_v2_stream_width() {
        let mut frame =
            RequestFrame::new(ProtocolVersion::V2, Opcode::Query, b"ab", None, false).unwrap();
        frame.set_stream(5);
        assert_eq!(frame.as_bytes(), &[0x02, 0x00, 0x05, 0x07, 0, 0, 0, 2, b'a', b'b']);
        assert_eq!(frame.opcode().unwrap(), Opcode::Query);
    }

    #[test]
    fn test_parse_response_header() {
        let raw = response_header(4, 0, 7, 0x08, 12);
        let header = FrameHeader::parse_response(&raw, ProtocolVersion::V4).unwrap();
        assert_eq!(header.stream, 7);
        assert_eq!(header.opcode, Opcode::Result);
        assert_eq!(header.length, 12);
        assert!(header.is_response);
    }

    #[test]
    fn test_parse_v2_header_event_stream() {
        let raw = [0x82, 0x00, 0xFF, 0x0C, 0, 0, 0, 0];
        let header = FrameHeader::parse_response(&raw, ProtocolVersion::V2).unwrap();
        assert_eq!(header.stream, EVENT_STREAM_ID);
        assert_eq!(header.opcode, Opcode::Event);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let raw = response_header(3, 0, 1, 0x08, 0);
        assert!(matches!(
            FrameHeader::parse_response(&raw, ProtocolVersion::V4),
            Err(Error::VersionMismatch { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn test_flags_gated_by_version() {
        let raw = response_header(3, flags::WARNING, 1, 0x08, 0);
        assert!(matches!(
            FrameHeader::parse_response(&raw, ProtocolVersion::V3),
            Err(Error::FrameCorruption(_))
        ));
        let raw = response_header(4, flags::WARNING, 1, 0x08, 0);
        assert!(FrameHeader::parse_response(&raw, ProtocolVersion::V4).is_ok());
    }

    #[test]
    fn test_request_direction_rejected() {
        let mut raw = response_header(4, 0, 1, 0x08, 0);
        raw[0] = 0x04;
        assert!(FrameHeader::parse_response(&raw, ProtocolVersion::V4).is_err());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let raw = response_header(4, 0, 1, 0x08, (MAX_BODY_SIZE + 1) as u32);
        assert!(matches!(
            FrameHeader::parse_response(&raw, ProtocolVersion::V4),
            Err(Error::FrameCorruption(_))
        ));
    }

    #[test]
    fn test_unknown_opcode_is_corruption() {
        let raw = response_header(4, 0, 1, 0x42, 0);
        assert!(matches!(
            FrameHeader::parse_response(&raw, ProtocolVersion::V4),
            Err(Error::FrameCorruption(_))
        ));
    }

    #[test]
    fn test_encode_response_parses_back() {
        let raw = encode_response(ProtocolVersion::V3, -1, Opcode::Event, &[1, 2], None).unwrap();
        let header = FrameHeader::parse_response(&raw[..9], ProtocolVersion::V3).unwrap();
        assert_eq!(header.stream, EVENT_STREAM_ID);
        assert_eq!(header.length, 2);

        let request = RequestFrame::new(ProtocolVersion::V3, Opcode::Options, &[], None, false).unwrap();
        let header = FrameHeader::parse_request(request.as_bytes(), ProtocolVersion::V3).unwrap();
        assert!(!header.is_response);
        assert!(FrameHeader::parse_response(request.as_bytes(), ProtocolVersion::V3).is_err());
    }

    #[test]
    fn test_lz4_roundtrip() {
        let body: Vec<u8> = (0..2000u32).map(|i| (i % 7) as u8).collect();
        let compressed = Compression::Lz4.compress(&body).unwrap();
        assert_eq!(&compressed[..4], &2000i32.to_be_bytes());
        assert_eq!(Compression::Lz4.decompress(&compressed).unwrap(), body);
    }

    #[test]
    fn test_lz4_garbage_is_corruption() {
        let garbage = [0, 0, 0, 50, 0xFF, 0xFF, 0xFF];
        assert!(matches!(
            Compression::Lz4.decompress(&garbage),
            Err(Error::FrameCorruption(_))
        ));
    }

    #[test]
    fn test_compressed_frame_without_negotiation() {
        let raw = response_header(4, flags::COMPRESSION, 1, 0x08, 4);
        let header = FrameHeader::parse_response(&raw, ProtocolVersion::V4).unwrap();
        let result = ResponseFrame::decode(header, Bytes::from_static(&[0, 0, 0, 1]), None);
        assert!(matches!(result, Err(Error::FrameCorruption(_))));
    }

    #[test]
    fn test_response_envelope_stripping() {
        let mut body = BytesMut::new();
        body.put_slice(&[7u8; 16]);
        crate::wire::put_string_list(&mut body, &["careful".to_string()]).unwrap();
        body.put_i32(1);

        let raw = response_header(4, flags::TRACING | flags::WARNING, 3, 0x08, body.len() as u32);
        let header = FrameHeader::parse_response(&raw, ProtocolVersion::V4).unwrap();
        let frame = ResponseFrame::decode(header, body.freeze(), None).unwrap();

        assert_eq!(frame.tracing_id, Some(Uuid::from_bytes([7u8; 16])));
        assert_eq!(frame.warnings, vec!["careful".to_string()]);
        assert_eq!(&frame.body[..], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_compressed_request_body() {
        let body = vec![b'x'; 512];
        let frame = RequestFrame::new(
            ProtocolVersion::V4,
            Opcode::Query,
            &body,
            Some(Compression::Lz4),
            false,
        )
        .unwrap();
        let bytes = frame.as_bytes();
        assert_eq!(bytes[1], flags::COMPRESSION);
        let length = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
        assert_eq!(length, bytes.len() - 9);
        assert_eq!(Compression::Lz4.decompress(&bytes[9..]).unwrap(), body);
    }

    #[test]
    fn test_startup_never_compressed() {
        let frame = RequestFrame::new(
            ProtocolVersion::V4,
            Opcode::Startup,
            b"abc",
            Some(Compression::Lz4),
            false,
        )
        .unwrap();
        assert_eq!(frame.as_bytes()[1], 0);
    }
}
