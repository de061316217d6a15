//! Cassie protocol types and serialization.
//!
//! This crate implements the binary native protocol (versions 2 to 4) spoken
//! by Cassandra-compatible databases. It is synchronous and allocation-light;
//! all I/O lives in `cassie-client`.
//!
//! # Modules
//!
//! - [`wire`] - Protocol primitives (`[int]`, `[string]`, `[bytes]`, ...)
//! - [`types`] - Column type descriptors
//! - [`value`] - Runtime values for bound arguments and result cells
//! - [`codec`] - Value encode/decode against a declared column type
//! - [`frame`] - Frame headers, flags, opcodes and compression
//! - [`request`] - Client-to-server messages
//! - [`response`] - Server-to-client messages
//! - [`result`] - RESULT bodies (rows, prepared metadata, ...)
//! - [`server_error`] - ERROR bodies and error codes
//! - [`event`] - Server-pushed events
//!
//! # Example
//!
//! ```
//! use cassie_proto::{codec, ColumnType, ProtocolVersion, Value};
//!
//! let bytes = codec::encode(&Value::TinyInt(-128), &ColumnType::TinyInt, ProtocolVersion::V4)
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(bytes, vec![0x80]);
//! ```

pub mod codec;
pub mod consistency;
pub mod error;
pub mod event;
pub mod frame;
pub mod request;
pub mod response;
pub mod result;
pub mod server_error;
pub mod types;
pub mod value;
pub mod wire;

pub use error::Error;

// Re-export commonly used types at crate root
pub use consistency::Consistency;
pub use event::{Event, EventType, SchemaChange};
pub use frame::{Compression, FrameHeader, Opcode, ProtocolVersion, RequestFrame, ResponseFrame};
pub use request::{BatchEntry, BatchQuery, BatchRequest, BatchType, QueryParameters, Request, Values};
pub use response::Response;
pub use result::{ColumnSpec, Prepared, QueryResult, Row, Rows, RowsMetadata};
pub use server_error::{error_codes, ErrorBody, ErrorDetail, WriteType};
pub use types::{ColumnType, UdtDef};
pub use value::{Date, Decimal, Time, Value};

/// Highest protocol version this crate speaks.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::LATEST;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version() {
        assert_eq!(PROTOCOL_VERSION, ProtocolVersion::V4);
        assert_eq!(PROTOCOL_VERSION.header_len(), 9);
    }

    #[test]
    fn test_query_request_frame() {
        let request = Request::Query {
            query: "SELECT now() FROM system.local".into(),
            params: QueryParameters {
                consistency: Consistency::One,
                ..Default::default()
            },
        };
        let body = request.serialize(PROTOCOL_VERSION).unwrap();
        let mut frame =
            RequestFrame::new(PROTOCOL_VERSION, request.opcode(), &body, None, false).unwrap();
        frame.set_stream(3);

        let bytes = frame.as_bytes();
        assert_eq!(bytes.len(), 9 + body.len());
        assert_eq!(&bytes[9..], &body[..]);
        assert_eq!(Request::parse(Opcode::Query, &bytes[9..], PROTOCOL_VERSION).unwrap(), request);
    }
}
