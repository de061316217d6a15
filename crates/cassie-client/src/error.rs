//! Client error types.
//!
//! [`Error`] is a closed taxonomy: every failure a caller can observe is one
//! of its variants, and server-reported failures carry a [`ServerErrorKind`]
//! with the structured detail of the protocol error code.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use cassie_proto::{Consistency, WriteType};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A bound value cannot be encoded as its declared type.
    #[error("type encode error: {0}")]
    TypeEncode(String),

    /// A result cell does not decode as its declared type.
    #[error("type decode error: {0}")]
    TypeDecode(String),

    /// A frame could not be parsed or decompressed.
    #[error("frame corruption: {0}")]
    FrameCorruption(String),

    /// The transport failed while the request was in flight.
    #[error("connection to {endpoint} lost: {reason}")]
    ConnectionLost {
        endpoint: SocketAddr,
        reason: String,
        /// Whether any byte of the request may have reached the server.
        request_written: bool,
    },

    /// The server answered with an ERROR message.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// The local deadline of an attempt expired.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// No ready connection exists for the selected host(s).
    #[error("no connections available: {0}")]
    NoConnectionsAvailable(String),

    /// Connection setup failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Authentication failed on the client side.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// The server sent something the protocol does not allow here.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration or statement arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<cassie_proto::Error> for Error {
    fn from(e: cassie_proto::Error) -> Self {
        use cassie_proto::Error as P;
        match e {
            P::TypeEncode(msg) => Error::TypeEncode(msg),
            P::TypeDecode(msg) => Error::TypeDecode(msg),
            P::FrameCorruption(msg) => Error::FrameCorruption(msg),
            other @ (P::VersionMismatch { .. } | P::UnsupportedVersion(_)) => {
                Error::Protocol(other.to_string())
            }
            P::InvalidMessage(msg) => Error::Protocol(msg),
        }
    }
}

impl Error {
    /// The server error, if this is one.
    pub fn as_server(&self) -> Option<&ServerError> {
        match self {
            Error::Server(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the request may have been applied even though it failed.
    pub fn is_ambiguous_write(&self) -> bool {
        match self {
            Error::ConnectionLost {
                request_written, ..
            } => *request_written,
            Error::Timeout(_) => true,
            Error::Server(e) => matches!(
                e.kind,
                ServerErrorKind::WriteTimeout { .. }
                    | ServerErrorKind::WriteFailure { .. }
                    | ServerErrorKind::ServerError
            ),
            _ => false,
        }
    }
}

/// A classified ERROR response.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("server error 0x{code:04x} ({kind}): {message}")]
pub struct ServerError {
    pub kind: ServerErrorKind,
    /// Raw protocol error code.
    pub code: i32,
    pub message: String,
}

/// One variant per protocol error code.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerErrorKind {
    ServerError,
    ProtocolError,
    BadCredentials,
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },
    Overloaded,
    IsBootstrapping,
    Truncate,
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        write_type: WriteType,
    },
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
    },
    ReadFailure {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        num_failures: i32,
        data_present: bool,
    },
    FunctionFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },
    WriteFailure {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        num_failures: i32,
        write_type: WriteType,
    },
    Syntax,
    Unauthorized,
    Invalid,
    Config,
    AlreadyExists {
        keyspace: String,
        table: String,
    },
    Unprepared {
        id: Vec<u8>,
    },
    /// A code this driver does not know; the raw code is on [`ServerError`].
    Unknown,
}

impl ServerErrorKind {
    /// Errors raised while executing a well-formed request.
    pub fn is_execution_error(&self) -> bool {
        matches!(
            self,
            ServerErrorKind::Unavailable { .. }
                | ServerErrorKind::Overloaded
                | ServerErrorKind::IsBootstrapping
                | ServerErrorKind::Truncate
                | ServerErrorKind::WriteTimeout { .. }
                | ServerErrorKind::ReadTimeout { .. }
                | ServerErrorKind::ReadFailure { .. }
                | ServerErrorKind::FunctionFailure { .. }
                | ServerErrorKind::WriteFailure { .. }
        )
    }

    /// Errors about the request itself; resending never helps.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            ServerErrorKind::Syntax
                | ServerErrorKind::Unauthorized
                | ServerErrorKind::Invalid
                | ServerErrorKind::Config
                | ServerErrorKind::AlreadyExists { .. }
                | ServerErrorKind::BadCredentials
                | ServerErrorKind::ProtocolError
                | ServerErrorKind::FunctionFailure { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerErrorKind::ServerError => "server error",
            ServerErrorKind::ProtocolError => "protocol error",
            ServerErrorKind::BadCredentials => "bad credentials",
            ServerErrorKind::Unavailable { .. } => "unavailable",
            ServerErrorKind::Overloaded => "overloaded",
            ServerErrorKind::IsBootstrapping => "bootstrapping",
            ServerErrorKind::Truncate => "truncate error",
            ServerErrorKind::WriteTimeout { .. } => "write timeout",
            ServerErrorKind::ReadTimeout { .. } => "read timeout",
            ServerErrorKind::ReadFailure { .. } => "read failure",
            ServerErrorKind::FunctionFailure { .. } => "function failure",
            ServerErrorKind::WriteFailure { .. } => "write failure",
            ServerErrorKind::Syntax => "syntax error",
            ServerErrorKind::Unauthorized => "unauthorized",
            ServerErrorKind::Invalid => "invalid query",
            ServerErrorKind::Config => "configuration error",
            ServerErrorKind::AlreadyExists { .. } => "already exists",
            ServerErrorKind::Unprepared { .. } => "unprepared",
            ServerErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ServerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proto_error_mapping() {
        let e: Error = cassie_proto::Error::TypeDecode("short".into()).into();
        assert!(matches!(e, Error::TypeDecode(_)));

        let e: Error = cassie_proto::Error::FrameCorruption("lz4".into()).into();
        assert!(matches!(e, Error::FrameCorruption(_)));

        let e: Error = cassie_proto::Error::VersionMismatch {
            expected: 4,
            actual: 3,
        }
        .into();
        assert!(matches!(e, Error::Protocol(_)));
    }

    #[test]
    fn test_ambiguous_writes() {
        let lost = |written| Error::ConnectionLost {
            endpoint: "127.0.0.1:9042".parse().unwrap(),
            reason: "reset".into(),
            request_written: written,
        };
        assert!(lost(true).is_ambiguous_write());
        assert!(!lost(false).is_ambiguous_write());
        assert!(Error::Timeout(Duration::from_secs(1)).is_ambiguous_write());

        let write_timeout = Error::Server(ServerError {
            kind: ServerErrorKind::WriteTimeout {
                consistency: Consistency::Quorum,
                received: 1,
                block_for: 2,
                write_type: WriteType::Simple,
            },
            code: 0x1100,
            message: "timeout".into(),
        });
        assert!(write_timeout.is_ambiguous_write());

        let syntax = Error::Server(ServerError {
            kind: ServerErrorKind::Syntax,
            code: 0x2000,
            message: "bad".into(),
        });
        assert!(!syntax.is_ambiguous_write());
    }

    #[test]
    fn test_display() {
        let e = Error::Server(ServerError {
            kind: ServerErrorKind::Invalid,
            code: 0x2200,
            message: "unknown table".into(),
        });
        assert_eq!(e.to_string(), "server error 0x2200 (invalid query): unknown table");
    }
}
