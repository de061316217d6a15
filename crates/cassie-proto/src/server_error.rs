//! ERROR response bodies.
//!
//! An error body is `[int code][string message]` followed by fields that
//! depend on the code. The detail is parsed for every code the protocol
//! defines; unknown codes keep their raw code and message.

use std::fmt;

use crate::consistency::Consistency;
use crate::wire::Reader;
use crate::Error;

/// Protocol error codes.
pub mod error_codes {
    pub const SERVER_ERROR: i32 = 0x0000;
    pub const PROTOCOL_ERROR: i32 = 0x000A;
    pub const BAD_CREDENTIALS: i32 = 0x0100;
    pub const UNAVAILABLE: i32 = 0x1000;
    pub const OVERLOADED: i32 = 0x1001;
    pub const IS_BOOTSTRAPPING: i32 = 0x1002;
    pub const TRUNCATE_ERROR: i32 = 0x1003;
    pub const WRITE_TIMEOUT: i32 = 0x1100;
    pub const READ_TIMEOUT: i32 = 0x1200;
    pub const READ_FAILURE: i32 = 0x1300;
    pub const FUNCTION_FAILURE: i32 = 0x1400;
    pub const WRITE_FAILURE: i32 = 0x1500;
    pub const SYNTAX_ERROR: i32 = 0x2000;
    pub const UNAUTHORIZED: i32 = 0x2100;
    pub const INVALID: i32 = 0x2200;
    pub const CONFIG_ERROR: i32 = 0x2300;
    pub const ALREADY_EXISTS: i32 = 0x2400;
    pub const UNPREPARED: i32 = 0x2500;
}

/// Kind of write that timed out or failed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WriteType {
    Simple,
    Batch,
    UnloggedBatch,
    Counter,
    BatchLog,
    Cas,
    View,
    Cdc,
    Other(String),
}

impl WriteType {
    pub fn parse(s: &str) -> Self {
        match s {
            "SIMPLE" => WriteType::Simple,
            "BATCH" => WriteType::Batch,
            "UNLOGGED_BATCH" => WriteType::UnloggedBatch,
            "COUNTER" => WriteType::Counter,
            "BATCH_LOG" => WriteType::BatchLog,
            "CAS" => WriteType::Cas,
            "VIEW" => WriteType::View,
            "CDC" => WriteType::Cdc,
            other => WriteType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            WriteType::Simple => "SIMPLE",
            WriteType::Batch => "BATCH",
            WriteType::UnloggedBatch => "UNLOGGED_BATCH",
            WriteType::Counter => "COUNTER",
            WriteType::BatchLog => "BATCH_LOG",
            WriteType::Cas => "CAS",
            WriteType::View => "VIEW",
            WriteType::Cdc => "CDC",
            WriteType::Other(s) => s,
        }
    }
}

impl fmt::Display for WriteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Code-specific payload of an error body.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorDetail {
    /// Codes without extra fields.
    None,
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },
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
    AlreadyExists {
        keyspace: String,
        /// Empty when the keyspace itself already exists.
        table: String,
    },
    Unprepared {
        id: Vec<u8>,
    },
}

/// A decoded ERROR message.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
    pub detail: ErrorDetail,
}

impl ErrorBody {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: ErrorDetail::None,
        }
    }

    pub fn with_detail(mut self, detail: ErrorDetail) -> Self {
        self.detail = detail;
        self
    }

    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        use error_codes::*;

        let mut r = Reader::new(body);
        let code = r.read_int()?;
        let message = r.read_string()?.to_owned();

        let detail = match code {
            UNAVAILABLE => ErrorDetail::Unavailable {
                consistency: read_consistency(&mut r)?,
                required: r.read_int()?,
                alive: r.read_int()?,
            },
            WRITE_TIMEOUT => ErrorDetail::WriteTimeout {
                consistency: read_consistency(&mut r)?,
                received: r.read_int()?,
                block_for: r.read_int()?,
                write_type: WriteType::parse(r.read_string()?),
            },
            READ_TIMEOUT => ErrorDetail::ReadTimeout {
                consistency: read_consistency(&mut r)?,
                received: r.read_int()?,
                block_for: r.read_int()?,
                data_present: r.read_u8()? != 0,
            },
            READ_FAILURE => ErrorDetail::ReadFailure {
                consistency: read_consistency(&mut r)?,
                received: r.read_int()?,
                block_for: r.read_int()?,
                num_failures: r.read_int()?,
                data_present: r.read_u8()? != 0,
            },
            FUNCTION_FAILURE => ErrorDetail::FunctionFailure {
                keyspace: r.read_string()?.to_owned(),
                function: r.read_string()?.to_owned(),
                arg_types: r.read_string_list()?,
            },
            WRITE_FAILURE => ErrorDetail::WriteFailure {
                consistency: read_consistency(&mut r)?,
                received: r.read_int()?,
                block_for: r.read_int()?,
                num_failures: r.read_int()?,
                write_type: WriteType::parse(r.read_string()?),
            },
            ALREADY_EXISTS => ErrorDetail::AlreadyExists {
                keyspace: r.read_string()?.to_owned(),
                table: r.read_string()?.to_owned(),
            },
            UNPREPARED => ErrorDetail::Unprepared {
                id: r.read_short_bytes()?.to_vec(),
            },
            _ => ErrorDetail::None,
        };

        Ok(Self {
            code,
            message,
            detail,
        })
    }

    /// Serializes the body; used by test servers.
    pub fn write(&self, buf: &mut bytes::BytesMut) -> Result<(), Error> {
        use crate::wire::*;
        use bytes::BufMut;

        put_int(buf, self.code);
        put_string(buf, &self.message)?;
        match &self.detail {
            ErrorDetail::None => {}
            ErrorDetail::Unavailable {
                consistency,
                required,
                alive,
            } => {
                put_short(buf, consistency.code());
                put_int(buf, *required);
                put_int(buf, *alive);
            }
            ErrorDetail::WriteTimeout {
                consistency,
                received,
                block_for,
                write_type,
            } => {
                put_short(buf, consistency.code());
                put_int(buf, *received);
                put_int(buf, *block_for);
                put_string(buf, write_type.as_str())?;
            }
            ErrorDetail::ReadTimeout {
                consistency,
                received,
                block_for,
                data_present,
            } => {
                put_short(buf, consistency.code());
                put_int(buf, *received);
                put_int(buf, *block_for);
                buf.put_u8(u8::from(*data_present));
            }
            ErrorDetail::ReadFailure {
                consistency,
                received,
                block_for,
                num_failures,
                data_present,
            } => {
                put_short(buf, consistency.code());
                put_int(buf, *received);
                put_int(buf, *block_for);
                put_int(buf, *num_failures);
                buf.put_u8(u8::from(*data_present));
            }
            ErrorDetail::FunctionFailure {
                keyspace,
                function,
                arg_types,
            } => {
                put_string(buf, keyspace)?;
                put_string(buf, function)?;
                put_string_list(buf, arg_types)?;
            }
            ErrorDetail::WriteFailure {
                consistency,
                received,
                block_for,
                num_failures,
                write_type,
            } => {
                put_short(buf, consistency.code());
                put_int(buf, *received);
                put_int(buf, *block_for);
                put_int(buf, *num_failures);
                put_string(buf, write_type.as_str())?;
            }
            ErrorDetail::AlreadyExists { keyspace, table } => {
                put_string(buf, keyspace)?;
                put_string(buf, table)?;
            }
            ErrorDetail::Unprepared { id } => put_short_bytes(buf, id)?,
        }
        Ok(())
    }
}

fn read_consistency(r: &mut Reader<'_>) -> Result<Consistency, Error> {
    let code = r.read_short()?;
    Consistency::from_code(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn roundtrip(body: &ErrorBody) -> ErrorBody {
        let mut buf = BytesMut::new();
        body.write(&mut buf).unwrap();
        ErrorBody::parse(&buf).unwrap()
    }

    #[test]
    fn test_unavailable_detail() {
        let body = ErrorBody::new(error_codes::UNAVAILABLE, "Cannot achieve consistency")
            .with_detail(ErrorDetail::Unavailable {
                consistency: Consistency::Quorum,
                required: 2,
                alive: 1,
            });
        assert_eq!(roundtrip(&body), body);
    }

    #[test]
    fn test_write_timeout_detail() {
        let body = ErrorBody::new(error_codes::WRITE_TIMEOUT, "timed out").with_detail(
            ErrorDetail::WriteTimeout {
                consistency: Consistency::LocalQuorum,
                received: 1,
                block_for: 2,
                write_type: WriteType::BatchLog,
            },
        );
        assert_eq!(roundtrip(&body), body);
    }

    #[test]
    fn test_unprepared_id() {
        let mut buf = BytesMut::new();
        crate::wire::put_int(&mut buf, error_codes::UNPREPARED);
        crate::wire::put_string(&mut buf, "Prepared query not found").unwrap();
        crate::wire::put_short_bytes(&mut buf, &[0xCA, 0xFE]).unwrap();

        let body = ErrorBody::parse(&buf).unwrap();
        assert_eq!(
            body.detail,
            ErrorDetail::Unprepared {
                id: vec![0xCA, 0xFE]
            }
        );
    }

    #[test]
    fn test_unknown_code_keeps_raw() {
        let mut buf = BytesMut::new();
        crate::wire::put_int(&mut buf, 0x7777);
        crate::wire::put_string(&mut buf, "mystery").unwrap();

        let body = ErrorBody::parse(&buf).unwrap();
        assert_eq!(body.code, 0x7777);
        assert_eq!(body.message, "mystery");
        assert_eq!(body.detail, ErrorDetail::None);
    }

    #[test]
    fn test_truncated_detail_is_error() {
        let mut buf = BytesMut::new();
        crate::wire::put_int(&mut buf, error_codes::READ_TIMEOUT);
        crate::wire::put_string(&mut buf, "timeout").unwrap();
        crate::wire::put_short(&mut buf, 1);

        assert!(ErrorBody::parse(&buf).is_err());
    }

    #[test]
    fn test_unknown_write_type() {
        assert_eq!(WriteType::parse("FOO"), WriteType::Other("FOO".into()));
        assert_eq!(WriteType::parse("CAS"), WriteType::Cas);
    }
}
