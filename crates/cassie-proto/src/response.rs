//! Server-to-client messages.

use std::collections::HashMap;

use bytes::BytesMut;

use crate::event::Event;
use crate::frame::{Opcode, ProtocolVersion};
use crate::result::{ColumnSpec, QueryResult};
use crate::server_error::ErrorBody;
use crate::wire::{self, Reader};
use crate::Error;

/// A decoded response message.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Error(ErrorBody),
    Ready,
    /// The server requires authentication with the named authenticator.
    Authenticate { authenticator: String },
    Supported { options: HashMap<String, Vec<String>> },
    Result(QueryResult),
    Event(Event),
    AuthChallenge { token: Option<Vec<u8>> },
    AuthSuccess { token: Option<Vec<u8>> },
}

impl Response {
    pub fn opcode(&self) -> Opcode {
        match self {
            Response::Error(_) => Opcode::Error,
            Response::Ready => Opcode::Ready,
            Response::Authenticate { .. } => Opcode::Authenticate,
            Response::Supported { .. } => Opcode::Supported,
            Response::Result(_) => Opcode::Result,
            Response::Event(_) => Opcode::Event,
            Response::AuthChallenge { .. } => Opcode::AuthChallenge,
            Response::AuthSuccess { .. } => Opcode::AuthSuccess,
        }
    }

    /// Parses a response body.
    ///
    /// `known_columns` is forwarded to rows decoding for results sent without
    /// metadata.
    pub fn parse(
        opcode: Opcode,
        body: &[u8],
        version: ProtocolVersion,
        known_columns: Option<&[ColumnSpec]>,
    ) -> Result<Self, Error> {
        Ok(match opcode {
            Opcode::Error => Response::Error(ErrorBody::parse(body)?),
            Opcode::Ready => Response::Ready,
            Opcode::Authenticate => Response::Authenticate {
                authenticator: Reader::new(body).read_string()?.to_owned(),
            },
            Opcode::Supported => Response::Supported {
                options: Reader::new(body).read_string_multimap()?,
            },
            Opcode::Result => Response::Result(QueryResult::parse(body, version, known_columns)?),
            Opcode::Event => Response::Event(Event::parse(body, version)?),
            Opcode::AuthChallenge => Response::AuthChallenge {
                token: Reader::new(body).read_bytes()?.map(<[u8]>::to_vec),
            },
            Opcode::AuthSuccess => Response::AuthSuccess {
                token: if body.is_empty() {
                    None
                } else {
                    Reader::new(body).read_bytes()?.map(<[u8]>::to_vec)
                },
            },
            other => {
                return Err(Error::invalid(format!(
                    "{:?} is not a response opcode",
                    other
                )))
            }
        })
    }

    /// Serializes the message body; the server side of the codec.
    pub fn serialize(&self, version: ProtocolVersion) -> Result<Vec<u8>, Error> {
        let mut buf = BytesMut::new();
        match self {
            Response::Error(body) => body.write(&mut buf)?,
            Response::Ready => {}
            Response::Authenticate { authenticator } => wire::put_string(&mut buf, authenticator)?,
            Response::Supported { options } => wire::put_string_multimap(&mut buf, options)?,
            Response::Result(result) => result.write(&mut buf, version)?,
            Response::Event(event) => event.write(&mut buf, version)?,
            Response::AuthChallenge { token } | Response::AuthSuccess { token } => {
                wire::put_bytes(&mut buf, token.as_deref())?
            }
        }
        Ok(buf.to_vec())
    }
}
