//! A scripted in-process server speaking the native protocol.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cassie_proto::frame::{encode_response, flags};
use cassie_proto::{
    error_codes, ColumnSpec, ColumnType, Compression, ErrorBody, Event, FrameHeader, Prepared,
    ProtocolVersion, QueryResult, Request, Response, Rows, RowsMetadata, Value,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// What the server does with one request.
pub enum Reply {
    Respond(Response),
    /// Respond after a delay, without blocking other requests.
    Delayed(Duration, Response),
    /// Close the connection without answering.
    Drop,
    /// Never answer.
    Ignore,
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Reply::Respond(response)
    }
}

type Handler = dyn Fn(&Request) -> Reply + Send + Sync;

enum Out {
    Frame(Vec<u8>),
    Close,
}

struct Shared {
    handler: Box<Handler>,
    max_version: ProtocolVersion,
    requests: Mutex<Vec<Request>>,
    connections: Mutex<usize>,
    subscribers: Mutex<Vec<(ProtocolVersion, mpsc::UnboundedSender<Out>)>>,
}

/// A mock node listening on a loopback port.
pub struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockServer {
    /// Start a v4 server. STARTUP, OPTIONS, REGISTER and `USE` are answered
    /// unless `handler` handles them first.
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Request) -> Option<Reply> + Send + Sync + 'static,
    {
        Self::start_with_version(ProtocolVersion::V4, handler).await
    }

    /// Start a server that rejects versions above `max_version`.
    pub async fn start_with_version<F>(max_version: ProtocolVersion, handler: F) -> Self
    where
        F: Fn(&Request) -> Option<Reply> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            handler: Box::new(move |request| handler(request).unwrap_or_else(|| default_reply(request))),
            max_version,
            requests: Mutex::new(Vec::new()),
            connections: Mutex::new(0),
            subscribers: Mutex::new(Vec::new()),
        });

        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                *accept_shared.connections.lock() += 1;
                tokio::spawn(serve(socket, Arc::clone(&accept_shared)));
            }
        });
        Self { addr, shared }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Requests received so far, handshake included.
    pub fn requests(&self) -> Vec<Request> {
        self.shared.requests.lock().clone()
    }

    /// Requests matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Request) -> bool) -> usize {
        self.shared.requests.lock().iter().filter(|r| predicate(r)).count()
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        *self.shared.connections.lock()
    }

    /// Push an event to every connection that registered.
    pub fn push_event(&self, event: Event) {
        for (version, tx) in self.shared.subscribers.lock().iter() {
            let body = Response::Event(event.clone()).serialize(*version).unwrap();
            let frame =
                encode_response(*version, -1, cassie_proto::Opcode::Event, &body, None).unwrap();
            let _ = tx.send(Out::Frame(frame));
        }
    }
}

fn default_reply(request: &Request) -> Reply {
    match request {
        Request::Startup { .. } | Request::Register { .. } => Response::Ready.into(),
        Request::Options => Response::Supported {
            options: [("CQL_VERSION".to_string(), vec!["3.4.5".to_string()])]
                .into_iter()
                .collect(),
        }
        .into(),
        Request::Query { query, .. } if query.starts_with("USE ") => {
            let keyspace = query.trim_start_matches("USE ").trim_matches('"').to_string();
            Response::Result(QueryResult::SetKeyspace(keyspace)).into()
        }
        other => error(
            error_codes::SERVER_ERROR,
            &format!("mock has no reply for {:?}", other.opcode()),
        )
        .into(),
    }
}

async fn serve(socket: TcpStream, shared: Arc<Shared>) {
    let (mut reader, mut writer) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Out>();

    tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Out::Frame(frame) => {
                    if writer.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                Out::Close => break,
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut compression: Option<Compression> = None;
    loop {
        let mut first = [0u8; 1];
        if reader.read_exact(&mut first).await.is_err() {
            return;
        }
        let Ok(version) = ProtocolVersion::from_byte(first[0]) else {
            return;
        };
        let mut raw = vec![0u8; version.header_len()];
        raw[0] = first[0];
        if reader.read_exact(&mut raw[1..]).await.is_err() {
            return;
        }
        let header = FrameHeader::parse_request(&raw, version).unwrap();
        let mut body = vec![0u8; header.length];
        if reader.read_exact(&mut body).await.is_err() {
            return;
        }

        if version > shared.max_version {
            let message = format!(
                "Invalid or unsupported protocol version ({}); highest supported version is {}",
                version.as_byte(),
                shared.max_version.as_byte()
            );
            let reply = Response::Error(ErrorBody::new(error_codes::PROTOCOL_ERROR, message));
            let body = reply.serialize(version).unwrap();
            let frame = encode_response(version, header.stream, reply.opcode(), &body, None).unwrap();
            let _ = tx.send(Out::Frame(frame));
            let _ = tx.send(Out::Close);
            return;
        }

        if header.has_flag(flags::COMPRESSION) {
            let codec = compression.expect("compressed frame before negotiation");
            body = codec.decompress(&body).unwrap();
        }
        let request = Request::parse(header.opcode, &body, version).unwrap();
        if let Request::Startup { options } = &request {
            if options.get("COMPRESSION").map(String::as_str) == Some("lz4") {
                compression = Some(Compression::Lz4);
            }
        }
        shared.requests.lock().push(request.clone());

        let reply = (shared.handler)(&request);
        if matches!(request, Request::Register { .. }) {
            shared.subscribers.lock().push((version, tx.clone()));
        }

        let encode = |response: &Response, compression| {
            let body = response.serialize(version).unwrap();
            encode_response(version, header.stream, response.opcode(), &body, compression).unwrap()
        };
        match reply {
            // The STARTUP reply itself is never compressed.
            Reply::Respond(response) if matches!(request, Request::Startup { .. }) => {
                let _ = tx.send(Out::Frame(encode(&response, None)));
            }
            Reply::Respond(response) => {
                let _ = tx.send(Out::Frame(encode(&response, compression)));
            }
            Reply::Delayed(delay, response) => {
                let frame = encode(&response, compression);
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Out::Frame(frame));
                });
            }
            Reply::Drop => {
                let _ = tx.send(Out::Close);
                return;
            }
            Reply::Ignore => {}
        }
    }
}

pub fn error(code: i32, message: &str) -> Response {
    Response::Error(ErrorBody::new(code, message))
}

pub fn void() -> Response {
    Response::Result(QueryResult::Void)
}

/// Two columns (int, text) and the given rows.
pub fn id_name_rows(rows: Vec<(i32, &str)>) -> Rows {
    Rows::new(
        vec![
            ColumnSpec::new("ks", "users", "id", ColumnType::Int),
            ColumnSpec::new("ks", "users", "name", ColumnType::Text),
        ],
        rows.into_iter()
            .map(|(id, name)| vec![Value::Int(id), Value::Text(name.to_string())])
            .collect(),
    )
}

/// A PREPARED result with one int bind marker and (id, name) result columns.
pub fn prepared(id: &[u8]) -> Response {
    let mut bind =
        RowsMetadata::from_columns(vec![ColumnSpec::new("ks", "users", "id", ColumnType::Int)]);
    bind.pk_indexes = vec![0];
    let result = RowsMetadata::from_columns(id_name_rows(vec![]).columns().to_vec());
    Response::Result(QueryResult::Prepared(Prepared {
        id: id.to_vec(),
        bind,
        result,
    }))
}

pub fn query_text(request: &Request) -> Option<&str> {
    match request {
        Request::Query { query, .. } => Some(query),
        _ => None,
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("cassie_client=debug")
        .with_test_writer()
        .try_init();
}
