//! A multiplexed connection to one node.
//!
//! Each connection is driven by a single router task that owns the transport.
//! The router runs a writer, which assigns stream ids and writes queued
//! requests, and a reader, which resolves the waiter registered for each
//! response's stream id. Callers only contend on a short critical section
//! around the stream table; round trips never hold a lock.
//!
//! ```text
//! send() --Task--> [writer] --frame--> socket
//!   ^                  |  register stream id
//!   |               handlers
//!   |                  |  resolve stream id
//! oneshot <------- [reader] <--frame-- socket
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cassie_proto::frame::EVENT_STREAM_ID;
use cassie_proto::{
    Compression, Event, EventType, FrameHeader, ProtocolVersion, QueryParameters, QueryResult,
    Request, RequestFrame, Response, ResponseFrame,
};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};

use crate::auth::Authenticator;
use crate::classifier::classify;
use crate::config::DEFAULT_CONNECT_TIMEOUT;
use crate::error::Error;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, handshake in progress.
    Connecting,
    /// Accepting requests.
    Ready,
    /// Refusing new requests; closes once in-flight requests complete.
    Draining,
    /// Transport closed. Terminal.
    Closed,
}

/// Settings for opening a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Version to request; lower versions are tried if the server rejects it.
    pub version: ProtocolVersion,
    pub compression: Option<Compression>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub connect_timeout: Duration,
    pub keyspace: Option<String>,
    pub event_types: Vec<EventType>,
    /// Receives server events; REGISTER is sent during the handshake when
    /// `event_types` is also non-empty.
    pub event_sender: Option<broadcast::Sender<Event>>,
}

impl ConnectionConfig {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            compression: None,
            authenticator: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keyspace: None,
            event_types: Vec::new(),
            event_sender: None,
        }
    }

    pub fn with_compression(mut self, compression: Option<Compression>) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Option<Arc<dyn Authenticator>>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_keyspace(mut self, keyspace: Option<String>) -> Self {
        self.keyspace = keyspace;
        self
    }

    pub fn with_events(mut self, types: Vec<EventType>, sender: broadcast::Sender<Event>) -> Self {
        self.event_types = types;
        self.event_sender = Some(sender);
        self
    }

    fn registers_events(&self) -> bool {
        self.event_sender.is_some() && !self.event_types.is_empty()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(ProtocolVersion::LATEST)
    }
}

/// Reads one response frame.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    version: ProtocolVersion,
    compression: Option<Compression>,
) -> Result<ResponseFrame, Error> {
    let mut raw = [0u8; 9];
    let raw = &mut raw[..version.header_len()];
    reader.read_exact(raw).await.map_err(|e| read_error(&e))?;
    let header = FrameHeader::parse_response(raw, version)?;

    let mut body = vec![0u8; header.length];
    reader.read_exact(&mut body).await.map_err(|e| read_error(&e))?;
    Ok(ResponseFrame::decode(header, Bytes::from(body), compression)?)
}

/// Writes and flushes one request frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &RequestFrame,
) -> Result<(), Error> {
    writer
        .write_all(frame.as_bytes())
        .await
        .map_err(|e| Error::Connection(format!("write failed: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Connection(format!("flush failed: {}", e)))
}

fn read_error(e: &std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Connection("connection closed by server".to_string())
    } else {
        Error::Connection(format!("read failed: {}", e))
    }
}

type ResponseSender = oneshot::Sender<Result<ResponseFrame, Error>>;

/// A request waiting for the writer.
struct Task {
    frame: RequestFrame,
    response_tx: ResponseSender,
}

/// Stream ids in use, lowest free id first.
struct StreamIdSet {
    used: Vec<u64>,
    max: i16,
}

impl StreamIdSet {
    fn new(max: i16) -> Self {
        let ids = max as usize + 1;
        Self {
            used: vec![0; ids.div_ceil(64)],
            max,
        }
    }

    fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones() as usize;
                let id = block_id * 64 + off;
                if id > self.max as usize {
                    return None;
                }
                *block |= 1u64 << off;
                return Some(id as i16);
            }
        }
        None
    }

    fn free(&mut self, id: i16) {
        let id = id as usize;
        if let Some(block) = self.used.get_mut(id / 64) {
            *block &= !(1u64 << (id % 64));
        }
    }
}

struct Inner {
    state: ConnectionState,
    streams: StreamIdSet,
    /// Waiters by stream id. A waiter whose caller went away stays here until
    /// its response arrives, so the id is not reused early.
    handlers: HashMap<i16, ResponseSender>,
    /// Tasks submitted but not yet picked up by the writer.
    queued: usize,
    close_reason: Option<String>,
}

struct Shared {
    id: u64,
    endpoint: SocketAddr,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: Notify,
}

impl Shared {
    fn lost(&self, reason: &str, request_written: bool) -> Error {
        Error::ConnectionLost {
            endpoint: self.endpoint,
            reason: reason.to_string(),
            request_written,
        }
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    fn finish_drain_if_idle(&self, inner: &mut Inner) {
        if inner.state == ConnectionState::Draining && inner.queued == 0 && inner.handlers.is_empty()
        {
            inner.close_reason.get_or_insert_with(|| "drained".to_string());
            self.shutdown.notify_one();
        }
    }

    /// Moves to `Closed` and fails every registered waiter.
    fn break_connection(&self, reason: &str) {
        let handlers = {
            let mut inner = self.inner.lock();
            self.set_state(&mut inner, ConnectionState::Closed);
            inner.close_reason.get_or_insert_with(|| reason.to_string());
            std::mem::take(&mut inner.handlers)
        };
        for (_, tx) in handlers {
            let _ = tx.send(Err(self.lost(reason, true)));
        }
    }
}

/// A connection to one node.
///
/// Cheap to share behind an `Arc`; any number of tasks may call
/// [`Connection::send`] concurrently.
pub struct Connection {
    shared: Arc<Shared>,
    submit: mpsc::UnboundedSender<Task>,
    state_rx: watch::Receiver<ConnectionState>,
    version: ProtocolVersion,
    compression: Option<Compression>,
}

impl Connection {
    /// Connect over TCP and perform the handshake, downgrading the protocol
    /// version while the server rejects it.
    pub async fn open(endpoint: SocketAddr, config: ConnectionConfig) -> Result<Self, Error> {
        let mut version = config.version;
        loop {
            let attempt = async {
                let stream = TcpStream::connect(endpoint).await.map_err(|e| {
                    Error::Connection(format!("failed to connect to {}: {}", endpoint, e))
                })?;
                stream
                    .set_nodelay(true)
                    .map_err(|e| Error::Connection(format!("failed to set TCP_NODELAY: {}", e)))?;
                Self::establish(stream, endpoint, &config, version).await
            };
            let result = tokio::time::timeout(config.connect_timeout, attempt)
                .await
                .unwrap_or_else(|_| {
                    Err(Error::Connection(format!(
                        "timed out connecting to {} after {:?}",
                        endpoint, config.connect_timeout
                    )))
                });

            match result {
                Err(e) if rejects_version(&e) => match version.downgrade() {
                    Some(lower) => {
                        tracing::info!(%endpoint, from = %version, to = %lower, "protocol version rejected, downgrading");
                        version = lower;
                    }
                    None => return Err(e),
                },
                other => return other,
            }
        }
    }

    /// Perform the handshake over an already open transport.
    pub async fn from_stream<S>(
        stream: S,
        endpoint: SocketAddr,
        config: ConnectionConfig,
    ) -> Result<Self, Error>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::establish(stream, endpoint, &config, config.version).await
    }

    async fn establish<S>(
        mut stream: S,
        endpoint: SocketAddr,
        config: &ConnectionConfig,
        version: ProtocolVersion,
    ) -> Result<Self, Error>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            id,
            endpoint,
            inner: Mutex::new(Inner {
                state: ConnectionState::Connecting,
                streams: StreamIdSet::new(version.max_stream_id()),
                handlers: HashMap::new(),
                queued: 0,
                close_reason: None,
            }),
            state_tx,
            shutdown: Notify::new(),
        });

        let mut handshake = Handshake {
            stream: &mut stream,
            endpoint,
            version,
            compression: config.compression,
        };
        if let Err(e) = handshake.run(config).await {
            shared.break_connection(&e.to_string());
            return Err(e);
        }

        {
            let mut inner = shared.inner.lock();
            shared.set_state(&mut inner, ConnectionState::Ready);
        }
        tracing::debug!(connection = id, %endpoint, %version, "connection ready");

        let (submit, tasks) = mpsc::unbounded_channel();
        let events = config.event_sender.clone();
        tokio::spawn(router(
            stream,
            Arc::clone(&shared),
            tasks,
            version,
            config.compression,
            events,
        ));

        Ok(Self {
            shared,
            submit,
            state_rx,
            version,
            compression: config.compression,
        })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.shared.endpoint
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn compression(&self) -> Option<Compression> {
        self.compression
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Requests queued or awaiting a response, abandoned ones included.
    pub fn in_flight(&self) -> usize {
        let inner = self.shared.inner.lock();
        inner.queued + inner.handlers.len()
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<String> {
        self.shared.inner.lock().close_reason.clone()
    }

    /// Builds a request frame for this connection.
    pub fn frame(&self, request: &Request, tracing: bool) -> Result<RequestFrame, Error> {
        let body = request.serialize(self.version)?;
        Ok(RequestFrame::new(
            self.version,
            request.opcode(),
            &body,
            self.compression,
            tracing,
        )?)
    }

    /// Sends a frame and waits for its response.
    ///
    /// Dropping the returned future does not retract the request; its stream
    /// id is released when the response arrives or the connection closes.
    pub async fn send(&self, frame: RequestFrame) -> Result<ResponseFrame, Error> {
        let (response_tx, response_rx) = oneshot::channel();
        {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                ConnectionState::Ready => {}
                ConnectionState::Draining => {
                    return Err(Error::NoConnectionsAvailable(format!(
                        "connection to {} is draining",
                        self.shared.endpoint
                    )));
                }
                ConnectionState::Connecting | ConnectionState::Closed => {
                    let reason = inner.close_reason.as_deref().unwrap_or("not connected");
                    return Err(self.shared.lost(reason, false));
                }
            }
            if self.submit.send(Task { frame, response_tx }).is_err() {
                return Err(self.shared.lost("router stopped", false));
            }
            inner.queued += 1;
        }

        match response_rx.await {
            Ok(result) => result,
            Err(_) => Err(self.shared.lost("response channel closed", true)),
        }
    }

    /// Sends a request and parses the response. Server errors are returned
    /// as [`Error::Server`].
    pub async fn request(&self, request: &Request) -> Result<Response, Error> {
        let frame = self.frame(request, false)?;
        let response = self.send(frame).await?;
        match Response::parse(response.header.opcode, &response.body, self.version, None)? {
            Response::Error(body) => Err(Error::Server(classify(body))),
            other => Ok(other),
        }
    }

    /// Options the server supports, from OPTIONS/SUPPORTED.
    pub async fn options(&self) -> Result<HashMap<String, Vec<String>>, Error> {
        match self.request(&Request::Options).await? {
            Response::Supported { options } => Ok(options),
            other => Err(unexpected("OPTIONS", &other)),
        }
    }

    /// Switch the connection to `keyspace`.
    pub async fn use_keyspace(&self, keyspace: &str) -> Result<(), Error> {
        match self.request(&use_request(keyspace)).await? {
            Response::Result(QueryResult::SetKeyspace(_)) => Ok(()),
            other => Err(unexpected("USE", &other)),
        }
    }

    /// Register for server events after the handshake. Events are only
    /// delivered if the connection was opened with an event sender.
    pub async fn register(&self, events: Vec<EventType>) -> Result<(), Error> {
        match self.request(&Request::Register { events }).await? {
            Response::Ready => Ok(()),
            other => Err(unexpected("REGISTER", &other)),
        }
    }

    /// Stop accepting requests and close once in-flight ones complete.
    pub fn drain(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.state == ConnectionState::Ready {
            tracing::debug!(connection = self.shared.id, endpoint = %self.shared.endpoint, "draining connection");
            self.shared.set_state(&mut inner, ConnectionState::Draining);
            self.shared.finish_drain_if_idle(&mut inner);
        }
    }

    /// Close immediately, failing in-flight requests.
    pub async fn close(&self) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state != ConnectionState::Closed {
                inner
                    .close_reason
                    .get_or_insert_with(|| "closed by client".to_string());
                self.shared.shutdown.notify_one();
            }
        }
        self.closed().await;
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.on_closed().await
    }

    /// Like [`Connection::closed`], but does not borrow the connection.
    pub fn on_closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut state_rx = self.state_rx.clone();
        async move {
            let _ = state_rx
                .wait_for(|state| *state == ConnectionState::Closed)
                .await;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("endpoint", &self.shared.endpoint)
            .field("version", &self.version)
            .field("state", &self.state())
            .finish()
    }
}

/// The handshake runs on the raw transport before the router starts, one
/// request at a time on stream 0.
struct Handshake<'a, S> {
    stream: &'a mut S,
    endpoint: SocketAddr,
    version: ProtocolVersion,
    compression: Option<Compression>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Handshake<'_, S> {
    async fn run(&mut self, config: &ConnectionConfig) -> Result<(), Error> {
        match self.exchange(&Request::startup(self.compression)).await? {
            Response::Ready => {}
            Response::Authenticate { authenticator } => {
                self.authenticate(config, &authenticator).await?
            }
            other => return Err(unexpected("STARTUP", &other)),
        }

        if let Some(keyspace) = &config.keyspace {
            match self.exchange(&use_request(keyspace)).await? {
                Response::Result(QueryResult::SetKeyspace(_)) => {}
                other => return Err(unexpected("USE", &other)),
            }
        }

        if config.registers_events() {
            let register = Request::Register {
                events: config.event_types.clone(),
            };
            match self.exchange(&register).await? {
                Response::Ready => {}
                other => return Err(unexpected("REGISTER", &other)),
            }
        }
        Ok(())
    }

    async fn authenticate(&mut self, config: &ConnectionConfig, class: &str) -> Result<(), Error> {
        let authenticator = config.authenticator.as_ref().ok_or_else(|| {
            Error::Authentication(format!(
                "{} requires authentication ({}) but no authenticator is configured",
                self.endpoint, class
            ))
        })?;
        tracing::debug!(endpoint = %self.endpoint, authenticator = class, "authenticating");

        let mut session = authenticator.new_session(class)?;
        let mut token = session.initial_response()?;
        loop {
            let response = self
                .exchange(&Request::AuthResponse {
                    token: token.take(),
                })
                .await?;
            match response {
                Response::AuthChallenge { token: challenge } => {
                    token = session.evaluate_challenge(challenge.as_deref())?;
                }
                Response::AuthSuccess { token: success } => {
                    return session.on_success(success.as_deref());
                }
                other => return Err(unexpected("AUTH_RESPONSE", &other)),
            }
        }
    }

    async fn exchange(&mut self, request: &Request) -> Result<Response, Error> {
        let body = request.serialize(self.version)?;
        let frame = RequestFrame::new(
            self.version,
            request.opcode(),
            &body,
            self.compression,
            false,
        )?;
        write_frame(&mut *self.stream, &frame).await?;
        loop {
            let response = read_frame(&mut *self.stream, self.version, self.compression).await?;
            if response.header.stream < 0 {
                continue;
            }
            return match Response::parse(response.header.opcode, &response.body, self.version, None)?
            {
                Response::Error(body) => Err(Error::Server(classify(body))),
                other => Ok(other),
            };
        }
    }
}

async fn router<S>(
    stream: S,
    shared: Arc<Shared>,
    mut tasks: mpsc::UnboundedReceiver<Task>,
    version: ProtocolVersion,
    compression: Option<Compression>,
    events: Option<broadcast::Sender<Event>>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    let reason = tokio::select! {
        e = read_loop(&mut reader, &shared, version, compression, events.as_ref()) => {
            tracing::warn!(connection = shared.id, endpoint = %shared.endpoint, error = %e, "connection broken");
            e.to_string()
        }
        res = write_loop(&mut writer, &shared, &mut tasks) => match res {
            Ok(()) => "connection dropped".to_string(),
            Err(e) => {
                tracing::warn!(connection = shared.id, endpoint = %shared.endpoint, error = %e, "connection broken");
                e.to_string()
            }
        },
        _ = shared.shutdown.notified() => shared
            .inner
            .lock()
            .close_reason
            .clone()
            .unwrap_or_else(|| "closed".to_string()),
    };

    shared.break_connection(&reason);
    tasks.close();
    while let Ok(task) = tasks.try_recv() {
        let _ = task.response_tx.send(Err(shared.lost(&reason, false)));
    }
    let _ = writer.shutdown().await;
    tracing::debug!(connection = shared.id, endpoint = %shared.endpoint, reason = %reason, "connection closed");
}

async fn read_loop<R: AsyncRead + Unpin>(
    reader: &mut R,
    shared: &Shared,
    version: ProtocolVersion,
    compression: Option<Compression>,
    events: Option<&broadcast::Sender<Event>>,
) -> Error {
    loop {
        let frame = match read_frame(reader, version, compression).await {
            Ok(frame) => frame,
            Err(e) => return e,
        };
        let stream = frame.header.stream;

        if stream < 0 {
            if stream == EVENT_STREAM_ID {
                if let Some(events) = events {
                    match Response::parse(frame.header.opcode, &frame.body, version, None) {
                        Ok(Response::Event(event)) => {
                            tracing::debug!(endpoint = %shared.endpoint, ?event, "server event");
                            let _ = events.send(event);
                        }
                        Ok(other) => {
                            tracing::debug!(opcode = ?other.opcode(), "ignoring non-event frame on event stream")
                        }
                        Err(e) => return e.into(),
                    }
                }
            }
            continue;
        }

        let handler = {
            let mut inner = shared.inner.lock();
            let handler = inner.handlers.remove(&stream);
            if handler.is_some() {
                inner.streams.free(stream);
                shared.finish_drain_if_idle(&mut inner);
            }
            handler
        };
        match handler {
            Some(tx) => {
                if tx.send(Ok(frame)).is_err() {
                    tracing::debug!(endpoint = %shared.endpoint, stream, "discarding response to abandoned request");
                }
            }
            None => {
                return Error::Protocol(format!(
                    "response on stream {} with no pending request",
                    stream
                ))
            }
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    writer: &mut W,
    shared: &Shared,
    tasks: &mut mpsc::UnboundedReceiver<Task>,
) -> Result<(), Error> {
    while let Some(Task {
        mut frame,
        response_tx,
    }) = tasks.recv().await
    {
        let stream = {
            let mut inner = shared.inner.lock();
            inner.queued = inner.queued.saturating_sub(1);
            if response_tx.is_closed() {
                // Caller gave up before anything was written.
                shared.finish_drain_if_idle(&mut inner);
                continue;
            }
            match inner.streams.allocate() {
                Some(stream) => {
                    inner.handlers.insert(stream, response_tx);
                    stream
                }
                None => {
                    tracing::warn!(endpoint = %shared.endpoint, "no free stream id");
                    let _ = response_tx.send(Err(Error::NoConnectionsAvailable(format!(
                        "all stream ids in use on {}",
                        shared.endpoint
                    ))));
                    shared.finish_drain_if_idle(&mut inner);
                    continue;
                }
            }
        };

        frame.set_stream(stream);
        tracing::trace!(endpoint = %shared.endpoint, stream, "writing request");
        write_frame(writer, &frame).await?;
    }
    Ok(())
}

fn rejects_version(error: &Error) -> bool {
    match error {
        Error::Protocol(msg) => msg.contains("protocol version"),
        Error::Server(e) => {
            e.code == cassie_proto::error_codes::PROTOCOL_ERROR
                && e.message.to_ascii_lowercase().contains("version")
        }
        _ => false,
    }
}

fn unexpected(request: &str, response: &Response) -> Error {
    Error::Protocol(format!(
        "unexpected {:?} in response to {}",
        response.opcode(),
        request
    ))
}

fn use_request(keyspace: &str) -> Request {
    Request::Query {
        query: format!("USE {}", quote_keyspace(keyspace)),
        params: QueryParameters::default(),
    }
}

/// Quotes a keyspace name unless it is already quoted or needs no quoting.
fn quote_keyspace(keyspace: &str) -> String {
    let plain = keyspace
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain || (keyspace.len() >= 2 && keyspace.starts_with('"') && keyspace.ends_with('"')) {
        keyspace.to_string()
    } else {
        format!("\"{}\"", keyspace.replace('"', "\"\""))
    }
}
