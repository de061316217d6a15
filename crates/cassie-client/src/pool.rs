//! Connections to every known host.
//!
//! The pool resolves the contact points once, opens
//! [`ClientConfig::connections_per_host`] connections to each host and keeps
//! that number up: when a connection closes, a monitor task removes it and
//! reconnects with exponential backoff. Acquisition never waits; a host with
//! no ready connection fails fast with [`Error::NoConnectionsAvailable`] so
//! the caller can move on to the next host.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use cassie_proto::{Event, ProtocolVersion};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionConfig};
use crate::error::Error;
use crate::load_balancing::RoutingInfo;

/// Capacity of the server event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A pool of connections across hosts.
///
/// Cloning is cheap; clones share the same connections.
///
/// # Example
///
/// ```ignore
/// use cassie_client::{ClientConfig, ConnectionPool, RoutingInfo};
///
/// let pool = ConnectionPool::connect(
///     ClientConfig::new(["10.0.0.1", "10.0.0.2"]).with_connections_per_host(2),
/// )
/// .await?;
///
/// let host = pool.hosts()[0];
/// let conn = pool.acquire(host, &RoutingInfo::default())?;
/// println!("using connection {} to {}", conn.id(), conn.endpoint());
/// ```
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: ClientConfig,
    hosts: Vec<SocketAddr>,
    version: ProtocolVersion,
    connections: Mutex<HashMap<SocketAddr, Vec<Arc<Connection>>>>,
    keyspace: RwLock<Option<String>>,
    events: broadcast::Sender<Event>,
    event_owner: Mutex<EventOwner>,
    closed: AtomicBool,
}

/// Which connection, if any, is registered for server events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum EventOwner {
    #[default]
    Unregistered,
    /// A REGISTER is in flight; nobody else may start one.
    Registering,
    Connection(u64),
}

impl EventOwner {
    /// Take the registration slot if it is free.
    fn claim(&mut self) -> bool {
        if *self == EventOwner::Unregistered {
            *self = EventOwner::Registering;
            true
        } else {
            false
        }
    }

    /// Give up a claimed slot after every candidate failed.
    fn release(&mut self) {
        if *self == EventOwner::Registering {
            *self = EventOwner::Unregistered;
        }
    }

    /// Free the slot if connection `id` holds it.
    fn disown(&mut self, id: u64) -> bool {
        if *self == EventOwner::Connection(id) {
            *self = EventOwner::Unregistered;
            true
        } else {
            false
        }
    }
}

impl ConnectionPool {
    /// Resolve the contact points and open connections to every host.
    ///
    /// The protocol version is negotiated on the first connection that opens
    /// and used for all others. Fails only if no host can be reached;
    /// connections that fail to open later are retried in the background.
    pub async fn connect(config: ClientConfig) -> Result<Self, Error> {
        let hosts = resolve_contact_points(&config.contact_points, config.port).await?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        // Negotiate the version against the first reachable host.
        let mut first = None;
        let mut last_error = None;
        for &host in &hosts {
            let conn_config = connection_config(&config, config.protocol_version, &events);
            match Connection::open(host, conn_config).await {
                Ok(conn) => {
                    first = Some(conn);
                    break;
                }
                Err(e) => {
                    tracing::warn!(endpoint = %host, error = %e, "contact point unreachable");
                    last_error = Some(e);
                }
            }
        }
        let first = first.ok_or_else(|| match last_error {
            Some(e @ (Error::Authentication(_) | Error::Server(_))) => e,
            Some(e) => Error::Connection(format!("could not connect to any contact point: {}", e)),
            None => Error::Connection("no contact points".to_string()),
        })?;

        let version = first.version();
        tracing::info!(hosts = hosts.len(), %version, "connected to cluster");

        let inner = Arc::new(PoolInner {
            keyspace: RwLock::new(config.keyspace.clone()),
            config,
            hosts,
            version,
            connections: Mutex::new(HashMap::new()),
            events,
            event_owner: Mutex::new(EventOwner::Unregistered),
            closed: AtomicBool::new(false),
        });
        let first_host = first.endpoint();
        PoolInner::add(&inner, Arc::new(first));

        let per_host = inner.config.connections_per_host;
        let opens = inner.hosts.iter().flat_map(|&host| {
            let wanted = if host == first_host { per_host.saturating_sub(1) } else { per_host };
            (0..wanted).map(move |_| host)
        });
        let opened = join_all(opens.map(|host| {
            let config = inner.connection_config();
            async move { (host, Connection::open(host, config).await) }
        }))
        .await;
        for (host, result) in opened {
            match result {
                Ok(conn) => PoolInner::add(&inner, Arc::new(conn)),
                Err(e) => {
                    tracing::warn!(endpoint = %host, error = %e, "failed to open connection");
                    tokio::spawn(reconnect(Arc::downgrade(&inner), host));
                }
            }
        }

        inner.ensure_event_registration().await;
        Ok(Self { inner })
    }

    /// Pick a ready connection to `endpoint`.
    pub fn acquire(
        &self,
        endpoint: SocketAddr,
        routing: &RoutingInfo<'_>,
    ) -> Result<Arc<Connection>, Error> {
        if self.is_closed() {
            return Err(Error::NoConnectionsAvailable("pool is closed".to_string()));
        }
        let ready: Vec<Arc<Connection>> = self
            .connections(endpoint)
            .into_iter()
            .filter(|conn| conn.is_ready())
            .collect();
        let in_flight: Vec<usize> = ready.iter().map(|conn| conn.in_flight()).collect();

        self.inner
            .config
            .load_balancing
            .select_connection(&in_flight, routing)
            .and_then(|i| ready.get(i).cloned())
            .ok_or_else(|| {
                Error::NoConnectionsAvailable(format!("no ready connection to {}", endpoint))
            })
    }

    /// Resolved hosts, in contact point order.
    pub fn hosts(&self) -> &[SocketAddr] {
        &self.inner.hosts
    }

    /// Open connections to `endpoint`, ready or not.
    pub fn connections(&self, endpoint: SocketAddr) -> Vec<Arc<Connection>> {
        self.inner
            .connections
            .lock()
            .get(&endpoint)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of open connections across all hosts.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().values().map(Vec::len).sum()
    }

    /// Protocol version negotiated for this pool.
    pub fn version(&self) -> ProtocolVersion {
        self.inner.version
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Keyspace new connections switch to.
    pub fn keyspace(&self) -> Option<String> {
        self.inner.keyspace.read().clone()
    }

    /// Record `keyspace` for new connections and switch every open one.
    ///
    /// Connections that fail to switch are drained and replaced.
    pub async fn set_keyspace(&self, keyspace: &str) {
        {
            let mut current = self.inner.keyspace.write();
            if current.as_deref() == Some(keyspace) {
                return;
            }
            *current = Some(keyspace.to_string());
        }
        tracing::info!(keyspace, "switching keyspace");

        let all: Vec<Arc<Connection>> = self.all_connections();
        let results = join_all(all.iter().map(|conn| conn.use_keyspace(keyspace))).await;
        for (conn, result) in all.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(connection = conn.id(), endpoint = %conn.endpoint(), keyspace, error = %e, "failed to switch keyspace");
                conn.drain();
            }
        }
    }

    /// Subscribe to server events. Events are only delivered when the
    /// configuration names event types.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Gracefully retire a connection; it is replaced once it has drained.
    pub fn retire(&self, connection: &Connection) {
        connection.drain();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close every connection. In-flight requests fail.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let all: Vec<Arc<Connection>> = {
            let mut connections = self.inner.connections.lock();
            connections.drain().flat_map(|(_, conns)| conns).collect()
        };
        join_all(all.iter().map(|conn| conn.close())).await;
        tracing::info!(connections = all.len(), "pool closed");
    }

    fn all_connections(&self) -> Vec<Arc<Connection>> {
        self.inner
            .connections
            .lock()
            .values()
            .flatten()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("hosts", &self.inner.hosts)
            .field("version", &self.inner.version)
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl PoolInner {
    fn connection_config(&self) -> ConnectionConfig {
        let mut config = connection_config(&self.config, self.version, &self.events);
        config.keyspace = self.keyspace.read().clone();
        config
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Track `conn` and watch for it to close.
    fn add(this: &Arc<Self>, conn: Arc<Connection>) {
        let endpoint = conn.endpoint();
        let id = conn.id();
        let closed = conn.on_closed();
        this.connections
            .lock()
            .entry(endpoint)
            .or_default()
            .push(conn);

        let pool = Arc::downgrade(this);
        tokio::spawn(async move {
            closed.await;
            let Some(inner) = pool.upgrade() else {
                return;
            };
            let reason = inner.remove(endpoint, id);
            if inner.is_closed() {
                return;
            }
            tracing::info!(connection = id, %endpoint, reason = reason.as_deref().unwrap_or("unknown"), "connection closed, reconnecting");

            let was_owner = inner.event_owner.lock().disown(id);
            if was_owner {
                inner.ensure_event_registration().await;
            }
            drop(inner);
            reconnect(pool, endpoint).await;
        });
    }

    /// Stop tracking a connection, returning why it closed.
    fn remove(&self, endpoint: SocketAddr, id: u64) -> Option<String> {
        let mut connections = self.connections.lock();
        let conns = connections.get_mut(&endpoint)?;
        let pos = conns.iter().position(|conn| conn.id() == id)?;
        let conn = conns.swap_remove(pos);
        if conns.is_empty() {
            connections.remove(&endpoint);
        }
        conn.close_reason()
    }

    /// Register one ready connection for server events if none is.
    async fn ensure_event_registration(&self) {
        if self.config.events.is_empty() || !self.event_owner.lock().claim() {
            return;
        }
        let candidates: Vec<Arc<Connection>> = self
            .connections
            .lock()
            .values()
            .flatten()
            .filter(|conn| conn.is_ready())
            .cloned()
            .collect();

        for conn in candidates {
            match conn.register(self.config.events.clone()).await {
                Ok(()) => {
                    *self.event_owner.lock() = EventOwner::Connection(conn.id());
                    // Its close monitor may have run before ownership was set.
                    if !conn.is_ready() {
                        let mut owner = self.event_owner.lock();
                        if *owner != EventOwner::Connection(conn.id()) {
                            return;
                        }
                        *owner = EventOwner::Registering;
                        continue;
                    }
                    tracing::debug!(connection = conn.id(), endpoint = %conn.endpoint(), "registered for server events");
                    return;
                }
                Err(e) => {
                    tracing::warn!(connection = conn.id(), endpoint = %conn.endpoint(), error = %e, "event registration failed");
                }
            }
        }
        self.event_owner.lock().release();
    }
}

fn connection_config(
    config: &ClientConfig,
    version: ProtocolVersion,
    events: &broadcast::Sender<Event>,
) -> ConnectionConfig {
    // Types are left empty so the handshake does not REGISTER; the pool
    // registers exactly one connection afterwards.
    ConnectionConfig::new(version)
        .with_compression(config.compression)
        .with_authenticator(config.authenticator.clone())
        .with_connect_timeout(config.connect_timeout)
        .with_keyspace(config.keyspace.clone())
        .with_events(Vec::new(), events.clone())
}

/// Reopen a connection to `endpoint` until it succeeds or the pool goes away.
async fn reconnect(pool: Weak<PoolInner>, endpoint: SocketAddr) {
    let mut attempt = 0u32;
    loop {
        let (delay, config) = {
            let Some(inner) = pool.upgrade() else {
                return;
            };
            if inner.is_closed() {
                return;
            }
            (inner.config.reconnection.delay(attempt), inner.connection_config())
        };
        tokio::time::sleep(delay).await;

        match Connection::open(endpoint, config).await {
            Ok(conn) => {
                let Some(inner) = pool.upgrade() else {
                    conn.close().await;
                    return;
                };
                if inner.is_closed() {
                    conn.close().await;
                    return;
                }
                tracing::info!(connection = conn.id(), %endpoint, attempt, "reconnected");
                PoolInner::add(&inner, Arc::new(conn));
                inner.ensure_event_registration().await;
                return;
            }
            Err(e) => {
                tracing::warn!(%endpoint, attempt, error = %e, "reconnection failed");
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// Resolve `host` and `host:port` contact points, dropping duplicates.
async fn resolve_contact_points(
    contact_points: &[String],
    default_port: u16,
) -> Result<Vec<SocketAddr>, Error> {
    let mut hosts = Vec::new();
    for point in contact_points {
        let resolved: Vec<SocketAddr> = if let Ok(addr) = point.parse::<SocketAddr>() {
            vec![addr]
        } else if let Ok(ip) = point.parse::<std::net::IpAddr>() {
            vec![SocketAddr::new(ip, default_port)]
        } else if point.contains(':') {
            lookup(point.as_str()).await?
        } else {
            lookup((point.as_str(), default_port)).await?
        };
        for addr in resolved {
            if !hosts.contains(&addr) {
                hosts.push(addr);
            }
        }
    }
    if hosts.is_empty() {
        return Err(Error::InvalidArgument("no contact points resolved".to_string()));
    }
    Ok(hosts)
}

async fn lookup<A>(host: A) -> Result<Vec<SocketAddr>, Error>
where
    A: tokio::net::ToSocketAddrs + std::fmt::Debug + Copy,
{
    tokio::net::lookup_host(host)
        .await
        .map(|addrs| addrs.collect())
        .map_err(|e| Error::Connection(format!("failed to resolve {:?}: {}", host, e)))
}
