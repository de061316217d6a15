//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use cassie_proto::{Compression, EventType, ProtocolVersion};
use rand::Rng;

use crate::auth::{Authenticator, PlainTextAuthenticator};
use crate::load_balancing::{LoadBalancingPolicy, RoundRobinPolicy};
use crate::options::ExecutionOptions;

/// Default native protocol port.
pub const DEFAULT_PORT: u16 = 9042;

/// Default timeout for opening a connection, handshake included.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of connections per host.
pub const DEFAULT_CONNECTIONS_PER_HOST: usize = 1;

/// Exponential reconnection backoff, capped and jittered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectionPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter applied to each delay, in `[0, 1)`.
    pub jitter: f64,
}

impl ReconnectionPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: 0.15,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 0.99);
        self
    }

    /// Delay before reconnection attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay));
        if self.jitter <= 0.0 {
            return capped;
        }
        let scale = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        capped.mul_f64(scale).min(self.max_delay)
    }
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(60))
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Initial hosts, as `host` or `host:port`.
    pub contact_points: Vec<String>,

    /// Port used for contact points without one.
    pub port: u16,

    /// Highest protocol version to try; lower versions are negotiated if the
    /// server rejects it.
    pub protocol_version: ProtocolVersion,

    pub compression: Option<Compression>,

    pub authenticator: Option<Arc<dyn Authenticator>>,

    pub connect_timeout: Duration,

    pub connections_per_host: usize,

    pub reconnection: ReconnectionPolicy,

    /// Options used when an execution does not supply its own.
    pub execution: ExecutionOptions,

    pub load_balancing: Arc<dyn LoadBalancingPolicy>,

    /// Keyspace set with `USE` on every new connection.
    pub keyspace: Option<String>,

    /// Server events to subscribe to.
    pub events: Vec<EventType>,
}

impl ClientConfig {
    /// Create a configuration with the given contact points.
    pub fn new<S: Into<String>>(contact_points: impl IntoIterator<Item = S>) -> Self {
        Self {
            contact_points: contact_points.into_iter().map(Into::into).collect(),
            port: DEFAULT_PORT,
            protocol_version: ProtocolVersion::LATEST,
            compression: None,
            authenticator: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connections_per_host: DEFAULT_CONNECTIONS_PER_HOST,
            reconnection: ReconnectionPolicy::default(),
            execution: ExecutionOptions::default(),
            load_balancing: Arc::new(RoundRobinPolicy::new()),
            keyspace: None,
            events: Vec::new(),
        }
    }

    /// Create a configuration for a single local node.
    pub fn localhost() -> Self {
        Self::new(["127.0.0.1"])
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_compression(mut self, compression: Option<Compression>) -> Self {
        self.compression = compression;
        self
    }

    /// Authenticate with a username and password.
    pub fn with_credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.with_authenticator(Arc::new(PlainTextAuthenticator::new(username, password)))
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the connections opened per host; at least one is always kept.
    pub fn with_connections_per_host(mut self, n: usize) -> Self {
        self.connections_per_host = n.max(1);
        self
    }

    pub fn with_reconnection(mut self, policy: ReconnectionPolicy) -> Self {
        self.reconnection = policy;
        self
    }

    pub fn with_execution_options(mut self, options: ExecutionOptions) -> Self {
        self.execution = options;
        self
    }

    pub fn with_load_balancing(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.load_balancing = policy;
        self
    }

    pub fn with_keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.keyspace = Some(keyspace.into());
        self
    }

    /// Subscribe to server events.
    pub fn with_events(mut self, events: Vec<EventType>) -> Self {
        self.events = events;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::localhost()
    }
}
