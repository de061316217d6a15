//! Host and connection selection.
//!
//! The pool and executor only talk to [`LoadBalancingPolicy`]; token- or
//! shard-aware policies plug in by reading the [`RoutingInfo`] of a
//! statement.

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// What is known about where a statement's data lives.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoutingInfo<'a> {
    pub keyspace: Option<&'a str>,
    /// Serialized partition key, when the statement is prepared and all key
    /// components are bound.
    pub routing_key: Option<&'a [u8]>,
}

/// Chooses hosts for an execution and a connection within a host.
pub trait LoadBalancingPolicy: Send + Sync + Debug {
    /// Hosts to try, in order.
    fn query_plan(&self, hosts: &[SocketAddr], routing: &RoutingInfo<'_>) -> Vec<SocketAddr>;

    /// Pick one of a host's usable connections given their in-flight counts.
    fn select_connection(&self, in_flight: &[usize], routing: &RoutingInfo<'_>) -> Option<usize>;
}

/// Rotates through hosts and connections.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    next_host: AtomicUsize,
    next_connection: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn query_plan(&self, hosts: &[SocketAddr], _routing: &RoutingInfo<'_>) -> Vec<SocketAddr> {
        if hosts.is_empty() {
            return Vec::new();
        }
        let start = self.next_host.fetch_add(1, Ordering::Relaxed) % hosts.len();
        hosts[start..].iter().chain(&hosts[..start]).copied().collect()
    }

    fn select_connection(&self, in_flight: &[usize], _routing: &RoutingInfo<'_>) -> Option<usize> {
        if in_flight.is_empty() {
            return None;
        }
        Some(self.next_connection.fetch_add(1, Ordering::Relaxed) % in_flight.len())
    }
}

/// Serializes partition key components into a routing key.
///
/// A single component is used as is; composite keys are encoded as
/// `[u16 length][bytes][0]` per component.
pub fn compose_routing_key(components: &[&[u8]]) -> Option<Vec<u8>> {
    match components {
        [] => None,
        [single] => Some(single.to_vec()),
        many => {
            let mut key = Vec::new();
            for component in many {
                let len = u16::try_from(component.len()).ok()?;
                key.extend_from_slice(&len.to_be_bytes());
                key.extend_from_slice(component);
                key.push(0);
            }
            Some(key)
        }
    }
}
