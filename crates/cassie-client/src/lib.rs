//! Cassie Client - async driver for Cassandra-compatible databases.
//!
//! This crate speaks the binary native protocol (v2 to v4) over multiplexed
//! connections, pools them per host, and runs statements with retries and
//! transparent re-preparation.
//!
//! # Quick Start
//!
//! ```ignore
//! use cassie_client::{ClientConfig, ExecutionOptions, Session};
//! use cassie_client::proto::{Consistency, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Connect to the cluster
//!     let config = ClientConfig::new(["10.0.0.1", "10.0.0.2"])
//!         .with_credentials("cassandra", "cassandra")
//!         .with_keyspace("app");
//!     let session = Session::connect(config).await?;
//!
//!     // Prepare once, execute many times
//!     let select = session.prepare("SELECT id, name FROM users WHERE id = ?").await?;
//!     let options = ExecutionOptions::new()
//!         .with_consistency(Consistency::Quorum)
//!         .with_idempotent(true);
//!     let result = session
//!         .execute_with(session.bind(&select, vec![Value::Int(42)])?, &options)
//!         .await?;
//!
//!     if let Some(rows) = result.rows() {
//!         println!("Found {} rows", rows.len());
//!     }
//!
//!     session.close().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod classifier;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod load_balancing;
pub mod options;
pub mod pool;
pub mod prepared;
pub mod retry;
pub mod session;
pub mod statement;

pub use auth::{AuthSession, Authenticator, PlainTextAuthenticator};
pub use config::{ClientConfig, ReconnectionPolicy};
pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use error::{Error, ServerError, ServerErrorKind};
pub use executor::{ExecutionResult, ExecutionState, Executor};
pub use load_balancing::{LoadBalancingPolicy, RoundRobinPolicy, RoutingInfo};
pub use options::ExecutionOptions;
pub use pool::ConnectionPool;
pub use prepared::{PreparedCache, PreparedStatement};
pub use retry::{
    DefaultRetryPolicy, DowngradingConsistencyRetryPolicy, FallthroughRetryPolicy, RetryContext,
    RetryDecision, RetryPolicy,
};
pub use session::Session;
pub use statement::{
    Arguments, BatchStatement, BatchStatementEntry, BoundStatement, SimpleStatement, Statement,
};

/// Re-export protocol types.
pub use cassie_proto as proto;
