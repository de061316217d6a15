//! The caller-facing session.

use std::sync::Arc;

use cassie_proto::{Event, ProtocolVersion, Value};
use tokio::sync::broadcast;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::executor::{ExecutionResult, Executor};
use crate::options::ExecutionOptions;
use crate::pool::ConnectionPool;
use crate::prepared::{PreparedCache, PreparedStatement};
use crate::statement::{BatchStatement, BoundStatement, SimpleStatement, Statement};

/// A session against a cluster.
///
/// Owns the connection pool and the prepared statement cache; both live
/// until [`Session::close`] or until the last clone is dropped.
///
/// # Example
///
/// ```ignore
/// use cassie_client::{ClientConfig, Session};
/// use cassie_client::proto::Value;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let session = Session::connect(ClientConfig::localhost().with_keyspace("app")).await?;
///
///     let insert = session.prepare("INSERT INTO users (id, name) VALUES (?, ?)").await?;
///     session
///         .execute(session.bind(&insert, vec![Value::Int(1), Value::Text("ada".into())])?)
///         .await?;
///
///     let result = session.query("SELECT id, name FROM users", vec![]).await?;
///     for row in result.rows().into_iter().flatten() {
///         println!("{:?}", row.get_by_name("name"));
///     }
///
///     session.close().await;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Session {
    executor: Executor,
    defaults: ExecutionOptions,
}

impl Session {
    /// Connect to the cluster described by `config`.
    pub async fn connect(config: ClientConfig) -> Result<Self, Error> {
        let defaults = config.execution.clone();
        let pool = ConnectionPool::connect(config).await?;
        Ok(Self {
            executor: Executor::new(pool, Arc::new(PreparedCache::new())),
            defaults,
        })
    }

    /// Execute a simple statement with positional values and the default
    /// options.
    pub async fn query(&self, query: &str, values: Vec<Value>) -> Result<ExecutionResult, Error> {
        self.execute(SimpleStatement::new(query).with_values(values))
            .await
    }

    /// Execute a statement with the default options.
    pub async fn execute(
        &self,
        statement: impl Into<Statement>,
    ) -> Result<ExecutionResult, Error> {
        self.executor
            .execute(&statement.into(), &self.defaults)
            .await
    }

    /// Execute a statement with explicit options.
    pub async fn execute_with(
        &self,
        statement: impl Into<Statement>,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, Error> {
        self.executor.execute(&statement.into(), options).await
    }

    /// Execute a batch with the default options.
    pub async fn batch(&self, batch: BatchStatement) -> Result<ExecutionResult, Error> {
        self.execute(batch).await
    }

    /// Fetch the page after `previous`, or `None` if it was the last one.
    pub async fn next_page(
        &self,
        statement: impl Into<Statement>,
        options: &ExecutionOptions,
        previous: &ExecutionResult,
    ) -> Result<Option<ExecutionResult>, Error> {
        let Some(state) = previous.paging_state() else {
            return Ok(None);
        };
        let options = options.clone().with_paging_state(Some(state.to_vec()));
        self.executor
            .execute(&statement.into(), &options)
            .await
            .map(Some)
    }

    /// Prepare `query` once per session; later calls return the cached
    /// statement.
    pub async fn prepare(&self, query: &str) -> Result<Arc<PreparedStatement>, Error> {
        self.executor.prepare(query, self.defaults.timeout).await
    }

    /// Bind values to a prepared statement.
    pub fn bind(
        &self,
        prepared: &Arc<PreparedStatement>,
        values: Vec<Value>,
    ) -> Result<BoundStatement, Error> {
        BoundStatement::new(Arc::clone(prepared), values)
    }

    /// Switch every connection to `keyspace`.
    pub async fn use_keyspace(&self, keyspace: &str) -> Result<(), Error> {
        let result = self
            .execute(format!("USE {}", keyspace))
            .await?;
        match result.result {
            cassie_proto::QueryResult::SetKeyspace(_) => Ok(()),
            other => Err(Error::Protocol(format!(
                "expected keyspace change, got {:?}",
                other
            ))),
        }
    }

    /// Receive server events named in [`ClientConfig::events`].
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.executor.pool().subscribe_events()
    }

    /// Options used by [`Session::execute`].
    pub fn default_options(&self) -> &ExecutionOptions {
        &self.defaults
    }

    pub fn keyspace(&self) -> Option<String> {
        self.executor.pool().keyspace()
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.executor.pool().version()
    }

    pub fn pool(&self) -> &ConnectionPool {
        self.executor.pool()
    }

    pub fn prepared_cache(&self) -> &PreparedCache {
        self.executor.cache()
    }

    /// Close all connections. Executions in flight fail.
    pub async fn close(&self) {
        self.executor.pool().close().await;
        self.executor.cache().clear();
    }
}
