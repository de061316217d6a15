//! Request execution.
//!
//! One logical execution moves through
//!
//! ```text
//! Start -> Encoding -> Dispatched -> Completed
//!                          |  ^
//!                          v  |
//!                        Retrying -> Failed
//! ```
//!
//! Encoding failures end the execution before anything is sent. After each
//! failed attempt the error is classified and, if recoverable, handed to the
//! retry policy through [`classifier::decide`], which refuses to resend a
//! non-idempotent statement after an ambiguous write. An unknown prepared id
//! is handled below the retry policy: the statement is prepared again on the
//! same connection and resent once, without counting as an attempt.
//!
//! The execution timeout bounds the whole execution: every send, re-prepare
//! and retry shares one deadline fixed when the execution starts.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use cassie_proto::{
    BatchEntry, BatchQuery, BatchRequest, ColumnSpec, Consistency, ProtocolVersion,
    QueryParameters, QueryResult, Request, Response, Rows,
};
use uuid::Uuid;

use crate::classifier::{self, classify};
use crate::connection::Connection;
use crate::error::{Error, ServerErrorKind};
use crate::load_balancing::{compose_routing_key, RoutingInfo};
use crate::options::ExecutionOptions;
use crate::pool::ConnectionPool;
use crate::prepared::{PreparedCache, PreparedStatement};
use crate::retry::{RetryContext, RetryDecision};
use crate::statement::{BatchStatement, BatchStatementEntry, BoundStatement, Statement};

static NEXT_EXECUTION_ID: AtomicU64 = AtomicU64::new(1);

/// Execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Start,
    Encoding,
    Dispatched,
    Retrying,
    Completed,
    Failed,
}

impl ExecutionState {
    /// Whether `next` may follow `self`.
    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Start, Encoding)
                | (Encoding, Dispatched)
                | (Encoding, Failed)
                | (Dispatched, Completed)
                | (Dispatched, Retrying)
                | (Dispatched, Failed)
                | (Retrying, Encoding)
                | (Retrying, Dispatched)
                | (Retrying, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionState::Completed | ExecutionState::Failed)
    }
}

/// The outcome of a successful execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub result: QueryResult,
    /// Set when tracing was requested and the server traced the request.
    pub tracing_id: Option<Uuid>,
    /// Server warnings (protocol v4).
    pub warnings: Vec<String>,
    /// Host that answered.
    pub host: SocketAddr,
    /// Attempts counted by the retry policy; the first send is attempt 0.
    pub attempts: u32,
}

impl ExecutionResult {
    pub fn rows(&self) -> Option<&Rows> {
        self.result.rows()
    }

    pub fn into_rows(self) -> Option<Rows> {
        self.result.into_rows()
    }

    /// Paging state for the next page, if the result has more.
    pub fn paging_state(&self) -> Option<&[u8]> {
        self.rows().and_then(Rows::paging_state)
    }

    pub fn has_more_pages(&self) -> bool {
        self.paging_state().is_some()
    }
}

/// A request ready to send, with what is needed to decode its response.
struct Encoded {
    request: Request,
    /// Result columns for executions sent with skip-metadata.
    known_columns: Option<Arc<[ColumnSpec]>>,
    /// Prepared statements whose ids appear in the request.
    prepared: Vec<Arc<PreparedStatement>>,
    routing_key: Option<Vec<u8>>,
    keyspace: Option<String>,
}

/// Tracks and logs the state of one execution.
struct Execution {
    id: u64,
    state: ExecutionState,
}

impl Execution {
    fn new() -> Self {
        Self {
            id: NEXT_EXECUTION_ID.fetch_add(1, Ordering::Relaxed),
            state: ExecutionState::Start,
        }
    }

    fn transition(&mut self, next: ExecutionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::trace!(execution = self.id, from = ?self.state, to = ?next, "execution state");
        self.state = next;
    }

    fn fail(&mut self, error: Error) -> Error {
        self.transition(ExecutionState::Failed);
        tracing::debug!(execution = self.id, error = %error, "execution failed");
        error
    }
}

/// Runs statements against a [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct Executor {
    pool: ConnectionPool,
    cache: Arc<PreparedCache>,
}

impl Executor {
    pub fn new(pool: ConnectionPool, cache: Arc<PreparedCache>) -> Self {
        Self { pool, cache }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn cache(&self) -> &PreparedCache {
        &self.cache
    }

    /// Prepare `query`, or return the cached statement for it.
    ///
    /// Hosts are tried in query plan order until one answers; server errors
    /// such as a syntax error are returned without trying further hosts.
    pub async fn prepare(
        &self,
        query: &str,
        timeout: Option<Duration>,
    ) -> Result<Arc<PreparedStatement>, Error> {
        if let Some(prepared) = self.cache.get(query) {
            return Ok(prepared);
        }
        let deadline = Deadline::after(timeout);
        let keyspace = self.pool.keyspace();
        let routing = RoutingInfo {
            keyspace: keyspace.as_deref(),
            routing_key: None,
        };
        let plan = self
            .pool
            .config()
            .load_balancing
            .query_plan(self.pool.hosts(), &routing);

        let mut last_error = None;
        for host in plan {
            let conn = match self.pool.acquire(host, &routing) {
                Ok(conn) => conn,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };
            match self.prepare_on(&conn, query, deadline).await {
                Ok(prepared) => return Ok(prepared),
                Err(e @ (Error::Server(_) | Error::Timeout(_))) => return Err(e),
                Err(e) => {
                    tracing::debug!(endpoint = %host, error = %e, "prepare failed, trying next host");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::NoConnectionsAvailable("query plan is empty".to_string())
        }))
    }

    async fn prepare_on(
        &self,
        conn: &Connection,
        query: &str,
        deadline: Option<Deadline>,
    ) -> Result<Arc<PreparedStatement>, Error> {
        let request = Request::Prepare {
            query: query.to_string(),
        };
        let response = within(deadline, conn.request(&request)).await?;
        match response {
            Response::Result(QueryResult::Prepared(prepared)) => {
                let statement = Arc::new(PreparedStatement::from_response(query, prepared));
                self.cache.insert(Arc::clone(&statement));
                tracing::debug!(endpoint = %conn.endpoint(), query, "statement prepared");
                Ok(statement)
            }
            other => Err(Error::Protocol(format!(
                "unexpected {:?} in response to PREPARE",
                other.opcode()
            ))),
        }
    }

    /// Execute `statement` with `options`.
    pub async fn execute(
        &self,
        statement: &Statement,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, Error> {
        let mut execution = Execution::new();
        let deadline = Deadline::after(options.timeout);
        tracing::debug!(execution = execution.id, statement = %statement.describe(), "executing");

        execution.transition(ExecutionState::Encoding);
        let version = self.pool.version();
        let mut consistency = options.consistency;
        let mut encoded = match validate(options, version)
            .and_then(|()| self.encode(statement, options, consistency, version))
        {
            Ok(encoded) => encoded,
            Err(e) => return Err(execution.fail(e)),
        };

        let default_keyspace = self.pool.keyspace();
        let keyspace = encoded.keyspace.clone().or(default_keyspace);
        let routing_key = encoded.routing_key.clone();
        let routing = RoutingInfo {
            keyspace: keyspace.as_deref(),
            routing_key: routing_key.as_deref(),
        };
        let mut plan = self
            .pool
            .config()
            .load_balancing
            .query_plan(self.pool.hosts(), &routing)
            .into_iter();

        let mut host = plan.next();
        let mut attempt = 0u32;
        let mut last_error: Option<Error> = None;

        loop {
            if let Some(deadline) = deadline.filter(Deadline::expired) {
                tracing::debug!(execution = execution.id, attempt, "execution deadline reached");
                return Err(execution.fail(Error::Timeout(deadline.limit)));
            }
            let Some(endpoint) = host else {
                let error = last_error.unwrap_or_else(|| {
                    Error::NoConnectionsAvailable("query plan exhausted".to_string())
                });
                return Err(execution.fail(error));
            };

            let conn = match self.pool.acquire(endpoint, &routing) {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::debug!(execution = execution.id, %endpoint, error = %e, "host unavailable, trying next");
                    if last_error.is_none() {
                        last_error = Some(e);
                    }
                    host = plan.next();
                    continue;
                }
            };

            execution.transition(ExecutionState::Dispatched);
            let outcome = self
                .attempt(&conn, statement, &mut encoded, options, consistency, deadline)
                .await;

            let error = match outcome {
                Ok((frame_meta, result)) => {
                    execution.transition(ExecutionState::Completed);
                    if let QueryResult::SetKeyspace(keyspace) = &result {
                        self.pool.set_keyspace(keyspace).await;
                    }
                    tracing::debug!(execution = execution.id, %endpoint, attempt, "execution completed");
                    return Ok(ExecutionResult {
                        result,
                        tracing_id: frame_meta.tracing_id,
                        warnings: frame_meta.warnings,
                        host: endpoint,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };

            if let Error::NoConnectionsAvailable(_) = error {
                // Nothing was sent; move on without spending an attempt.
                tracing::debug!(execution = execution.id, %endpoint, error = %error, "connection unusable, trying next host");
                execution.transition(ExecutionState::Retrying);
                last_error = Some(error);
                host = plan.next();
                continue;
            }

            let decision = classifier::decide(
                options.retry_policy.as_ref(),
                &RetryContext {
                    error: &error,
                    idempotent: options.idempotent,
                    attempt,
                    consistency,
                },
            );
            tracing::debug!(execution = execution.id, %endpoint, attempt, error = %error, ?decision, "attempt failed");

            let new_consistency = match decision {
                RetryDecision::Rethrow => return Err(execution.fail(error)),
                RetryDecision::RetrySameHost(cl) => cl,
                RetryDecision::RetryNextHost(cl) => {
                    host = plan.next();
                    cl
                }
            };
            execution.transition(ExecutionState::Retrying);
            attempt += 1;
            last_error = Some(error);

            if let Some(cl) = new_consistency.filter(|cl| *cl != consistency) {
                tracing::info!(execution = execution.id, from = %consistency, to = %cl, "retrying at a different consistency");
                consistency = cl;
                execution.transition(ExecutionState::Encoding);
                encoded = match self.encode(statement, options, consistency, version) {
                    Ok(encoded) => encoded,
                    Err(e) => return Err(execution.fail(e)),
                };
            }
        }
    }

    /// One attempt on one connection, including a single transparent
    /// re-prepare if the server no longer knows a prepared id.
    async fn attempt(
        &self,
        conn: &Connection,
        statement: &Statement,
        encoded: &mut Encoded,
        options: &ExecutionOptions,
        consistency: Consistency,
        deadline: Option<Deadline>,
    ) -> Result<(FrameMeta, QueryResult), Error> {
        let mut reprepared = false;
        loop {
            let frame = conn.frame(&encoded.request, options.tracing)?;
            let response = within(deadline, conn.send(frame)).await?;
            let meta = FrameMeta {
                tracing_id: response.tracing_id,
                warnings: response.warnings,
            };
            for warning in &meta.warnings {
                tracing::warn!(endpoint = %conn.endpoint(), warning = %warning, "server warning");
            }

            let parsed = Response::parse(
                response.header.opcode,
                &response.body,
                conn.version(),
                encoded.known_columns.as_deref(),
            )?;
            match parsed {
                Response::Result(result) => return Ok((meta, result)),
                Response::Error(body) => {
                    let error = classify(body);
                    if let ServerErrorKind::Unprepared { id } = &error.kind {
                        if !reprepared {
                            let stale = encoded.prepared.iter().find(|p| p.id() == id.as_slice());
                            if let Some(stale) = stale {
                                let stale = Arc::clone(stale);
                                reprepared = true;
                                self.reprepare(conn, &stale, deadline).await?;
                                *encoded =
                                    self.encode(statement, options, consistency, conn.version())?;
                                continue;
                            }
                        }
                    }
                    return Err(Error::Server(error));
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected {:?} in response to {:?}",
                        other.opcode(),
                        encoded.request.opcode()
                    )))
                }
            }
        }
    }

    async fn reprepare(
        &self,
        conn: &Connection,
        stale: &PreparedStatement,
        deadline: Option<Deadline>,
    ) -> Result<(), Error> {
        tracing::info!(endpoint = %conn.endpoint(), query = stale.query(), "prepared id unknown to server, preparing again");
        self.cache.invalidate(stale.query(), stale.id());
        self.prepare_on(conn, stale.query(), deadline).await?;
        Ok(())
    }

    /// The cached statement for `prepared`'s query, which replaces it after
    /// a re-prepare.
    fn current(&self, prepared: &Arc<PreparedStatement>) -> Arc<PreparedStatement> {
        self.cache
            .get(prepared.query())
            .unwrap_or_else(|| Arc::clone(prepared))
    }

    fn encode(
        &self,
        statement: &Statement,
        options: &ExecutionOptions,
        consistency: Consistency,
        version: ProtocolVersion,
    ) -> Result<Encoded, Error> {
        let params = |values, skip_metadata| QueryParameters {
            consistency,
            values,
            skip_metadata,
            page_size: options.page_size,
            paging_state: options.paging_state.clone(),
            serial_consistency: options.serial_consistency,
            timestamp: options.timestamp,
        };

        match statement {
            Statement::Simple(simple) => Ok(Encoded {
                request: Request::Query {
                    query: simple.query().to_string(),
                    params: params(simple.encode_values(version)?, false),
                },
                known_columns: None,
                prepared: Vec::new(),
                routing_key: None,
                keyspace: None,
            }),
            Statement::Bound(bound) => {
                let (prepared, values) = self.encode_bound(bound, version)?;
                let routing_key = routing_key(&prepared, &values);
                let skip_metadata = !prepared.result_columns().is_empty();
                let keyspace = prepared
                    .bind_columns()
                    .first()
                    .map(|column| column.keyspace.clone());
                Ok(Encoded {
                    request: Request::Execute {
                        id: prepared.id().to_vec(),
                        params: params(
                            cassie_proto::Values::Positional(values),
                            skip_metadata,
                        ),
                    },
                    known_columns: skip_metadata.then(|| prepared.shared_result_columns()),
                    prepared: vec![prepared],
                    routing_key,
                    keyspace,
                })
            }
            Statement::Batch(batch) => self.encode_batch(batch, consistency, options, version),
        }
    }

    fn encode_batch(
        &self,
        batch: &BatchStatement,
        consistency: Consistency,
        options: &ExecutionOptions,
        version: ProtocolVersion,
    ) -> Result<Encoded, Error> {
        if batch.is_empty() {
            return Err(Error::InvalidArgument("batch has no statements".to_string()));
        }
        let mut prepared_entries = Vec::new();
        let mut routing = None;
        let entries = batch
            .entries()
            .iter()
            .map(|entry| match entry {
                BatchStatementEntry::Simple(simple) => Ok(BatchEntry {
                    query: BatchQuery::Query(simple.query().to_string()),
                    values: simple.encode_positional(version)?,
                }),
                BatchStatementEntry::Bound(bound) => {
                    let (prepared, values) = self.encode_bound(bound, version)?;
                    if routing.is_none() {
                        routing = routing_key(&prepared, &values);
                    }
                    let id = prepared.id().to_vec();
                    prepared_entries.push(prepared);
                    Ok(BatchEntry {
                        query: BatchQuery::Prepared(id),
                        values,
                    })
                }
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Encoded {
            request: Request::Batch(BatchRequest {
                batch_type: batch.batch_type(),
                entries,
                consistency,
                serial_consistency: options.serial_consistency,
                timestamp: options.timestamp,
            }),
            known_columns: None,
            prepared: prepared_entries,
            routing_key: routing,
            keyspace: None,
        })
    }

    fn encode_bound(
        &self,
        bound: &BoundStatement,
        version: ProtocolVersion,
    ) -> Result<(Arc<PreparedStatement>, Vec<Option<Vec<u8>>>), Error> {
        let prepared = self.current(bound.prepared());
        let values = bound.encode_values(&prepared, version)?;
        Ok((prepared, values))
    }
}

/// Frame-level data surfaced on the result.
struct FrameMeta {
    tracing_id: Option<Uuid>,
    warnings: Vec<String>,
}

fn validate(options: &ExecutionOptions, version: ProtocolVersion) -> Result<(), Error> {
    if let Some(size) = options.page_size {
        if size <= 0 {
            return Err(Error::InvalidArgument(format!(
                "page size must be positive, got {}",
                size
            )));
        }
    }
    if let Some(serial) = options.serial_consistency {
        if !serial.is_serial() {
            return Err(Error::InvalidArgument(format!(
                "{} is not a serial consistency",
                serial
            )));
        }
    }
    if options.timestamp.is_some() && version < ProtocolVersion::V3 {
        return Err(Error::InvalidArgument(format!(
            "client timestamps require protocol v3, connected with {}",
            version
        )));
    }
    Ok(())
}

/// Routing key from the bound partition key components, if all are set.
fn routing_key(prepared: &PreparedStatement, values: &[Option<Vec<u8>>]) -> Option<Vec<u8>> {
    let components = prepared
        .pk_indexes()
        .iter()
        .map(|&i| values.get(usize::from(i))?.as_deref())
        .collect::<Option<Vec<&[u8]>>>()?;
    compose_routing_key(&components)
}

/// The instant an execution must finish by, with the limit it came from
/// for error reporting.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    limit: Duration,
}

impl Deadline {
    fn after(limit: Option<Duration>) -> Option<Self> {
        limit.map(|limit| Self {
            at: Instant::now() + limit,
            limit,
        })
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

async fn within<T>(
    deadline: Option<Deadline>,
    fut: impl std::future::Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline.at, fut)
            .await
            .map_err(|_| Error::Timeout(deadline.limit))?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cassie_proto::{ColumnType, Prepared, RowsMetadata};

    #[test]
    fn test_state_transitions() {
        use ExecutionState::*;
        assert!(Start.can_transition_to(Encoding));
        assert!(Encoding.can_transition_to(Failed));
        assert!(Dispatched.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Dispatched));
        assert!(!Start.can_transition_to(Dispatched));
        assert!(!Completed.can_transition_to(Retrying));
        assert!(!Failed.can_transition_to(Encoding));
        assert!(Completed.is_terminal() && Failed.is_terminal());
        assert!(!Retrying.is_terminal());
    }

    #[test]
    fn test_validate_options() {
        let v4 = ProtocolVersion::V4;
        assert!(validate(&ExecutionOptions::default(), v4).is_ok());
        assert!(validate(&ExecutionOptions::new().with_page_size(Some(0)), v4).is_err());
        assert!(validate(
            &ExecutionOptions::new().with_serial_consistency(Consistency::Quorum),
            v4
        )
        .is_err());
        assert!(validate(
            &ExecutionOptions::new().with_timestamp(1),
            ProtocolVersion::V2
        )
        .is_err());
    }

    #[test]
    fn test_routing_key_needs_every_component() {
        let bind = RowsMetadata {
            pk_indexes: vec![1, 0],
            ..RowsMetadata::from_columns(vec![
                ColumnSpec::new("ks", "t", "a", ColumnType::Int),
                ColumnSpec::new("ks", "t", "b", ColumnType::Int),
            ])
        };
        let prepared = PreparedStatement::from_response(
            "SELECT * FROM t WHERE a = ? AND b = ?",
            Prepared {
                id: vec![1],
                bind,
                result: RowsMetadata::default(),
            },
        );
        let key = routing_key(&prepared, &[Some(vec![1]), Some(vec![2])]).unwrap();
        assert_eq!(key, vec![0, 1, 2, 0, 0, 1, 1, 0]);
        assert_eq!(routing_key(&prepared, &[Some(vec![1]), None]), None);
    }

    #[tokio::test]
    async fn test_pending_future_times_out_at_deadline() {
        let deadline = Deadline::after(Some(Duration::from_millis(10)));
        let result: Result<(), Error> =
            within(deadline, futures::future::pending::<Result<(), Error>>()).await;
        assert!(matches!(result, Err(Error::Timeout(d)) if d == Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_deadline_is_shared_across_waits() {
        let deadline = Deadline::after(Some(Duration::from_millis(60)));
        let start = Instant::now();

        // Each wait alone fits the limit; together they do not.
        let first = within(deadline, async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            Ok::<_, Error>(())
        })
        .await;
        assert!(first.is_ok());
        let second = within(deadline, async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            Ok::<_, Error>(())
        })
        .await;

        assert!(matches!(second, Err(Error::Timeout(_))));
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(deadline.is_some_and(|d| d.expired()));
    }

    #[test]
    fn test_no_timeout_means_no_deadline() {
        assert!(Deadline::after(None).is_none());
    }
}
