//! Integration tests for the session against a mock node.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cassie_client::proto::{
    error_codes, BatchQuery, Compression, Consistency, ErrorBody, ErrorDetail, Event, EventType,
    ProtocolVersion, QueryResult, Request, Response, SchemaChange, Value, WriteType,
};
use cassie_client::{
    BatchStatement, ClientConfig, ConnectionState, Error, ExecutionOptions, ReconnectionPolicy,
    RetryContext, RetryDecision, RetryPolicy, RoutingInfo, ServerErrorKind, Session,
    SimpleStatement,
};
use common::{error, id_name_rows, prepared, query_text, void, MockServer, Reply};

/// Retries every recoverable error on the next host.
#[derive(Debug)]
struct AlwaysNextHost;

impl RetryPolicy for AlwaysNextHost {
    fn decide(&self, _ctx: &RetryContext<'_>) -> RetryDecision {
        RetryDecision::RetryNextHost(None)
    }
}

fn config(servers: &[&MockServer]) -> ClientConfig {
    ClientConfig::new(servers.iter().map(|s| s.addr().to_string()))
        .with_connect_timeout(Duration::from_secs(2))
        .with_reconnection(ReconnectionPolicy::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
        ))
}

fn is_insert(request: &Request) -> bool {
    query_text(request).is_some_and(|q| q.starts_with("INSERT"))
}

fn write_timeout() -> Response {
    Response::Error(
        ErrorBody::new(error_codes::WRITE_TIMEOUT, "timed out").with_detail(
            ErrorDetail::WriteTimeout {
                consistency: Consistency::Quorum,
                received: 1,
                block_for: 2,
                write_type: WriteType::Simple,
            },
        ),
    )
}

fn unprepared(id: &[u8]) -> Response {
    Response::Error(
        ErrorBody::new(error_codes::UNPREPARED, "unknown prepared id")
            .with_detail(ErrorDetail::Unprepared { id: id.to_vec() }),
    )
}

/// Answers PREPARE with ids 1, 2, ... and treats only the latest id as known.
fn reprepare_server(
    on_known: impl Fn(&Request) -> Response + Send + Sync + 'static,
) -> impl Fn(&Request) -> Option<Reply> + Send + Sync + 'static {
    let prepares = Arc::new(AtomicUsize::new(0));
    let executions = Arc::new(AtomicUsize::new(0));
    move |request: &Request| -> Option<Reply> {
        let latest = vec![prepares.load(Ordering::SeqCst) as u8];
        match request {
            Request::Prepare { .. } => {
                let id = prepares.fetch_add(1, Ordering::SeqCst) as u8 + 1;
                Some(prepared(&[id]).into())
            }
            Request::Execute { id, .. } => {
                // The first execution succeeds; afterwards the server
                // "restarts" and forgets id 1.
                let n = executions.fetch_add(1, Ordering::SeqCst);
                if n > 0 && *id == [1] {
                    Some(unprepared(id).into())
                } else if *id == latest {
                    Some(on_known(request).into())
                } else {
                    Some(unprepared(id).into())
                }
            }
            Request::Batch(batch) => {
                let stale = batch.entries.iter().any(|entry| {
                    matches!(&entry.query, BatchQuery::Prepared(id) if *id != latest)
                });
                if stale {
                    Some(unprepared(&[1]).into())
                } else {
                    Some(on_known(request).into())
                }
            }
            _ => None,
        }
    }
}

#[tokio::test]
async fn test_simple_query_returns_rows() {
    common::init_tracing();
    let server = MockServer::start(|request| match query_text(request) {
        Some("SELECT id, name FROM users") => Some(
            Response::Result(QueryResult::Rows(id_name_rows(vec![(42, "x")]))).into(),
        ),
        _ => None,
    })
    .await;

    let session = Session::connect(config(&[&server])).await.unwrap();
    let result = session.query("SELECT id, name FROM users", vec![]).await.unwrap();
    let rows = result.rows().unwrap();

    assert_eq!(rows.len(), 1);
    let row = rows.first().unwrap();
    assert_eq!(row.get(0), Some(&Value::Int(42)));
    assert_eq!(row.get(1), Some(&Value::Text("x".to_string())));
    assert_eq!(row.get_by_name("name"), Some(&Value::Text("x".to_string())));
    assert_eq!(result.host, server.addr());
    assert_eq!(result.attempts, 0);
    assert!(!result.has_more_pages());

    session.close().await;
}

#[tokio::test]
async fn test_unprepared_triggers_one_reprepare() {
    common::init_tracing();
    let server = MockServer::start(reprepare_server(|_| {
        Response::Result(QueryResult::Rows(id_name_rows(vec![(7, "seven")])))
    }))
    .await;
    let session = Session::connect(config(&[&server])).await.unwrap();

    let statement = session
        .prepare("SELECT id, name FROM users WHERE id = ?")
        .await
        .unwrap();
    assert_eq!(statement.id(), [1]);
    // A second prepare of the same text is served from the cache.
    session
        .prepare("SELECT id, name FROM users WHERE id = ?")
        .await
        .unwrap();

    let bound = session.bind(&statement, vec![Value::Int(7)]).unwrap();
    session.execute(bound.clone()).await.unwrap();
    let result = session.execute(bound).await.unwrap();

    assert_eq!(result.rows().unwrap().len(), 1);
    assert_eq!(result.attempts, 0);
    assert_eq!(server.count(|r| matches!(r, Request::Prepare { .. })), 2);
    assert_eq!(server.count(|r| matches!(r, Request::Execute { .. })), 3);
    let cached = session
        .prepared_cache()
        .get("SELECT id, name FROM users WHERE id = ?")
        .unwrap();
    assert_eq!(cached.id(), [2]);
}

#[tokio::test]
async fn test_batch_reprepares_stale_entry() {
    let server = MockServer::start(reprepare_server(|_| void())).await;
    let session = Session::connect(config(&[&server])).await.unwrap();

    let statement = session
        .prepare("UPDATE users SET name = 'n' WHERE id = ?")
        .await
        .unwrap();
    // Forget id 1 on the server side by preparing the statement elsewhere.
    session.prepared_cache().clear();
    session
        .prepare("UPDATE users SET name = 'n' WHERE id = ?")
        .await
        .unwrap();
    session.prepared_cache().clear();
    session.prepared_cache().insert(Arc::clone(&statement));

    let batch = BatchStatement::logged()
        .with(SimpleStatement::new("DELETE FROM users WHERE id = 1"))
        .with(session.bind(&statement, vec![Value::Int(2)]).unwrap());
    let result = session.batch(batch).await.unwrap();

    assert_eq!(result.result, QueryResult::Void);
    assert_eq!(server.count(|r| matches!(r, Request::Prepare { .. })), 3);
    assert_eq!(server.count(|r| matches!(r, Request::Batch(_))), 2);
}

#[tokio::test]
async fn test_non_idempotent_write_timeout_sent_once() {
    let handler = |request: &Request| is_insert(request).then(|| Reply::from(write_timeout()));
    let a = MockServer::start(handler).await;
    let b = MockServer::start(handler).await;
    let session = Session::connect(config(&[&a, &b])).await.unwrap();

    let options = ExecutionOptions::new().with_retry_policy(Arc::new(AlwaysNextHost));
    let err = session
        .execute_with("INSERT INTO users (id) VALUES (1)", &options)
        .await
        .unwrap_err();

    assert!(matches!(
        err.as_server().map(|e| &e.kind),
        Some(ServerErrorKind::WriteTimeout { .. })
    ));
    assert_eq!(a.count(is_insert) + b.count(is_insert), 1);
}

#[tokio::test]
async fn test_idempotent_write_timeout_retried() {
    let handler = |request: &Request| is_insert(request).then(|| Reply::from(write_timeout()));
    let a = MockServer::start(handler).await;
    let b = MockServer::start(handler).await;
    let session = Session::connect(config(&[&a, &b])).await.unwrap();

    let options = ExecutionOptions::new()
        .with_retry_policy(Arc::new(AlwaysNextHost))
        .with_idempotent(true);
    let err = session
        .execute_with("INSERT INTO users (id) VALUES (1)", &options)
        .await
        .unwrap_err();

    // One attempt per host, then the last error surfaces.
    assert!(err.as_server().is_some());
    assert_eq!(a.count(is_insert), 1);
    assert_eq!(b.count(is_insert), 1);
}

#[tokio::test]
async fn test_connection_lost_after_write_not_retried() {
    let handler = |request: &Request| is_insert(request).then_some(Reply::Drop);
    let a = MockServer::start(handler).await;
    let b = MockServer::start(handler).await;
    let session = Session::connect(config(&[&a, &b])).await.unwrap();

    let options = ExecutionOptions::new().with_retry_policy(Arc::new(AlwaysNextHost));
    let err = session
        .execute_with("INSERT INTO users (id) VALUES (1)", &options)
        .await
        .unwrap_err();

    match err {
        Error::ConnectionLost {
            request_written, ..
        } => assert!(request_written),
        other => panic!("expected connection lost, got {:?}", other),
    }
    assert_eq!(a.count(is_insert) + b.count(is_insert), 1);
}

#[tokio::test]
async fn test_unavailable_moves_to_next_host() {
    let a = MockServer::start(|request| {
        query_text(request)
            .is_some_and(|q| q.starts_with("SELECT"))
            .then(|| {
                Response::Error(
                    ErrorBody::new(error_codes::UNAVAILABLE, "not enough replicas").with_detail(
                        ErrorDetail::Unavailable {
                            consistency: Consistency::Quorum,
                            required: 2,
                            alive: 1,
                        },
                    ),
                )
                .into()
            })
    })
    .await;
    let b = MockServer::start(|request| {
        query_text(request)
            .is_some_and(|q| q.starts_with("SELECT"))
            .then(|| Response::Result(QueryResult::Rows(id_name_rows(vec![(1, "b")]))).into())
    })
    .await;
    let session = Session::connect(config(&[&a, &b])).await.unwrap();

    let result = session.query("SELECT id, name FROM users", vec![]).await.unwrap();
    assert_eq!(result.host, b.addr());
    assert_eq!(result.attempts, 1);
}

/// Retries once on the same host at consistency ONE.
#[derive(Debug)]
struct DowngradeOnce;

impl RetryPolicy for DowngradeOnce {
    fn decide(&self, ctx: &RetryContext<'_>) -> RetryDecision {
        if ctx.attempt == 0 {
            RetryDecision::RetrySameHost(Some(Consistency::One))
        } else {
            RetryDecision::Rethrow
        }
    }
}

#[tokio::test]
async fn test_routed_statement_reencoded_at_new_consistency() {
    let server = MockServer::start(|request| match request {
        Request::Prepare { .. } => Some(prepared(&[3]).into()),
        Request::Execute { params, .. } if params.consistency == Consistency::One => Some(
            Response::Result(QueryResult::Rows(id_name_rows(vec![(7, "seven")]))).into(),
        ),
        Request::Execute { .. } => Some(
            Response::Error(
                ErrorBody::new(error_codes::UNAVAILABLE, "not enough replicas").with_detail(
                    ErrorDetail::Unavailable {
                        consistency: Consistency::Quorum,
                        required: 2,
                        alive: 1,
                    },
                ),
            )
            .into(),
        ),
        _ => None,
    })
    .await;
    let session = Session::connect(config(&[&server])).await.unwrap();
    let statement = session
        .prepare("SELECT id, name FROM users WHERE id = ?")
        .await
        .unwrap();
    let bound = session.bind(&statement, vec![Value::Int(7)]).unwrap();

    let options = ExecutionOptions::new()
        .with_consistency(Consistency::Quorum)
        .with_retry_policy(Arc::new(DowngradeOnce));
    let result = session.execute_with(bound, &options).await.unwrap();

    assert_eq!(result.attempts, 1);
    assert_eq!(result.rows().unwrap().len(), 1);
    let consistencies: Vec<Consistency> = server
        .requests()
        .iter()
        .filter_map(|r| match r {
            Request::Execute { params, .. } => Some(params.consistency),
            _ => None,
        })
        .collect();
    assert_eq!(consistencies, vec![Consistency::Quorum, Consistency::One]);
}

#[tokio::test]
async fn test_local_timeout() {
    let server = MockServer::start(|request| match query_text(request) {
        Some("SELECT slow") => Some(Reply::Delayed(Duration::from_millis(300), void())),
        Some("SELECT fast") => Some(void().into()),
        _ => None,
    })
    .await;
    let session = Session::connect(config(&[&server])).await.unwrap();

    let options = ExecutionOptions::new().with_timeout(Some(Duration::from_millis(50)));
    let err = session.execute_with("SELECT slow", &options).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(server.count(|r| query_text(r) == Some("SELECT slow")), 1);

    // The late response must not be mistaken for the next request's.
    tokio::time::sleep(Duration::from_millis(350)).await;
    let result = session.execute_with("SELECT fast", &options).await.unwrap();
    assert_eq!(result.result, QueryResult::Void);
}

/// Retries on the same host until five attempts have been spent.
#[derive(Debug)]
struct SameHostFiveTimes;

impl RetryPolicy for SameHostFiveTimes {
    fn decide(&self, ctx: &RetryContext<'_>) -> RetryDecision {
        if ctx.attempt < 5 {
            RetryDecision::RetrySameHost(None)
        } else {
            RetryDecision::Rethrow
        }
    }
}

#[tokio::test]
async fn test_timeout_bounds_all_retries() {
    let server = MockServer::start(|request| {
        query_text(request).is_some_and(|q| q.starts_with("SELECT")).then(|| {
            Reply::Delayed(
                Duration::from_millis(40),
                error(error_codes::OVERLOADED, "overloaded"),
            )
        })
    })
    .await;
    let session = Session::connect(config(&[&server])).await.unwrap();

    let options = ExecutionOptions::new()
        .with_idempotent(true)
        .with_retry_policy(Arc::new(SameHostFiveTimes))
        .with_timeout(Some(Duration::from_millis(100)));
    let start = std::time::Instant::now();
    let err = session.execute_with("SELECT slow", &options).await.unwrap_err();
    let elapsed = start.elapsed();

    // Six sends of 40ms each would take 240ms.
    assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(100)));
    assert!(elapsed < Duration::from_millis(200), "took {:?}", elapsed);
    assert!(server.count(|r| query_text(r) == Some("SELECT slow")) <= 3);
}

#[tokio::test]
async fn test_authentication() {
    let handler = |request: &Request| match request {
        Request::Startup { .. } => Some(Reply::from(Response::Authenticate {
            authenticator: "org.apache.cassandra.auth.PasswordAuthenticator".to_string(),
        })),
        Request::AuthResponse { token } => {
            if token.as_deref() == Some(b"\0cassandra\0secret".as_slice()) {
                Some(Reply::from(Response::AuthSuccess { token: None }))
            } else {
                Some(Reply::from(error(error_codes::BAD_CREDENTIALS, "bad credentials")))
            }
        }
        _ => None,
    };
    let server = MockServer::start(handler).await;

    let session = Session::connect(config(&[&server]).with_credentials("cassandra", "secret"))
        .await
        .unwrap();
    session.close().await;

    let err = Session::connect(config(&[&server]).with_credentials("cassandra", "wrong"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.as_server().map(|e| &e.kind),
        Some(ServerErrorKind::BadCredentials)
    ));

    let err = Session::connect(config(&[&server])).await.unwrap_err();
    assert!(matches!(err, Error::Authentication(_)));
}

#[tokio::test]
async fn test_paging() {
    let server = MockServer::start(|request| match request {
        Request::Query { query, params } if query == "SELECT id, name FROM users" => {
            assert_eq!(params.page_size, Some(1));
            let rows = match params.paging_state.as_deref() {
                None => id_name_rows(vec![(1, "a")]).with_paging_state(Some(b"p1".to_vec())),
                Some(b"p1") => id_name_rows(vec![(2, "b")]),
                Some(other) => panic!("unexpected paging state {:?}", other),
            };
            Some(Response::Result(QueryResult::Rows(rows)).into())
        }
        _ => None,
    })
    .await;
    let session = Session::connect(config(&[&server])).await.unwrap();

    let statement = SimpleStatement::new("SELECT id, name FROM users");
    let options = ExecutionOptions::new().with_page_size(Some(1));
    let first = session
        .execute_with(statement.clone(), &options)
        .await
        .unwrap();
    assert_eq!(first.paging_state(), Some(b"p1".as_slice()));

    let second = session
        .next_page(statement.clone(), &options, &first)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        second.rows().unwrap().first().unwrap().get(0),
        Some(&Value::Int(2))
    );
    assert!(session
        .next_page(statement, &options, &second)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_events_forwarded() {
    let server = MockServer::start(|_| None).await;
    let session = Session::connect(
        config(&[&server])
            .with_connections_per_host(2)
            .with_events(vec![EventType::SchemaChange]),
    )
    .await
    .unwrap();
    let mut events = session.subscribe_events();

    // Exactly one connection registers.
    assert_eq!(server.count(|r| matches!(r, Request::Register { .. })), 1);

    let event = Event::SchemaChange(SchemaChange {
        change: "CREATED".to_string(),
        target: "TABLE".to_string(),
        keyspace: "ks".to_string(),
        name: Some("users".to_string()),
        arguments: Vec::new(),
    });
    server.push_event(event.clone());
    let received = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, event);
}

#[tokio::test]
async fn test_lz4_compression() {
    let server = MockServer::start(|request| {
        query_text(request)
            .is_some_and(|q| q.starts_with("SELECT"))
            .then(|| {
                let many = (0..100).map(|i| (i, "repeated text")).collect();
                Response::Result(QueryResult::Rows(id_name_rows(many))).into()
            })
    })
    .await;
    let session = Session::connect(config(&[&server]).with_compression(Some(Compression::Lz4)))
        .await
        .unwrap();

    let result = session
        .query("SELECT id, name FROM users WHERE id > ?", vec![Value::Int(0)])
        .await
        .unwrap();
    assert_eq!(result.rows().unwrap().len(), 100);
    match &server.requests()[0] {
        Request::Startup { options } => {
            assert_eq!(options.get("COMPRESSION").map(String::as_str), Some("lz4"))
        }
        other => panic!("expected STARTUP, got {:?}", other),
    }
}

#[tokio::test]
async fn test_protocol_version_downgrade() {
    let server = MockServer::start_with_version(ProtocolVersion::V3, |request| {
        (query_text(request) == Some("SELECT 1")).then(|| void().into())
    })
    .await;
    let session = Session::connect(config(&[&server])).await.unwrap();

    assert_eq!(session.protocol_version(), ProtocolVersion::V3);
    session.query("SELECT 1", vec![]).await.unwrap();
}

#[tokio::test]
async fn test_use_switches_every_connection() {
    let server = MockServer::start(|_| None).await;
    let session = Session::connect(config(&[&server]).with_connections_per_host(2))
        .await
        .unwrap();

    session.use_keyspace("other").await.unwrap();

    assert_eq!(session.keyspace().as_deref(), Some("other"));
    let uses = server.count(|r| query_text(r) == Some("USE other"));
    assert_eq!(uses, 3);
}

#[tokio::test]
async fn test_encode_error_not_sent() {
    let server = MockServer::start(|request| match request {
        Request::Prepare { .. } => Some(prepared(&[9]).into()),
        _ => None,
    })
    .await;
    let session = Session::connect(config(&[&server])).await.unwrap();
    let statement = session
        .prepare("SELECT id, name FROM users WHERE id = ?")
        .await
        .unwrap();

    let bound = session
        .bind(&statement, vec![Value::Text("not an int".into())])
        .unwrap();
    let err = session.execute(bound).await.unwrap_err();

    assert!(matches!(err, Error::TypeEncode(_)));
    assert_eq!(server.count(|r| matches!(r, Request::Execute { .. })), 0);
}

#[tokio::test]
async fn test_pool_reconnects_after_drop() {
    let server = MockServer::start(|request| {
        (query_text(request) == Some("SELECT drop")).then_some(Reply::Drop)
    })
    .await;
    let session = Session::connect(config(&[&server])).await.unwrap();
    assert_eq!(session.pool().connection_count(), 1);

    let err = session.query("SELECT drop", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionLost { .. }));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while server.connections() < 2 || session.pool().connection_count() < 1 {
        assert!(tokio::time::Instant::now() < deadline, "pool did not reconnect");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let host = session.pool().hosts()[0];
    assert!(session.pool().connections(host).iter().any(|c| c.is_ready()));
}

/// A pool whose reconnection attempts wait far longer than any test runs.
fn slow_reconnect_config(server: &MockServer) -> ClientConfig {
    config(&[server]).with_reconnection(ReconnectionPolicy::new(
        Duration::from_secs(30),
        Duration::from_secs(60),
    ))
}

#[tokio::test]
async fn test_draining_connection_not_acquired() {
    let server = MockServer::start(|_| None).await;
    let session = Session::connect(slow_reconnect_config(&server)).await.unwrap();
    let pool = session.pool();
    let host = pool.hosts()[0];

    let conn = pool.acquire(host, &RoutingInfo::default()).unwrap();
    pool.retire(&conn);
    assert_ne!(conn.state(), ConnectionState::Ready);

    assert!(matches!(
        pool.acquire(host, &RoutingInfo::default()),
        Err(Error::NoConnectionsAvailable(_))
    ));
    conn.closed().await;
    assert_eq!(conn.close_reason().as_deref(), Some("drained"));
}

#[tokio::test]
async fn test_acquire_fails_fast_while_reconnecting() {
    let server = MockServer::start(|request| {
        (query_text(request) == Some("SELECT drop")).then_some(Reply::Drop)
    })
    .await;
    let session = Session::connect(slow_reconnect_config(&server)).await.unwrap();
    let host = session.pool().hosts()[0];
    let conn = session.pool().acquire(host, &RoutingInfo::default()).unwrap();

    let err = session.query("SELECT drop", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionLost { .. }));
    conn.closed().await;

    // The reconnect task is asleep; nothing may wait for it.
    let acquired = tokio::time::timeout(Duration::from_millis(200), async {
        session.pool().acquire(host, &RoutingInfo::default())
    })
    .await
    .expect("acquire blocked on reconnection");
    assert!(matches!(acquired, Err(Error::NoConnectionsAvailable(_))));

    let executed = tokio::time::timeout(
        Duration::from_millis(500),
        session.query("SELECT 1", vec![]),
    )
    .await
    .expect("execution blocked on reconnection");
    assert!(matches!(executed, Err(Error::NoConnectionsAvailable(_))));
    assert_eq!(server.connections(), 1);
}
