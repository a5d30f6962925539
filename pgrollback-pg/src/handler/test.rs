//! End-to-end tests of the connection handler against a scripted
//! wire-protocol backend.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use pgrollback_core::{
    config::{BackendConfig, ListenConfig, ProxyConfig, SessionConfig},
    err::Result,
};
use pgrollback_proxy::stream::Stream;
use pretty_assertions::assert_eq;
use tokio::{
    io::{duplex, AsyncWriteExt, DuplexStream},
    net::{TcpListener, TcpStream},
};

use crate::proto::{
    be::{ErrorResponse, FieldDescription, PostgresBackendMessage, PostgresBackendMessageTag},
    common::{write_cstr, CancelKey, PostgresMessage},
    fe::{PostgresFrontendMessage, PostgresFrontendStartupMessage},
};

use super::*;

/// A scripted postgres server: accepts startup with trust auth, records
/// every Query it receives and answers by statement shape.
struct MockPostgres {
    addr: SocketAddr,
    queries: Arc<Mutex<Vec<String>>>,
}

impl MockPostgres {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let queries = Arc::new(Mutex::new(vec![]));

        let accepted = Arc::clone(&queries);
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(con) => con,
                    Err(_) => return,
                };

                let queries = Arc::clone(&accepted);
                tokio::spawn(async move {
                    let _ = serve(stream, queries).await;
                });
            }
        });

        Self { addr, queries }
    }

    fn received(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    /// The queries received after session setup (SETs, ping, BEGIN)
    fn received_after_setup(&self) -> Vec<String> {
        self.received().into_iter().skip(5).collect()
    }
}

async fn serve(mut stream: TcpStream, queries: Arc<Mutex<Vec<String>>>) -> Result<()> {
    match PostgresFrontendMessage::read_initial(&mut stream).await? {
        PostgresFrontendMessage::StartupMessage(_) => {}
        _ => return Ok(()),
    }

    PostgresBackendMessage::AuthenticationOk.write(&mut stream).await?;
    PostgresBackendMessage::ParameterStatus("server_version".into(), "15.0".into())
        .write(&mut stream)
        .await?;
    PostgresBackendMessage::BackendKeyData(CancelKey { pid: 7, key: 8 })
        .write(&mut stream)
        .await?;
    PostgresBackendMessage::ReadyForQuery(b'I').write(&mut stream).await?;
    stream.flush().await?;

    loop {
        let msg = match PostgresFrontendMessage::read(&mut stream).await {
            Ok(msg) => msg,
            Err(_) => return Ok(()),
        };

        match msg {
            PostgresFrontendMessage::Query(sql) => {
                queries.lock().unwrap().push(sql.clone());

                for part in sql.split(';') {
                    let part = part.trim();
                    if !part.is_empty() {
                        respond(&mut stream, part).await?;
                    }
                }

                PostgresBackendMessage::ReadyForQuery(b'T').write(&mut stream).await?;
                stream.flush().await?;
            }
            PostgresFrontendMessage::Terminate => return Ok(()),
            _ => {}
        }
    }
}

async fn respond(stream: &mut TcpStream, part: &str) -> Result<()> {
    let upper = part.to_ascii_uppercase();

    if upper.contains("NO_SUCH_TABLE") {
        PostgresBackendMessage::ErrorResponse(ErrorResponse::new(
            "ERROR",
            "42P01",
            "relation \"no_such_table\" does not exist",
        ))
        .write(stream)
        .await?;
        return Ok(());
    }

    let tag = if upper.starts_with("BEGIN") {
        "BEGIN"
    } else if upper.starts_with("ROLLBACK TO") {
        "ROLLBACK"
    } else if upper.starts_with("ROLLBACK") {
        "ROLLBACK"
    } else if upper.starts_with("SAVEPOINT") {
        "SAVEPOINT"
    } else if upper.starts_with("RELEASE") {
        "RELEASE"
    } else if upper.starts_with("SET") {
        "SET"
    } else if upper.starts_with("DEALLOCATE") {
        "DEALLOCATE"
    } else if upper.starts_with("INSERT") {
        if upper.contains("RETURNING") {
            PostgresBackendMessage::row_description(vec![FieldDescription::int8("id")])?
                .write(stream)
                .await?;
            PostgresBackendMessage::data_row(vec![Some("1".into())])?
                .write(stream)
                .await?;
        }
        "INSERT 0 1"
    } else if upper.starts_with("SELECT") {
        PostgresBackendMessage::row_description(vec![FieldDescription::text("?column?")])?
            .write(stream)
            .await?;
        PostgresBackendMessage::data_row(vec![Some("1".into())])?
            .write(stream)
            .await?;
        "SELECT 1"
    } else {
        "SELECT 0"
    };

    PostgresBackendMessage::CommandComplete(tag.into())
        .write(stream)
        .await?;

    Ok(())
}

fn mock_conf(backend: SocketAddr) -> &'static ProxyConfig {
    Box::leak(Box::new(ProxyConfig {
        backend: BackendConfig {
            host: backend.ip().to_string(),
            port: backend.port(),
            database: "test".into(),
            user: "test".into(),
            password: "".into(),
        },
        proxy: ListenConfig::default(),
        session: SessionConfig::default(),
    }))
}

/// Drives the handler over an in-memory stream like a real client would
struct TestClient {
    stream: DuplexStream,
}

impl TestClient {
    async fn connect(handler: Arc<PostgresConnectionHandler>, application_name: &str) -> Self {
        let (client, server) = duplex(1 << 16);

        tokio::spawn(async move {
            let _ = handler.handle(Box::new(Stream(server))).await;
        });

        let mut client = Self { stream: client };

        // Startup
        PostgresFrontendMessage::StartupMessage(PostgresFrontendStartupMessage::new(
            [
                ("user".to_string(), "test".to_string()),
                (
                    "application_name".to_string(),
                    application_name.to_string(),
                ),
            ]
            .into_iter()
            .collect(),
        ))
        .write(&mut client.stream)
        .await
        .unwrap();
        client.stream.flush().await.unwrap();

        // Cleartext challenge, any answer accepted
        assert_eq!(
            client.read().await,
            PostgresBackendMessage::AuthenticationCleartextPassword
        );
        PostgresFrontendMessage::PasswordMessage("anything".into())
            .write(&mut client.stream)
            .await
            .unwrap();
        client.stream.flush().await.unwrap();

        assert_eq!(client.read().await, PostgresBackendMessage::AuthenticationOk);

        // Parameter replay, key data, then ready
        loop {
            match client.read().await {
                PostgresBackendMessage::ParameterStatus(_, _) => {}
                PostgresBackendMessage::BackendKeyData(_) => {}
                PostgresBackendMessage::ReadyForQuery(b'I') => break,
                msg => panic!("Unexpected startup message: {:?}", msg),
            }
        }

        client
    }

    async fn read(&mut self) -> PostgresBackendMessage {
        PostgresBackendMessage::read(&mut self.stream).await.unwrap()
    }

    async fn send(&mut self, msg: PostgresFrontendMessage) {
        msg.write(&mut self.stream).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    async fn send_raw(&mut self, msg: PostgresMessage) {
        self.stream.write_all(msg.as_slice()).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Sends a simple query and reads every response up to ReadyForQuery,
    /// returning (responses, status byte)
    async fn query(&mut self, sql: &str) -> (Vec<PostgresBackendMessage>, u8) {
        self.send(PostgresFrontendMessage::Query(sql.into())).await;

        let mut responses = vec![];

        loop {
            match self.read().await {
                PostgresBackendMessage::ReadyForQuery(status) => return (responses, status),
                msg => responses.push(msg),
            }
        }
    }
}

fn tags(messages: &[PostgresBackendMessage]) -> Vec<PostgresBackendMessageTag> {
    messages.iter().map(|m| m.tag().unwrap()).collect()
}

fn command_tags(messages: &[PostgresBackendMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match m {
            PostgresBackendMessage::CommandComplete(tag) => Some(tag.clone()),
            _ => None,
        })
        .collect()
}

async fn setup(application_name: &str) -> (MockPostgres, Arc<SessionRegistry>, TestClient) {
    pgrollback_logging::init_for_tests();

    let pg = MockPostgres::start().await;
    let registry = Arc::new(SessionRegistry::new(mock_conf(pg.addr)));
    let handler = Arc::new(PostgresConnectionHandler::new(Arc::clone(&registry)));
    let client = TestClient::connect(handler, application_name).await;

    (pg, registry, client)
}

#[tokio::test]
async fn test_handler_session_setup_sequence() {
    let (pg, registry, _client) = setup("pgtest_t1").await;

    assert!(registry.get("t1").is_some());

    let received = pg.received();
    assert_eq!(
        received,
        vec![
            "SET SESSION idle_in_transaction_session_timeout = 86400000".to_string(),
            "SET SESSION idle_session_timeout = 0".to_string(),
            "SET SESSION statement_timeout = 0".to_string(),
            "SELECT 1".to_string(),
            "BEGIN".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_handler_simple_select_streams_rows() {
    let (pg, _registry, mut client) = setup("pgtest_t1").await;

    let (responses, status) = client.query("SELECT 1").await;

    assert_eq!(
        tags(&responses),
        vec![
            PostgresBackendMessageTag::RowDescription,
            PostgresBackendMessageTag::DataRow,
            PostgresBackendMessageTag::CommandComplete,
        ]
    );
    assert_eq!(command_tags(&responses), vec!["SELECT 1".to_string()]);
    assert_eq!(status, b'I');

    // Executed under a guard savepoint
    assert_eq!(
        pg.received_after_setup(),
        vec![
            "SAVEPOINT pgtest_g_1".to_string(),
            "SELECT 1".to_string(),
            "RELEASE SAVEPOINT pgtest_g_1".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_handler_rewrites_begin_insert_commit() {
    let (pg, _registry, mut client) = setup("pgtest_t1").await;

    let (responses, status) = client.query("BEGIN").await;
    assert_eq!(command_tags(&responses), vec!["BEGIN".to_string()]);
    assert_eq!(status, b'T');

    let (responses, status) = client.query("INSERT INTO foo VALUES (1)").await;
    assert_eq!(command_tags(&responses), vec!["INSERT 1".to_string()]);
    assert_eq!(status, b'T');

    let (responses, status) = client.query("COMMIT").await;
    assert_eq!(command_tags(&responses), vec!["COMMIT".to_string()]);
    assert_eq!(status, b'I');

    let received = pg.received_after_setup();
    assert_eq!(
        received,
        vec![
            "SAVEPOINT pgtest_v_1".to_string(),
            "SAVEPOINT pgtest_g_1".to_string(),
            "INSERT INTO foo VALUES (1)".to_string(),
            "RELEASE SAVEPOINT pgtest_g_1".to_string(),
            "RELEASE SAVEPOINT pgtest_v_1".to_string(),
        ]
    );

    // The backend never saw a COMMIT
    assert!(!pg.received().iter().any(|sql| sql.starts_with("COMMIT")));
}

#[tokio::test]
async fn test_handler_bare_commit_is_swallowed() {
    let (pg, _registry, mut client) = setup("pgtest_t1").await;

    let (responses, status) = client.query("COMMIT").await;

    assert_eq!(command_tags(&responses), vec!["COMMIT".to_string()]);
    assert_eq!(status, b'I');

    // Nothing reached the backend
    assert_eq!(pg.received_after_setup(), Vec::<String>::new());
}

#[tokio::test]
async fn test_handler_nested_begin_rollback() {
    let (pg, _registry, mut client) = setup("pgtest_t1").await;

    let (_, status) = client.query("BEGIN").await;
    assert_eq!(status, b'T');

    let (_, status) = client.query("BEGIN").await;
    assert_eq!(status, b'T');

    let (responses, status) = client.query("ROLLBACK").await;
    assert_eq!(command_tags(&responses), vec!["ROLLBACK".to_string()]);
    // The outer user transaction is still open
    assert_eq!(status, b'T');

    assert_eq!(
        pg.received_after_setup(),
        vec![
            "SAVEPOINT pgtest_v_1".to_string(),
            "SAVEPOINT pgtest_v_2".to_string(),
            "ROLLBACK TO SAVEPOINT pgtest_v_2; RELEASE SAVEPOINT pgtest_v_2".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_handler_failed_statement_does_not_poison_session() {
    let (pg, _registry, mut client) = setup("pgtest_t1").await;

    let (responses, status) = client.query("INSERT INTO no_such_table VALUES (1)").await;

    let error = match &responses[0] {
        PostgresBackendMessage::ErrorResponse(error) => error,
        msg => panic!("Expected error response, got: {:?}", msg),
    };
    assert_eq!(error.code(), Some("42P01"));
    assert_eq!(status, b'I');

    // The guard was rolled back and released
    assert_eq!(
        pg.received_after_setup(),
        vec![
            "SAVEPOINT pgtest_g_1".to_string(),
            "INSERT INTO no_such_table VALUES (1)".to_string(),
            "ROLLBACK TO SAVEPOINT pgtest_g_1".to_string(),
            "RELEASE SAVEPOINT pgtest_g_1".to_string(),
        ]
    );

    // The session keeps answering queries
    let (responses, _) = client.query("SELECT 1").await;
    assert_eq!(command_tags(&responses), vec!["SELECT 1".to_string()]);
}

#[tokio::test]
async fn test_handler_multi_statement_batch_takes_advisory_lock() {
    let (pg, _registry, mut client) = setup("pgtest_t1").await;

    let (responses, _) = client.query("INSERT INTO a VALUES (1); INSERT INTO b VALUES (2)").await;
    assert_eq!(
        command_tags(&responses),
        vec!["INSERT 1".to_string(), "INSERT 1".to_string()]
    );

    let received = pg.received_after_setup();
    assert!(received[0].starts_with("SELECT pg_advisory_lock("));
    assert!(received.last().unwrap().starts_with("SELECT pg_advisory_unlock("));
}

#[tokio::test]
async fn test_handler_pgtest_status_is_synthesised() {
    let (pg, _registry, mut client) = setup("pgtest_t1").await;

    let (responses, status) = client.query("pgtest status").await;

    assert_eq!(
        tags(&responses),
        vec![
            PostgresBackendMessageTag::RowDescription,
            PostgresBackendMessageTag::DataRow,
            PostgresBackendMessageTag::CommandComplete,
        ]
    );
    assert_eq!(status, b'I');

    // Built by the proxy, no backend round-trip
    assert_eq!(pg.received_after_setup(), Vec::<String>::new());
}

#[tokio::test]
async fn test_handler_pgtest_rollback_resets_the_outer_transaction() {
    let (pg, _registry, mut client) = setup("pgtest_t1").await;

    client.query("INSERT INTO foo VALUES (1)").await;

    let (responses, _) = client.query("pgtest rollback").await;
    assert_eq!(command_tags(&responses), vec!["PGTEST".to_string()]);

    let received = pg.received();
    // The reset: a raw ROLLBACK then a fresh BEGIN
    assert_eq!(received[received.len() - 2..].to_vec(), vec![
        "ROLLBACK".to_string(),
        "BEGIN".to_string(),
    ]);
}

#[tokio::test]
async fn test_handler_deallocate_is_excluded_from_history() {
    let (_pg, registry, mut client) = setup("pgtest_t1").await;

    client.query("SELECT 1").await;
    client.query("DEALLOCATE ALL").await;

    let session = registry.get("t1").unwrap();
    let info = session.info().await;

    assert_eq!(info.history.len(), 1);
    assert_eq!(info.history[0].sql, "SELECT 1");
}

#[tokio::test]
async fn test_handler_session_survives_disconnect() {
    let (pg, registry, client) = setup("pgtest_t1").await;

    drop(client);

    // Give the handler task a moment to observe the close
    tokio::task::yield_now().await;

    assert!(registry.get("t1").is_some());
    // The outer transaction was not rolled back
    assert!(!pg.received().iter().any(|sql| sql == "ROLLBACK"));
}

// Extended protocol frames built by hand; the proxy's own frontend codec
// only serialises the messages it sends to the backend.

fn parse_frame(name: &str, sql: &str) -> PostgresMessage {
    PostgresMessage::build(b'P', |body| {
        write_cstr(body, name)?;
        write_cstr(body, sql)?;
        std::io::Write::write_all(&mut *body, &0i16.to_be_bytes())?;
        Ok(())
    })
    .unwrap()
}

fn bind_frame(portal: &str, statement: &str, params: &[&str]) -> PostgresMessage {
    PostgresMessage::build(b'B', |body| {
        write_cstr(body, portal)?;
        write_cstr(body, statement)?;
        // All-text parameter formats
        std::io::Write::write_all(&mut *body, &0i16.to_be_bytes())?;
        std::io::Write::write_all(&mut *body, &(params.len() as i16).to_be_bytes())?;
        for param in params {
            std::io::Write::write_all(&mut *body, &(param.len() as i32).to_be_bytes())?;
            std::io::Write::write_all(&mut *body, param.as_bytes())?;
        }
        std::io::Write::write_all(&mut *body, &0i16.to_be_bytes())?;
        Ok(())
    })
    .unwrap()
}

fn describe_frame(target: u8, name: &str) -> PostgresMessage {
    PostgresMessage::build(b'D', |body| {
        std::io::Write::write_all(&mut *body, &[target])?;
        write_cstr(body, name)?;
        Ok(())
    })
    .unwrap()
}

fn execute_frame(portal: &str) -> PostgresMessage {
    PostgresMessage::build(b'E', |body| {
        write_cstr(body, portal)?;
        std::io::Write::write_all(&mut *body, &0i32.to_be_bytes())?;
        Ok(())
    })
    .unwrap()
}

fn sync_frame() -> PostgresMessage {
    PostgresMessage::build(b'S', |_| Ok(())).unwrap()
}

#[tokio::test]
async fn test_handler_extended_protocol_with_returning() {
    let (pg, _registry, mut client) = setup("pgtest_t1").await;

    let sql = "INSERT INTO t (n) VALUES ($1) RETURNING \"id\"";

    client.send_raw(parse_frame("s1", sql)).await;
    assert_eq!(
        client.read().await.tag().unwrap(),
        PostgresBackendMessageTag::ParseComplete
    );

    client.send_raw(describe_frame(b'S', "s1")).await;
    assert_eq!(
        client.read().await.tag().unwrap(),
        PostgresBackendMessageTag::ParameterDescription
    );
    assert_eq!(
        client.read().await.tag().unwrap(),
        PostgresBackendMessageTag::RowDescription
    );

    client.send_raw(bind_frame("", "s1", &["1"])).await;
    assert_eq!(
        client.read().await.tag().unwrap(),
        PostgresBackendMessageTag::BindComplete
    );

    client.send_raw(execute_frame("")).await;

    // The synthesised description already went out with Describe; Execute
    // streams the data row and the command tag only
    assert_eq!(
        client.read().await.tag().unwrap(),
        PostgresBackendMessageTag::DataRow
    );
    assert_eq!(
        client.read().await,
        PostgresBackendMessage::CommandComplete("INSERT 1".into())
    );

    client.send_raw(sync_frame()).await;
    assert_eq!(client.read().await, PostgresBackendMessage::ReadyForQuery(b'I'));

    // The parameter was rendered as a literal
    assert!(pg
        .received()
        .iter()
        .any(|sql| sql == "INSERT INTO t (n) VALUES ('1') RETURNING \"id\""));
}

#[tokio::test]
async fn test_handler_extended_protocol_error_drains_until_sync() {
    let (_pg, _registry, mut client) = setup("pgtest_t1").await;

    // Bind to a statement that was never prepared
    client.send_raw(bind_frame("", "missing", &[])).await;

    match client.read().await {
        PostgresBackendMessage::ErrorResponse(_) => {}
        msg => panic!("Expected error response, got: {:?}", msg),
    }

    // Discarded while draining
    client.send_raw(execute_frame("")).await;

    client.send_raw(sync_frame()).await;
    assert_eq!(client.read().await, PostgresBackendMessage::ReadyForQuery(b'I'));
}

#[tokio::test]
async fn test_handler_cross_connection_session_sharing() {
    let (pg, registry, mut first) = setup("pgtest_shared").await;

    let handler = Arc::new(PostgresConnectionHandler::new(Arc::clone(&registry)));
    let mut second = TestClient::connect(handler, "pgtest_shared").await;

    // Only one backend connection was opened
    assert_eq!(
        pg.received()
            .iter()
            .filter(|sql| *sql == "BEGIN")
            .count(),
        1
    );

    // A transaction opened by the first client does not mark the second
    // client's status byte
    let (_, status) = first.query("BEGIN").await;
    assert_eq!(status, b'T');

    let (_, status) = second.query("SELECT 1").await;
    assert_eq!(status, b'I');
}
