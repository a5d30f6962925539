use std::{collections::HashMap, time::Duration};

use md5::{Digest, Md5};
use pgrollback_core::{
    config::BackendConfig,
    err::{bail, Context, Error, Result},
};
use pgrollback_logging::trace;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::timeout,
};

use crate::{
    proto::{
        be::{ErrorResponse, PostgresBackendMessage, PostgresBackendMessageTag},
        common::CancelKey,
        fe::{PostgresFrontendMessage, PostgresFrontendStartupMessage},
    },
    query::string::normalise_command_tag,
};

/// Bounded timeouts for backend housekeeping operations. Statement
/// execution itself is unbounded: statement_timeout is disabled so
/// long-running test queries are not killed.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// A statement rejected by the backend.
///
/// Carries the backend's ErrorResponse so it can be forwarded to the
/// client verbatim, code and all.
#[derive(Debug)]
pub struct BackendError(pub ErrorResponse);

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BackendError {}

/// A connection to the real postgres server, speaking the v3 protocol.
///
/// Each session owns exactly one. The outer transaction is begun at
/// session creation and only ever rolled back; nothing in this type (or
/// anywhere else in the proxy) commits it.
#[derive(Debug)]
pub struct BackendConnection<S = TcpStream> {
    stream: S,
    broken: bool,
    tx_open: bool,
    guard_seq: u64,
    initial_parameters: Vec<(String, String)>,
    backend_key_data: Option<CancelKey>,
}

impl BackendConnection<TcpStream> {
    /// Connects and authenticates against the configured postgres server.
    ///
    /// Cleartext and md5 password challenges are answered with the
    /// configured credentials. SCRAM is not implemented; the proxy user
    /// must be configured for trust, password or md5 auth.
    pub async fn connect(conf: &BackendConfig, application_name: &str) -> Result<Self> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(conf.addr()))
            .await
            .context("Timed out while connecting to postgres")?
            .with_context(|| format!("Failed to connect to postgres at {}", conf.addr()))?;

        let mut con = Self::new(stream);
        con.authenticate(conf, application_name).await?;

        Ok(con)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> BackendConnection<S> {
    /// Creates a new connection over the supplied stream
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            broken: false,
            tx_open: false,
            guard_seq: 1,
            initial_parameters: vec![],
            backend_key_data: None,
        }
    }

    /// Sends a startup message and completes the authentication cycle.
    ///
    /// @see https://www.postgresql.org/docs/current/protocol-flow.html#id-1.10.5.7.3
    async fn authenticate(&mut self, conf: &BackendConfig, application_name: &str) -> Result<()> {
        let params: HashMap<String, String> = [
            ("client_encoding".to_string(), "UTF8".to_string()),
            ("user".to_string(), conf.user.clone()),
            ("database".to_string(), conf.database.clone()),
            ("application_name".to_string(), application_name.to_string()),
        ]
        .into_iter()
        .collect();

        self.send(PostgresFrontendMessage::StartupMessage(
            PostgresFrontendStartupMessage::new(params),
        ))
        .await?;

        loop {
            let msg = self.receive().await?;

            match msg {
                PostgresBackendMessage::AuthenticationOk => {}
                PostgresBackendMessage::AuthenticationCleartextPassword => {
                    self.send(PostgresFrontendMessage::PasswordMessage(
                        conf.password.clone(),
                    ))
                    .await?;
                }
                PostgresBackendMessage::AuthenticationMd5Password(salt) => {
                    self.send(PostgresFrontendMessage::PasswordMessage(md5_password(
                        &conf.user,
                        &conf.password,
                        salt,
                    )))
                    .await?;
                }
                PostgresBackendMessage::AuthenticationSasl(_) => {
                    bail!(
                        "Postgres requested SCRAM authentication which is not supported, \
                         configure trust, password or md5 auth for user \"{}\"",
                        conf.user
                    );
                }
                PostgresBackendMessage::ParameterStatus(key, value) => {
                    self.initial_parameters.push((key, value));
                }
                PostgresBackendMessage::BackendKeyData(key) => {
                    let _ = self.backend_key_data.insert(key);
                }
                PostgresBackendMessage::ReadyForQuery(_) => break,
                PostgresBackendMessage::ErrorResponse(err) => {
                    bail!("Postgres rejected connection: {}", err);
                }
                msg if msg.tag()? == PostgresBackendMessageTag::NoticeResponse => continue,
                msg => bail!("Unexpected response from postgres: {:?}", msg),
            }
        }

        Ok(())
    }

    /// Applies the session-scoped settings every test session runs with:
    /// the configured idle-in-transaction ceiling, with the server's idle
    /// and statement timeouts disabled.
    pub async fn configure_session(&mut self, idle_timeout: Duration) -> Result<()> {
        self.execute(format!(
            "SET SESSION idle_in_transaction_session_timeout = {}",
            idle_timeout.as_millis()
        ))
        .await?;
        self.execute("SET SESSION idle_session_timeout = 0").await?;
        self.execute("SET SESSION statement_timeout = 0").await?;

        Ok(())
    }

    /// Verifies the connection actually answers queries, within a bound
    pub async fn ping(&mut self) -> Result<()> {
        timeout(PING_TIMEOUT, self.execute("SELECT 1"))
            .await
            .context("Timed out while pinging postgres")??;

        Ok(())
    }

    /// Sends the supplied message to postgres
    pub async fn send(&mut self, message: PostgresFrontendMessage) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        self.check_broken()?;

        let res = message.write(&mut self.stream).await;
        if res.is_err() {
            self.broken = true;
            return res;
        }

        let res = self.stream.flush().await.context("Failed to flush");
        if res.is_err() {
            self.broken = true;
        }

        res
    }

    /// Receives a message from the postgres backend
    pub async fn receive(&mut self) -> Result<PostgresBackendMessage> {
        self.check_broken()?;

        let res = PostgresBackendMessage::read(&mut self.stream)
            .await
            .context("Failed to read message from postgres");

        if res.is_err() {
            self.broken = true;
        }

        res
    }

    /// Executes the supplied query, returning every response message up to
    /// ReadyForQuery.
    ///
    /// A backend error surfaces as a `BackendError` carrying the original
    /// ErrorResponse; the protocol stays in sync because the backend's
    /// ReadyForQuery is still consumed.
    pub async fn execute_with_responses(
        &mut self,
        sql: impl Into<String>,
    ) -> Result<Vec<PostgresBackendMessage>> {
        let sql = sql.into();
        trace!("Executing SQL: {}", &sql);

        self.send(PostgresFrontendMessage::Query(sql))
            .await
            .context("Failed to execute query")?;

        let mut responses = vec![];
        let mut error: Option<ErrorResponse> = None;

        loop {
            let msg = self.receive().await.context("Failed to execute query")?;

            match msg {
                PostgresBackendMessage::ReadyForQuery(_) => break,
                PostgresBackendMessage::ErrorResponse(err) => {
                    // Keep the first error, the rest of the batch is skipped
                    // by the backend anyway
                    if error.is_none() {
                        let _ = error.insert(err);
                    }
                }
                msg if [
                    PostgresBackendMessageTag::CommandComplete,
                    PostgresBackendMessageTag::RowDescription,
                    PostgresBackendMessageTag::DataRow,
                    PostgresBackendMessageTag::EmptyQueryResponse,
                    PostgresBackendMessageTag::ParameterStatus,
                    PostgresBackendMessageTag::NoticeResponse,
                    PostgresBackendMessageTag::NotificationResponse,
                ]
                .contains(&msg.tag()?) =>
                {
                    responses.push(msg);
                }
                msg => {
                    self.broken = true;
                    bail!("Unexpected response while executing query: {:?}", msg);
                }
            }
        }

        match error {
            Some(err) => Err(Error::new(BackendError(err))),
            None => Ok(responses),
        }
    }

    /// Executes the supplied query, returning the last command tag
    pub async fn execute(&mut self, sql: impl Into<String>) -> Result<String> {
        let responses = self.execute_with_responses(sql).await?;

        let tag = responses
            .iter()
            .rev()
            .find_map(|msg| match msg {
                PostgresBackendMessage::CommandComplete(tag) => Some(tag.clone()),
                _ => None,
            })
            .unwrap_or_default();

        Ok(normalise_command_tag(&tag))
    }

    /// Executes a data statement wrapped in a guard savepoint so a failure
    /// cannot abort the outer transaction.
    ///
    /// The helper owns all exit paths: release on success, roll back to the
    /// guard and release it on error with the original error surfaced.
    /// Transaction control must never come through here, releasing the
    /// guard would destroy a user savepoint created by the statement.
    pub async fn execute_guarded(
        &mut self,
        sql: impl Into<String>,
    ) -> Result<Vec<PostgresBackendMessage>> {
        let guard = format!("pgtest_g_{}", self.guard_seq);
        self.guard_seq += 1;

        self.execute(format!("SAVEPOINT {}", guard))
            .await
            .context("Failed to create guard savepoint")?;

        match self.execute_with_responses(sql).await {
            Ok(responses) => {
                self.execute(format!("RELEASE SAVEPOINT {}", guard))
                    .await
                    .context("Failed to release guard savepoint")?;

                Ok(responses)
            }
            Err(err) => {
                self.execute(format!("ROLLBACK TO SAVEPOINT {}", guard))
                    .await
                    .context("Failed to roll back to guard savepoint")?;
                self.execute(format!("RELEASE SAVEPOINT {}", guard))
                    .await
                    .context("Failed to release guard savepoint")?;

                Err(err)
            }
        }
    }

    /// Begins the outer transaction. Idempotent.
    pub async fn begin_tx(&mut self) -> Result<()> {
        if self.tx_open {
            return Ok(());
        }

        self.execute("BEGIN").await?;
        self.tx_open = true;

        Ok(())
    }

    /// Rolls back the outer transaction. Safe when absent.
    pub async fn rollback_tx(&mut self) -> Result<()> {
        if !self.tx_open {
            return Ok(());
        }

        self.tx_open = false;
        self.execute("ROLLBACK").await?;

        Ok(())
    }

    /// Discards the outer transaction, including any failed state, and
    /// begins a fresh one on the same connection.
    pub async fn start_new_tx(&mut self) -> Result<()> {
        // A raw ROLLBACK clears an aborted transaction; outside a
        // transaction it is a no-op notice
        self.tx_open = false;
        self.execute("ROLLBACK").await?;
        self.begin_tx().await?;

        Ok(())
    }

    /// Takes the session-level advisory lock for the supplied key
    pub async fn advisory_lock(&mut self, key: i64) -> Result<()> {
        self.execute(format!("SELECT pg_advisory_lock({})", key))
            .await?;
        Ok(())
    }

    pub async fn advisory_unlock(&mut self, key: i64) -> Result<()> {
        self.execute(format!("SELECT pg_advisory_unlock({})", key))
            .await?;
        Ok(())
    }

    /// Rolls back the outer transaction and terminates the connection.
    /// Errors from an already-dead backend are swallowed, closing is
    /// idempotent.
    pub async fn close(mut self) -> Result<()> {
        if self.tx_open && !self.broken {
            self.tx_open = false;
            let _ = self.execute("ROLLBACK").await;
        }

        let _ = self.send(PostgresFrontendMessage::Terminate).await;

        Ok(())
    }

    pub fn tx_open(&self) -> bool {
        self.tx_open
    }

    pub fn broken(&self) -> bool {
        self.broken
    }

    fn check_broken(&self) -> Result<()> {
        if self.broken {
            bail!("Backend connection is broken");
        }

        Ok(())
    }

    /// The parameter statuses captured during startup, replayed to clients
    pub fn initial_parameters(&self) -> &Vec<(String, String)> {
        &self.initial_parameters
    }

    pub fn backend_key_data(&self) -> &Option<CancelKey> {
        &self.backend_key_data
    }
}

/// The md5 password response: md5(hex(md5(password ‖ user)) ‖ salt),
/// prefixed with "md5"
fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(user.as_bytes());
    let inner = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);

    format!("md5{}", hex::encode(hasher.finalize()))
}
