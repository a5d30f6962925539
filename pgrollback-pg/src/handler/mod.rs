//! Request handler for postgres-wire-protocol client connections.
//!
//! Terminates startup and authentication towards the client, then runs
//! the simple/extended query state machine, dispatching statements to the
//! command interpreter and the session's backend connection.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use pgrollback_core::err::{bail, Context, Error, Result};
use pgrollback_logging::{debug, warn};
use pgrollback_proxy::{handler::ConnectionHandler, stream::IOStream};
use tokio::{io::AsyncWriteExt, time::timeout};

use crate::{
    backend::BackendError,
    interpret::{
        self, CommandInterpreter, ControlCommand, Rewritten, SyntheticReply, TxSemanticsError,
    },
    proto::{
        be::{PostgresBackendMessage, PostgresBackendMessageTag},
        common::CancelKey,
        fe::{
            Bind, Close, Describe, Execute, Parse, PostgresFrontendMessage, Target,
        },
    },
    query::string::{
        advisory_lock_key, count_placeholders, normalise_command_tag, split_statements,
        substitute_params,
    },
    registry::SessionRegistry,
    session::{
        next_connection_id, ConnectionId, Portal, PreparedKind, PreparedStatement, Session,
        SessionState,
    },
};

#[cfg(test)]
mod test;

/// Clients may sit idle for a long time between test steps; reads are
/// bounded by this deadline, refreshed on every message.
const CLIENT_DEADLINE: Duration = Duration::from_secs(3600);

/// Request handler for postgres-wire-protocol connections
pub struct PostgresConnectionHandler {
    registry: Arc<SessionRegistry>,
    interpreter: CommandInterpreter,
}

impl PostgresConnectionHandler {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            interpreter: CommandInterpreter::new(Arc::clone(&registry)),
            registry,
        }
    }
}

#[async_trait]
impl ConnectionHandler for PostgresConnectionHandler {
    async fn handle(&self, mut client: Box<dyn IOStream>) -> Result<()> {
        match self.handle_connection(&mut client).await {
            Ok(()) => {
                debug!("Client connection closed");
                Ok(())
            }
            Err(err) => {
                let _ = PostgresBackendMessage::error_msg(format!("{}", err))
                    .write(&mut client)
                    .await;
                let _ = client.flush().await;

                Err(err)
            }
        }
    }
}

impl PostgresConnectionHandler {
    async fn handle_connection(&self, client: &mut Box<dyn IOStream>) -> Result<()> {
        // The proxy protocol layer has already declined an SSLRequest, but
        // some drivers retry the upgrade before starting up
        let startup = loop {
            let msg = PostgresFrontendMessage::read_initial(client)
                .await
                .context("Failed to read startup message")?;

            match msg {
                PostgresFrontendMessage::StartupMessage(startup) => break startup,
                PostgresFrontendMessage::SslRequest => {
                    client.write_all(b"N").await?;
                    client.flush().await?;
                }
                PostgresFrontendMessage::CancelRequest(_) => {
                    // Statements run synchronously under the session lock,
                    // there is no backend task to cancel
                    debug!("Ignoring cancel request");
                    return Ok(());
                }
                msg => bail!("Unexpected startup message: {:?}", msg),
            }
        };

        let application_name = startup
            .params
            .get("application_name")
            .map(|s| s.as_str())
            .unwrap_or("");
        let test_id = derive_test_id(application_name);
        debug!("Client connected for test id \"{}\"", test_id);

        // The challenge is a formality every driver can answer; the proxy
        // does not authenticate clients. Backend authentication happened
        // at session creation.
        PostgresBackendMessage::AuthenticationCleartextPassword
            .write(client)
            .await?;
        client.flush().await?;

        match PostgresFrontendMessage::read(client).await? {
            PostgresFrontendMessage::PasswordMessage(_) => {}
            msg => bail!("Expected a password message, got: {:?}", msg),
        }

        let session = self
            .registry
            .get_or_create(&test_id)
            .await
            .with_context(|| format!("Failed to open session \"{}\"", test_id))?;

        self.complete_startup(client, &session).await?;

        let connection_id = next_connection_id();
        self.run(client, &session, connection_id).await
    }

    /// AuthenticationOk, the backend's cached parameter statuses and key
    /// data (plausible defaults otherwise), then ReadyForQuery
    async fn complete_startup(
        &self,
        client: &mut Box<dyn IOStream>,
        session: &Arc<Session>,
    ) -> Result<()> {
        PostgresBackendMessage::AuthenticationOk.write(client).await?;

        let (parameters, key_data) = {
            let state = session.state().lock().await;

            match state.backend() {
                Ok(backend) => (
                    backend.initial_parameters().clone(),
                    backend.backend_key_data().clone(),
                ),
                Err(_) => (vec![], None),
            }
        };

        let parameters = if parameters.is_empty() {
            default_parameters()
        } else {
            parameters
        };

        for (key, value) in parameters {
            PostgresBackendMessage::ParameterStatus(key, value)
                .write(client)
                .await?;
        }

        // Drivers want key data to build cancel requests, even though the
        // proxy ignores them
        let key_data = key_data.unwrap_or_else(|| CancelKey {
            pid: rand::random(),
            key: rand::random(),
        });
        PostgresBackendMessage::BackendKeyData(key_data)
            .write(client)
            .await?;

        PostgresBackendMessage::ReadyForQuery(b'I').write(client).await?;
        client.flush().await?;

        Ok(())
    }

    /// The per-connection message loop
    async fn run(
        &self,
        client: &mut Box<dyn IOStream>,
        session: &Arc<Session>,
        connection_id: ConnectionId,
    ) -> Result<()> {
        // After an extended-protocol error, messages are discarded until
        // the client syncs
        let mut draining = false;

        loop {
            let msg = match timeout(CLIENT_DEADLINE, PostgresFrontendMessage::read(client)).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(err)) => {
                    // Disconnects are routine; the session persists
                    debug!("Client read ended: {:?}", err);
                    return Ok(());
                }
                Err(_) => {
                    warn!("Client idle past deadline, closing connection");
                    return Ok(());
                }
            };

            session.touch().await;

            let step = match msg {
                PostgresFrontendMessage::Query(sql) => {
                    draining = false;
                    self.handle_simple_query(client, session, connection_id, &sql)
                        .await?;
                    Ok(())
                }
                PostgresFrontendMessage::Sync => {
                    draining = false;
                    self.ready_for_query(client, session, connection_id).await?;
                    Ok(())
                }
                PostgresFrontendMessage::Flush => {
                    client.flush().await?;
                    Ok(())
                }
                PostgresFrontendMessage::Terminate => return Ok(()),
                _ if draining => Ok(()),
                PostgresFrontendMessage::Parse(parse) => {
                    self.handle_parse(client, session, parse).await
                }
                PostgresFrontendMessage::Bind(bind) => {
                    self.handle_bind(client, session, bind).await
                }
                PostgresFrontendMessage::Describe(describe) => {
                    self.handle_describe(client, session, describe).await
                }
                PostgresFrontendMessage::Execute(execute) => {
                    self.handle_execute(client, session, connection_id, execute)
                        .await
                }
                PostgresFrontendMessage::Close(close) => {
                    self.handle_close(client, session, close).await
                }
                msg => bail!("Unexpected message: {:?}", msg),
            };

            if let Err(err) = step {
                self.report_statement_error(client, err).await?;
                draining = true;
            }
        }
    }

    /// Reports a failed statement to the client, preserving a backend
    /// error's original wire image (code included), and keeps the
    /// connection alive
    async fn report_statement_error(
        &self,
        client: &mut Box<dyn IOStream>,
        err: Error,
    ) -> Result<()> {
        let msg = match err.downcast::<BackendError>() {
            Ok(backend_err) => PostgresBackendMessage::ErrorResponse(backend_err.0),
            Err(err) => match err.downcast::<TxSemanticsError>() {
                Ok(tx_err) => PostgresBackendMessage::error_msg(tx_err.to_string()),
                Err(err) => {
                    debug!("Statement failed: {:?}", err);
                    PostgresBackendMessage::error_msg(format!("{}", err))
                }
            },
        };

        msg.write(client).await?;
        client.flush().await?;

        Ok(())
    }

    async fn ready_for_query(
        &self,
        client: &mut Box<dyn IOStream>,
        session: &Arc<Session>,
        connection_id: ConnectionId,
    ) -> Result<()> {
        let status = session.status_byte(connection_id).await;

        PostgresBackendMessage::ReadyForQuery(status)
            .write(client)
            .await?;
        client.flush().await?;

        Ok(())
    }

    /// Simple query flow: control sub-language, then statement splitting,
    /// interpretation and execution, closed by one ReadyForQuery
    async fn handle_simple_query(
        &self,
        client: &mut Box<dyn IOStream>,
        session: &Arc<Session>,
        connection_id: ConnectionId,
        sql: &str,
    ) -> Result<()> {
        match ControlCommand::parse(sql) {
            Ok(Some(cmd)) => {
                match self.interpreter.run_control(&cmd, session).await {
                    Ok(reply) => write_synthetic(client, reply).await?,
                    Err(err) => self.report_statement_error(client, err).await?,
                }

                return self.ready_for_query(client, session, connection_id).await;
            }
            Ok(None) => {}
            Err(err) => {
                self.report_statement_error(client, err).await?;
                return self.ready_for_query(client, session, connection_id).await;
            }
        }

        let statements = split_statements(sql);

        if statements.is_empty() {
            PostgresBackendMessage::empty_query_response()
                .write(client)
                .await?;
            return self.ready_for_query(client, session, connection_id).await;
        }

        let mut state = session.state().lock().await;

        // A multi-statement batch is made to appear atomic to other
        // observers of the backend
        let lock_key = (statements.len() > 1).then(|| advisory_lock_key(session.test_id()));

        let res = async {
            if let Some(key) = lock_key {
                state.backend_mut()?.advisory_lock(key).await?;
            }

            self.run_statements(client, &mut state, connection_id, &statements)
                .await
        }
        .await;

        if let Some(key) = lock_key {
            if let Ok(backend) = state.backend_mut() {
                let _ = backend.advisory_unlock(key).await;
            }
        }

        drop(state);

        if let Err(err) = res {
            self.report_statement_error(client, err).await?;
        }

        self.ready_for_query(client, session, connection_id).await
    }

    async fn run_statements(
        &self,
        client: &mut Box<dyn IOStream>,
        state: &mut SessionState,
        connection_id: ConnectionId,
        statements: &[String],
    ) -> Result<()> {
        for sql in statements {
            let started = Instant::now();

            let rewritten = interpret::rewrite(state, connection_id, sql)?;

            let outcome = match rewritten {
                Rewritten::Synthetic { tag } => {
                    PostgresBackendMessage::CommandComplete(tag)
                        .write(client)
                        .await?;
                    Ok(())
                }
                Rewritten::Forward {
                    sql: exec_sql,
                    guard,
                    tag_override,
                } => {
                    self.execute_forward(
                        client,
                        state,
                        connection_id,
                        &exec_sql,
                        guard,
                        tag_override,
                        false,
                    )
                    .await
                }
            };

            // Driver housekeeping stays out of the history
            if !interpret::is_deallocate(sql) {
                state.record_query(sql.clone(), started.elapsed());
            }

            // A failed statement ends the batch; the error was isolated by
            // its guard savepoint so the outer transaction survives
            outcome?;
        }

        Ok(())
    }

    /// Executes rewritten SQL on the backend and streams the responses to
    /// the client. Tracking is applied only after the backend accepted the
    /// statement.
    #[allow(clippy::too_many_arguments)]
    async fn execute_forward(
        &self,
        client: &mut Box<dyn IOStream>,
        state: &mut SessionState,
        connection_id: ConnectionId,
        sql: &str,
        guard: bool,
        tag_override: Option<String>,
        suppress_row_description: bool,
    ) -> Result<()> {
        let responses = {
            let backend = state.backend_mut()?;

            // Safety rail: every statement runs inside the outer transaction
            backend.begin_tx().await?;

            if guard {
                backend.execute_guarded(sql).await?
            } else {
                backend.execute_with_responses(sql).await?
            }
        };

        interpret::apply_tracking(state, connection_id, sql);

        for msg in responses {
            match msg {
                PostgresBackendMessage::CommandComplete(tag) => {
                    if tag_override.is_none() {
                        PostgresBackendMessage::CommandComplete(normalise_command_tag(&tag))
                            .write(client)
                            .await?;
                    }
                }
                PostgresBackendMessage::ParameterStatus(key, value) => {
                    PostgresBackendMessage::ParameterStatus(key, value)
                        .write(client)
                        .await?;
                }
                PostgresBackendMessage::Other(raw) => {
                    let tag: PostgresBackendMessageTag = raw.tag().try_into()?;

                    if tag == PostgresBackendMessageTag::RowDescription
                        && suppress_row_description
                    {
                        continue;
                    }

                    PostgresBackendMessage::Other(raw).write(client).await?;
                }
                _ => {}
            }
        }

        if let Some(tag) = tag_override {
            PostgresBackendMessage::CommandComplete(tag)
                .write(client)
                .await?;
        }

        client.flush().await?;

        Ok(())
    }

    /// Parse: run the interpreter, store the statement under its name
    async fn handle_parse(
        &self,
        client: &mut Box<dyn IOStream>,
        session: &Arc<Session>,
        parse: Parse,
    ) -> Result<()> {
        let kind = match ControlCommand::parse(&parse.query)? {
            Some(cmd) => PreparedKind::Control(cmd),
            None if interpret::classify(&parse.query).is_tcl() => {
                // Rewriting depends on the savepoint level at execute time
                PreparedKind::Tcl(parse.query.clone())
            }
            None => PreparedKind::Forward(parse.query.clone()),
        };

        let prepared = PreparedStatement {
            returning: interpret::returning_columns(&parse.query),
            param_count: parse.param_types.len().max(count_placeholders(&parse.query)),
            kind,
        };

        session
            .state()
            .lock()
            .await
            .prepared_statements
            .insert(parse.name, prepared);

        PostgresBackendMessage::parse_complete().write(client).await?;

        Ok(())
    }

    async fn handle_bind(
        &self,
        client: &mut Box<dyn IOStream>,
        session: &Arc<Session>,
        bind: Bind,
    ) -> Result<()> {
        let mut state = session.state().lock().await;

        if !state.prepared_statements.contains_key(&bind.statement) {
            bail!("Prepared statement \"{}\" does not exist", bind.statement);
        }

        state.portals.insert(
            bind.portal,
            Portal {
                statement: bind.statement,
                params: bind.params,
                param_formats: bind.param_formats,
            },
        );

        drop(state);

        PostgresBackendMessage::bind_complete().write(client).await?;

        Ok(())
    }

    /// Describe: parameter description plus a synthesised row description
    /// for recognised RETURNING lists; NoData otherwise, with the
    /// backend's own field descriptions following at execute time
    async fn handle_describe(
        &self,
        client: &mut Box<dyn IOStream>,
        session: &Arc<Session>,
        describe: Describe,
    ) -> Result<()> {
        let state = session.state().lock().await;

        let (stmt, include_params) = match describe.target {
            Target::Statement => (
                state
                    .prepared_statements
                    .get(&describe.name)
                    .with_context(|| {
                        format!("Prepared statement \"{}\" does not exist", describe.name)
                    })?,
                true,
            ),
            Target::Portal => {
                let portal = state
                    .portals
                    .get(&describe.name)
                    .with_context(|| format!("Portal \"{}\" does not exist", describe.name))?;

                (
                    state
                        .prepared_statements
                        .get(&portal.statement)
                        .with_context(|| {
                            format!("Prepared statement \"{}\" does not exist", portal.statement)
                        })?,
                    false,
                )
            }
        };

        let param_count = stmt.param_count;
        let returning = stmt.returning.clone();

        drop(state);

        if include_params {
            PostgresBackendMessage::parameter_description(param_count)?
                .write(client)
                .await?;
        }

        match returning {
            Some(columns) => {
                PostgresBackendMessage::row_description(interpret::returning_fields(&columns))?
                    .write(client)
                    .await?;
            }
            None => {
                PostgresBackendMessage::no_data().write(client).await?;
            }
        }

        Ok(())
    }

    /// Execute: resolve portal → statement → SQL, render the bound
    /// parameters, run on the backend. No ReadyForQuery here.
    async fn handle_execute(
        &self,
        client: &mut Box<dyn IOStream>,
        session: &Arc<Session>,
        connection_id: ConnectionId,
        execute: Execute,
    ) -> Result<()> {
        let (prepared, params, formats) = {
            let state = session.state().lock().await;

            let portal = state
                .portals
                .get(&execute.portal)
                .with_context(|| format!("Portal \"{}\" does not exist", execute.portal))?;

            let prepared = state
                .prepared_statements
                .get(&portal.statement)
                .with_context(|| {
                    format!("Prepared statement \"{}\" does not exist", portal.statement)
                })?;

            (
                prepared.clone(),
                portal.params.clone(),
                portal.param_formats.clone(),
            )
        };

        match prepared.kind {
            PreparedKind::Control(cmd) => {
                let reply = self.interpreter.run_control(&cmd, session).await?;
                write_synthetic(client, reply).await?;
            }
            PreparedKind::Tcl(sql) => {
                let mut state = session.state().lock().await;
                let started = Instant::now();

                match interpret::rewrite(&state, connection_id, &sql)? {
                    Rewritten::Synthetic { tag } => {
                        PostgresBackendMessage::CommandComplete(tag)
                            .write(client)
                            .await?;
                    }
                    Rewritten::Forward {
                        sql: exec_sql,
                        guard,
                        tag_override,
                    } => {
                        self.execute_forward(
                            client,
                            &mut state,
                            connection_id,
                            &exec_sql,
                            guard,
                            tag_override,
                            false,
                        )
                        .await?;
                    }
                }

                state.record_query(sql, started.elapsed());
            }
            PreparedKind::Forward(sql) => {
                let rendered = decode_params(&params, &formats)?;
                let final_sql = substitute_params(&sql, &rendered)?;

                let mut state = session.state().lock().await;
                let started = Instant::now();

                let res = self
                    .execute_forward(
                        client,
                        &mut state,
                        connection_id,
                        &final_sql,
                        true,
                        None,
                        // The client already holds the synthesised
                        // description from Describe
                        prepared.returning.is_some(),
                    )
                    .await;

                if !interpret::is_deallocate(&final_sql) {
                    state.record_query(final_sql, started.elapsed());
                }

                res?;
            }
        }

        Ok(())
    }

    async fn handle_close(
        &self,
        client: &mut Box<dyn IOStream>,
        session: &Arc<Session>,
        close: Close,
    ) -> Result<()> {
        let mut state = session.state().lock().await;

        match close.target {
            Target::Statement => {
                state.prepared_statements.remove(&close.name);
            }
            Target::Portal => {
                state.portals.remove(&close.name);
            }
        }

        drop(state);

        PostgresBackendMessage::close_complete().write(client).await?;

        Ok(())
    }
}

/// Emits a synthetic reply: a bare CommandComplete, or a literal result
/// set built by the proxy without a backend round-trip
async fn write_synthetic(client: &mut Box<dyn IOStream>, reply: SyntheticReply) -> Result<()> {
    match reply {
        SyntheticReply::Command(tag) => {
            PostgresBackendMessage::CommandComplete(tag)
                .write(client)
                .await?;
        }
        SyntheticReply::Rows { fields, rows, tag } => {
            PostgresBackendMessage::row_description(fields)?
                .write(client)
                .await?;

            for row in rows {
                PostgresBackendMessage::data_row(row)?.write(client).await?;
            }

            PostgresBackendMessage::CommandComplete(tag)
                .write(client)
                .await?;
        }
    }

    client.flush().await?;

    Ok(())
}

/// Derives the session identifier from the client's application_name:
/// `pgtest_<id>` unwraps to `<id>`, empty or `default` share the default
/// session, anything else is used verbatim.
fn derive_test_id(application_name: &str) -> String {
    match application_name {
        "" | "default" => "default".to_string(),
        name => match name.strip_prefix("pgtest_") {
            Some("") | None => name.to_string(),
            Some(id) => id.to_string(),
        },
    }
}

/// Renders bound parameter values to text for the substitution renderer.
///
/// Binary-format values decode 8-byte and 4-byte big-endian integers;
/// anything else is assumed to be utf8 text already.
fn decode_params(
    params: &[Option<Vec<u8>>],
    formats: &[i16],
) -> Result<Vec<Option<String>>> {
    let format_for = |idx: usize| -> i16 {
        match formats.len() {
            0 => 0,
            1 => formats[0],
            _ => formats.get(idx).copied().unwrap_or(0),
        }
    };

    params
        .iter()
        .enumerate()
        .map(|(idx, param)| {
            let value = match param {
                None => return Ok(None),
                Some(value) => value,
            };

            let text = if format_for(idx) == 1 {
                match value.len() {
                    8 => i64::from_be_bytes(value.as_slice().try_into().unwrap()).to_string(),
                    4 => i32::from_be_bytes(value.as_slice().try_into().unwrap()).to_string(),
                    _ => String::from_utf8(value.clone())
                        .context("Binary parameter is not utf8 text")?,
                }
            } else {
                String::from_utf8(value.clone()).context("Parameter is not utf8 text")?
            };

            Ok(Some(text))
        })
        .collect()
}

fn default_parameters() -> Vec<(String, String)> {
    vec![
        ("server_version".into(), "15.0".into()),
        ("server_encoding".into(), "UTF8".into()),
        ("client_encoding".into(), "UTF8".into()),
        ("DateStyle".into(), "ISO, MDY".into()),
        ("integer_datetimes".into(), "on".into()),
        ("standard_conforming_strings".into(), "on".into()),
    ]
}
