//! Classifies incoming SQL and rewrites transaction control so that user
//! transactions become savepoints on the session's outer transaction.
//!
//! Classification precedence, first match wins:
//!   1. the `pgtest` control sub-language,
//!   2. transaction control rewrite,
//!   3. verbatim pass-through (executed under a guard savepoint).

use std::sync::Arc;

use pgrollback_core::err::{bail, Error, Result};
use sqlparser::{
    ast::{Expr, SelectItem, Statement},
    dialect::PostgreSqlDialect,
    parser::Parser,
};

use crate::{
    proto::be::FieldDescription,
    registry::SessionRegistry,
    session::{ConnectionId, Session, SessionState},
};

/// Prefix of user-visible savepoints on the outer transaction
pub const SAVEPOINT_PREFIX: &str = "pgtest_v_";

/// A user issued COMMIT/ROLLBACK that would manipulate another client's
/// savepoints. Surfaced to the client as a protocol error with the
/// session state unchanged.
#[derive(Debug)]
pub struct TxSemanticsError(pub String);

impl std::fmt::Display for TxSemanticsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TxSemanticsError {}

/// The broad statement classes the proxy cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlKind {
    Begin,
    Commit,
    Rollback,
    RollbackSavepoint,
    Savepoint,
    Release,
    Deallocate,
    Other,
}

impl SqlKind {
    /// Transaction control statements are never wrapped in a guard
    /// savepoint: releasing the guard would destroy the user's savepoint,
    /// and releasing an earlier user savepoint can dissolve the guard.
    pub fn is_tcl(&self) -> bool {
        matches!(
            self,
            Self::Begin
                | Self::Commit
                | Self::Rollback
                | Self::RollbackSavepoint
                | Self::Savepoint
                | Self::Release
        )
    }
}

/// Classifies a statement, preferring a real parse and falling back to
/// prefix heuristics for syntax the parser rejects.
pub fn classify(sql: &str) -> SqlKind {
    match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
        Ok(stmts) if stmts.len() == 1 => match &stmts[0] {
            Statement::StartTransaction { .. } => SqlKind::Begin,
            Statement::Commit { .. } => SqlKind::Commit,
            Statement::Rollback {
                savepoint: Some(_), ..
            } => SqlKind::RollbackSavepoint,
            Statement::Rollback {
                savepoint: None, ..
            } => SqlKind::Rollback,
            Statement::Savepoint { .. } => SqlKind::Savepoint,
            Statement::ReleaseSavepoint { .. } => SqlKind::Release,
            Statement::Deallocate { .. } => SqlKind::Deallocate,
            _ => SqlKind::Other,
        },
        _ => classify_fallback(sql),
    }
}

fn classify_fallback(sql: &str) -> SqlKind {
    let upper = sql.trim().to_ascii_uppercase();

    if upper.starts_with("BEGIN") || upper.starts_with("START TRANSACTION") {
        SqlKind::Begin
    } else if upper.starts_with("COMMIT") {
        SqlKind::Commit
    } else if upper.starts_with("ROLLBACK TO") {
        SqlKind::RollbackSavepoint
    } else if upper.starts_with("ROLLBACK") {
        SqlKind::Rollback
    } else if upper.starts_with("SAVEPOINT") {
        SqlKind::Savepoint
    } else if upper.starts_with("RELEASE") {
        SqlKind::Release
    } else if upper.starts_with("DEALLOCATE") {
        SqlKind::Deallocate
    } else {
        SqlKind::Other
    }
}

/// Whether the statement is driver housekeeping that should not appear in
/// the session's query history
pub fn is_deallocate(sql: &str) -> bool {
    classify(sql) == SqlKind::Deallocate
}

/// Extracts the plainly-named columns of an
/// `INSERT/UPDATE/DELETE ... RETURNING <columns>` statement.
///
/// `RETURNING *`, expressions and unparseable statements return None; the
/// backend's own field descriptions are used instead.
pub fn returning_columns(sql: &str) -> Option<Vec<String>> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;

    if stmts.len() != 1 {
        return None;
    }

    let returning = match &stmts[0] {
        Statement::Insert(insert) => insert.returning.as_ref()?,
        Statement::Update { returning, .. } => returning.as_ref()?,
        Statement::Delete(delete) => delete.returning.as_ref()?,
        _ => return None,
    };

    let mut columns = vec![];

    for item in returning.iter() {
        match item {
            SelectItem::UnnamedExpr(Expr::Identifier(ident)) => columns.push(ident.value.clone()),
            SelectItem::ExprWithAlias { alias, .. } => columns.push(alias.value.clone()),
            _ => return None,
        }
    }

    Some(columns)
}

/// Synthesises the row description for a recognised RETURNING list:
/// int8 for identifier-like column names, text for the rest.
pub fn returning_fields(columns: &[String]) -> Vec<FieldDescription> {
    columns
        .iter()
        .map(|name| {
            if name == "id" || name.ends_with("_id") {
                FieldDescription::int8(name.clone())
            } else {
                FieldDescription::text(name.clone())
            }
        })
        .collect()
}

/// A `pgtest` control command
#[derive(Debug, Clone, PartialEq)]
pub struct ControlCommand {
    pub verb: ControlVerb,
    pub arg: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlVerb {
    Begin,
    Rollback,
    Status,
    List,
    Cleanup,
}

impl ControlCommand {
    /// Recognises the `pgtest ...` sub-language at statement start,
    /// case-insensitively. Non-pgtest statements return Ok(None).
    pub fn parse(sql: &str) -> Result<Option<Self>> {
        let trimmed = sql.trim().trim_end_matches(';').trim();
        let mut tokens = trimmed.split_whitespace();

        match tokens.next() {
            Some(first) if first.eq_ignore_ascii_case("pgtest") => {}
            _ => return Ok(None),
        }

        let verb = match tokens.next() {
            Some(verb) => verb,
            None => bail!("pgtest requires a sub-command: begin, rollback, status, list, cleanup"),
        };

        let verb = match verb.to_ascii_lowercase().as_str() {
            "begin" => ControlVerb::Begin,
            "rollback" => ControlVerb::Rollback,
            "status" => ControlVerb::Status,
            "list" => ControlVerb::List,
            "cleanup" => ControlVerb::Cleanup,
            other => bail!("Unknown pgtest sub-command: {}", other),
        };

        let arg = tokens.next().map(|s| s.to_string());

        if tokens.next().is_some() {
            bail!("Too many arguments to pgtest {:?}", verb);
        }

        if arg.is_some() && verb != ControlVerb::Rollback {
            bail!("pgtest {:?} takes no argument", verb);
        }

        Ok(Some(Self { verb, arg }))
    }
}

/// The interpreter's verdict on one statement
#[derive(Debug, Clone, PartialEq)]
pub enum Rewritten {
    /// Execute this SQL on the backend. TCL runs bare; everything else
    /// runs inside a guard savepoint.
    Forward {
        sql: String,
        guard: bool,
        /// The command tag the client expects when the SQL on the wire no
        /// longer matches its verb (BEGIN executed as SAVEPOINT, and so on)
        tag_override: Option<String>,
    },
    /// Answer the client with a CommandComplete and do no backend work
    Synthetic { tag: String },
}

/// Rewrites one statement against the current session state.
///
/// Must be called with the session lock held; the savepoint ordinal baked
/// into the rewritten SQL is only valid while the state cannot move.
pub fn rewrite(
    state: &SessionState,
    connection_id: ConnectionId,
    sql: &str,
) -> Result<Rewritten> {
    match classify(sql) {
        SqlKind::Begin => {
            let next = state.savepoint_level() + 1;

            Ok(Rewritten::Forward {
                sql: format!("SAVEPOINT {}{}", SAVEPOINT_PREFIX, next),
                guard: false,
                tag_override: Some("BEGIN".into()),
            })
        }
        SqlKind::Commit => rewrite_tx_end(state, connection_id, "COMMIT", |level| {
            format!("RELEASE SAVEPOINT {}{}", SAVEPOINT_PREFIX, level)
        }),
        SqlKind::Rollback => rewrite_tx_end(state, connection_id, "ROLLBACK", |level| {
            format!(
                "ROLLBACK TO SAVEPOINT {p}{l}; RELEASE SAVEPOINT {p}{l}",
                p = SAVEPOINT_PREFIX,
                l = level
            )
        }),
        SqlKind::RollbackSavepoint | SqlKind::Savepoint | SqlKind::Release => {
            Ok(Rewritten::Forward {
                sql: sql.to_string(),
                guard: false,
                tag_override: None,
            })
        }
        SqlKind::Deallocate | SqlKind::Other => Ok(Rewritten::Forward {
            sql: sql.to_string(),
            guard: true,
            tag_override: None,
        }),
    }
}

/// COMMIT and ROLLBACK share their gating: they only touch the backend
/// when this client holds the innermost user savepoint. A bare verb with
/// no open user transaction degrades to synthetic success; a real COMMIT
/// is never forwarded.
fn rewrite_tx_end(
    state: &SessionState,
    connection_id: ConnectionId,
    verb: &str,
    emit: impl FnOnce(u32) -> String,
) -> Result<Rewritten> {
    if state.savepoint_level() == 0 {
        return Ok(Rewritten::Synthetic { tag: verb.into() });
    }

    match state.owner() {
        Some(owner) if owner == connection_id && state.user_tx_count(connection_id) > 0 => {
            Ok(Rewritten::Forward {
                sql: emit(state.savepoint_level()),
                guard: false,
                tag_override: Some(verb.into()),
            })
        }
        Some(owner) if owner != connection_id && state.user_tx_count(owner) > 0 => {
            Err(Error::new(TxSemanticsError(format!(
                "{} issued without an open transaction on this connection \
                 while another connection holds one",
                verb
            ))))
        }
        _ => Ok(Rewritten::Synthetic { tag: verb.into() }),
    }
}

enum TrackingAction {
    Create(u32),
    Release(u32),
}

/// Applies savepoint-level tracking for an acknowledged statement.
///
/// Called only after the backend accepted the SQL. The ordinal is
/// extracted from the statement itself and matched against the session's
/// expected name, so a stale or foreign savepoint never moves the level.
pub fn apply_tracking(state: &mut SessionState, connection_id: ConnectionId, sql: &str) {
    let action = match tracking_action(sql) {
        Some(action) => action,
        None => return,
    };

    match action {
        TrackingAction::Create(level) => {
            if level == state.savepoint_level() + 1 {
                state.set_savepoint_level(level);
                state.claim(connection_id);
                state.increment_user_tx(connection_id);
            }
        }
        TrackingAction::Release(level) => {
            if level == state.savepoint_level() && level > 0 {
                state.set_savepoint_level(level - 1);
                state.decrement_user_tx(connection_id);
            }
        }
    }
}

/// Recognises the statements that move the savepoint level:
/// `SAVEPOINT pgtest_v_N`, `RELEASE [SAVEPOINT] pgtest_v_N`, and the
/// compound `ROLLBACK TO [SAVEPOINT] pgtest_v_N; RELEASE ...` this
/// interpreter emits. A bare `ROLLBACK TO` leaves the savepoint in place
/// on the backend and therefore does not track.
fn tracking_action(sql: &str) -> Option<TrackingAction> {
    let statements: Vec<Vec<String>> = sql
        .split(';')
        .map(|stmt| {
            stmt.split_whitespace()
                .map(|t| t.to_ascii_lowercase())
                .collect()
        })
        .filter(|tokens: &Vec<String>| !tokens.is_empty())
        .collect();

    let first: Vec<&str> = statements.first()?.iter().map(|s| s.as_str()).collect();

    match first.as_slice() {
        ["savepoint", name] => Some(TrackingAction::Create(savepoint_ordinal(name)?)),
        ["release", "savepoint", name] | ["release", name] => {
            Some(TrackingAction::Release(savepoint_ordinal(name)?))
        }
        ["rollback", "to", "savepoint", name] | ["rollback", "to", name] => {
            let level = savepoint_ordinal(name)?;

            // Only the compound rollback-and-release form dissolves the
            // savepoint; match the second statement against the same name
            let second: Vec<&str> = statements.get(1)?.iter().map(|s| s.as_str()).collect();

            match second.as_slice() {
                ["release", "savepoint", released] | ["release", released]
                    if savepoint_ordinal(released) == Some(level) =>
                {
                    Some(TrackingAction::Release(level))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn savepoint_ordinal(name: &str) -> Option<u32> {
    name.strip_prefix(SAVEPOINT_PREFIX)?.parse().ok()
}

/// Replies for statements the proxy answers without backend work
#[derive(Debug, Clone, PartialEq)]
pub enum SyntheticReply {
    Command(String),
    Rows {
        fields: Vec<FieldDescription>,
        rows: Vec<Vec<Option<String>>>,
        tag: String,
    },
}

/// Runs the `pgtest` control sub-language against the session registry.
///
/// Callers must not hold any session lock: the commands lock sessions
/// themselves, including the caller's own.
pub struct CommandInterpreter {
    registry: Arc<SessionRegistry>,
}

impl CommandInterpreter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub async fn run_control(
        &self,
        cmd: &ControlCommand,
        session: &Arc<Session>,
    ) -> Result<SyntheticReply> {
        match cmd.verb {
            // The session was created when the connection arrived; nothing
            // left to do beyond acknowledging
            ControlVerb::Begin => Ok(SyntheticReply::Command("PGTEST".into())),
            ControlVerb::Rollback => {
                let target = match cmd.arg.as_deref() {
                    None => Arc::clone(session),
                    Some(test_id) => match self.registry.get(test_id) {
                        Some(target) => target,
                        None => bail!("No session exists for test id \"{}\"", test_id),
                    },
                };

                let mut state = target.state().lock().await;
                state.backend_mut()?.start_new_tx().await?;
                // The fresh outer transaction has no savepoints and its
                // history describes state that no longer exists
                state.reset_user_transactions();
                state.clear_history();

                Ok(SyntheticReply::Command("PGTEST".into()))
            }
            ControlVerb::Status => {
                let row = Self::status_row(session).await;

                Ok(SyntheticReply::Rows {
                    fields: Self::status_fields(),
                    rows: vec![row],
                    tag: "SELECT 1".into(),
                })
            }
            ControlVerb::List => {
                let sessions = self.registry.snapshot();
                let mut rows = Vec::with_capacity(sessions.len());

                for session in sessions.iter() {
                    rows.push(Self::status_row(session).await);
                }

                let tag = format!("SELECT {}", rows.len());

                Ok(SyntheticReply::Rows {
                    fields: Self::status_fields(),
                    rows,
                    tag,
                })
            }
            ControlVerb::Cleanup => {
                let count = self.registry.cleanup_expired().await;

                Ok(SyntheticReply::Rows {
                    fields: vec![FieldDescription::int8("cleaned_up")],
                    rows: vec![vec![Some(count.to_string())]],
                    tag: "SELECT 1".into(),
                })
            }
        }
    }

    fn status_fields() -> Vec<FieldDescription> {
        vec![
            FieldDescription::text("test_id"),
            FieldDescription::bool("active"),
            FieldDescription::int4("level"),
            FieldDescription::text("created_at"),
        ]
    }

    async fn status_row(session: &Arc<Session>) -> Vec<Option<String>> {
        let state = session.state().lock().await;

        vec![
            Some(session.test_id().to_string()),
            Some(if state.outer_tx_active() { "t" } else { "f" }.to_string()),
            Some(state.savepoint_level().to_string()),
            Some(session.created_at().to_rfc3339()),
        ]
    }
}
