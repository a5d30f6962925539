use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use chrono::{DateTime, Utc};
use pgrollback_core::{
    err::{bail, Result},
    web::{QueryInfo, SessionInfo},
};
use tokio::{sync::Mutex, task::JoinHandle};

use crate::{backend::BackendConnection, interpret::ControlCommand};

/// Bounded length of each session's query history
pub const HISTORY_LIMIT: usize = 100;

/// Identifies one client connection for the lifetime of its TCP stream.
///
/// Minted from a process-wide counter so identity is reproducible in tests
/// and never tied to memory layout.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// One executed query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRecord {
    pub sql: String,
    pub executed_at: DateTime<Utc>,
    pub duration: Duration,
}

/// How a prepared statement will be executed when a portal over it runs
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedKind {
    /// A `pgtest` control command, dispatched outside the session lock
    Control(ControlCommand),
    /// Transaction control, re-interpreted against the session state at
    /// execute time
    Tcl(String),
    /// A data statement executed under a guard savepoint
    Forward(String),
}

/// A statement prepared via the extended query protocol
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStatement {
    pub kind: PreparedKind,
    /// Column names to synthesise a row description for, when the statement
    /// is `INSERT/UPDATE/DELETE ... RETURNING <named columns>`
    pub returning: Option<Vec<String>>,
    pub param_count: usize,
}

/// A portal bound over a prepared statement
#[derive(Debug, Clone, PartialEq)]
pub struct Portal {
    pub statement: String,
    pub params: Vec<Option<Vec<u8>>>,
    pub param_formats: Vec<i16>,
}

/// The mutable interior of a session.
///
/// One mutex serialises metadata mutation and use of the backend
/// connection; two clients sharing a session never interleave frames on
/// the backend socket.
#[derive(Debug)]
pub struct SessionState {
    backend: Option<BackendConnection>,
    savepoint_level: u32,
    owner: Option<ConnectionId>,
    user_tx_counts: HashMap<ConnectionId, u32>,
    pub prepared_statements: HashMap<String, PreparedStatement>,
    pub portals: HashMap<String, Portal>,
    query_history: VecDeque<QueryRecord>,
    last_activity: DateTime<Utc>,
    pub(crate) keepalive: Option<JoinHandle<()>>,
}

impl SessionState {
    fn new(backend: BackendConnection) -> Self {
        Self {
            backend: Some(backend),
            savepoint_level: 0,
            owner: None,
            user_tx_counts: HashMap::new(),
            prepared_statements: HashMap::new(),
            portals: HashMap::new(),
            query_history: VecDeque::new(),
            last_activity: Utc::now(),
            keepalive: None,
        }
    }

    /// A detached state with no backend, for unit tests of the
    /// interpreter and tracking rules
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            backend: None,
            savepoint_level: 0,
            owner: None,
            user_tx_counts: HashMap::new(),
            prepared_statements: HashMap::new(),
            portals: HashMap::new(),
            query_history: VecDeque::new(),
            last_activity: Utc::now(),
            keepalive: None,
        }
    }

    /// The backend connection, absent only mid-reset
    pub fn backend(&self) -> Result<&BackendConnection> {
        match self.backend.as_ref() {
            Some(con) => Ok(con),
            None => bail!("Session is resetting"),
        }
    }

    pub fn backend_mut(&mut self) -> Result<&mut BackendConnection> {
        match self.backend.as_mut() {
            Some(con) => Ok(con),
            None => bail!("Session is resetting"),
        }
    }

    pub fn backend_opt_mut(&mut self) -> Option<&mut BackendConnection> {
        self.backend.as_mut()
    }

    pub fn take_backend(&mut self) -> Option<BackendConnection> {
        self.backend.take()
    }

    pub fn savepoint_level(&self) -> u32 {
        self.savepoint_level
    }

    pub fn set_savepoint_level(&mut self, level: u32) {
        self.savepoint_level = level;
    }

    pub fn owner(&self) -> Option<ConnectionId> {
        self.owner
    }

    /// Claims the session for the supplied connection if unclaimed
    pub fn claim(&mut self, connection_id: ConnectionId) {
        self.owner.get_or_insert(connection_id);
    }

    pub fn user_tx_count(&self, connection_id: ConnectionId) -> u32 {
        self.user_tx_counts
            .get(&connection_id)
            .copied()
            .unwrap_or(0)
    }

    /// Whether any client currently holds an open user transaction
    pub fn any_user_tx_open(&self) -> bool {
        self.user_tx_counts.values().any(|c| *c > 0)
    }

    pub fn increment_user_tx(&mut self, connection_id: ConnectionId) {
        *self.user_tx_counts.entry(connection_id).or_insert(0) += 1;
    }

    pub fn decrement_user_tx(&mut self, connection_id: ConnectionId) {
        if let Some(count) = self.user_tx_counts.get_mut(&connection_id) {
            *count = count.saturating_sub(1);

            if *count == 0 {
                self.user_tx_counts.remove(&connection_id);

                // Release the claim once the owner has no transactions left
                if self.owner == Some(connection_id) {
                    self.owner = None;
                }
            }
        }
    }

    /// Forgets every user transaction. Used when the outer transaction is
    /// replaced wholesale and its savepoints no longer exist.
    pub fn reset_user_transactions(&mut self) {
        self.savepoint_level = 0;
        self.owner = None;
        self.user_tx_counts.clear();
    }

    /// Appends a query to the bounded history, dropping the oldest entry
    /// once the limit is reached
    pub fn record_query(&mut self, sql: impl Into<String>, duration: Duration) {
        if self.query_history.len() >= HISTORY_LIMIT {
            self.query_history.pop_front();
        }

        self.query_history.push_back(QueryRecord {
            sql: sql.into(),
            executed_at: Utc::now(),
            duration,
        });
    }

    pub fn query_history(&self) -> &VecDeque<QueryRecord> {
        &self.query_history
    }

    pub fn clear_history(&mut self) {
        self.query_history.clear();
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// Whether the outer transaction is currently open on the backend
    pub fn outer_tx_active(&self) -> bool {
        self.backend
            .as_ref()
            .map(|b| b.tx_open() && !b.broken())
            .unwrap_or(false)
    }
}

/// A test session: one backend connection, its outer transaction, and the
/// protocol catalogues shared by every client connection using the same
/// test identifier.
#[derive(Debug)]
pub struct Session {
    test_id: String,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(test_id: impl Into<String>, backend: BackendConnection) -> Self {
        Self {
            test_id: test_id.into(),
            created_at: Utc::now(),
            state: Mutex::new(SessionState::new(backend)),
        }
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> &Mutex<SessionState> {
        &self.state
    }

    /// Whether the session's backend connection is still usable
    pub async fn healthy(&self) -> bool {
        let state = self.state.lock().await;

        state
            .backend
            .as_ref()
            .map(|b| !b.broken())
            .unwrap_or(false)
    }

    pub async fn touch(&self) {
        self.state.lock().await.touch();
    }

    pub async fn last_activity(&self) -> DateTime<Utc> {
        self.state.lock().await.last_activity()
    }

    /// The transaction status byte reported to the supplied client on
    /// ReadyForQuery: 'T' while it holds an open user transaction
    pub async fn status_byte(&self, connection_id: ConnectionId) -> u8 {
        if self.state.lock().await.user_tx_count(connection_id) > 0 {
            b'T'
        } else {
            b'I'
        }
    }

    /// A read-only view of the session for the dashboard
    pub async fn info(&self) -> SessionInfo {
        let state = self.state.lock().await;

        let history: Vec<QueryInfo> = state
            .query_history
            .iter()
            .map(|q| QueryInfo {
                sql: q.sql.clone(),
                executed_at: q.executed_at.to_rfc3339(),
                duration_ms: q.duration.as_millis() as u64,
            })
            .collect();

        SessionInfo {
            test_id: self.test_id.clone(),
            active: state.any_user_tx_open(),
            savepoint_level: state.savepoint_level,
            created_at: self.created_at.to_rfc3339(),
            last_activity: state.last_activity.to_rfc3339(),
            last_query: history.last().cloned(),
            history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_connection_ids_are_unique() {
        let a = next_connection_id();
        let b = next_connection_id();

        assert_ne!(a, b);
    }

    fn mock_state() -> SessionState {
        SessionState::detached()
    }

    #[test]
    fn test_session_history_is_bounded_and_oldest_first() {
        let mut state = mock_state();

        for i in 0..(HISTORY_LIMIT + 10) {
            state.record_query(format!("SELECT {}", i), Duration::from_millis(1));
        }

        assert_eq!(state.query_history().len(), HISTORY_LIMIT);
        assert_eq!(state.query_history().front().unwrap().sql, "SELECT 10");
        assert_eq!(
            state.query_history().back().unwrap().sql,
            format!("SELECT {}", HISTORY_LIMIT + 9)
        );
    }

    #[test]
    fn test_session_user_tx_counting() {
        let mut state = mock_state();

        assert_eq!(state.user_tx_count(1), 0);

        state.claim(1);
        state.increment_user_tx(1);
        state.increment_user_tx(1);
        assert_eq!(state.user_tx_count(1), 2);
        assert_eq!(state.owner(), Some(1));
        assert!(state.any_user_tx_open());

        // A second client cannot steal the claim
        state.claim(2);
        assert_eq!(state.owner(), Some(1));

        state.decrement_user_tx(1);
        assert_eq!(state.user_tx_count(1), 1);
        assert_eq!(state.owner(), Some(1));

        state.decrement_user_tx(1);
        assert_eq!(state.user_tx_count(1), 0);
        assert_eq!(state.owner(), None);
        assert!(!state.any_user_tx_open());

        // Decrement below zero is a no-op
        state.decrement_user_tx(1);
        assert_eq!(state.user_tx_count(1), 0);
    }

    #[test]
    fn test_session_reset_user_transactions() {
        let mut state = mock_state();
        state.claim(1);
        state.increment_user_tx(1);
        state.set_savepoint_level(3);

        state.reset_user_transactions();

        assert_eq!(state.savepoint_level(), 0);
        assert_eq!(state.owner(), None);
        assert_eq!(state.user_tx_count(1), 0);
        assert!(!state.any_user_tx_open());
    }

    #[test]
    fn test_session_backend_absent_while_resetting() {
        let mut state = mock_state();

        state.backend().unwrap_err();
        state.backend_mut().unwrap_err();
        assert!(!state.outer_tx_active());
    }
}
