use serde::{Deserialize, Serialize};

/// A read-only view of one test session, as exposed to the dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub test_id: String,
    /// Whether any client currently holds an open user transaction
    pub active: bool,
    pub savepoint_level: u32,
    pub created_at: String,
    pub last_activity: String,
    pub last_query: Option<QueryInfo>,
    pub history: Vec<QueryInfo>,
}

/// One executed query in a session's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryInfo {
    pub sql: String,
    pub executed_at: String,
    pub duration_ms: u64,
}
