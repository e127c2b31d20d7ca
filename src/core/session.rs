//! Session records tracked per connector.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A live charging session on one connector.
#[derive(Debug, Clone)]
pub struct Session {
    pub transaction_id: i64,
    pub id_tag: String,
    pub meter_start: i64,
    pub start_time: DateTime<Utc>,
    pub vid: Option<String>,
}

/// A finished charging session, appended to `CompletedSessions`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedSession {
    pub connector_id: u32,
    pub transaction_id: i64,
    pub id_tag: String,
    pub meter_start: i64,
    pub meter_stop: i64,
    pub energy: i64,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    pub duration_secs: f64,
}

/// Operator-supplied metadata to attach to a session once `StartTransaction`
/// arrives.
#[derive(Debug, Clone)]
pub struct PendingStartInfo {
    pub id_tag: String,
    pub vid: Option<String>,
}
