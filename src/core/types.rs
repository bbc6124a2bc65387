use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::dispatch::tracker::TaskRecord;

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// JSON error envelope — the control API never surfaces a failure any other
/// way.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub enabled: bool,
    pub running: bool,
}

/// Run-state snapshot served by `/api/status`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime: String,
    pub running_sources: Vec<String>,
    pub sources: Vec<SourceStatus>,
    pub tasks_tracked: usize,
    pub blacklisted: usize,
    pub posted_total: Option<u64>,
}

/// Tracker contents served by `/api/task/list`, keyed by task id.
#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub message: BTreeMap<String, TaskRecord>,
}
