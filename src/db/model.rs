//! Row models returned by the repository.
//!
//! Keep these structs focused on the data returned by queries. Pipeline logic
//! lives in the stage modules.

use chrono::{DateTime, Utc};

use crate::model::JobKind;

/// Fetch state of one block. `children_json` is untrusted while `is_busy`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub external_id: String,
    pub is_busy: bool,
    pub edited_at: DateTime<Utc>,
    pub children_json: String,
    pub sync_token: i64,
}

/// Mirrored page as stored for the serving layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRecord {
    pub id: i64,
    pub external_id: String,
    pub title: String,
    pub content_type: String,
    pub edited_at: DateTime<Utc>,
    pub composed_json: String,
    pub sync_token: i64,
}

/// A job claimed by a worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: i64,
    pub kind: String,
    pub payload: String,
    pub attempt: i32,
    pub max_attempts: i32,
}

impl ClaimedJob {
    pub fn job_kind(&self) -> Option<JobKind> {
        JobKind::parse_kind(&self.kind)
    }
}

/// Outcome counters recorded on a reconciliation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleCounts {
    pub created: i64,
    pub updated: i64,
    pub deleted: i64,
    pub skipped: i64,
}
