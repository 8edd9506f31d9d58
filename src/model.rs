use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Page metadata as listed by the remote source. Ephemeral, rebuilt every cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemotePage {
    pub external_id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub page_type: String,
    pub edited_at: DateTime<Utc>,
}

/// One node of a page's content tree.
///
/// Field names follow the remote wire format so API payloads deserialize
/// directly. Everything not modelled explicitly (the type-specific body,
/// `archived`, `parent`, ...) is kept in `payload`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteBlock {
    pub id: String,
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub has_children: bool,
    #[serde(rename = "last_edited_time")]
    pub edited_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<RemoteBlock>>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMetadata {
    pub id: String,
    pub edited_at: DateTime<Utc>,
    pub has_children: bool,
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing<T> {
    pub results: Vec<T>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobKind {
    CreateContent,
    UpdateContent,
    DeleteContent,
    FetchBlock,
    CheckCompletion,
    Aggregate,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::CreateContent => "create_content",
            JobKind::UpdateContent => "update_content",
            JobKind::DeleteContent => "delete_content",
            JobKind::FetchBlock => "fetch_block",
            JobKind::CheckCompletion => "check_completion",
            JobKind::Aggregate => "aggregate",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "create_content" => Some(JobKind::CreateContent),
            "update_content" => Some(JobKind::UpdateContent),
            "delete_content" => Some(JobKind::DeleteContent),
            "fetch_block" => Some(JobKind::FetchBlock),
            "check_completion" => Some(JobKind::CheckCompletion),
            "aggregate" => Some(JobKind::Aggregate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base_secs * 2^attempt`
    Exponential { base_secs: i64 },
    Fixed { secs: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt `attempt` (0-based).
    /// A non-positive `cap_secs` disables the cap.
    pub fn delay_secs(&self, attempt: i32, cap_secs: i64) -> i64 {
        let secs = match self.backoff {
            Backoff::Exponential { base_secs } => {
                base_secs.saturating_mul(1_i64 << attempt.clamp(0, 20))
            }
            Backoff::Fixed { secs } => secs,
        };
        if cap_secs > 0 {
            secs.min(cap_secs)
        } else {
            secs
        }
    }

    /// Whether a job that just failed attempt `attempt` (0-based) may run again.
    pub fn allows_retry(&self, attempt: i32) -> bool {
        attempt + 1 < self.max_attempts
    }
}

/// Page fields carried through the pipeline until the Materializer writes them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageMeta {
    pub title: String,
    #[serde(rename = "type")]
    pub page_type: String,
    pub edited_at: DateTime<Utc>,
}

impl From<&RemotePage> for PageMeta {
    fn from(page: &RemotePage) -> Self {
        Self {
            title: page.title.clone(),
            page_type: page.page_type.clone(),
            edited_at: page.edited_at,
        }
    }
}

/// Typed job payloads know which queue kind they belong to.
pub trait JobPayload: Serialize {
    const KIND: JobKind;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateContentIntent {
    pub external_id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub page_type: String,
    pub edited_at: DateTime<Utc>,
    pub sync_token: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateContentIntent {
    pub internal_id: i64,
    pub external_id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub page_type: String,
    pub edited_at: DateTime<Utc>,
    /// The local composed tree at diff time; replaced once the refetch lands.
    pub composed_placeholder: String,
    pub sync_token: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteContentIntent {
    pub external_id: String,
    pub sync_token: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchBlockJob {
    pub block_id: String,
    pub root_id: String,
    pub depth: u32,
    pub sync_token: i64,
    /// Present on the root job only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<PageMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckCompletionJob {
    pub block_id: String,
    pub sync_token: i64,
    pub page: PageMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregateJob {
    pub external_id: String,
    pub sync_token: i64,
    /// Set when the completion poller gave up waiting on the subtree.
    #[serde(default)]
    pub forced: bool,
    pub page: PageMeta,
}

impl JobPayload for CreateContentIntent {
    const KIND: JobKind = JobKind::CreateContent;
}

impl JobPayload for UpdateContentIntent {
    const KIND: JobKind = JobKind::UpdateContent;
}

impl JobPayload for DeleteContentIntent {
    const KIND: JobKind = JobKind::DeleteContent;
}

impl JobPayload for FetchBlockJob {
    const KIND: JobKind = JobKind::FetchBlock;
}

impl JobPayload for CheckCompletionJob {
    const KIND: JobKind = JobKind::CheckCompletion;
}

impl JobPayload for AggregateJob {
    const KIND: JobKind = JobKind::Aggregate;
}
