use thiserror::Error;

/// Failure kinds the queue worker tells apart. Everything else travels as a
/// plain `anyhow::Error` with context.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("remote request failed: {0}")]
    RemoteTransient(String),
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: String },
    #[error("subtree of {root} incomplete at {block}: {reason}")]
    IncompleteSubtree {
        root: String,
        block: String,
        reason: String,
    },
    #[error("subtree of {root} has {stale} block(s) older than sync token {sync_token}")]
    StaleSubtree {
        root: String,
        stale: usize,
        sync_token: i64,
    },
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl PipelineError {
    /// Expected while fan-out is still running; not a real fault.
    pub fn is_expected_retry(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::IncompleteSubtree { .. }) | Some(PipelineError::StaleSubtree { .. })
        )
    }

    /// Malformed payloads will never succeed, so retrying them is pointless.
    pub fn is_permanent(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidPayload { .. })
        )
    }
}
