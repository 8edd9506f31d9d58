//! Completion polling: decides whether a page's block subtree has fully
//! resolved for the current cycle before it is materialized.

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::db::Pool;
use crate::error::PipelineError;
use crate::materializer;
use crate::model::{AggregateJob, CheckCompletionJob};
use crate::pipeline::Pipeline;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    Complete,
    Incomplete { block: String, reason: String },
}

/// The subtree is complete when no record is busy, none is missing and none
/// was written by a cycle older than `sync_token`.
#[instrument(skip(pool))]
pub async fn check_completion(
    pool: &Pool,
    root_id: &str,
    sync_token: i64,
) -> Result<CompletionStatus> {
    let subtree = materializer::load_subtree(pool, root_id).await?;
    let defects = subtree.defects(sync_token);

    let status = if let Some(block) = defects.missing.first() {
        CompletionStatus::Incomplete {
            block: block.clone(),
            reason: format!("{} block(s) not fetched yet", defects.missing.len()),
        }
    } else if let Some(block) = defects.busy.first() {
        CompletionStatus::Incomplete {
            block: block.clone(),
            reason: format!("{} block(s) still busy", defects.busy.len()),
        }
    } else if let Some(block) = defects.stale.first() {
        CompletionStatus::Incomplete {
            block: block.clone(),
            reason: format!("{} block(s) from an older cycle", defects.stale.len()),
        }
    } else {
        CompletionStatus::Complete
    };
    Ok(status)
}

fn aggregate_job(job: &CheckCompletionJob, forced: bool) -> AggregateJob {
    AggregateJob {
        external_id: job.block_id.clone(),
        sync_token: job.sync_token,
        forced,
        page: job.page.clone(),
    }
}

#[instrument(skip_all, fields(root = %job.block_id, sync_token = job.sync_token))]
pub async fn handle_check_completion(p: &Pipeline, job: &CheckCompletionJob) -> Result<()> {
    match check_completion(&p.pool, &job.block_id, job.sync_token).await? {
        CompletionStatus::Complete => {
            p.enqueue(&p.pool, &aggregate_job(job, false), 0).await?;
            debug!("subtree complete; aggregate scheduled");
            Ok(())
        }
        CompletionStatus::Incomplete { block, reason } => Err(PipelineError::IncompleteSubtree {
            root: job.block_id.clone(),
            block,
            reason,
        }
        .into()),
    }
}

/// Called once the check has used up its attempts: materialize whatever is
/// there rather than leave the page stale.
#[instrument(skip_all, fields(root = %job.block_id, sync_token = job.sync_token))]
pub async fn on_exhausted(p: &Pipeline, job: &CheckCompletionJob) -> Result<()> {
    warn!("subtree never completed; forcing aggregate");
    p.enqueue(&p.pool, &aggregate_job(job, true), 0).await?;
    Ok(())
}
