use anyhow::Result;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::db::{self, ClaimedJob};
use crate::error::PipelineError;
use crate::materializer;
use crate::model::{CheckCompletionJob, JobKind, RetryPolicy};
use crate::orchestrator;
use crate::pipeline::Pipeline;
use crate::poller;

fn decode<T: DeserializeOwned>(kind: JobKind, payload: &str) -> Result<T> {
    serde_json::from_str(payload).map_err(|source| {
        PipelineError::InvalidPayload {
            kind: kind.as_str(),
            source,
        }
        .into()
    })
}

async fn dispatch(p: &Pipeline, kind: JobKind, payload: &str) -> Result<()> {
    match kind {
        JobKind::CreateContent => orchestrator::handle_create(p, &decode(kind, payload)?).await,
        JobKind::UpdateContent => orchestrator::handle_update(p, &decode(kind, payload)?).await,
        JobKind::DeleteContent => orchestrator::handle_delete(p, &decode(kind, payload)?).await,
        JobKind::FetchBlock => orchestrator::handle_fetch_block(p, &decode(kind, payload)?).await,
        JobKind::CheckCompletion => {
            poller::handle_check_completion(p, &decode(kind, payload)?).await
        }
        JobKind::Aggregate => materializer::aggregate(p, &decode(kind, payload)?)
            .await
            .map(|_| ()),
    }
}

/// Claim and run one due job. Returns false when nothing was due.
///
/// Failures while recording the job's outcome hand the claim back instead of
/// leaving the job `running`.
#[instrument(skip_all, fields(worker = %worker))]
pub async fn process_next_job(p: &Pipeline, worker: &str) -> Result<bool> {
    let Some(job) = db::claim_next_job(&p.pool, worker).await? else {
        return Ok(false);
    };

    if let Err(err) = settle(p, worker, &job).await {
        let delay = job
            .job_kind()
            .map(|kind| {
                p.policy
                    .retry_policy(kind)
                    .delay_secs(job.attempt, p.policy.max_backoff_seconds)
            })
            .unwrap_or(0);
        error!(
            ?err,
            id = job.id,
            kind = job.kind.as_str(),
            delay,
            "job bookkeeping failed; releasing claim"
        );
        if let Err(err) = db::release_job(&p.pool, job.id, worker, delay).await {
            error!(?err, id = job.id, "failed to release job claim");
        }
    }
    Ok(true)
}

async fn settle(p: &Pipeline, worker: &str, job: &ClaimedJob) -> Result<()> {
    let ClaimedJob {
        id,
        attempt,
        max_attempts,
        ..
    } = *job;
    let kind = job.kind.as_str();
    let payload = job.payload.as_str();

    let Some(kind_enum) = job.job_kind() else {
        error!(id, kind, "unknown job kind; abandoning");
        return db::abandon_job(&p.pool, id, worker, "unknown job kind").await;
    };

    let err = match dispatch(p, kind_enum, payload).await {
        Ok(()) => {
            db::complete_job(&p.pool, id, worker).await?;
            debug!(id, kind, attempt, "job succeeded");
            return Ok(());
        }
        Err(err) => err,
    };
    let message = format!("{:#}", err);

    if PipelineError::is_permanent(&err) {
        error!(?err, id, kind, "job payload unusable; abandoning");
        return db::abandon_job(&p.pool, id, worker, &message).await;
    }

    let policy = RetryPolicy {
        max_attempts,
        ..p.policy.retry_policy(kind_enum)
    };
    if policy.allows_retry(attempt) {
        let delay = policy.delay_secs(attempt, p.policy.max_backoff_seconds);
        if PipelineError::is_expected_retry(&err) {
            debug!(id, kind, attempt, delay, error = %message, "job deferred");
        } else {
            warn!(?err, id, kind, attempt, delay, "job failed; backoff");
        }
        return db::retry_job(&p.pool, id, worker, delay, &message).await;
    }

    if kind_enum == JobKind::CheckCompletion {
        let check: CheckCompletionJob = decode(kind_enum, payload)?;
        poller::on_exhausted(p, &check).await?;
        return db::complete_job(&p.pool, id, worker).await;
    }

    error!(?err, id, kind, attempt, "job exhausted its attempts; abandoning");
    db::abandon_job(&p.pool, id, worker, &message).await
}

/// Process jobs until the task is dropped, sleeping when the queue is idle.
pub async fn run_worker(p: Pipeline, worker: String, poll_interval: Duration) {
    info!(%worker, "queue worker started");
    loop {
        match process_next_job(&p, &worker).await {
            Ok(true) => {}
            Ok(false) => tokio::time::sleep(poll_interval).await,
            Err(err) => {
                error!(?err, %worker, "queue worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
