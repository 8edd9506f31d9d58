//! Fetch orchestration: turns content intents into block fetches and expands
//! each fetched block one level at a time through the job queue.

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::db;
use crate::fetcher::{self, FetchedChildren};
use crate::materializer;
use crate::model::{
    CheckCompletionJob, CreateContentIntent, DeleteContentIntent, FetchBlockJob, PageMeta,
    UpdateContentIntent,
};
use crate::pipeline::Pipeline;

fn root_fetch(external_id: &str, sync_token: i64, page: PageMeta) -> FetchBlockJob {
    FetchBlockJob {
        block_id: external_id.to_string(),
        root_id: external_id.to_string(),
        depth: 0,
        sync_token,
        page: Some(page),
    }
}

/// New remote page: placeholder row first so readers always find it, then
/// the root fetch.
#[instrument(skip_all, fields(page = %intent.external_id, sync_token = intent.sync_token))]
pub async fn handle_create(p: &Pipeline, intent: &CreateContentIntent) -> Result<()> {
    let page = PageMeta {
        title: intent.title.clone(),
        page_type: intent.page_type.clone(),
        edited_at: intent.edited_at,
    };

    let mut tx = p.pool.begin().await?;
    let id =
        db::insert_placeholder_content(&mut *tx, &intent.external_id, &page, intent.sync_token)
            .await?;
    p.enqueue(
        &mut *tx,
        &root_fetch(&intent.external_id, intent.sync_token, page),
        0,
    )
    .await?;
    tx.commit().await?;

    info!(content_id = id, "content placeholder created");
    Ok(())
}

#[instrument(skip_all, fields(page = %intent.external_id, sync_token = intent.sync_token))]
pub async fn handle_update(p: &Pipeline, intent: &UpdateContentIntent) -> Result<()> {
    let page = PageMeta {
        title: intent.title.clone(),
        page_type: intent.page_type.clone(),
        edited_at: intent.edited_at,
    };

    let mut tx = p.pool.begin().await?;
    let stamped =
        db::stamp_content_token(&mut *tx, &intent.external_id, intent.sync_token).await?;
    if !stamped {
        warn!(
            internal_id = intent.internal_id,
            "content vanished before refetch; recreating placeholder"
        );
        db::insert_placeholder_content(&mut *tx, &intent.external_id, &page, intent.sync_token)
            .await?;
    }
    p.enqueue(
        &mut *tx,
        &root_fetch(&intent.external_id, intent.sync_token, page),
        0,
    )
    .await?;
    tx.commit().await?;

    debug!("content refetch scheduled");
    Ok(())
}

#[instrument(skip_all, fields(page = %intent.external_id, sync_token = intent.sync_token))]
pub async fn handle_delete(p: &Pipeline, intent: &DeleteContentIntent) -> Result<()> {
    materializer::delete_content(p, &intent.external_id, intent.sync_token).await?;
    Ok(())
}

/// Split the discovered parents into those to expand and those to stub out.
pub fn apply_caps(
    parent_ids: &[String],
    depth: u32,
    max_depth: u32,
    max_fanout: usize,
) -> (Vec<String>, Vec<String>) {
    if depth.saturating_add(1) > max_depth {
        return (Vec::new(), parent_ids.to_vec());
    }
    let cut = parent_ids.len().min(max_fanout);
    (parent_ids[..cut].to_vec(), parent_ids[cut..].to_vec())
}

/// Fetch one block's immediate children, persist them, and fan out one job
/// per child that has children of its own. Jobs whose page was deleted or
/// claimed by a newer cycle do nothing.
#[instrument(skip_all, fields(block = %job.block_id, root = %job.root_id, depth = job.depth, sync_token = job.sync_token))]
pub async fn handle_fetch_block(p: &Pipeline, job: &FetchBlockJob) -> Result<()> {
    match db::get_content(&p.pool, &job.root_id).await? {
        None => {
            debug!("page deleted; fetch dropped");
            return Ok(());
        }
        Some(content) if content.sync_token > job.sync_token => {
            debug!(current_token = content.sync_token, "fetch superseded by newer cycle");
            return Ok(());
        }
        Some(_) => {}
    }

    let meta = p.source().get_block_metadata(&job.block_id).await?;
    let claimed = db::upsert_block(
        &p.pool,
        &job.block_id,
        true,
        meta.edited_at,
        "[]",
        job.sync_token,
    )
    .await?;
    if !claimed {
        debug!("block already written by a newer cycle; fetch dropped");
        return Ok(());
    }

    let FetchedChildren {
        children,
        parent_block_ids,
    } = fetcher::fetch_children(p.source(), &job.block_id).await?;
    let children_json = serde_json::to_string(&children)?;

    let (expand, truncated) = apply_caps(
        &parent_block_ids,
        job.depth,
        p.policy.max_depth,
        p.policy.max_fanout,
    );
    if !truncated.is_empty() {
        warn!(
            expanded = expand.len(),
            truncated = truncated.len(),
            "fan-out capped; truncated blocks stored without children"
        );
    }

    let mut tx = p.pool.begin().await?;
    let written = db::upsert_block(
        &mut *tx,
        &job.block_id,
        false,
        meta.edited_at,
        &children_json,
        job.sync_token,
    )
    .await?;
    if !written {
        tx.rollback().await?;
        debug!("block overtaken by a newer cycle; fan-out dropped");
        return Ok(());
    }
    for child_id in &expand {
        let child = FetchBlockJob {
            block_id: child_id.clone(),
            root_id: job.root_id.clone(),
            depth: job.depth + 1,
            sync_token: job.sync_token,
            page: None,
        };
        p.enqueue(&mut *tx, &child, 0).await?;
    }
    for stub_id in &truncated {
        let edited_at = children
            .iter()
            .find(|c| &c.id == stub_id)
            .map(|c| c.edited_at)
            .unwrap_or(meta.edited_at);
        db::upsert_block(&mut *tx, stub_id, false, edited_at, "[]", job.sync_token).await?;
    }

    if job.depth == 0 {
        match &job.page {
            Some(page) => {
                let check = CheckCompletionJob {
                    block_id: job.root_id.clone(),
                    sync_token: job.sync_token,
                    page: page.clone(),
                };
                p.enqueue(&mut *tx, &check, p.policy.check_initial_delay_seconds)
                    .await?;
            }
            None => warn!("root fetch carried no page metadata; completion check skipped"),
        }
    }
    tx.commit().await?;

    debug!(
        children = children.len(),
        fanned_out = expand.len(),
        "block fetched"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("b{}", i)).collect()
    }

    #[test]
    fn caps_limit_fanout() {
        let (expand, stub) = apply_caps(&ids(5), 0, 32, 3);
        assert_eq!(expand, vec!["b0", "b1", "b2"]);
        assert_eq!(stub, vec!["b3", "b4"]);
    }

    #[test]
    fn caps_stop_at_depth() {
        let (expand, stub) = apply_caps(&ids(2), 3, 3, 100);
        assert!(expand.is_empty());
        assert_eq!(stub.len(), 2);

        let (expand, stub) = apply_caps(&ids(2), 2, 3, 100);
        assert_eq!(expand.len(), 2);
        assert!(stub.is_empty());
    }
}
