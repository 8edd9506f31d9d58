//! Composes a page's resolved block subtree into one nested value and writes
//! it to the content store; also owns the page deletion path.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use tracing::{info, instrument, warn};

use crate::db::{self, BlockRecord, Pool};
use crate::error::PipelineError;
use crate::model::{AggregateJob, RemoteBlock};
use crate::pipeline::Pipeline;

/// A stored block with its children already decoded.
#[derive(Debug, Clone)]
pub struct SubtreeNode {
    pub record: BlockRecord,
    pub children: Vec<RemoteBlock>,
}

/// Every block record reachable from a root, plus referenced ids with no row.
#[derive(Debug, Clone, Default)]
pub struct Subtree {
    pub root_id: String,
    pub nodes: HashMap<String, SubtreeNode>,
    pub missing: Vec<String>,
}

/// Reasons a subtree cannot be trusted yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Defects {
    pub busy: Vec<String>,
    pub missing: Vec<String>,
    pub stale: Vec<String>,
}

impl Defects {
    pub fn is_empty(&self) -> bool {
        self.busy.is_empty() && self.missing.is_empty() && self.stale.is_empty()
    }
}

impl Subtree {
    pub fn root(&self) -> Option<&SubtreeNode> {
        self.nodes.get(&self.root_id)
    }

    /// Busy, missing and older-than-`sync_token` blocks, in sorted order.
    pub fn defects(&self, sync_token: i64) -> Defects {
        let mut defects = Defects {
            missing: self.missing.clone(),
            ..Default::default()
        };
        for (id, node) in &self.nodes {
            if node.record.is_busy {
                defects.busy.push(id.clone());
            }
            if node.record.sync_token < sync_token {
                defects.stale.push(id.clone());
            }
        }
        defects.busy.sort();
        defects.missing.sort();
        defects.stale.sort();
        defects
    }
}

/// Walk the block store from `root_id`, following children that report
/// children of their own. Cycles in malformed data are visited once.
#[instrument(skip(pool))]
pub async fn load_subtree(pool: &Pool, root_id: &str) -> Result<Subtree> {
    let mut subtree = Subtree {
        root_id: root_id.to_string(),
        ..Default::default()
    };
    let mut seen: HashSet<String> = HashSet::new();
    let mut stack = vec![root_id.to_string()];

    while let Some(id) = stack.pop() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let Some(record) = db::get_block(pool, &id).await? else {
            subtree.missing.push(id);
            continue;
        };
        let children: Vec<RemoteBlock> = serde_json::from_str(&record.children_json)
            .with_context(|| format!("corrupt children_json for block {}", id))?;
        stack.extend(
            children
                .iter()
                .rev()
                .filter(|c| c.has_children)
                .map(|c| c.id.clone()),
        );
        subtree.nodes.insert(id, SubtreeNode { record, children });
    }

    Ok(subtree)
}

/// The root's nested children and whatever kept the subtree from being whole.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedTree {
    pub blocks: Vec<RemoteBlock>,
    pub defects: Defects,
}

/// Substitute each descendant's children into its parent, producing the
/// nested children of the root. Children whose record is absent stay leaves
/// and are counted as missing rather than failing the composition.
pub fn compose_tree(subtree: &Subtree, sync_token: i64) -> ComposedTree {
    let mut path = HashSet::new();
    ComposedTree {
        blocks: compose_children(&subtree.root_id, subtree, &mut path),
        defects: subtree.defects(sync_token),
    }
}

fn compose_children(id: &str, subtree: &Subtree, path: &mut HashSet<String>) -> Vec<RemoteBlock> {
    let Some(node) = subtree.nodes.get(id) else {
        return Vec::new();
    };
    path.insert(id.to_string());
    let composed = node
        .children
        .iter()
        .cloned()
        .map(|mut child| {
            if child.has_children
                && subtree.nodes.contains_key(&child.id)
                && !path.contains(&child.id)
            {
                child.children = Some(compose_children(&child.id, subtree, path));
            }
            child
        })
        .collect();
    path.remove(id);
    composed
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateOutcome {
    Written {
        content_id: i64,
        top_level_blocks: usize,
        defects: Defects,
    },
    /// A newer cycle owns the page; its own aggregate will write it.
    Superseded { current_token: i64 },
    /// The page was deleted while this lineage was in flight.
    Deleted,
    /// Forced run with no root record: keep the previous body.
    RootMissing,
}

/// `Some` when the page no longer belongs to the lineage of `sync_token`.
async fn ownership(
    p: &Pipeline,
    external_id: &str,
    sync_token: i64,
) -> Result<Option<AggregateOutcome>> {
    match db::get_content(&p.pool, external_id).await? {
        None => {
            info!("page deleted; aggregate dropped");
            Ok(Some(AggregateOutcome::Deleted))
        }
        Some(content) if content.sync_token > sync_token => {
            info!(current_token = content.sync_token, "aggregate superseded by newer cycle");
            Ok(Some(AggregateOutcome::Superseded {
                current_token: content.sync_token,
            }))
        }
        Some(_) => Ok(None),
    }
}

#[instrument(skip_all, fields(page = %job.external_id, sync_token = job.sync_token, forced = job.forced))]
pub async fn aggregate(p: &Pipeline, job: &AggregateJob) -> Result<AggregateOutcome> {
    if let Some(outcome) = ownership(p, &job.external_id, job.sync_token).await? {
        return Ok(outcome);
    }

    let subtree = load_subtree(&p.pool, &job.external_id).await?;
    if subtree.root().is_none() {
        if job.forced {
            warn!("forced aggregate found no root block; keeping previous body");
            return Ok(AggregateOutcome::RootMissing);
        }
        return Err(PipelineError::NotFound {
            what: "root block",
            id: job.external_id.clone(),
        }
        .into());
    }

    let ComposedTree { blocks, defects } = compose_tree(&subtree, job.sync_token);
    if !job.forced && !defects.stale.is_empty() {
        return Err(PipelineError::StaleSubtree {
            root: job.external_id.clone(),
            stale: defects.stale.len(),
            sync_token: job.sync_token,
        }
        .into());
    }
    if !defects.is_empty() {
        warn!(
            busy = defects.busy.len(),
            missing = defects.missing.len(),
            stale = defects.stale.len(),
            "materializing an incomplete subtree"
        );
    }

    let composed_json = serde_json::to_string(&blocks).context("failed to encode composed tree")?;
    let content_id = db::write_composed_content(
        &p.pool,
        &job.external_id,
        &job.page,
        &composed_json,
        job.sync_token,
    )
    .await?;
    let Some(content_id) = content_id else {
        // Lost a race with a delete or a newer cycle after composing.
        return Ok(ownership(p, &job.external_id, job.sync_token)
            .await?
            .unwrap_or(AggregateOutcome::Deleted));
    };

    info!(content_id, blocks = blocks.len(), "content materialized");
    Ok(AggregateOutcome::Written {
        content_id,
        top_level_blocks: blocks.len(),
        defects,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted {
        content_id: Option<i64>,
        memberships_cleared: u64,
        blocks_removed: u64,
    },
    /// A newer cycle re-created the page after this delete was planned.
    Superseded { current_token: i64 },
}

/// Remove a page that disappeared remotely: detach it from collections, drop
/// the content row, then drop its block records. Rows claimed by a cycle
/// newer than `sync_token` are kept.
#[instrument(skip(p))]
pub async fn delete_content(
    p: &Pipeline,
    external_id: &str,
    sync_token: i64,
) -> Result<DeleteOutcome> {
    let subtree = load_subtree(&p.pool, external_id).await?;
    let block_ids: Vec<String> = subtree.nodes.into_keys().collect();

    let mut tx = p.pool.begin().await?;
    if let Some(current_token) = db::content_token_tx(&mut tx, external_id).await? {
        if current_token > sync_token {
            tx.rollback().await?;
            info!(current_token, "delete superseded by newer cycle");
            return Ok(DeleteOutcome::Superseded { current_token });
        }
    }
    let memberships_cleared = db::detach_content_from_collections_tx(&mut tx, external_id).await?;
    let content_id = db::delete_content_tx(&mut tx, external_id).await?;
    let blocks_removed = db::delete_blocks_tx(&mut tx, &block_ids).await?;
    tx.commit().await?;

    info!(
        ?content_id,
        memberships_cleared, blocks_removed, "content deleted"
    );
    Ok(DeleteOutcome::Deleted {
        content_id,
        memberships_cleared,
        blocks_removed,
    })
}
