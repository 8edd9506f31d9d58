//! Flat, retryable tree fetching over a [`NotionSource`].
//!
//! Nothing here recurses: the fetch orchestrator drives expansion of the
//! returned parent blocks through the job queue.

use anyhow::{Context, Result};
use std::future::Future;
use tracing::{debug, instrument};

use crate::model::{Listing, RemoteBlock, RemotePage};
use crate::notion::{NotionSource, PageFilter};

/// Immediate children of a block and the subset that needs expanding.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedChildren {
    pub children: Vec<RemoteBlock>,
    pub parent_block_ids: Vec<String>,
}

/// Follow cursors until the listing is exhausted, keeping page order.
pub async fn collect_all<T, F, Fut>(mut fetch_page: F) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Listing<T>>>,
{
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0u32;

    loop {
        let listing = fetch_page(cursor.take()).await?;
        pages += 1;
        items.extend(listing.results);

        match (listing.has_more, listing.next_cursor) {
            (true, Some(next)) => cursor = Some(next),
            (true, None) => {
                debug!(pages, "listing reported has_more without a cursor; stopping");
                break;
            }
            (false, _) => break,
        }
    }

    Ok(items)
}

/// Every page the source exposes. Any failure aborts the whole listing.
#[instrument(skip_all)]
pub async fn list_all_pages(
    source: &dyn NotionSource,
    filter: Option<&PageFilter>,
) -> Result<Vec<RemotePage>> {
    collect_all(|cursor| async move { source.list_pages(filter, cursor.as_deref()).await })
        .await
        .context("failed to list remote pages")
}

#[instrument(skip(source))]
pub async fn fetch_children(source: &dyn NotionSource, block_id: &str) -> Result<FetchedChildren> {
    let children = collect_all(|cursor| async move {
        source.list_children(block_id, cursor.as_deref()).await
    })
    .await
    .with_context(|| format!("failed to list children of {}", block_id))?;

    let parent_block_ids = children
        .iter()
        .filter(|child| child.has_children)
        .map(|child| child.id.clone())
        .collect();

    Ok(FetchedChildren {
        children,
        parent_block_ids,
    })
}
