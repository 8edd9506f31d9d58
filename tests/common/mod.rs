#![allow(dead_code)]

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Map};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use notion_mirror::config::SyncPolicy;
use notion_mirror::db;
use notion_mirror::error::PipelineError;
use notion_mirror::model::{BlockMetadata, Listing, RemoteBlock, RemotePage};
use notion_mirror::notion::{NotionSource, PageFilter};
use notion_mirror::pipeline::Pipeline;
use notion_mirror::queue::process_next_job;

pub async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn edited() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap()
}

pub fn page(id: &str, title: &str) -> RemotePage {
    RemotePage {
        external_id: id.into(),
        title: title.into(),
        page_type: "note".into(),
        edited_at: edited(),
    }
}

pub fn block(id: &str, has_children: bool) -> RemoteBlock {
    let mut payload = Map::new();
    payload.insert("object".into(), json!("block"));
    payload.insert(
        "paragraph".into(),
        json!({ "rich_text": [{ "plain_text": format!("text of {}", id) }] }),
    );
    RemoteBlock {
        id: id.into(),
        block_type: "paragraph".into(),
        has_children,
        edited_at: edited(),
        children: None,
        payload,
    }
}

/// Policy with every delay at zero so a drained queue means a settled pipeline.
pub fn instant_policy() -> SyncPolicy {
    SyncPolicy {
        check_initial_delay_seconds: 0,
        check_delay_seconds: 0,
        aggregate_delay_seconds: 0,
        ..Default::default()
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotion {
    pages: Arc<Mutex<Vec<RemotePage>>>,
    page_size: usize,
    /// Children listings per block, already split into cursor pages.
    children: Arc<Mutex<HashMap<String, Vec<Vec<RemoteBlock>>>>>,
    /// Remaining forced failures of `get_block_metadata` per block.
    failures: Arc<Mutex<HashMap<String, usize>>>,
    fail_listing: Arc<Mutex<bool>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingNotion {
    pub fn new(pages: Vec<RemotePage>) -> Self {
        Self {
            pages: Arc::new(Mutex::new(pages)),
            page_size: 2,
            ..Default::default()
        }
    }

    pub async fn set_children(&self, block_id: &str, listings: Vec<Vec<RemoteBlock>>) {
        self.children
            .lock()
            .await
            .insert(block_id.to_string(), listings);
    }

    pub async fn set_pages(&self, pages: Vec<RemotePage>) {
        *self.pages.lock().await = pages;
    }

    pub async fn fail_block(&self, block_id: &str, times: usize) {
        self.failures
            .lock()
            .await
            .insert(block_id.to_string(), times);
    }

    pub async fn fail_listing(&self, fail: bool) {
        *self.fail_listing.lock().await = fail;
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    pub fn pipeline(&self, pool: sqlx::SqlitePool, policy: SyncPolicy) -> Pipeline {
        Pipeline::new(pool, Arc::new(self.clone()), policy)
    }
}

fn cursor_index(cursor: Option<&str>) -> usize {
    cursor.and_then(|c| c.parse().ok()).unwrap_or(0)
}

#[async_trait::async_trait]
impl NotionSource for RecordingNotion {
    async fn list_pages(
        &self,
        _filter: Option<&PageFilter>,
        cursor: Option<&str>,
    ) -> Result<Listing<RemotePage>> {
        self.calls
            .lock()
            .await
            .push(format!("pages:{}", cursor.unwrap_or("-")));
        if *self.fail_listing.lock().await {
            return Err(PipelineError::RemoteTransient("listing unavailable".into()).into());
        }
        let pages = self.pages.lock().await;
        let start = cursor_index(cursor);
        let end = (start + self.page_size.max(1)).min(pages.len());
        let has_more = end < pages.len();
        Ok(Listing {
            results: pages[start.min(end)..end].to_vec(),
            next_cursor: has_more.then(|| end.to_string()),
            has_more,
        })
    }

    async fn get_block_metadata(&self, block_id: &str) -> Result<BlockMetadata> {
        self.calls.lock().await.push(format!("meta:{}", block_id));
        let mut failures = self.failures.lock().await;
        if let Some(left) = failures.get_mut(block_id) {
            if *left > 0 {
                *left -= 1;
                return Err(PipelineError::RemoteTransient(format!("boom on {}", block_id)).into());
            }
        }
        Ok(BlockMetadata {
            id: block_id.to_string(),
            edited_at: edited(),
            has_children: true,
        })
    }

    async fn list_children(
        &self,
        block_id: &str,
        cursor: Option<&str>,
    ) -> Result<Listing<RemoteBlock>> {
        self.calls
            .lock()
            .await
            .push(format!("children:{}:{}", block_id, cursor.unwrap_or("-")));
        let children = self.children.lock().await;
        let Some(listings) = children.get(block_id) else {
            return Ok(Listing {
                results: vec![],
                next_cursor: None,
                has_more: false,
            });
        };
        let idx = cursor_index(cursor);
        let has_more = idx + 1 < listings.len();
        Ok(Listing {
            results: listings.get(idx).cloned().unwrap_or_default(),
            next_cursor: has_more.then(|| (idx + 1).to_string()),
            has_more,
        })
    }
}

/// Run due jobs until none is left. Returns how many were processed.
pub async fn drain(p: &Pipeline) -> usize {
    let mut processed = 0;
    while process_next_job(p, "test-worker").await.unwrap() {
        processed += 1;
        assert!(processed < 1000, "queue never settled");
    }
    processed
}

pub async fn composed(p: &Pipeline, external_id: &str) -> Vec<RemoteBlock> {
    let content = db::get_content(&p.pool, external_id)
        .await
        .unwrap()
        .expect("content row");
    serde_json::from_str(&content.composed_json).unwrap()
}
