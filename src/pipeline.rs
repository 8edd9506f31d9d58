use anyhow::Result;
use sqlx::{Executor, Sqlite};
use std::fmt;
use std::sync::Arc;

use crate::config::{Config, SyncPolicy};
use crate::db::{self, Pool};
use crate::model::{JobPayload, RetryPolicy};
use crate::notion::{NotionClient, NotionSource, PageFilter};

/// Everything a stage handler needs, built once at startup and passed down.
#[derive(Clone)]
pub struct Pipeline {
    pub pool: Pool,
    pub source: Arc<dyn NotionSource>,
    pub policy: SyncPolicy,
    pub filter: Option<PageFilter>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("policy", &self.policy)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(pool: Pool, source: Arc<dyn NotionSource>, policy: SyncPolicy) -> Self {
        Self {
            pool,
            source,
            policy,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: PageFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn from_config(cfg: &Config, pool: Pool) -> Result<Self> {
        let client = NotionClient::from_config(cfg)?;
        let pipeline = Self::new(pool, Arc::new(client), cfg.sync_policy());
        Ok(match &cfg.notion.database_id {
            Some(db) => pipeline.with_filter(PageFilter {
                database_id: Some(db.clone()),
            }),
            None => pipeline,
        })
    }

    pub fn source(&self) -> &dyn NotionSource {
        self.source.as_ref()
    }

    pub fn retry_policy_for<P: JobPayload>(&self) -> RetryPolicy {
        self.policy.retry_policy(P::KIND)
    }

    /// Enqueue with the attempt bound that belongs to the payload's kind.
    pub async fn enqueue<'e, E, P>(&self, exec: E, payload: &P, delay_secs: i64) -> Result<i64>
    where
        E: Executor<'e, Database = Sqlite>,
        P: JobPayload,
    {
        let max_attempts = self.retry_policy_for::<P>().max_attempts;
        db::enqueue_job(exec, payload, max_attempts, delay_secs).await
    }
}
