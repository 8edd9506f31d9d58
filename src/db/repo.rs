use super::model::{BlockRecord, ClaimedJob, ContentRecord, CycleCounts};
use crate::model::{JobPayload, PageMeta};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // Several workers write concurrently; WAL keeps readers unblocked.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=NORMAL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/` and create the parent
/// directory. Other schemes and in-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{}?{}", path, q),
        None => format!("sqlite://{}", path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// sync cycles

/// Open a reconciliation cycle; its id is the monotonic sync token.
#[instrument(skip_all)]
pub async fn begin_sync_cycle(pool: &Pool) -> Result<i64> {
    let id: i64 = sqlx::query("INSERT INTO sync_cycles DEFAULT VALUES RETURNING id")
        .fetch_one(pool)
        .await?
        .get("id");
    Ok(id)
}

#[instrument(skip_all)]
pub async fn finish_sync_cycle(pool: &Pool, cycle_id: i64, counts: &CycleCounts) -> Result<()> {
    sqlx::query(
        "UPDATE sync_cycles SET finished_at = CURRENT_TIMESTAMP, created = ?, updated = ?, deleted = ?, skipped = ? WHERE id = ?",
    )
    .bind(counts.created)
    .bind(counts.updated)
    .bind(counts.deleted)
    .bind(counts.skipped)
    .bind(cycle_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn fail_sync_cycle(pool: &Pool, cycle_id: i64, error: &str) -> Result<()> {
    sqlx::query("UPDATE sync_cycles SET finished_at = CURRENT_TIMESTAMP, error = ? WHERE id = ?")
        .bind(error)
        .bind(cycle_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// contents

fn content_from_row(row: &SqliteRow) -> ContentRecord {
    ContentRecord {
        id: row.get("id"),
        external_id: row.get("external_id"),
        title: row.get("title"),
        content_type: row.get("type"),
        edited_at: row.get("edited_at"),
        composed_json: row.get("composed_json"),
        sync_token: row.get("sync_token"),
    }
}

/// Read-only snapshot of every mirrored page.
#[instrument(skip_all)]
pub async fn list_contents(pool: &Pool) -> Result<Vec<ContentRecord>> {
    let rows = sqlx::query(
        "SELECT id, external_id, title, type, edited_at, composed_json, sync_token FROM contents ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(content_from_row).collect())
}

#[instrument(skip_all)]
pub async fn get_content(pool: &Pool, external_id: &str) -> Result<Option<ContentRecord>> {
    let row = sqlx::query(
        "SELECT id, external_id, title, type, edited_at, composed_json, sync_token FROM contents WHERE external_id = ?",
    )
    .bind(external_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(content_from_row))
}

/// Insert a page with an empty body so consumers always find a row. An
/// existing row only has its token raised.
#[instrument(skip_all)]
pub async fn insert_placeholder_content<'e, E>(
    exec: E,
    external_id: &str,
    page: &PageMeta,
    sync_token: i64,
) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let id: i64 = sqlx::query(
        "INSERT INTO contents (external_id, title, type, edited_at, composed_json, sync_token) VALUES (?, ?, ?, ?, '[]', ?) \
         ON CONFLICT(external_id) DO UPDATE SET sync_token = MAX(contents.sync_token, excluded.sync_token) \
         RETURNING id",
    )
    .bind(external_id)
    .bind(&page.title)
    .bind(&page.page_type)
    .bind(page.edited_at)
    .bind(sync_token)
    .fetch_one(exec)
    .await?
    .get("id");
    Ok(id)
}

/// Mark the page as claimed by a newer cycle. Returns false if the row is gone.
#[instrument(skip_all)]
pub async fn stamp_content_token<'e, E>(exec: E, external_id: &str, sync_token: i64) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query(
        "UPDATE contents SET sync_token = MAX(sync_token, ?) WHERE external_id = ?",
    )
    .bind(sync_token)
    .bind(external_id)
    .execute(exec)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Write the composed tree together with the page fields the pipeline owns.
/// Only an existing row that no newer cycle has claimed is touched; `None`
/// means the page was deleted or superseded meanwhile.
#[instrument(skip_all)]
pub async fn write_composed_content(
    pool: &Pool,
    external_id: &str,
    page: &PageMeta,
    composed_json: &str,
    sync_token: i64,
) -> Result<Option<i64>> {
    let id: Option<i64> = sqlx::query_scalar(
        "UPDATE contents SET title = ?, type = ?, edited_at = ?, composed_json = ?, \
            sync_token = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE external_id = ? AND sync_token <= ? \
         RETURNING id",
    )
    .bind(&page.title)
    .bind(&page.page_type)
    .bind(page.edited_at)
    .bind(composed_json)
    .bind(sync_token)
    .bind(external_id)
    .bind(sync_token)
    .fetch_optional(pool)
    .await
    .context("failed to persist composed content")?;
    Ok(id)
}

pub async fn content_token_tx(
    tx: &mut Transaction<'_, Sqlite>,
    external_id: &str,
) -> Result<Option<i64>> {
    let token: Option<i64> =
        sqlx::query_scalar("SELECT sync_token FROM contents WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(&mut **tx)
            .await?;
    Ok(token)
}

/// Delete a page row. Collection membership must be cleared first.
pub async fn delete_content_tx(
    tx: &mut Transaction<'_, Sqlite>,
    external_id: &str,
) -> Result<Option<i64>> {
    let id: Option<i64> = sqlx::query_scalar("DELETE FROM contents WHERE external_id = ? RETURNING id")
        .bind(external_id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(id)
}

// ---------------------------------------------------------------------------
// collections

#[instrument(skip_all)]
pub async fn create_collection(pool: &Pool, name: &str) -> Result<i64> {
    let id: i64 = sqlx::query("INSERT INTO collections (name) VALUES (?) RETURNING id")
        .bind(name)
        .fetch_one(pool)
        .await?
        .get("id");
    Ok(id)
}

#[instrument(skip_all)]
pub async fn add_to_collection(pool: &Pool, collection_id: i64, content_id: i64) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO collection_items (collection_id, content_id) VALUES (?, ?)")
        .bind(collection_id)
        .bind(content_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn detach_content_from_collections_tx(
    tx: &mut Transaction<'_, Sqlite>,
    external_id: &str,
) -> Result<u64> {
    let res = sqlx::query(
        "DELETE FROM collection_items WHERE content_id IN (SELECT id FROM contents WHERE external_id = ?)",
    )
    .bind(external_id)
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn count_collection_memberships(pool: &Pool, content_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM collection_items WHERE content_id = ?")
        .bind(content_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// blocks

fn block_from_row(row: &SqliteRow) -> BlockRecord {
    BlockRecord {
        external_id: row.get("external_id"),
        is_busy: row.get("is_busy"),
        edited_at: row.get("edited_at"),
        children_json: row.get("children_json"),
        sync_token: row.get("sync_token"),
    }
}

/// Write a block's fetch state. A row already written by a newer cycle is
/// left alone; returns whether the write landed.
pub async fn upsert_block<'e, E>(
    exec: E,
    external_id: &str,
    is_busy: bool,
    edited_at: DateTime<Utc>,
    children_json: &str,
    sync_token: i64,
) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query(
        "INSERT INTO blocks (external_id, is_busy, edited_at, children_json, sync_token) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(external_id) DO UPDATE SET is_busy = excluded.is_busy, edited_at = excluded.edited_at, \
            children_json = excluded.children_json, sync_token = excluded.sync_token, updated_at = CURRENT_TIMESTAMP \
         WHERE excluded.sync_token >= blocks.sync_token",
    )
    .bind(external_id)
    .bind(is_busy)
    .bind(edited_at)
    .bind(children_json)
    .bind(sync_token)
    .execute(exec)
    .await
    .with_context(|| format!("failed to upsert block {}", external_id))?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn get_block(pool: &Pool, external_id: &str) -> Result<Option<BlockRecord>> {
    let row = sqlx::query(
        "SELECT external_id, is_busy, edited_at, children_json, sync_token FROM blocks WHERE external_id = ?",
    )
    .bind(external_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(block_from_row))
}

pub async fn delete_blocks_tx(tx: &mut Transaction<'_, Sqlite>, ids: &[String]) -> Result<u64> {
    let mut removed = 0;
    for id in ids {
        removed += sqlx::query("DELETE FROM blocks WHERE external_id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await?
            .rows_affected();
    }
    Ok(removed)
}

// ---------------------------------------------------------------------------
// job queue

/// Enqueue a typed job, due `delay_secs` from now.
pub async fn enqueue_job<'e, E, P>(
    exec: E,
    payload: &P,
    max_attempts: i32,
    delay_secs: i64,
) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
    P: JobPayload,
{
    let body = serde_json::to_string(payload).context("failed to encode job payload")?;
    let id: i64 = sqlx::query(
        "INSERT INTO jobs (kind, payload, attempt, max_attempts, state, due_at) VALUES (?, ?, 0, ?, 'pending', datetime('now', ? || ' seconds')) RETURNING id",
    )
    .bind(P::KIND.as_str())
    .bind(body)
    .bind(max_attempts)
    .bind(delay_secs)
    .fetch_one(exec)
    .await?
    .get("id");
    Ok(id)
}

/// Atomically claim the oldest due job for `worker`.
#[instrument(skip_all)]
pub async fn claim_next_job(pool: &Pool, worker: &str) -> Result<Option<ClaimedJob>> {
    let row = sqlx::query(
        "UPDATE jobs SET state = 'running', claimed_by = ? \
         WHERE id = ( \
            SELECT id FROM jobs WHERE state = 'pending' AND datetime(due_at) <= datetime('now') \
            ORDER BY datetime(due_at) ASC, id ASC LIMIT 1) \
         RETURNING id, kind, payload, attempt, max_attempts",
    )
    .bind(worker)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| ClaimedJob {
        id: row.get("id"),
        kind: row.get("kind"),
        payload: row.get("payload"),
        attempt: row.get("attempt"),
        max_attempts: row.get("max_attempts"),
    }))
}

#[instrument(skip_all)]
pub async fn complete_job(pool: &Pool, id: i64, worker: &str) -> Result<()> {
    sqlx::query("DELETE FROM jobs WHERE id = ? AND claimed_by = ?")
        .bind(id)
        .bind(worker)
        .execute(pool)
        .await?;
    Ok(())
}

/// Put a failed job back in line after `delay_secs`.
#[instrument(skip_all)]
pub async fn retry_job(
    pool: &Pool,
    id: i64,
    worker: &str,
    delay_secs: i64,
    error: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET state = 'pending', claimed_by = NULL, attempt = attempt + 1, last_error = ?, \
            due_at = datetime('now', ? || ' seconds') \
         WHERE id = ? AND claimed_by = ?",
    )
    .bind(error)
    .bind(delay_secs)
    .bind(id)
    .bind(worker)
    .execute(pool)
    .await?;
    Ok(())
}

/// Give up on a job, keeping it for inspection.
#[instrument(skip_all)]
pub async fn abandon_job(pool: &Pool, id: i64, worker: &str, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET state = 'abandoned', claimed_by = NULL, attempt = attempt + 1, last_error = ? \
         WHERE id = ? AND claimed_by = ?",
    )
    .bind(error)
    .bind(id)
    .bind(worker)
    .execute(pool)
    .await?;
    Ok(())
}

/// Hand a claimed job back untouched, due again after `delay_secs`.
#[instrument(skip_all)]
pub async fn release_job(pool: &Pool, id: i64, worker: &str, delay_secs: i64) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET state = 'pending', claimed_by = NULL, due_at = datetime('now', ? || ' seconds') \
         WHERE id = ? AND claimed_by = ?",
    )
    .bind(delay_secs)
    .bind(id)
    .bind(worker)
    .execute(pool)
    .await?;
    Ok(())
}

/// Jobs left `running` by a process that died are handed back to the queue.
#[instrument(skip_all)]
pub async fn requeue_running_jobs(pool: &Pool) -> Result<u64> {
    let res = sqlx::query("UPDATE jobs SET state = 'pending', claimed_by = NULL WHERE state = 'running'")
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn count_jobs(pool: &Pool, state: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE state = ?")
        .bind(state)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Seconds until the earliest pending job is due (negative when overdue).
#[instrument(skip_all)]
pub async fn seconds_until_next_job(pool: &Pool) -> Result<Option<i64>> {
    let secs: Option<i64> = sqlx::query_scalar(
        "SELECT CAST(MIN(strftime('%s', due_at)) - strftime('%s', 'now') AS INTEGER) FROM jobs WHERE state = 'pending'",
    )
    .fetch_one(pool)
    .await?;
    Ok(secs)
}
