//! Periodic diff of the remote page inventory against the local mirror.
//!
//! Remote edit times are minute-granular and do not bubble up from
//! descendants, so pages present on both sides are always refetched.

use anyhow::Result;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::db::{self, ContentRecord, CycleCounts};
use crate::error::PipelineError;
use crate::fetcher;
use crate::model::{CreateContentIntent, DeleteContentIntent, RemotePage, UpdateContentIntent};
use crate::pipeline::Pipeline;

/// Disjoint partition of the remote and local id sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdDiff {
    pub common: BTreeSet<String>,
    pub only_remote: BTreeSet<String>,
    pub only_local: BTreeSet<String>,
}

pub fn diff_ids<'a, R, L>(remote: R, local: L) -> IdDiff
where
    R: IntoIterator<Item = &'a str>,
    L: IntoIterator<Item = &'a str>,
{
    let remote: BTreeSet<String> = remote.into_iter().map(str::to_string).collect();
    let local: BTreeSet<String> = local.into_iter().map(str::to_string).collect();
    IdDiff {
        common: remote.intersection(&local).cloned().collect(),
        only_remote: remote.difference(&local).cloned().collect(),
        only_local: local.difference(&remote).cloned().collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Create(CreateContentIntent),
    Update(UpdateContentIntent),
    Delete(DeleteContentIntent),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub intents: Vec<Intent>,
    pub skipped: usize,
}

impl ReconcilePlan {
    pub fn counts(&self) -> CycleCounts {
        let mut counts = CycleCounts {
            skipped: self.skipped as i64,
            ..Default::default()
        };
        for intent in &self.intents {
            match intent {
                Intent::Create(_) => counts.created += 1,
                Intent::Update(_) => counts.updated += 1,
                Intent::Delete(_) => counts.deleted += 1,
            }
        }
        counts
    }
}

/// Turn a diff into intents. Ids with no matching source record are logged
/// and skipped.
pub fn plan_intents(
    diff: &IdDiff,
    remote: &[RemotePage],
    local: &[ContentRecord],
    sync_token: i64,
) -> ReconcilePlan {
    let remote_by_id: HashMap<&str, &RemotePage> =
        remote.iter().map(|p| (p.external_id.as_str(), p)).collect();
    let local_by_id: HashMap<&str, &ContentRecord> =
        local.iter().map(|c| (c.external_id.as_str(), c)).collect();

    let mut plan = ReconcilePlan::default();
    let skip = |what: &'static str, id: &str| {
        let err = PipelineError::NotFound {
            what,
            id: id.to_string(),
        };
        warn!(%err, "diffed id has no source record; skipping");
    };

    for id in &diff.only_remote {
        let Some(page) = remote_by_id.get(id.as_str()) else {
            skip("remote page", id);
            plan.skipped += 1;
            continue;
        };
        plan.intents.push(Intent::Create(CreateContentIntent {
            external_id: page.external_id.clone(),
            title: page.title.clone(),
            page_type: page.page_type.clone(),
            edited_at: page.edited_at,
            sync_token,
        }));
    }

    for id in &diff.only_local {
        let Some(content) = local_by_id.get(id.as_str()) else {
            skip("content record", id);
            plan.skipped += 1;
            continue;
        };
        plan.intents.push(Intent::Delete(DeleteContentIntent {
            external_id: content.external_id.clone(),
            sync_token,
        }));
    }

    for id in &diff.common {
        let (Some(page), Some(content)) =
            (remote_by_id.get(id.as_str()), local_by_id.get(id.as_str()))
        else {
            skip("page on both sides", id);
            plan.skipped += 1;
            continue;
        };
        plan.intents.push(Intent::Update(UpdateContentIntent {
            internal_id: content.id,
            external_id: page.external_id.clone(),
            title: page.title.clone(),
            page_type: page.page_type.clone(),
            edited_at: page.edited_at,
            composed_placeholder: content.composed_json.clone(),
            sync_token,
        }));
    }

    plan
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub sync_token: i64,
    pub counts: CycleCounts,
}

/// One reconciliation tick. A failed remote listing aborts the cycle before
/// anything is dispatched.
#[instrument(skip_all)]
pub async fn run_cycle(p: &Pipeline) -> Result<CycleReport> {
    let sync_token = db::begin_sync_cycle(&p.pool).await?;

    let remote = match fetcher::list_all_pages(p.source(), p.filter.as_ref()).await {
        Ok(pages) => pages,
        Err(err) => {
            error!(?err, sync_token, "remote listing failed; aborting cycle");
            db::fail_sync_cycle(&p.pool, sync_token, &format!("{:#}", err)).await?;
            return Err(err);
        }
    };
    let local = db::list_contents(&p.pool).await?;

    let diff = diff_ids(
        remote.iter().map(|r| r.external_id.as_str()),
        local.iter().map(|c| c.external_id.as_str()),
    );
    let plan = plan_intents(&diff, &remote, &local, sync_token);

    let mut tx = p.pool.begin().await?;
    for intent in &plan.intents {
        match intent {
            Intent::Create(c) => p.enqueue(&mut *tx, c, 0).await?,
            Intent::Update(u) => p.enqueue(&mut *tx, u, 0).await?,
            Intent::Delete(d) => p.enqueue(&mut *tx, d, 0).await?,
        };
    }
    tx.commit().await?;

    let counts = plan.counts();
    db::finish_sync_cycle(&p.pool, sync_token, &counts).await?;
    info!(
        sync_token,
        remote = remote.len(),
        local = local.len(),
        created = counts.created,
        updated = counts.updated,
        deleted = counts.deleted,
        skipped = counts.skipped,
        "reconciliation cycle dispatched"
    );
    Ok(CycleReport { sync_token, counts })
}

/// Tick forever. Failures are whole-cycle and the next tick is the retry.
pub async fn run_reconciler(p: Pipeline, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(err) = run_cycle(&p).await {
            error!(?err, "reconciliation cycle failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn remote(id: &str) -> RemotePage {
        RemotePage {
            external_id: id.into(),
            title: format!("title {}", id),
            page_type: "doc".into(),
            edited_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    fn local(id: &str, pk: i64) -> ContentRecord {
        ContentRecord {
            id: pk,
            external_id: id.into(),
            title: "old".into(),
            content_type: "doc".into(),
            edited_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            composed_json: "[]".into(),
            sync_token: 0,
        }
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn diff_partitions_both_sides() {
        let cases: Vec<(Vec<&str>, Vec<&str>)> = vec![
            (vec![], vec![]),
            (vec!["a"], vec![]),
            (vec![], vec!["b"]),
            (vec!["a", "b", "c"], vec!["b", "c", "d"]),
            (vec!["x", "x", "y"], vec!["y"]),
        ];
        for (r, l) in cases {
            let diff = diff_ids(r.iter().copied(), l.iter().copied());
            let rebuilt_remote: BTreeSet<String> =
                diff.common.union(&diff.only_remote).cloned().collect();
            let rebuilt_local: BTreeSet<String> =
                diff.common.union(&diff.only_local).cloned().collect();
            assert_eq!(rebuilt_remote, set(&r));
            assert_eq!(rebuilt_local, set(&l));
            assert!(diff.common.is_disjoint(&diff.only_remote));
            assert!(diff.common.is_disjoint(&diff.only_local));
            assert!(diff.only_remote.is_disjoint(&diff.only_local));
        }
    }

    #[test]
    fn plan_maps_sets_to_intents() {
        let remote_pages = vec![remote("a"), remote("b")];
        let local_rows = vec![local("b", 7), local("c", 8)];
        let diff = diff_ids(
            remote_pages.iter().map(|p| p.external_id.as_str()),
            local_rows.iter().map(|c| c.external_id.as_str()),
        );
        let plan = plan_intents(&diff, &remote_pages, &local_rows, 42);

        assert_eq!(plan.skipped, 0);
        assert_eq!(
            plan.counts(),
            CycleCounts {
                created: 1,
                updated: 1,
                deleted: 1,
                skipped: 0
            }
        );
        for intent in &plan.intents {
            match intent {
                Intent::Create(c) => {
                    assert_eq!(c.external_id, "a");
                    assert_eq!(c.title, "title a");
                    assert_eq!(c.sync_token, 42);
                }
                Intent::Delete(d) => assert_eq!(d.external_id, "c"),
                Intent::Update(u) => {
                    assert_eq!(u.external_id, "b");
                    assert_eq!(u.internal_id, 7);
                    assert_eq!(u.title, "title b");
                    assert_eq!(u.composed_placeholder, "[]");
                }
            }
        }
    }

    #[test]
    fn plan_skips_ids_without_source_record() {
        let diff = IdDiff {
            common: set(&["ghost-common"]),
            only_remote: set(&["ghost-remote"]),
            only_local: set(&["ghost-local"]),
        };
        let plan = plan_intents(&diff, &[], &[], 1);
        assert!(plan.intents.is_empty());
        assert_eq!(plan.skipped, 3);
    }
}
