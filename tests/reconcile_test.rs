mod common;

use common::*;
use notion_mirror::db;
use notion_mirror::materializer::{self, AggregateOutcome};
use notion_mirror::model::{AggregateJob, DeleteContentIntent, FetchBlockJob, PageMeta};
use notion_mirror::orchestrator;
use notion_mirror::queue::process_next_job;
use notion_mirror::reconcile::run_cycle;

fn meta(title: &str) -> PageMeta {
    PageMeta {
        title: title.into(),
        page_type: "note".into(),
        edited_at: edited(),
    }
}

#[tokio::test]
async fn remote_only_page_is_created() {
    let pool = setup_pool().await;
    let notion = RecordingNotion::new(vec![page("A", "Alpha")]);
    notion.set_children("A", vec![vec![block("a1", false)]]).await;
    let p = notion.pipeline(pool, instant_policy());

    let report = run_cycle(&p).await.unwrap();
    assert_eq!(report.counts.created, 1);
    assert_eq!(report.counts.updated, 0);
    assert_eq!(report.counts.deleted, 0);

    // The first job seeds a placeholder so readers see the page right away.
    assert!(process_next_job(&p, "w").await.unwrap());
    let placeholder = db::get_content(&p.pool, "A").await.unwrap().unwrap();
    assert_eq!(placeholder.composed_json, "[]");

    drain(&p).await;
    let tree = composed(&p, "A").await;
    assert_eq!(tree.len(), 1);
    assert_eq!(tree[0].id, "a1");
}

#[tokio::test]
async fn local_only_page_is_deleted_with_memberships_and_blocks() {
    let pool = setup_pool().await;
    let notion = RecordingNotion::new(vec![]);
    let p = notion.pipeline(pool, instant_policy());

    let content_id = db::insert_placeholder_content(&p.pool, "B", &meta("Beta"), 1)
        .await
        .unwrap();
    let coll = db::create_collection(&p.pool, "reading").await.unwrap();
    db::add_to_collection(&p.pool, coll, content_id).await.unwrap();
    let children = serde_json::to_string(&vec![block("b1", true)]).unwrap();
    db::upsert_block(&p.pool, "B", false, edited(), &children, 1)
        .await
        .unwrap();
    db::upsert_block(&p.pool, "b1", false, edited(), "[]", 1)
        .await
        .unwrap();

    let report = run_cycle(&p).await.unwrap();
    assert_eq!(report.counts.deleted, 1);
    drain(&p).await;

    assert!(db::get_content(&p.pool, "B").await.unwrap().is_none());
    assert_eq!(
        db::count_collection_memberships(&p.pool, content_id)
            .await
            .unwrap(),
        0
    );
    assert!(db::get_block(&p.pool, "B").await.unwrap().is_none());
    assert!(db::get_block(&p.pool, "b1").await.unwrap().is_none());
    // Deletion never touches the remote source beyond the listing.
    assert!(notion
        .calls()
        .await
        .iter()
        .all(|c| c.starts_with("pages:")));
}

#[tokio::test]
async fn page_on_both_sides_is_refetched() {
    let pool = setup_pool().await;
    let notion = RecordingNotion::new(vec![page("C", "Gamma v2")]);
    notion.set_children("C", vec![vec![block("c-new", false)]]).await;
    let p = notion.pipeline(pool, instant_policy());

    db::insert_placeholder_content(&p.pool, "C", &meta("Gamma"), 0)
        .await
        .unwrap();
    db::write_composed_content(&p.pool, "C", &meta("Gamma"), "[{\"old\":true}]", 0)
        .await
        .unwrap();

    let report = run_cycle(&p).await.unwrap();
    assert_eq!(report.counts.updated, 1);
    assert_eq!(report.counts.created, 0);
    drain(&p).await;

    let content = db::get_content(&p.pool, "C").await.unwrap().unwrap();
    assert_eq!(content.title, "Gamma v2");
    assert_eq!(content.sync_token, report.sync_token);
    let tree = composed(&p, "C").await;
    assert_eq!(tree[0].id, "c-new");
}

#[tokio::test]
async fn failed_listing_aborts_the_cycle() {
    let pool = setup_pool().await;
    let notion = RecordingNotion::new(vec![page("A", "Alpha")]);
    notion.fail_listing(true).await;
    let p = notion.pipeline(pool, instant_policy());

    db::insert_placeholder_content(&p.pool, "keep", &meta("Keep"), 0)
        .await
        .unwrap();

    assert!(run_cycle(&p).await.is_err());
    let error: Option<String> =
        sqlx::query_scalar("SELECT error FROM sync_cycles ORDER BY id DESC LIMIT 1")
            .fetch_one(&p.pool)
            .await
            .unwrap();
    assert!(error.unwrap().contains("listing unavailable"));
    // Nothing dispatched, and in particular no deletion of the local page.
    assert_eq!(db::count_jobs(&p.pool, "pending").await.unwrap(), 0);
    assert!(db::get_content(&p.pool, "keep").await.unwrap().is_some());
}

#[tokio::test]
async fn interleaved_cycles_settle_on_newest_token() {
    let pool = setup_pool().await;
    let notion = RecordingNotion::new(vec![page("D", "Delta")]);
    notion.set_children("D", vec![vec![block("d1", true)]]).await;
    notion.set_children("d1", vec![vec![block("d2", false)]]).await;
    let p = notion.pipeline(pool, instant_policy());

    let first = run_cycle(&p).await.unwrap();
    // Only the create intent runs; the first root fetch is still queued
    // when the second cycle lands.
    assert!(process_next_job(&p, "w").await.unwrap());
    let second = run_cycle(&p).await.unwrap();
    assert!(second.sync_token > first.sync_token);
    assert_eq!(second.counts.updated, 1);
    drain(&p).await;

    let content = db::get_content(&p.pool, "D").await.unwrap().unwrap();
    assert_eq!(content.sync_token, second.sync_token);
    for id in ["D", "d1"] {
        let rec = db::get_block(&p.pool, id).await.unwrap().unwrap();
        assert_eq!(rec.sync_token, second.sync_token, "{}", id);
        assert!(!rec.is_busy);
    }
    assert!(
        db::get_block(&p.pool, "d2").await.unwrap().is_none(),
        "leaf blocks have no record of their own"
    );
    let tree = composed(&p, "D").await;
    assert_eq!(tree[0].children.as_ref().unwrap()[0].id, "d2");
    assert_eq!(db::count_jobs(&p.pool, "pending").await.unwrap(), 0);
    assert_eq!(db::count_jobs(&p.pool, "abandoned").await.unwrap(), 0);
}

#[tokio::test]
async fn late_lineage_does_not_resurrect_deleted_page() {
    let pool = setup_pool().await;
    let notion = RecordingNotion::new(vec![page("A", "Alpha")]);
    notion.set_children("A", vec![vec![block("a1", false)]]).await;
    let p = notion.pipeline(pool, instant_policy());

    let first = run_cycle(&p).await.unwrap();
    drain(&p).await;
    notion.set_pages(vec![]).await;
    let second = run_cycle(&p).await.unwrap();
    assert_eq!(second.counts.deleted, 1);
    drain(&p).await;
    assert!(db::get_content(&p.pool, "A").await.unwrap().is_none());

    // Work from the first cycle that was still in flight arrives late.
    let fetch = FetchBlockJob {
        block_id: "A".into(),
        root_id: "A".into(),
        depth: 0,
        sync_token: first.sync_token,
        page: Some(meta("Alpha")),
    };
    orchestrator::handle_fetch_block(&p, &fetch).await.unwrap();
    let late = AggregateJob {
        external_id: "A".into(),
        sync_token: first.sync_token,
        forced: true,
        page: meta("Alpha"),
    };
    assert_eq!(
        materializer::aggregate(&p, &late).await.unwrap(),
        AggregateOutcome::Deleted
    );

    assert!(db::get_content(&p.pool, "A").await.unwrap().is_none());
    assert!(db::get_block(&p.pool, "A").await.unwrap().is_none());
    assert_eq!(db::count_jobs(&p.pool, "pending").await.unwrap(), 0);
}

#[tokio::test]
async fn delete_from_older_cycle_keeps_recreated_page() {
    let pool = setup_pool().await;
    let notion = RecordingNotion::new(vec![]);
    let p = notion.pipeline(pool, instant_policy());
    db::insert_placeholder_content(&p.pool, "E", &meta("Epsilon"), 5)
        .await
        .unwrap();

    let stale = DeleteContentIntent {
        external_id: "E".into(),
        sync_token: 3,
    };
    orchestrator::handle_delete(&p, &stale).await.unwrap();
    assert!(db::get_content(&p.pool, "E").await.unwrap().is_some());

    let current = DeleteContentIntent {
        external_id: "E".into(),
        sync_token: 5,
    };
    orchestrator::handle_delete(&p, &current).await.unwrap();
    assert!(db::get_content(&p.pool, "E").await.unwrap().is_none());
}
