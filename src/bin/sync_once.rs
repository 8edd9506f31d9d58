use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use notion_mirror::pipeline::Pipeline;
use notion_mirror::{config, db, queue, reconcile};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run one reconciliation cycle and process the queue until it is empty"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Give up waiting on delayed jobs after this many seconds
    #[arg(long, default_value = "600")]
    max_wait: u64,

    /// Only drain jobs already queued; skip the reconciliation cycle
    #[arg(long)]
    skip_cycle: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    db::requeue_running_jobs(&pool).await?;
    let pipeline = Pipeline::from_config(&cfg, pool)?;

    if !args.skip_cycle {
        let report = reconcile::run_cycle(&pipeline).await?;
        info!(
            sync_token = report.sync_token,
            created = report.counts.created,
            updated = report.counts.updated,
            deleted = report.counts.deleted,
            "cycle dispatched"
        );
    }

    let worker = uuid::Uuid::new_v4().to_string();
    let deadline = Instant::now() + Duration::from_secs(args.max_wait);
    let mut processed = 0u64;

    loop {
        match queue::process_next_job(&pipeline, &worker).await {
            Ok(true) => {
                processed += 1;
                if processed % 50 == 0 {
                    let pending = db::count_jobs(&pipeline.pool, "pending").await?;
                    info!(processed, pending, "sync progress");
                }
                continue;
            }
            Ok(false) => {}
            Err(err) => {
                error!(?err, "error processing job");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        }

        let Some(wait) = db::seconds_until_next_job(&pipeline.pool).await? else {
            break;
        };
        if Instant::now() >= deadline {
            let pending = db::count_jobs(&pipeline.pool, "pending").await?;
            warn!(pending, "max wait reached with jobs still pending");
            break;
        }
        let sleep_secs = wait.clamp(1, 30) as u64;
        tokio::time::sleep(Duration::from_secs(sleep_secs)).await;
    }

    let abandoned = db::count_jobs(&pipeline.pool, "abandoned").await?;
    info!(processed, abandoned, "sync finished");
    Ok(())
}
