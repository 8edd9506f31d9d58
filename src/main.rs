use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};

use notion_mirror::pipeline::Pipeline;
use notion_mirror::{config, db, queue, reconcile};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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
    let requeued = db::requeue_running_jobs(&pool).await?;
    if requeued > 0 {
        warn!(requeued, "re-queued jobs left running by a previous process");
    }

    let pipeline = Pipeline::from_config(&cfg, pool)?;
    let poll_sleep = cfg.app.poll_interval();

    let mut tasks = Vec::with_capacity(cfg.app.workers + 1);
    for _ in 0..cfg.app.workers {
        let worker = uuid::Uuid::new_v4().to_string();
        tasks.push(tokio::spawn(queue::run_worker(
            pipeline.clone(),
            worker,
            poll_sleep,
        )));
    }
    tasks.push(tokio::spawn(reconcile::run_reconciler(
        pipeline.clone(),
        cfg.app.reconcile_interval(),
    )));

    info!(
        workers = cfg.app.workers,
        every_secs = cfg.app.reconcile_interval_seconds,
        "notion mirror running"
    );

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("shutdown requested");
        }
        (res, idx, _) = futures::future::select_all(tasks.iter_mut()) => {
            if let Err(err) = res {
                error!(?err, task = idx, "background task stopped");
            }
        }
    }

    for task in &tasks {
        task.abort();
    }
    Ok(())
}
