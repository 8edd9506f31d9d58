use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use notion_mirror::config;
use notion_mirror::fetcher;
use notion_mirror::notion::{normalize_id, NotionClient, NotionSource};

#[derive(Parser, Debug)]
#[command(about = "Print the immediate children of a Notion block or page")]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Block or page id (a page URL works too)
    #[arg(long)]
    block: String,

    /// Print the children as JSON instead of a summary
    #[arg(long)]
    json: bool,
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
    let client = NotionClient::from_config(&cfg)?;

    let block_id =
        normalize_id(&args.block).ok_or_else(|| anyhow!("invalid block id '{}'", args.block))?;
    let meta = client.get_block_metadata(&block_id).await?;
    let fetched = fetcher::fetch_children(&client, &block_id).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&fetched.children)?);
        return Ok(());
    }

    println!("Block: {} (edited {})", meta.id, meta.edited_at);
    println!("Children: {}", fetched.children.len());
    for child in &fetched.children {
        let marker = if child.has_children { "+" } else { " " };
        println!("  {} {} [{}]", marker, child.id, child.block_type);
    }
    println!("Expandable: {}", fetched.parent_block_ids.len());
    Ok(())
}
