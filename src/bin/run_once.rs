use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use feed_reader::config;
use feed_reader::db;
use feed_reader::orchestrator::Runner;
use feed_reader::remote::LocalDropSource;

#[derive(Debug, Parser)]
#[command(author, version, about = "Run a single polling pass for one source and exit")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Source id to poll
    #[arg(long)]
    source: String,

    /// Forget recorded unknown files before polling
    #[arg(long)]
    clear_unknown_files: bool,

    /// Pause notification for the source and exit
    #[arg(long, conflicts_with = "resume")]
    pause: bool,

    /// Resume notification for the source before polling
    #[arg(long)]
    resume: bool,
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
    let source = cfg
        .source(&args.source)
        .ok_or_else(|| anyhow!("source {} is not configured", args.source))?
        .clone();
    let runner = Runner::from_config(&cfg).await?;

    if args.pause {
        db::pause_notifications(&runner.pool, &source.id).await?;
        info!(source = %source.id, "notification paused");
        return Ok(());
    }
    if args.resume {
        db::resume_notifications(&runner.pool, &source.id).await?;
        info!(source = %source.id, "notification resumed");
    }
    if args.clear_unknown_files {
        let cleared = db::clear_unknown_files(&runner.pool, &source.id).await?;
        info!(source = %source.id, cleared, "unknown files cleared");
    }

    let remote = LocalDropSource::new(&source.remote_path);
    let attempt = runner.run_source(&source, &remote).await?;
    if let Some(error) = attempt.error_text {
        warn!(source = %source.id, %error, "pass recorded an error");
        std::process::exit(1);
    }
    Ok(())
}
