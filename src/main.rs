use anyhow::Result;
use clap::Parser;
use feed_reader::config;
use feed_reader::orchestrator::Runner;
use feed_reader::remote::LocalDropSource;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about = "Poll every configured source on its own interval")]
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
    let runner = Arc::new(Runner::from_config(&cfg).await?);

    let mut tasks = Vec::with_capacity(cfg.sources.len());
    for source in cfg.sources.clone() {
        let runner = runner.clone();
        tasks.push(tokio::spawn(async move {
            let remote = LocalDropSource::new(&source.remote_path);
            let mut interval =
                tokio::time::interval(Duration::from_secs(source.poll_interval_seconds));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(source = %source.id, every = source.poll_interval_seconds, "scheduling source");
            loop {
                interval.tick().await;
                if let Err(err) = runner.run_source(&source, &remote).await {
                    error!(?err, source = %source.id, "failed to record polling attempt");
                }
            }
        }));
    }

    for task in futures::future::join_all(tasks).await {
        if let Err(err) = task {
            error!(?err, "source task ended");
        }
    }
    Ok(())
}
