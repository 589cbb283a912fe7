//! CLI entry point for the IPSW mirror.

use anyhow::{Context, Result};
use clap::Parser;
use ipsw_downloader_core::logging::{default_level, init_logging};
use ipsw_downloader_core::{
    LogNotifier, NoopNotifier, Notifier, Pipeline, Scheduler, load_config,
};
use tracing::{debug, info};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    let loaded = load_config(args.config.as_deref()).context("failed to load configuration")?;
    let mut config = loaded.config;
    args.apply_overrides(&mut config);
    config.validate().context("invalid configuration")?;

    let _log_guard = init_logging(default_level(args.verbose, args.quiet), &config.detailed_log)
        .context("failed to initialise logging")?;

    debug!(?args, "CLI arguments parsed");
    match &loaded.path {
        Some(path) if loaded.loaded_from_file => info!(path = %path.display(), "loaded config file"),
        Some(path) => debug!(path = %path.display(), "no config file, using defaults"),
        None => debug!("no config location, using defaults"),
    }
    info!("IPSW downloader starting");

    let notifier: Box<dyn Notifier> = if args.no_notify {
        Box::new(NoopNotifier)
    } else {
        Box::new(LogNotifier::new(config.viewer_links.clone()))
    };
    let pipeline = Pipeline::from_config(&config, notifier)?;

    if args.once {
        let report = pipeline.run_once().await?;
        info!(
            downloaded = report.downloaded().len(),
            failed = report.result.failed.len(),
            "single pass finished"
        );
        return Ok(());
    }

    Scheduler::from_config(&config).run_forever(&pipeline).await;
    info!("IPSW downloader stopped");
    Ok(())
}
