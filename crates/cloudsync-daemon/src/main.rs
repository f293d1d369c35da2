//! cloudsync: keeps a local directory in sync with a remote project store.

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cloudsync_daemon::{Args, Config, Daemon};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,cloudsync_daemon=debug"
    } else {
        "info,cloudsync_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting cloudsync {}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_args(&args)?;
    info!("Root: {}", config.root.display());
    info!("Remote: {}", config.remote.display());

    std::fs::create_dir_all(&config.remote)
        .with_context(|| format!("Failed to create {}", config.remote.display()))?;

    let daemon = Daemon::open(config)?;

    if args.reset {
        daemon.reset().await?;
    }

    let (entries, report) = daemon.baseline().await?;
    if report.has_changes() {
        info!(
            "{} files appeared and {} disappeared since the last run ({} never uploaded)",
            report.created.len(),
            report.deleted.len() + report.discarded.len(),
            report.discarded.len()
        );
    }

    if args.once {
        let result = daemon.sync_once().await;
        if result.canceled {
            warn!("Sync was canceled");
        } else if !result.success {
            bail!("Sync failed: {}", result.errors.join("; "));
        }
        return Ok(());
    }

    info!("Daemon running. Press Ctrl+C to stop.");
    daemon.run(&entries).await?;

    info!("Shutting down");
    Ok(())
}
