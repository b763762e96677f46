//! stripeio worker daemon.

mod profile;
mod worker;

use anyhow::{bail, Result};
use clap::Parser;
use profile::Profile;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker::BlockWorker;

#[derive(Parser, Debug)]
#[command(name = "stripeio-worker")]
#[command(about = "stripeio worker node")]
#[command(version)]
struct Args {
    /// Worker configuration file.
    config: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let profile = Profile::parse_toml(&args.config)?;
    info!(
        workspace = %profile.workspace_name,
        working_dir = %profile.working_dir.display(),
        ip = %profile.ip,
        threads = profile.num_threads,
        cache_mb = profile.cache_size >> 20,
        "starting worker"
    );

    profile.prepare_working_dir()?;

    if !profile.do_block {
        bail!("only the block worker is supported; set do_block = true");
    }
    let worker = BlockWorker::new(&profile)?;
    worker.run()
}
