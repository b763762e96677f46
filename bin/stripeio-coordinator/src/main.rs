//! stripeio coordinator.

mod actions;
mod plan;
mod pool;
mod profile;

use actions::Coordinator;
use anyhow::{Context, Result};
use clap::Parser;
use profile::Profile;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use stripeio_common::ActionType;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Parser, Debug)]
#[command(name = "stripeio-coordinator")]
#[command(about = "stripeio coordinator")]
#[command(version)]
struct Args {
    /// Coordinator configuration file.
    config: PathBuf,
}

fn init_logging(log_file: &PathBuf) -> Result<()> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
    };
    let stdout = tracing_subscriber::fmt::layer().with_filter(filter());

    if let Some(parent) = log_file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("failed to open log file {}", log_file.display()))?;
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Arc::new(file))
        .with_filter(filter());

    tracing_subscriber::registry()
        .with(stdout)
        .with(file_layer)
        .init();
    Ok(())
}

fn throughput_mb_s(bytes: usize, elapsed: std::time::Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    (bytes >> 20) as f64 / secs
}

fn main() -> Result<()> {
    let args = Args::parse();
    let profile = Arc::new(Profile::parse_toml(&args.config)?);
    init_logging(&profile.log_file)?;

    info!(
        workspace = %profile.workspace_name,
        ip = %profile.ip,
        action = %profile.action,
        ec = format!("{}-{}+{}", profile.ec_type, profile.ec_k, profile.ec_m),
        pg_num = profile.pg_num,
        merge_scheme = %profile.merge_scheme,
        "starting coordinator"
    );

    let coordinator =
        Coordinator::new(Arc::clone(&profile)).context("failed to launch coordinator")?;

    match profile.action {
        ActionType::BuildData => {
            info!("building data");
            let epoch = Instant::now();
            let result = coordinator.build_data()?;
            let elapsed = epoch.elapsed();
            info!(
                stripes = result.stripe_range.1 - result.stripe_range.0,
                range = format!("{}..{}", result.stripe_range.0, result.stripe_range.1),
                elapsed_ms = elapsed.as_millis() as u64,
                "build done"
            );
            for ((ec_type, layout), stat) in &result.stripe_stat {
                info!(
                    "stripe type {ec_type}-{layout}: count {}, size {}MB",
                    stat.count,
                    stat.size >> 20
                );
            }
            info!(
                total_mb = result.total_size >> 20,
                throughput_mb_s = format!("{:.2}", throughput_mb_s(result.total_size, elapsed)),
                "build throughput"
            );
            coordinator.persist()?;
        }
        ActionType::RepairChunk => {
            info!("repairing failed chunks");
            let epoch = Instant::now();
            coordinator.repair_chunk()?;
            info!(elapsed_ms = epoch.elapsed().as_millis() as u64, "repair done");
        }
        ActionType::RepairFailureDomain => {
            info!("repairing failure domain");
            let epoch = Instant::now();
            let result = coordinator.repair_failure_domain()?;
            let elapsed = epoch.elapsed();
            info!(
                repaired_mb = result.total_size >> 20,
                elapsed_ms = elapsed.as_millis() as u64,
                throughput_mb_s = format!("{:.2}", throughput_mb_s(result.total_size, elapsed)),
                "failure domain repaired"
            );
        }
        ActionType::Read => {
            info!("reading trace");
            let epoch = Instant::now();
            let result = coordinator.read()?;
            let elapsed = epoch.elapsed();
            info!(
                read_mb = result.total_size >> 20,
                elapsed_ms = elapsed.as_millis() as u64,
                throughput_mb_s = format!("{:.2}", throughput_mb_s(result.total_size, elapsed)),
                "read done"
            );
        }
        ActionType::DegradeRead => {
            info!("degrade-reading trace");
            let epoch = Instant::now();
            let result = coordinator.degrade_read()?;
            let elapsed = epoch.elapsed();
            info!(
                read_mb = result.total_size >> 20,
                elapsed_ms = elapsed.as_millis() as u64,
                throughput_mb_s = format!("{:.2}", throughput_mb_s(result.total_size, elapsed)),
                "degrade read done"
            );
        }
    }
    Ok(())
}
