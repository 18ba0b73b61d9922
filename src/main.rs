//! bdev-aio: drive batched Linux AIO against a file or block device.
//!
//! Writes a configurable number of blocks through the AIO queue, harvesting
//! completions on a dedicated reaper thread, and optionally reads them back.
//!
//! Configuration via CLI arguments or TOML file.

use bdev_aio::config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        max_submissions_per_call = config.max_submissions_per_call,
        max_iodepth = config.max_iodepth,
        post_chunk_sleep = ?config.post_chunk_sleep,
        reap_timeout_ms = config.reap_timeout_ms,
        reap_max = config.reap_max,
        "Starting bdev-aio"
    );

    run(config)
}

/// Run the bench (Linux only)
#[cfg(target_os = "linux")]
fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let report = bdev_aio::bench::run(&config)?;

    info!(
        submitted = report.submitted,
        completed = report.completed,
        failed = report.failed,
        short = report.short,
        retries = report.retries,
        batches = report.batches,
        mismatched = report.mismatched,
        "Finished"
    );

    if report.failed > 0 || report.short > 0 || report.mismatched > 0 {
        return Err(format!(
            "{} failed, {} short, {} mismatched operations",
            report.failed, report.short, report.mismatched
        )
        .into());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_config: Config) -> Result<(), Box<dyn std::error::Error>> {
    Err(Box::new(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "Unsupported platform: kernel AIO requires Linux",
    )))
}
