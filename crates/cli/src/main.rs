//! CLI entry point for the audiobook encoding pipeline.
//!
//! Resolves the environment profile, wires the queue, retry manager and
//! file manager together, and runs until interrupted.

use audiobook_encoder::{
    run_startup_checks, EncodingFileManager, EncodingQueue, EnvironmentConfig, FfmpegEncoder,
    NullChapterStore, Profile, RetryManager,
};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Period of the job-table and temp-file housekeeping loop.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3600);

/// Terminal job records older than this are purged from memory.
const JOB_RETENTION_HOURS: u64 = 24;

/// Audiobook encoder - background audio transcoding with retry and
/// file lifecycle management
#[derive(Parser, Debug)]
#[command(name = "audiobook-encoder")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Deployment profile (local, staging, production)
    #[arg(short, long, default_value = "local", env = "ENCODER_PROFILE")]
    profile: Profile,

    /// Root directory for book storage (uploads/media/temp/archive)
    #[arg(short, long, default_value = "./storage")]
    storage_dir: PathBuf,

    /// Optional TOML file overriding profile tunables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Skip startup checks (ffmpeg, ffprobe). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match EnvironmentConfig::resolve(args.profile, args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let default_filter = if config.detailed_logging {
        "audiobook_encoder=debug,info"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    info!(
        profile = %config.profile,
        storage = %args.storage_dir.display(),
        workers = config.max_workers,
        "audiobook encoder starting"
    );

    if args.skip_checks {
        info!("skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&config) {
        error!(error = %e, "startup check failed");
        return ExitCode::FAILURE;
    }

    let files = EncodingFileManager::new(&args.storage_dir, &config.encoding.output_format);
    let encoder = FfmpegEncoder::new(&config);
    let queue = EncodingQueue::new(&config, encoder, files.clone(), Arc::new(NullChapterStore));
    let retry_manager = RetryManager::new(queue.clone(), config.retry);

    queue.start();
    retry_manager.start();

    let housekeeping = spawn_housekeeping(queue.clone(), files, config.cleanup_temp_max_age_hours);

    info!("encoding pipeline running, press ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }

    info!("shutting down");
    housekeeping.abort();
    retry_manager.stop();
    queue.stop();

    let stats = queue.stats();
    info!(
        total_jobs = stats.total_jobs,
        completed = stats.status_counts.get("completed").copied().unwrap_or(0),
        failed = stats.status_counts.get("failed").copied().unwrap_or(0),
        "final queue statistics"
    );

    ExitCode::SUCCESS
}

/// Periodically purge old terminal jobs and stale temp files.
fn spawn_housekeeping(
    queue: EncodingQueue,
    files: EncodingFileManager,
    temp_max_age_hours: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup stays quiet
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed_jobs = queue.cleanup_old_jobs(JOB_RETENTION_HOURS);
            let removed_files = files.cleanup_old_temp(temp_max_age_hours);
            info!(removed_jobs, removed_files, "housekeeping pass complete");
        }
    })
}
