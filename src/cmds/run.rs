// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

use crate::byterange::ByteRangeCache;
use crate::companion::CompanionClient;
use crate::config::Config;
use crate::eviction::EvictionService;
use crate::muxer::MuxerDriver;
use crate::pipeline::Pipeline;
use crate::progress::ActiveDownloads;
use crate::queue_processor::{QueueProcessor, RetryPolicy};
use crate::upstream::SqliteUpstreamCatalog;
use crate::watcher::Watcher;
use crate::web;
use base::{Error, ErrorKind};
use bpaf::Bpaf;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Starts the request router, queue processor, subscription watcher, and eviction service.
#[derive(Bpaf, Clone, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// The number of worker threads used by the asynchronous runtime.
    /// Defaults to the number of cores on the system.
    #[bpaf(long, argument("THREADS"))]
    worker_threads: Option<usize>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(worker_threads) = args.worker_threads {
        builder.worker_threads(worker_threads);
    }
    builder
        .build()
        .map_err(|e| Error::wrap(ErrorKind::Internal, e))?
        .block_on(async_run())
}

/// A partial `{videoId}_video.tmp`/`{videoId}_audio.tmp` left behind by a
/// process that died mid-download is otherwise only cleaned up when that
/// video's queue item is retried; one that never gets retried (manually
/// cancelled, or whose queue row was deleted) would sit forever. Swept
/// once at startup, before any task that could create a new one runs.
const STALE_TMP_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

fn gc_stale_tmp_files(videos_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(videos_dir) else {
        return;
    };
    let now = SystemTime::now();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !(name.ends_with("_video.tmp") || name.ends_with("_audio.tmp")) {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|m| now.duration_since(m).ok());
        if age.is_some_and(|age| age > STALE_TMP_AGE) {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => info!(file = name, "removed stale tmp file at startup"),
                Err(e) => warn!(file = name, error = %e, "failed to remove stale tmp file"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gc_removes_only_stale_tmp_files() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("dQw4w9WgXcQ_video.tmp");
        let fresh = dir.path().join("aaaaaaaaaaa_audio.tmp");
        let unrelated = dir.path().join("dQw4w9WgXcQ.mp4");
        std::fs::write(&stale, b"partial").unwrap();
        std::fs::write(&fresh, b"partial").unwrap();
        std::fs::write(&unrelated, b"done").unwrap();

        let old_time = SystemTime::now() - STALE_TMP_AGE - Duration::from_secs(60);
        std::fs::File::options().write(true).open(&stale).unwrap().set_modified(old_time).unwrap();

        gc_stale_tmp_files(dir.path());

        assert!(!stale.is_file());
        assert!(fresh.is_file());
        assert!(unrelated.is_file());
    }
}

async fn async_run() -> Result<i32, Error> {
    let config = Config::load()?;
    let clocks: Arc<dyn base::clock::Clocks> = Arc::new(base::clock::RealClocks);

    let catalog = db::Catalog::open(&config.catalog_path)?;
    info!(path = %config.catalog_path.display(), "catalog opened");

    let upstream = Arc::new(SqliteUpstreamCatalog::open(Path::new(&config.upstream_db_url))?);
    info!(url = %config.upstream_db_url, "upstream catalog opened");

    std::fs::create_dir_all(&config.videos_dir)
        .map_err(|e| Error::wrap(ErrorKind::Unavailable, e))?;
    gc_stale_tmp_files(&config.videos_dir);

    let http = reqwest::Client::new();
    let companion = Arc::new(CompanionClient::new(
        http.clone(),
        config.companion_url.clone(),
        config.companion_shared_secret.clone(),
    ));
    let muxer = Arc::new(MuxerDriver::new(config.muxer_binary.clone()));
    if let Err(e) = muxer.ensure_available().await {
        warn!(error = %e, binary = %config.muxer_binary.display(), "muxer binary not available at startup; downloads will fail until this is fixed");
    }

    let active = ActiveDownloads::new();
    let pipeline = Arc::new(Pipeline::new(&config, catalog.clone(), companion, muxer, active.clone()));
    let retry_policy = RetryPolicy {
        max_retries: config.max_retry_attempts,
        base_delay_minutes: config.retry_base_delay_minutes,
        throttle_max_retries: config.throttle_max_retries,
    };
    let queue_processor = Arc::new(QueueProcessor::new(
        catalog.clone(),
        pipeline,
        retry_policy,
        config.max_concurrent_downloads,
    ));

    let watcher_notify = Arc::new(tokio::sync::Notify::new());
    let watcher = Arc::new(Watcher::new(catalog.clone(), upstream.clone(), &config, watcher_notify));
    let eviction = Arc::new(EvictionService::new(
        catalog.clone(),
        upstream,
        config.videos_dir.clone(),
        config.cleanup_age_days,
    ));

    let state = Arc::new(web::AppState {
        catalog,
        upstream_frontend: config.upstream_frontend_url.clone(),
        http,
        active,
        watcher: watcher.clone(),
        eviction: eviction.clone(),
        videos_dir: config.videos_dir.clone(),
        byte_ranges: ByteRangeCache::new(),
        clocks: clocks.clone(),
    });

    let cancel = CancellationToken::new();

    let mut tasks: Vec<tokio::task::JoinHandle<Result<(), Error>>> = Vec::new();
    tasks.push(tokio::spawn(web::serve(state, config.listen_port, cancel.clone())));
    tasks.push(tokio::spawn({
        let processor = queue_processor.clone();
        let cancel = cancel.clone();
        async move {
            processor
                .run_loop(Duration::from_secs(5), cancel)
                .await;
            Ok(())
        }
    }));
    tasks.push(tokio::spawn({
        let watcher = watcher.clone();
        let cancel = cancel.clone();
        let clocks = clocks.clone();
        async move {
            watcher
                .run_loop(
                    Duration::from_secs(config.check_interval_minutes as u64 * 60),
                    cancel,
                    clocks,
                )
                .await;
            Ok(())
        }
    }));
    if config.cleanup_enabled {
        tasks.push(tokio::spawn({
            let eviction = eviction.clone();
            let cancel = cancel.clone();
            let clocks = clocks.clone();
            async move {
                eviction
                    .run_loop(
                        Duration::from_secs(config.cleanup_interval_hours as u64 * 3600),
                        cancel,
                        clocks,
                    )
                    .await;
                Ok(())
            }
        }));
    }

    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| Error::wrap(ErrorKind::Internal, e))?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| Error::wrap(ErrorKind::Internal, e))?;
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    info!("shutting down");
    cancel.cancel();
    for task in tasks {
        task.await.map_err(|e| Error::wrap(ErrorKind::Internal, e))??;
    }
    info!("exited cleanly");
    Ok(0)
}
