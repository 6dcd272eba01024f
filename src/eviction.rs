// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! The eviction service (C9): a long-lived task that periodically sweeps
//! downloaded videos past their age threshold and reclaims disk space for
//! the ones nobody still needs, consulting C2 for ownership/watch state.
//! Shaped like the eviction sweep in a typical cache-janitor loop: a fixed
//! interval timer, a bounded run-stats ring, no external trigger (unlike
//! the watcher/processor, nothing enqueues work for this one).

use crate::upstream::UpstreamCatalog;
use db::Catalog;
use jiff::{SignedDuration, Timestamp};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const MAX_RECORDED_ERRORS: usize = 20;

#[derive(Clone, Debug, Default)]
pub struct EvictionStats {
    pub runs_total: u64,
    pub last_checked: u64,
    pub last_deleted: u64,
    pub last_freed_bytes: u64,
    pub last_duration: Option<SignedDuration>,
    /// Most recent failures first, capped at `MAX_RECORDED_ERRORS`.
    pub recent_errors: Vec<String>,
}

pub struct EvictionService<U> {
    catalog: Catalog,
    upstream: Arc<U>,
    videos_dir: PathBuf,
    age_days: u32,
    stats: base::Mutex<EvictionStats>,
}

impl<U: UpstreamCatalog> EvictionService<U> {
    pub fn new(catalog: Catalog, upstream: Arc<U>, videos_dir: PathBuf, age_days: u32) -> Self {
        EvictionService {
            catalog,
            upstream,
            videos_dir,
            age_days,
            stats: base::Mutex::new(EvictionStats::default()),
        }
    }

    pub fn stats(&self) -> EvictionStats {
        self.stats.lock().clone()
    }

    /// One sweep per `## 4.9`.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self, now: Timestamp) {
        let start = std::time::Instant::now();
        let candidates = match self.catalog.get_cleanup_candidates(self.age_days as i64, now) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to query cleanup candidates");
                let mut stats = self.stats.lock();
                stats.runs_total += 1;
                push_error(&mut stats.recent_errors, format!("get_cleanup_candidates: {e}"));
                return;
            }
        };

        let mut checked = 0u64;
        let mut deleted = 0u64;
        let mut freed_bytes = 0u64;
        let mut errors = Vec::new();

        for candidate in &candidates {
            checked += 1;
            match self.evict_one(candidate, now).await {
                Ok(Some(freed)) => {
                    deleted += 1;
                    freed_bytes += freed;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(video_id = %candidate.video_id, error = %e, "eviction failed for candidate");
                    errors.push(format!("{}: {}", candidate.video_id, e));
                }
            }
        }

        let duration = SignedDuration::try_from(start.elapsed()).unwrap_or_default();
        let mut stats = self.stats.lock();
        stats.runs_total += 1;
        stats.last_checked = checked;
        stats.last_deleted = deleted;
        stats.last_freed_bytes = freed_bytes;
        stats.last_duration = Some(duration);
        for e in errors {
            push_error(&mut stats.recent_errors, e);
        }
        info!(checked, deleted, freed_bytes, "eviction sweep complete");
    }

    /// Returns `Ok(Some(bytes_freed))` if deleted, `Ok(None)` if skipped
    /// (kept forever or still unwatched by some owner).
    async fn evict_one(&self, candidate: &db::Download, now: Timestamp) -> Result<Option<u64>, base::Error> {
        let owners = self.catalog.get_active_video_owners(&candidate.video_id)?;
        if owners.iter().any(|o| o.keep_forever) {
            return Ok(None);
        }
        if !owners.is_empty() {
            for owner in &owners {
                let watched = self
                    .upstream
                    .has_user_watched_video(&owner.user_id, &candidate.video_id)
                    .await?;
                if !watched {
                    return Ok(None);
                }
            }
        }

        let mut freed = 0u64;
        freed += remove_if_exists(&PathBuf::from(&candidate.file_path)).await;
        if let Some(thumb) = &candidate.thumbnail_path {
            freed += remove_if_exists(&PathBuf::from(thumb)).await;
        }
        freed += remove_if_exists(&self.videos_dir.join(format!("{}.json", candidate.video_id))).await;
        freed += self.remove_stream_files(&candidate.video_id, "video").await;
        freed += self.remove_stream_files(&candidate.video_id, "audio").await;

        self.catalog.mark_files_deleted(&candidate.video_id, now)?;
        Ok(Some(freed))
    }

    /// Removes every `{videoId}_{kind}_{itag}.*` stream file left on disk
    /// from a separate-streams download.
    async fn remove_stream_files(&self, video_id: &str, kind: &str) -> u64 {
        let prefix = format!("{video_id}_{kind}_");
        let mut freed = 0u64;
        let mut entries = match tokio::fs::read_dir(&self.videos_dir).await {
            Ok(e) => e,
            Err(_) => return 0,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) {
                if let Ok(meta) = entry.metadata().await {
                    freed += meta.len();
                }
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
        freed
    }

    pub async fn run_loop(self: Arc<Self>, tick_interval: std::time::Duration, cancel: CancellationToken, clocks: Arc<dyn base::clock::Clocks>) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("eviction service shutting down");
                    return;
                }
                _ = tokio::time::sleep(tick_interval) => {}
            }
            self.run_once(clocks.now()).await;
        }
    }
}

async fn remove_if_exists(path: &PathBuf) -> u64 {
    let freed = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
    let _ = tokio::fs::remove_file(path).await;
    freed
}

fn push_error(errors: &mut Vec<String>, message: String) {
    errors.insert(0, message);
    errors.truncate(MAX_RECORDED_ERRORS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::fake::FakeUpstreamCatalog;
    use db::{DownloadInput, DownloadMetadata, Source};

    fn metadata() -> DownloadMetadata {
        DownloadMetadata::default()
    }

    #[tokio::test]
    async fn skips_unwatched_owner() {
        let catalog = db::testutil::test_catalog();
        let now = db::testutil::test_now();
        catalog
            .add_download(
                DownloadInput {
                    video_id: "dQw4w9WgXcQ".to_string(),
                    channel_id: Some("UC1".to_string()),
                    title: "t".to_string(),
                    duration_seconds: Some(300),
                    quality: Some("720p".to_string()),
                    file_path: "/nonexistent/dQw4w9WgXcQ.mp4".to_string(),
                    thumbnail_path: None,
                    metadata: metadata(),
                    file_size_bytes: 100,
                    source: Source::Subscription,
                },
                now,
            )
            .unwrap();
        catalog
            .add_to_queue(
                db::AddToQueue {
                    video_id: "dQw4w9WgXcQ".to_string(),
                    user_id: None,
                    priority: None,
                    source: Source::Subscription,
                    owner_user_ids: Some(vec!["alice@example.com".to_string()]),
                },
                now,
            )
            .unwrap();

        let later = now.checked_add(jiff::Span::new().days(1)).unwrap();
        let candidates = catalog.get_cleanup_candidates(0, later).unwrap();
        assert_eq!(candidates.len(), 1);

        let upstream = Arc::new(FakeUpstreamCatalog::default());
        let svc = EvictionService::new(catalog.clone(), upstream, std::env::temp_dir(), 0);
        let outcome = svc.evict_one(&candidates[0], later).await.unwrap();
        assert!(outcome.is_none(), "owner without keepForever but unwatched should be skipped");
    }

    #[test]
    fn error_ring_caps_at_twenty() {
        let mut errors = Vec::new();
        for i in 0..30 {
            push_error(&mut errors, format!("err{i}"));
        }
        assert_eq!(errors.len(), MAX_RECORDED_ERRORS);
        assert_eq!(errors[0], "err29");
    }
}
