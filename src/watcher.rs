// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! The subscription watcher (C8): a long-lived task that periodically asks
//! C2 for new videos across every tracked subscription and enqueues the
//! survivors into C1. Shaped like the queue processor's tick loop (a timer
//! race against an explicit notify), but single-threaded per tick — there's
//! only one scan in flight at a time.

use crate::upstream::{LatestVideosQuery, UpstreamCatalog};
use db::{AddToQueue, Catalog, Source};
use jiff::{Span, Timestamp};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything the filter in `filter_candidate` needs, precomputed once per
/// tick so the function itself stays pure and testable standalone: `D`,
/// `Q`, and `X` from `filterVideos(videos, cfg, D, Q, X)`, plus the config
/// knobs it carries as `cfg`.
#[derive(Clone, Debug, Default)]
pub struct FilterContext {
    pub downloaded: HashSet<String>,
    pub queued: HashSet<String>,
    /// `X`: channel IDs excluded for every user (a channel-wide mute, not
    /// a per-user one — those narrow the owner set in step 7 instead,
    /// since a per-user mute can't drop a video other owners still want).
    pub excluded_channels: HashSet<String>,
    pub min_duration_seconds: u32,
    pub exclude_live: bool,
    pub exclude_premiere: bool,
}

/// Step 5 of the tick algorithm: drop if already downloaded, already
/// queued, channel-wide excluded, too short, live, or a premiere (each
/// gated by config).
pub fn filter_candidate(video: &crate::upstream::UpstreamVideo, ctx: &FilterContext) -> bool {
    if ctx.downloaded.contains(&video.video_id) {
        return false;
    }
    if ctx.queued.contains(&video.video_id) {
        return false;
    }
    if ctx.excluded_channels.contains(&video.channel_id) {
        return false;
    }
    if let Some(len) = video.length_seconds {
        if len < ctx.min_duration_seconds {
            return false;
        }
    }
    if ctx.exclude_live && video.live_now {
        return false;
    }
    if ctx.exclude_premiere && video.premiere {
        return false;
    }
    true
}

#[derive(Clone, Debug, Default)]
pub struct WatcherStats {
    pub ticks_total: u64,
    pub videos_enqueued_total: u64,
    pub last_tick_at: Option<Timestamp>,
    pub last_error: Option<String>,
}

pub struct Watcher<U> {
    catalog: Catalog,
    upstream: Arc<U>,
    single_user: Option<String>,
    min_duration_seconds: u32,
    exclude_live: bool,
    exclude_premiere: bool,
    max_videos_per_check: u32,
    last_seen: base::Mutex<Option<Timestamp>>,
    stats: base::Mutex<WatcherStats>,
    pub notify: Arc<tokio::sync::Notify>,
}

impl<U: UpstreamCatalog> Watcher<U> {
    pub fn new(
        catalog: Catalog,
        upstream: Arc<U>,
        config: &crate::config::Config,
        notify: Arc<tokio::sync::Notify>,
    ) -> Self {
        Watcher {
            catalog,
            upstream,
            single_user: config.single_user.clone(),
            min_duration_seconds: config.min_duration_seconds,
            exclude_live: config.exclude_live,
            exclude_premiere: config.exclude_premiere,
            max_videos_per_check: config.max_videos_per_check,
            last_seen: base::Mutex::new(None),
            stats: base::Mutex::new(WatcherStats::default()),
            notify,
        }
    }

    pub fn stats(&self) -> WatcherStats {
        self.stats.lock().clone()
    }

    /// One tick of the algorithm in `## 4.8`.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self, now: Timestamp) {
        match self.tick_inner(now).await {
            Ok(enqueued) => {
                let mut stats = self.stats.lock();
                stats.ticks_total += 1;
                stats.videos_enqueued_total += enqueued as u64;
                stats.last_tick_at = Some(now);
                stats.last_error = None;
            }
            Err(e) => {
                warn!(error = %e, "subscription scan failed");
                let mut stats = self.stats.lock();
                stats.ticks_total += 1;
                stats.last_tick_at = Some(now);
                stats.last_error = Some(e.to_string());
            }
        }
    }

    async fn tick_inner(&self, now: Timestamp) -> Result<usize, base::Error> {
        // Step 1: resolve target users.
        let target_users = match &self.single_user {
            Some(u) => vec![u.clone()],
            None => self.upstream.get_all_users_with_subscriptions().await?,
        };

        // Step 2: union channel IDs across targets.
        let mut channel_ids: HashSet<String> = HashSet::new();
        for user in &target_users {
            for channel in self.upstream.get_subscriptions(user).await? {
                channel_ids.insert(channel);
            }
        }
        if channel_ids.is_empty() {
            return Ok(0);
        }
        let channel_ids: Vec<String> = channel_ids.into_iter().collect();

        // Step 3: quick-check.
        let last_seen = *self.last_seen.lock();
        let max_published = self.upstream.get_max_published_timestamp(&channel_ids).await?;
        if let (Some(max), Some(seen)) = (max_published, last_seen) {
            if max <= seen {
                return Ok(0);
            }
        }
        if max_published.is_none() {
            return Ok(0);
        }

        // Step 4.
        let published_after = last_seen.unwrap_or_else(|| {
            now.checked_sub(Span::new().hours(24)).unwrap_or(now)
        });
        let candidates = self
            .upstream
            .get_latest_videos(LatestVideosQuery {
                channel_ids,
                published_after: Some(published_after),
                exclude_live: self.exclude_live,
                exclude_premieres: self.exclude_premiere,
                min_duration_seconds: Some(self.min_duration_seconds),
                limit: self.max_videos_per_check,
            })
            .await?;

        let new_last_seen = candidates.iter().map(|v| v.published).max();

        // Step 5: filter.
        let downloaded: HashSet<String> = self
            .catalog
            .list_downloads()
            .map_err(base::Error::from)?
            .into_iter()
            .map(|d| d.video_id)
            .collect();
        let queued: HashSet<String> = self
            .catalog
            .list_queue()
            .map_err(base::Error::from)?
            .into_iter()
            .map(|q| q.video_id)
            .collect();
        let excluded_channels: HashSet<String> = self
            .catalog
            .list_exclusions()
            .map_err(base::Error::from)?
            .into_iter()
            .filter(|e| e.user_id.is_none())
            .map(|e| e.channel_id)
            .collect();
        let ctx = FilterContext {
            downloaded,
            queued,
            excluded_channels,
            min_duration_seconds: self.min_duration_seconds,
            exclude_live: self.exclude_live,
            exclude_premiere: self.exclude_premiere,
        };

        let mut survivors: Vec<_> = candidates.into_iter().filter(|v| filter_candidate(v, &ctx)).collect();
        // Step 6: already sorted published DESC by the upstream query, but
        // re-sort defensively since a fake implementation might not.
        survivors.sort_by(|a, b| b.published.cmp(&a.published));

        // Step 7: resolve owners and enqueue.
        let mut enqueued = 0usize;
        for video in &survivors {
            let owners = self.upstream.get_users_subscribed_to_channel(&video.channel_id).await?;
            if owners.is_empty() {
                continue;
            }
            let mut remaining = Vec::new();
            for owner in &owners {
                if !self
                    .catalog
                    .is_channel_excluded(&video.channel_id, owner)
                    .map_err(base::Error::from)?
                {
                    remaining.push(owner.clone());
                }
            }
            if remaining.is_empty() {
                continue;
            }
            match self.catalog.add_to_queue(
                AddToQueue {
                    video_id: video.video_id.clone(),
                    user_id: None,
                    priority: None,
                    source: Source::Subscription,
                    owner_user_ids: Some(remaining),
                },
                now,
            ) {
                Ok(_) => {
                    enqueued += 1;
                    self.notify.notify_one();
                }
                Err(e) => {
                    warn!(video_id = %video.video_id, error = %e, "failed to enqueue subscription video");
                }
            }
        }

        // Step 8: advance last-seen only after a successful scan.
        if let Some(new_seen) = new_last_seen {
            *self.last_seen.lock() = Some(new_seen);
        }
        info!(enqueued, candidates = survivors.len(), "subscription scan complete");
        Ok(enqueued)
    }

    pub async fn run_loop(
        self: Arc<Self>,
        tick_interval: std::time::Duration,
        cancel: CancellationToken,
        clocks: Arc<dyn base::clock::Clocks>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("subscription watcher shutting down");
                    return;
                }
                _ = tokio::time::sleep(tick_interval) => {}
                _ = self.notify.notified() => {}
            }
            self.tick(clocks.now()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamVideo;

    fn video(id: &str, channel: &str, published: &str, len: u32, live: bool, premiere: bool) -> UpstreamVideo {
        UpstreamVideo {
            video_id: id.to_string(),
            channel_id: channel.to_string(),
            title: format!("title-{id}"),
            published: published.parse().unwrap(),
            length_seconds: Some(len),
            live_now: live,
            premiere,
        }
    }

    #[test]
    fn filter_drops_already_downloaded() {
        let mut ctx = FilterContext::default();
        ctx.downloaded.insert("dQw4w9WgXcQ".to_string());
        let v = video("dQw4w9WgXcQ", "UC1", "2024-01-15T10:00:00Z", 300, false, false);
        assert!(!filter_candidate(&v, &ctx));
    }

    #[test]
    fn filter_drops_too_short_and_live() {
        let ctx = FilterContext {
            min_duration_seconds: 120,
            exclude_live: true,
            ..Default::default()
        };
        let too_short = video("aaaaaaaaaaa", "UC1", "2024-01-15T10:00:00Z", 60, false, false);
        assert!(!filter_candidate(&too_short, &ctx));
        let live = video("bbbbbbbbbbb", "UC1", "2024-01-15T10:00:00Z", 300, true, false);
        assert!(!filter_candidate(&live, &ctx));
    }

    #[test]
    fn filter_drops_channel_wide_excluded() {
        let mut ctx = FilterContext::default();
        ctx.excluded_channels.insert("UC1".to_string());
        let v = video("ddddddddddd", "UC1", "2024-01-15T10:00:00Z", 300, false, false);
        assert!(!filter_candidate(&v, &ctx));
        let other = video("eeeeeeeeeee", "UC2", "2024-01-15T10:00:00Z", 300, false, false);
        assert!(filter_candidate(&other, &ctx));
    }

    #[test]
    fn filter_keeps_ordinary_survivor() {
        let ctx = FilterContext {
            min_duration_seconds: 60,
            exclude_live: true,
            exclude_premiere: true,
            ..Default::default()
        };
        let v = video("ccccccccccc", "UC1", "2024-01-15T10:00:00Z", 300, false, false);
        assert!(filter_candidate(&v, &ctx));
    }

    #[tokio::test]
    async fn tick_enqueues_new_survivors_and_advances_last_seen() {
        use crate::upstream::fake::FakeUpstreamCatalog;
        use std::collections::HashMap;

        let catalog = db::testutil::test_catalog();
        let mut fake = FakeUpstreamCatalog::default();
        fake.subscriptions.insert("alice@example.com".to_string(), vec!["UC1".to_string()]);
        fake.channel_owners.insert("UC1".to_string(), vec!["alice@example.com".to_string()]);
        fake.videos.push(video("dQw4w9WgXcQ", "UC1", "2024-01-15T10:00:00Z", 300, false, false));
        let upstream = Arc::new(fake);

        let config = crate::config::Config {
            upstream_frontend_url: "http://upstream.example".parse().unwrap(),
            upstream_db_url: "/tmp/upstream.db".to_string(),
            companion_url: "http://companion.example".parse().unwrap(),
            companion_shared_secret: "s3cr3t".to_string(),
            videos_dir: std::env::temp_dir(),
            listen_port: 3001,
            single_user: None,
            quality_preference: crate::config::QualityPreference::Best,
            rate_limit_bytes_per_sec: 0,
            check_interval_minutes: 5,
            max_concurrent_downloads: 2,
            max_retry_attempts: 3,
            retry_base_delay_minutes: 1,
            cleanup_enabled: true,
            cleanup_age_days: 30,
            cleanup_interval_hours: 24,
            throttle_speed_threshold_bytes_per_sec: 0,
            throttle_detection_window_seconds: 30,
            throttle_max_retries: 3,
            min_duration_seconds: 60,
            exclude_live: true,
            exclude_premiere: true,
            max_videos_per_check: 50,
        };
        let watcher = Watcher::new(catalog.clone(), upstream, &config, Arc::new(tokio::sync::Notify::new()));

        let now: Timestamp = "2024-01-15T11:00:00Z".parse().unwrap();
        let enqueued = watcher.tick_inner(now).await.unwrap();
        assert_eq!(enqueued, 1);
        let item = catalog.get_queue_item("dQw4w9WgXcQ").unwrap();
        assert!(item.is_some());
        let _ = HashMap::<String, String>::new();
    }
}
