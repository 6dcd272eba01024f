// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! The download pipeline (C6): per-video orchestration from a claimed
//! `QueueItem` through fetch, mux, and catalog record. One pipeline run
//! owns exactly one videoId at a time, the way `db::writer`'s `Syncer`
//! owns exactly one sample file directory — its own task, its own
//! terminal-state bookkeeping, no shared mutable state besides what's
//! threaded in explicitly.

use crate::companion::{self, CompanionClient, SelectedStreams};
use crate::config::{Config, QualityPreference};
use crate::error::DownloadError;
use crate::fetcher::{self, FetchOptions, ThrottleConfig};
use crate::filename::sanitize_filename;
use crate::muxer::{MuxOptions, MuxerDriver};
use crate::progress::{ActiveDownloads, Phase};
use db::{Catalog, DownloadInput, DownloadMetadata, QueueItem};
use jiff::Timestamp;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What the pipeline run produced, for the queue processor's "on return"
/// dispatch in `## 4.7`.
pub enum PipelineOutcome {
    Completed,
    /// Sustained throttle was detected; caller decides whether this
    /// consumes the throttle-retry budget or falls through to the
    /// ordinary failure classifier.
    Throttled,
    /// The pipeline already reset the row to `pending` itself (the
    /// `startFresh` case in `## 4.6` step 5) and nothing further is owed.
    RestartedWithoutRetry,
    Failed(String),
}

pub struct Pipeline {
    pub catalog: Catalog,
    pub companion: Arc<CompanionClient>,
    pub http: reqwest::Client,
    pub muxer: Arc<MuxerDriver>,
    pub videos_dir: PathBuf,
    pub quality_preference: QualityPreference,
    pub rate_limit_bytes_per_sec: u64,
    pub throttle: Option<ThrottleConfig>,
    pub active: ActiveDownloads,
}

impl Pipeline {
    pub fn new(config: &Config, catalog: Catalog, companion: Arc<CompanionClient>, muxer: Arc<MuxerDriver>, active: ActiveDownloads) -> Self {
        let throttle = if config.throttle_speed_threshold_bytes_per_sec > 0 {
            Some(ThrottleConfig {
                speed_threshold_bytes_per_sec: config.throttle_speed_threshold_bytes_per_sec,
                detection_window: std::time::Duration::from_secs(
                    config.throttle_detection_window_seconds as u64,
                ),
            })
        } else {
            None
        };
        Pipeline {
            catalog,
            companion,
            http: reqwest::Client::new(),
            muxer,
            videos_dir: config.videos_dir.clone(),
            quality_preference: config.quality_preference,
            rate_limit_bytes_per_sec: config.rate_limit_bytes_per_sec,
            throttle,
            active,
        }
    }

    fn video_tmp(&self, video_id: &str) -> PathBuf {
        self.videos_dir.join(format!("{video_id}_video.tmp"))
    }

    fn audio_tmp(&self, video_id: &str) -> PathBuf {
        self.videos_dir.join(format!("{video_id}_audio.tmp"))
    }

    fn muxed_path(&self, video_id: &str) -> PathBuf {
        self.videos_dir.join(format!("{video_id}.mp4"))
    }

    fn thumbnail_path(&self, video_id: &str) -> PathBuf {
        self.videos_dir.join(format!("{video_id}.webp"))
    }

    fn metadata_sidecar_path(&self, video_id: &str) -> PathBuf {
        self.videos_dir.join(format!("{video_id}.json"))
    }

    /// Best-effort thumbnail fetch: a missing or unreachable thumbnail
    /// URL never fails the download, since `cached::get_cached_streams`
    /// treats the file as simply absent.
    async fn fetch_thumbnail(&self, video_id: &str, url: Option<&str>) -> Option<PathBuf> {
        let url = url?;
        let resp = match self.http.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(video_id, error = %e, "thumbnail fetch failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            warn!(video_id, status = %resp.status(), "thumbnail fetch returned non-success status");
            return None;
        }
        let bytes = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!(video_id, error = %e, "failed to read thumbnail response body");
                return None;
            }
        };
        let path = self.thumbnail_path(video_id);
        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            warn!(video_id, error = %e, "failed to write thumbnail to disk");
            return None;
        }
        Some(path)
    }

    /// Writes a JSON sidecar alongside the muxed file so `cached`'s scan
    /// and the downloader API can surface title/author/quality metadata
    /// without a catalog round-trip.
    async fn write_metadata_sidecar(&self, video_id: &str, info: &companion::VideoInfo, metadata: &DownloadMetadata) {
        let sidecar = MetadataSidecar {
            video_id,
            title: &info.title,
            sanitized_title: sanitize_filename(&info.title),
            author: &info.author,
            channel_id: &info.channel_id,
            duration_seconds: info.length_seconds,
            metadata,
        };
        let bytes = match serde_json::to_vec_pretty(&sidecar) {
            Ok(b) => b,
            Err(e) => {
                warn!(video_id, error = %e, "failed to serialize metadata sidecar");
                return;
            }
        };
        if let Err(e) = tokio::fs::write(self.metadata_sidecar_path(video_id), bytes).await {
            warn!(video_id, error = %e, "failed to write metadata sidecar to disk");
        }
    }

    /// A cached elementary stream, persisted so the synthesized manifest
    /// (`## 4.10` step 5, via C11) and direct per-itag playback
    /// (`## 4.10` step 6) have a file to point at.
    fn video_stream_path(&self, video_id: &str, itag: i32, ext: &str) -> PathBuf {
        self.videos_dir.join(format!("{video_id}_video_{itag}.{ext}"))
    }

    fn audio_stream_path(&self, video_id: &str, itag: i32, ext: &str) -> PathBuf {
        self.videos_dir.join(format!("{video_id}_audio_{itag}.{ext}"))
    }

    async fn delete_tmp_files(&self, video_id: &str) {
        for path in [self.video_tmp(video_id), self.audio_tmp(video_id)] {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }

    /// Runs the full pipeline for `item`, which the caller has already
    /// transitioned to `downloading` (the claim is C7's linearization
    /// point, not this function's).
    #[tracing::instrument(skip(self, item, cancel), fields(video_id = %item.video_id))]
    pub async fn run(&self, item: &QueueItem, cancel: &CancellationToken, now: Timestamp) -> PipelineOutcome {
        let video_id = item.video_id.clone();
        let _cancel_guard = self.active.start(&video_id, video_id.clone(), now);

        let info = match self.companion.get_video_info(&video_id).await {
            Ok(i) => i,
            Err(e) => return PipelineOutcome::Failed(e.to_string()),
        };
        self.active.update(&video_id, 0, None, 0.0);

        let selected = match companion::select_best_streams(&info, self.quality_preference) {
            Some(s) => s,
            None => return PipelineOutcome::Failed("No suitable streams found".to_string()),
        };

        let result = match selected {
            SelectedStreams::Separate { video, audio } => {
                self.run_separate(&video_id, &info, &video, &audio, cancel).await
            }
            SelectedStreams::Combined(fmt) => self.run_combined(&video_id, &info, &fmt, cancel).await,
        };

        let outcome = match result {
            Ok((file_path, file_size, quality, metadata)) => {
                self.active.set_phase(&video_id, Phase::Muxing);
                let thumbnail_path = self.fetch_thumbnail(&video_id, info.thumbnail_url.as_deref()).await;
                self.write_metadata_sidecar(&video_id, &info, &metadata).await;
                match self.catalog.add_download(
                    DownloadInput {
                        video_id: video_id.clone(),
                        channel_id: Some(info.channel_id.clone()),
                        title: info.title.clone(),
                        duration_seconds: Some(info.length_seconds as i64),
                        quality: Some(quality),
                        file_path: file_path.display().to_string(),
                        thumbnail_path: thumbnail_path.map(|p| p.display().to_string()),
                        metadata,
                        file_size_bytes: file_size as i64,
                        source: item.source,
                    },
                    now,
                ) {
                    Ok(_) => PipelineOutcome::Completed,
                    Err(e) => PipelineOutcome::Failed(e.to_string()),
                }
            }
            Err(DownloadError::Throttled) => PipelineOutcome::Throttled,
            Err(DownloadError::StartFresh) => {
                self.delete_tmp_files(&video_id).await;
                if let Err(e) = self.catalog.update_queue_status(&video_id, db::QueueStatus::Pending, None, now) {
                    warn!(error = %e, "failed to reset queue row to pending after startFresh");
                }
                PipelineOutcome::RestartedWithoutRetry
            }
            Err(e) => {
                self.delete_tmp_files(&video_id).await;
                PipelineOutcome::Failed(e.to_string())
            }
        };

        self.active.finish(&video_id);
        outcome
    }

    async fn run_separate(
        &self,
        video_id: &str,
        info: &companion::VideoInfo,
        video: &companion::Format,
        audio: &companion::Format,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, u64, String, DownloadMetadata), DownloadError> {
        let video_tmp = self.video_tmp(video_id);
        let audio_tmp = self.audio_tmp(video_id);

        let video_nonempty = tokio::fs::metadata(&video_tmp).await.map(|m| m.len() > 0).unwrap_or(false);
        let audio_nonempty = tokio::fs::metadata(&audio_tmp).await.map(|m| m.len() > 0).unwrap_or(false);
        let resume = video_nonempty || audio_nonempty;
        if resume {
            info!(video_id, "resuming partial download");
        }

        self.active.set_phase(video_id, Phase::DownloadingVideo);
        let opts = FetchOptions {
            rate_limit_bytes_per_sec: self.rate_limit_bytes_per_sec,
            resume,
            throttle: self.throttle,
        };
        let active = self.active.clone();
        let vid_owned = video_id.to_string();
        let sink = move |bytes: u64, total: Option<u64>, speed: f64| {
            active.update(&vid_owned, bytes, total, speed);
        };
        fetcher::download_to_file(&self.http, &video.url, &video_tmp, &opts, cancel, &sink).await?;

        self.active.set_phase(video_id, Phase::DownloadingAudio);
        let active = self.active.clone();
        let vid_owned = video_id.to_string();
        let sink = move |bytes: u64, total: Option<u64>, speed: f64| {
            active.update(&vid_owned, bytes, total, speed);
        };
        fetcher::download_to_file(&self.http, &audio.url, &audio_tmp, &opts, cancel, &sink).await?;

        self.active.set_phase(video_id, Phase::Muxing);
        let output = self.muxed_path(video_id);
        let (_, probe) = self
            .muxer
            .mux(&MuxOptions {
                video_path: video_tmp.clone(),
                audio_path: audio_tmp.clone(),
                output_path: output.clone(),
                copy_streams: true,
                faststart: true,
                overwrite: true,
            })
            .await?;
        let video_ext = ext_for_mime_type(&video.mime_type);
        let audio_ext = ext_for_mime_type(&audio.mime_type);
        let video_stream = self.video_stream_path(video_id, video.itag, video_ext);
        let audio_stream = self.audio_stream_path(video_id, audio.itag, audio_ext);
        tokio::fs::rename(&video_tmp, &video_stream).await.map_err(DownloadError::Filesystem)?;
        tokio::fs::rename(&audio_tmp, &audio_stream).await.map_err(DownloadError::Filesystem)?;

        let file_size = tokio::fs::metadata(&output)
            .await
            .map(|m| m.len())
            .map_err(DownloadError::Filesystem)?;
        let quality = video.height.map(|h| format!("{h}p")).unwrap_or_else(|| "unknown".to_string());
        let metadata = DownloadMetadata {
            author: Some(info.author.clone()),
            description: None,
            video_itag: Some(video.itag),
            audio_itag: Some(audio.itag),
            width: video.width,
            height: video.height,
            video_mime_type: Some(video.mime_type.clone()),
            audio_mime_type: Some(audio.mime_type.clone()),
            video_bitrate_bps: video.bitrate,
            audio_bitrate_bps: audio.bitrate,
            video_content_length: video.content_length,
            audio_content_length: audio.content_length,
            audio_container_ext: Some(audio_ext.to_string()),
        };
        let _ = probe.duration_seconds;
        Ok((output, file_size, quality, metadata))
    }

    async fn run_combined(
        &self,
        video_id: &str,
        info: &companion::VideoInfo,
        fmt: &companion::Format,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, u64, String, DownloadMetadata), DownloadError> {
        let tmp = self.video_tmp(video_id);
        let resume = tokio::fs::metadata(&tmp).await.map(|m| m.len() > 0).unwrap_or(false);

        self.active.set_phase(video_id, Phase::DownloadingVideo);
        let opts = FetchOptions {
            rate_limit_bytes_per_sec: self.rate_limit_bytes_per_sec,
            resume,
            throttle: self.throttle,
        };
        let active = self.active.clone();
        let vid_owned = video_id.to_string();
        let sink = move |bytes: u64, total: Option<u64>, speed: f64| {
            active.update(&vid_owned, bytes, total, speed);
        };
        fetcher::download_to_file(&self.http, &fmt.url, &tmp, &opts, cancel, &sink).await?;

        self.active.set_phase(video_id, Phase::Muxing);
        let output = self.muxed_path(video_id);
        let (_, probe) = self.muxer.convert(&tmp, &output).await?;

        let combined_ext = ext_for_mime_type(&fmt.mime_type);
        let combined_stream = self.video_stream_path(video_id, fmt.itag, combined_ext);
        tokio::fs::rename(&tmp, &combined_stream).await.map_err(DownloadError::Filesystem)?;

        let file_size = tokio::fs::metadata(&output)
            .await
            .map(|m| m.len())
            .map_err(DownloadError::Filesystem)?;
        let quality = fmt.height.map(|h| format!("{h}p")).unwrap_or_else(|| "unknown".to_string());
        let metadata = DownloadMetadata {
            author: Some(info.author.clone()),
            description: None,
            video_itag: Some(fmt.itag),
            audio_itag: None,
            width: fmt.width,
            height: fmt.height,
            video_mime_type: Some(fmt.mime_type.clone()),
            audio_mime_type: None,
            video_bitrate_bps: fmt.bitrate,
            audio_bitrate_bps: None,
            video_content_length: fmt.content_length,
            audio_content_length: None,
            audio_container_ext: None,
        };
        let _ = probe.duration_seconds;
        Ok((output, file_size, quality, metadata))
    }
}

/// On-disk shape of `{videoId}.json`, read back by `cached::get_cached_streams`.
#[derive(serde::Serialize)]
struct MetadataSidecar<'a> {
    video_id: &'a str,
    title: &'a str,
    sanitized_title: String,
    author: &'a str,
    channel_id: &'a str,
    duration_seconds: u32,
    metadata: &'a DownloadMetadata,
}

/// Helper for tests/callers that want a trivial `Path` existence check
/// without going through `tokio::fs`.
#[allow(dead_code)]
fn exists(p: &Path) -> bool {
    p.exists()
}

/// File extension for a persisted elementary stream, derived from its
/// `mimeType` (`## 6`'s on-disk layout names these `{id}_video_{itag}.{ext}`).
fn ext_for_mime_type(mime_type: &str) -> &'static str {
    let base = mime_type.split(';').next().unwrap_or(mime_type).trim();
    match base {
        "video/mp4" => "mp4",
        "audio/mp4" => "m4a",
        "video/webm" => "webm",
        "audio/webm" => "webm",
        _ => "bin",
    }
}
