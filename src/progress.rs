// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! The in-memory active-download/progress map (`# 3. DATA MODEL`'s
//! `ActiveProgress`, never persisted). Shared between the pipeline (which
//! writes it) and the router's progress-snapshot endpoint (which reads it).

use base::Mutex;
use jiff::Timestamp;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    FetchingInfo,
    DownloadingVideo,
    DownloadingAudio,
    Muxing,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProgressSnapshot {
    pub video_id: String,
    pub title: String,
    pub phase: Phase,
    pub bytes: u64,
    pub total: Option<u64>,
    pub percentage: Option<f64>,
    pub speed_bytes_per_sec: f64,
    pub started_at: Timestamp,
}

struct Entry {
    title: String,
    phase: Phase,
    bytes: u64,
    total: Option<u64>,
    speed_bytes_per_sec: f64,
    started_at: Timestamp,
    cancel: CancellationToken,
}

impl Entry {
    fn snapshot(&self, video_id: &str) -> ProgressSnapshot {
        ProgressSnapshot {
            video_id: video_id.to_string(),
            title: self.title.clone(),
            phase: self.phase,
            bytes: self.bytes,
            total: self.total,
            percentage: self
                .total
                .filter(|&t| t > 0)
                .map(|t| (self.bytes as f64 / t as f64) * 100.0),
            speed_bytes_per_sec: self.speed_bytes_per_sec,
            started_at: self.started_at,
        }
    }
}

/// Thread-safe registry of in-flight downloads. One entry per videoId,
/// created when the pipeline starts and removed at terminal state.
#[derive(Clone, Default)]
pub struct ActiveDownloads(Arc<Mutex<HashMap<String, Entry>>>);

impl ActiveDownloads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `video_id` as starting, returning a cancellation token the
    /// pipeline must check at every suspension point and that the router's
    /// cancel endpoint can trigger.
    pub fn start(&self, video_id: &str, title: String, now: Timestamp) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.0.lock().insert(
            video_id.to_string(),
            Entry {
                title,
                phase: Phase::FetchingInfo,
                bytes: 0,
                total: None,
                speed_bytes_per_sec: 0.0,
                started_at: now,
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    pub fn set_phase(&self, video_id: &str, phase: Phase) {
        if let Some(e) = self.0.lock().get_mut(video_id) {
            e.phase = phase;
        }
    }

    pub fn update(&self, video_id: &str, bytes: u64, total: Option<u64>, speed_bytes_per_sec: f64) {
        if let Some(e) = self.0.lock().get_mut(video_id) {
            e.bytes = bytes;
            e.total = total;
            e.speed_bytes_per_sec = speed_bytes_per_sec;
        }
    }

    pub fn finish(&self, video_id: &str) {
        self.0.lock().remove(video_id);
    }

    /// Requests cancellation of an in-flight download; returns `true` if
    /// one was found.
    pub fn cancel(&self, video_id: &str) -> bool {
        match self.0.lock().get(video_id) {
            Some(e) => {
                e.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn snapshot_all(&self) -> Vec<ProgressSnapshot> {
        self.0
            .lock()
            .iter()
            .map(|(id, e)| e.snapshot(id))
            .collect()
    }

    pub fn snapshot_one(&self, video_id: &str) -> Option<ProgressSnapshot> {
        self.0.lock().get(video_id).map(|e| e.snapshot(video_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Timestamp {
        "2024-01-15T10:00:00Z".parse().unwrap()
    }

    #[test]
    fn start_update_finish_round_trip() {
        let active = ActiveDownloads::new();
        let _cancel = active.start("dQw4w9WgXcQ", "Title".to_string(), now());
        active.update("dQw4w9WgXcQ", 500, Some(1000), 123.4);
        let snap = active.snapshot_one("dQw4w9WgXcQ").unwrap();
        assert_eq!(snap.bytes, 500);
        assert_eq!(snap.percentage, Some(50.0));
        active.finish("dQw4w9WgXcQ");
        assert!(active.snapshot_one("dQw4w9WgXcQ").is_none());
    }

    #[test]
    fn cancel_signals_token() {
        let active = ActiveDownloads::new();
        let cancel = active.start("dQw4w9WgXcQ", "Title".to_string(), now());
        assert!(active.cancel("dQw4w9WgXcQ"));
        assert!(cancel.is_cancelled());
        assert!(!active.cancel("unknown_id"));
    }
}
