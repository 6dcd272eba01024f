// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! Request/response bodies for the control-plane API (`## 4.1`, `## 4.10`).
//! Catalog rows ([`db::QueueItem`], [`db::Download`], ...) already derive
//! `Serialize`/`Deserialize` and are returned as-is; this module only holds
//! the request shapes and the thin wrappers those rows don't cover.

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct AddQueueRequest {
    pub video_id: String,
    pub priority: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct AddExclusionRequest {
    pub channel_id: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub queue_depth: usize,
    pub downloads_total: usize,
    pub watcher_ticks_total: u64,
    pub watcher_videos_enqueued_total: u64,
    pub watcher_last_error: Option<String>,
    pub eviction_runs_total: u64,
    pub eviction_last_deleted: u64,
    pub eviction_last_freed_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub downloads: Vec<crate::progress::ProgressSnapshot>,
}
