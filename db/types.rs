// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// Where a download or queue item originated.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Subscription,
    Manual,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Subscription => "subscription",
            Source::Manual => "manual",
        }
    }
}

impl std::str::FromStr for Source {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscription" => Ok(Source::Subscription),
            "manual" => Ok(Source::Manual),
            _ => Err(crate::Error::new(
                crate::ErrorKind::Unknown,
                format!("invalid source: {s}"),
            )),
        }
    }
}

/// Lifecycle state of a [`QueueItem`]. Terminal states are `Completed`,
/// `Failed`, and `Cancelled`; `clearCompleted` removes rows in those states.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Downloading,
    Muxing,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Downloading => "downloading",
            QueueStatus::Muxing => "muxing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Cancelled
        )
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => QueueStatus::Pending,
            "downloading" => QueueStatus::Downloading,
            "muxing" => QueueStatus::Muxing,
            "completed" => QueueStatus::Completed,
            "failed" => QueueStatus::Failed,
            "cancelled" => QueueStatus::Cancelled,
            _ => {
                return Err(crate::Error::new(
                    crate::ErrorKind::Unknown,
                    format!("invalid queue status: {s}"),
                ))
            }
        })
    }
}

/// Per-stream and container metadata recorded for a completed download.
/// Stored as a JSON blob; not queried on, only round-tripped.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DownloadMetadata {
    pub author: Option<String>,
    pub description: Option<String>,
    pub video_itag: Option<i32>,
    pub audio_itag: Option<i32>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub video_mime_type: Option<String>,
    pub audio_mime_type: Option<String>,
    pub video_bitrate_bps: Option<i64>,
    pub audio_bitrate_bps: Option<i64>,
    pub video_content_length: Option<i64>,
    pub audio_content_length: Option<i64>,
    pub audio_container_ext: Option<String>,
}

/// One per successfully completed video (spec invariant 3: its existence
/// implies files existed on disk as of `downloaded_at`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Download {
    pub video_id: String,
    pub channel_id: Option<String>,
    pub title: String,
    pub duration_seconds: Option<i64>,
    pub quality: Option<String>,
    pub file_path: String,
    pub thumbnail_path: Option<String>,
    pub metadata: DownloadMetadata,
    pub file_size_bytes: i64,
    pub downloaded_at: Timestamp,
    pub source: Source,
    pub files_deleted_at: Option<Timestamp>,
}

/// Fields needed to record a newly completed download; `downloaded_at` is
/// assigned by the catalog from the clock passed to [`crate::Catalog::add_download`].
#[derive(Clone, Debug)]
pub struct DownloadInput {
    pub video_id: String,
    pub channel_id: Option<String>,
    pub title: String,
    pub duration_seconds: Option<i64>,
    pub quality: Option<String>,
    pub file_path: String,
    pub thumbnail_path: Option<String>,
    pub metadata: DownloadMetadata,
    pub file_size_bytes: i64,
    pub source: Source,
}

/// One per outstanding or terminal download request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub video_id: String,
    pub user_id: Option<String>,
    pub priority: i32,
    pub status: QueueStatus,
    pub error_message: Option<String>,
    pub queued_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub retry_count: i32,
    pub next_retry_at: Option<Timestamp>,
    pub throttle_retry_count: i32,
    pub source: Source,
}

/// Per (video, user) ownership fact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VideoUserStatus {
    pub video_id: String,
    pub user_id: String,
    pub is_owner: bool,
    pub keep_forever: bool,
    pub deleted_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

/// Per (channel, user?) mute; `user_id` of `None` excludes the channel for
/// every user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelExclusion {
    pub channel_id: String,
    pub user_id: Option<String>,
    pub created_at: Timestamp,
}
