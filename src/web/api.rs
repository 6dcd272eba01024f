// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! The control-plane API (`## 4.1`, `## 4.10` step 2): thin shells over
//! the catalog and the in-memory watcher/eviction/progress state. Every
//! handler here takes the already-decoded `/api/downloader/` suffix plus
//! the HTTP method and returns a response; it never touches the route
//! table itself.

use crate::body::{self, Body};
use crate::cached;
use crate::eviction::EvictionStats;
use crate::json::{AddExclusionRequest, AddQueueRequest, ErrorResponse, HealthResponse, ProgressResponse, StatsResponse};
use crate::progress::ActiveDownloads;
use crate::watcher::WatcherStats;
use crate::web::path::is_valid_video_id;
use bytes::Bytes;
use db::{AddToQueue, Catalog, Source};
use http::{Method, Response, StatusCode};
use jiff::Timestamp;

pub(super) struct Context<'a> {
    pub catalog: &'a Catalog,
    pub active: &'a ActiveDownloads,
    pub videos_dir: &'a std::path::Path,
    pub watcher_stats: WatcherStats,
    pub eviction_stats: EvictionStats,
    pub now: Timestamp,
}

fn json_response(status: StatusCode, body: impl serde::Serialize) -> Response<Body> {
    let payload = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(crate::body::full(Bytes::from(payload)))
        .expect("hardcoded response should be valid")
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    json_response(status, ErrorResponse { error: message.into() })
}

fn not_found(message: impl Into<String>) -> Response<Body> {
    error_response(StatusCode::NOT_FOUND, message)
}

fn bad_request(message: impl Into<String>) -> Response<Body> {
    error_response(StatusCode::BAD_REQUEST, message)
}

fn from_base_error(e: base::Error) -> Response<Body> {
    let status = match e.kind() {
        base::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        base::ErrorKind::InvalidArgument | base::ErrorKind::OutOfRange => StatusCode::BAD_REQUEST,
        base::ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}

/// Dispatches one request to `/api/downloader/{suffix}`.
pub(super) async fn dispatch(ctx: Context<'_>, method: &Method, suffix: &str, uri: &http::Uri, body: Bytes) -> Response<Body> {
    let segments: Vec<&str> = suffix.split('/').filter(|s| !s.is_empty()).collect();
    match (method.as_str(), segments.as_slice()) {
        ("GET", ["status"]) => status(&ctx),
        ("GET", ["stats"]) => stats(&ctx),
        ("GET", ["progress"]) => progress(&ctx),
        ("GET", ["queue"]) => list_queue(&ctx),
        ("POST", ["queue"]) => add_queue(&ctx, body),
        ("DELETE", ["queue"]) => clear_queue(&ctx),
        ("DELETE", ["queue", video_id]) => cancel_queue(&ctx, video_id),
        ("POST", ["queue", video_id, "retry"]) => retry_queue(&ctx, video_id),
        ("GET", ["downloads"]) => list_downloads(&ctx),
        ("DELETE", ["downloads", video_id]) => {
            let user_id = super::query_param(uri, "userId");
            let purge = super::query_param(uri, "purge").as_deref() == Some("true");
            delete_download(&ctx, video_id, user_id.as_deref(), purge)
        }
        ("GET", ["exclusions"]) => list_exclusions(&ctx),
        ("POST", ["exclusions"]) => add_exclusion(&ctx, body),
        ("DELETE", ["exclusions", channel_id]) => remove_exclusion(&ctx, channel_id),
        _ => not_found(format!("no such route: {} /api/downloader/{}", method, suffix)),
    }
}

fn status(_ctx: &Context<'_>) -> Response<Body> {
    json_response(StatusCode::OK, HealthResponse { status: "ok" })
}

fn stats(ctx: &Context<'_>) -> Response<Body> {
    let queue_depth = match ctx.catalog.list_queue() {
        Ok(items) => items.iter().filter(|i| !i.status.is_terminal()).count(),
        Err(e) => return from_base_error(e.into()),
    };
    let downloads_total = match ctx.catalog.list_downloads() {
        Ok(d) => d.len(),
        Err(e) => return from_base_error(e.into()),
    };
    json_response(
        StatusCode::OK,
        StatsResponse {
            queue_depth,
            downloads_total,
            watcher_ticks_total: ctx.watcher_stats.ticks_total,
            watcher_videos_enqueued_total: ctx.watcher_stats.videos_enqueued_total,
            watcher_last_error: ctx.watcher_stats.last_error.clone(),
            eviction_runs_total: ctx.eviction_stats.runs_total,
            eviction_last_deleted: ctx.eviction_stats.last_deleted,
            eviction_last_freed_bytes: ctx.eviction_stats.last_freed_bytes,
        },
    )
}

fn progress(ctx: &Context<'_>) -> Response<Body> {
    json_response(
        StatusCode::OK,
        ProgressResponse {
            downloads: ctx.active.snapshot_all(),
        },
    )
}

fn list_queue(ctx: &Context<'_>) -> Response<Body> {
    match ctx.catalog.list_queue() {
        Ok(items) => json_response(StatusCode::OK, items),
        Err(e) => from_base_error(e.into()),
    }
}

fn add_queue(ctx: &Context<'_>, body: Bytes) -> Response<Body> {
    let req: AddQueueRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return bad_request(format!("invalid request body: {e}")),
    };
    if !is_valid_video_id(&req.video_id) {
        return bad_request(format!("invalid video id: {}", req.video_id));
    }
    match ctx.catalog.get_queue_item(&req.video_id) {
        Ok(Some(_)) => return error_response(StatusCode::CONFLICT, "video already queued"),
        Ok(None) => {}
        Err(e) => return from_base_error(e.into()),
    }
    let item = ctx.catalog.add_to_queue(
        AddToQueue {
            video_id: req.video_id,
            user_id: None,
            priority: req.priority,
            source: Source::Manual,
            owner_user_ids: None,
        },
        ctx.now,
    );
    match item {
        Ok(item) => json_response(StatusCode::CREATED, item),
        Err(e) => from_base_error(e.into()),
    }
}

fn clear_queue(ctx: &Context<'_>) -> Response<Body> {
    match ctx.catalog.clear_completed() {
        Ok(removed) => json_response(StatusCode::OK, serde_json::json!({ "removed": removed })),
        Err(e) => from_base_error(e.into()),
    }
}

fn cancel_queue(ctx: &Context<'_>, video_id: &str) -> Response<Body> {
    if !is_valid_video_id(video_id) {
        return bad_request(format!("invalid video id: {video_id}"));
    }
    let existing = match ctx.catalog.get_queue_item(video_id) {
        Ok(Some(item)) => item,
        Ok(None) => return not_found(format!("no queue item for {video_id}")),
        Err(e) => return from_base_error(e.into()),
    };
    if existing.status.is_terminal() {
        return json_response(StatusCode::OK, existing);
    }
    ctx.active.cancel(video_id);
    if let Err(e) = ctx.catalog.update_queue_status(video_id, db::QueueStatus::Cancelled, None, ctx.now) {
        return from_base_error(e.into());
    }
    match ctx.catalog.get_queue_item(video_id) {
        Ok(Some(item)) => json_response(StatusCode::OK, item),
        Ok(None) => not_found(format!("no queue item for {video_id}")),
        Err(e) => from_base_error(e.into()),
    }
}

/// `resetRetryCount`: clears a failed item's retry/throttle counters and
/// gives it another shot at the front of the ordinary retry gate, without
/// otherwise touching its status.
fn retry_queue(ctx: &Context<'_>, video_id: &str) -> Response<Body> {
    if !is_valid_video_id(video_id) {
        return bad_request(format!("invalid video id: {video_id}"));
    }
    match ctx.catalog.get_queue_item(video_id) {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(format!("no queue item for {video_id}")),
        Err(e) => return from_base_error(e.into()),
    }
    if let Err(e) = ctx.catalog.reset_retry_count(video_id) {
        return from_base_error(e.into());
    }
    match ctx.catalog.get_queue_item(video_id) {
        Ok(Some(item)) => json_response(StatusCode::OK, item),
        Ok(None) => not_found(format!("no queue item for {video_id}")),
        Err(e) => from_base_error(e.into()),
    }
}

fn list_downloads(ctx: &Context<'_>) -> Response<Body> {
    match ctx.catalog.list_downloads() {
        Ok(downloads) => json_response(StatusCode::OK, downloads),
        Err(e) => from_base_error(e.into()),
    }
}

/// `DELETE /api/downloader/downloads/:videoId`: by default soft-deletes,
/// setting `deletedAt` on the caller's (`userId` query parameter)
/// `VideoUserStatus` row — files are left alone and reclaimed only once
/// `## 4.9`'s eviction sweep finds no owner left, the same "watched by all
/// owners" protection it already implements. Passing `?purge=true`
/// bypasses that and hard-deletes the cached files immediately, mirroring
/// the eviction sweep's own per-candidate cleanup on direct operator
/// request.
fn delete_download(ctx: &Context<'_>, video_id: &str, user_id: Option<&str>, purge: bool) -> Response<Body> {
    if !is_valid_video_id(video_id) {
        return bad_request(format!("invalid video id: {video_id}"));
    }

    if purge {
        let download = match ctx.catalog.get_download(video_id) {
            Ok(Some(d)) => d,
            Ok(None) => return not_found(format!("no download for {video_id}")),
            Err(e) => return from_base_error(e.into()),
        };

        let _ = std::fs::remove_file(&download.file_path);
        if let Some(thumb) = &download.thumbnail_path {
            let _ = std::fs::remove_file(thumb);
        }
        let _ = std::fs::remove_file(ctx.videos_dir.join(format!("{video_id}.json")));
        let streams = cached::get_cached_streams(ctx.videos_dir, video_id);
        for stream in streams.video.iter().chain(streams.audio.iter()) {
            let _ = std::fs::remove_file(&stream.path);
        }

        if let Err(e) = ctx.catalog.mark_files_deleted(video_id, ctx.now) {
            return from_base_error(e.into());
        }
        return json_response(StatusCode::OK, serde_json::json!({ "videoId": video_id, "purged": true }));
    }

    let Some(user_id) = user_id else {
        return bad_request("userId query parameter is required to delete a download");
    };
    if let Err(e) = ctx.catalog.soft_delete_user_download(video_id, user_id, ctx.now) {
        return from_base_error(e.into());
    }
    json_response(
        StatusCode::OK,
        serde_json::json!({ "videoId": video_id, "userId": user_id, "deleted": true }),
    )
}

fn list_exclusions(ctx: &Context<'_>) -> Response<Body> {
    match ctx.catalog.list_exclusions() {
        Ok(exclusions) => json_response(StatusCode::OK, exclusions),
        Err(e) => from_base_error(e.into()),
    }
}

fn add_exclusion(ctx: &Context<'_>, body: Bytes) -> Response<Body> {
    let req: AddExclusionRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return bad_request(format!("invalid request body: {e}")),
    };
    match ctx.catalog.add_exclusion(&req.channel_id, req.user_id.as_deref(), ctx.now) {
        Ok(()) => json_response(StatusCode::CREATED, serde_json::json!({ "channelId": req.channel_id })),
        Err(e) => from_base_error(e.into()),
    }
}

fn remove_exclusion(ctx: &Context<'_>, channel_id: &str) -> Response<Body> {
    match ctx.catalog.remove_exclusion(channel_id, None) {
        Ok(()) => json_response(StatusCode::OK, serde_json::json!({ "channelId": channel_id })),
        Err(e) => from_base_error(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(catalog: &Catalog, active: &ActiveDownloads, dir: &std::path::Path) -> Context<'_> {
        Context {
            catalog,
            active,
            videos_dir: dir,
            watcher_stats: WatcherStats::default(),
            eviction_stats: EvictionStats::default(),
            now: db::testutil::test_now(),
        }
    }

    fn uri(path_and_query: &str) -> http::Uri {
        path_and_query.parse().unwrap()
    }

    #[tokio::test]
    async fn add_then_duplicate_add_conflicts() {
        let catalog = db::testutil::test_catalog();
        let active = ActiveDownloads::new();
        let dir = tempfile::tempdir().unwrap();

        let body = Bytes::from(r#"{"videoId":"dQw4w9WgXcQ"}"#);
        let resp = dispatch(ctx(&catalog, &active, dir.path()), &Method::POST, "queue", &uri("/queue"), body.clone()).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = dispatch(ctx(&catalog, &active, dir.path()), &Method::POST, "queue", &uri("/queue"), body).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn cancel_unknown_queue_item_is_404() {
        let catalog = db::testutil::test_catalog();
        let active = ActiveDownloads::new();
        let dir = tempfile::tempdir().unwrap();
        let resp = dispatch(
            ctx(&catalog, &active, dir.path()),
            &Method::DELETE,
            "queue/dQw4w9WgXcQ",
            &uri("/queue/dQw4w9WgXcQ"),
            Bytes::new(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_enqueued_item_marks_cancelled() {
        let catalog = db::testutil::test_catalog();
        let active = ActiveDownloads::new();
        let dir = tempfile::tempdir().unwrap();
        let body = Bytes::from(r#"{"videoId":"dQw4w9WgXcQ"}"#);
        dispatch(ctx(&catalog, &active, dir.path()), &Method::POST, "queue", &uri("/queue"), body).await;

        let resp = dispatch(
            ctx(&catalog, &active, dir.path()),
            &Method::DELETE,
            "queue/dQw4w9WgXcQ",
            &uri("/queue/dQw4w9WgXcQ"),
            Bytes::new(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let item = catalog.get_queue_item("dQw4w9WgXcQ").unwrap().unwrap();
        assert_eq!(item.status, db::QueueStatus::Cancelled);
    }

    #[tokio::test]
    async fn retry_resets_failed_item_to_pending() {
        let catalog = db::testutil::test_catalog();
        let active = ActiveDownloads::new();
        let dir = tempfile::tempdir().unwrap();
        let body = Bytes::from(r#"{"videoId":"dQw4w9WgXcQ"}"#);
        dispatch(ctx(&catalog, &active, dir.path()), &Method::POST, "queue", &uri("/queue"), body).await;
        catalog
            .update_queue_status("dQw4w9WgXcQ", db::QueueStatus::Failed, Some("boom"), db::testutil::test_now())
            .unwrap();

        let resp = dispatch(
            ctx(&catalog, &active, dir.path()),
            &Method::POST,
            "queue/dQw4w9WgXcQ/retry",
            &uri("/queue/dQw4w9WgXcQ/retry"),
            Bytes::new(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let item = catalog.get_queue_item("dQw4w9WgXcQ").unwrap().unwrap();
        assert_eq!(item.status, db::QueueStatus::Pending);
        assert_eq!(item.retry_count, 0);
    }

    #[tokio::test]
    async fn retry_unknown_queue_item_is_404() {
        let catalog = db::testutil::test_catalog();
        let active = ActiveDownloads::new();
        let dir = tempfile::tempdir().unwrap();
        let resp = dispatch(
            ctx(&catalog, &active, dir.path()),
            &Method::POST,
            "queue/dQw4w9WgXcQ/retry",
            &uri("/queue/dQw4w9WgXcQ/retry"),
            Bytes::new(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_download_without_user_id_is_bad_request() {
        let catalog = db::testutil::test_catalog();
        let active = ActiveDownloads::new();
        let dir = tempfile::tempdir().unwrap();
        let resp = dispatch(
            ctx(&catalog, &active, dir.path()),
            &Method::DELETE,
            "downloads/dQw4w9WgXcQ",
            &uri("/downloads/dQw4w9WgXcQ"),
            Bytes::new(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_download_soft_deletes_only_that_owner() {
        let catalog = db::testutil::test_catalog();
        let active = ActiveDownloads::new();
        let dir = tempfile::tempdir().unwrap();
        let now = db::testutil::test_now();
        catalog
            .add_to_queue(
                db::AddToQueue {
                    video_id: "dQw4w9WgXcQ".into(),
                    user_id: None,
                    priority: None,
                    source: db::Source::Manual,
                    owner_user_ids: Some(vec!["alice".into(), "bob".into()]),
                },
                now,
            )
            .unwrap();
        let file_path = dir.path().join("dQw4w9WgXcQ.mp4");
        std::fs::write(&file_path, b"data").unwrap();
        catalog
            .add_download(
                db::DownloadInput {
                    video_id: "dQw4w9WgXcQ".into(),
                    channel_id: None,
                    title: "t".into(),
                    duration_seconds: None,
                    quality: None,
                    file_path: file_path.display().to_string(),
                    thumbnail_path: None,
                    metadata: db::DownloadMetadata::default(),
                    file_size_bytes: 4,
                    source: db::Source::Manual,
                },
                now,
            )
            .unwrap();

        let resp = dispatch(
            ctx(&catalog, &active, dir.path()),
            &Method::DELETE,
            "downloads/dQw4w9WgXcQ",
            &uri("/downloads/dQw4w9WgXcQ?userId=alice"),
            Bytes::new(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        // alice's ownership row is gone, bob's remains, and the file was untouched.
        let owners = catalog.get_active_video_owners("dQw4w9WgXcQ").unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].user_id, "bob");
        assert!(file_path.is_file());
        let download = catalog.get_download("dQw4w9WgXcQ").unwrap().unwrap();
        assert!(download.files_deleted_at.is_none());
    }

    #[tokio::test]
    async fn delete_download_purge_removes_files() {
        let catalog = db::testutil::test_catalog();
        let active = ActiveDownloads::new();
        let dir = tempfile::tempdir().unwrap();
        let now = db::testutil::test_now();
        let file_path = dir.path().join("dQw4w9WgXcQ.mp4");
        std::fs::write(&file_path, b"data").unwrap();
        catalog
            .add_download(
                db::DownloadInput {
                    video_id: "dQw4w9WgXcQ".into(),
                    channel_id: None,
                    title: "t".into(),
                    duration_seconds: None,
                    quality: None,
                    file_path: file_path.display().to_string(),
                    thumbnail_path: None,
                    metadata: db::DownloadMetadata::default(),
                    file_size_bytes: 4,
                    source: db::Source::Manual,
                },
                now,
            )
            .unwrap();

        let resp = dispatch(
            ctx(&catalog, &active, dir.path()),
            &Method::DELETE,
            "downloads/dQw4w9WgXcQ",
            &uri("/downloads/dQw4w9WgXcQ?purge=true"),
            Bytes::new(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!file_path.is_file());
        let download = catalog.get_download("dQw4w9WgXcQ").unwrap().unwrap();
        assert!(download.files_deleted_at.is_some());
    }

    #[tokio::test]
    async fn invalid_video_id_is_bad_request() {
        let catalog = db::testutil::test_catalog();
        let active = ActiveDownloads::new();
        let dir = tempfile::tempdir().unwrap();
        let body = Bytes::from(r#"{"videoId":"short"}"#);
        let resp = dispatch(ctx(&catalog, &active, dir.path()), &Method::POST, "queue", &uri("/queue"), body).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let catalog = db::testutil::test_catalog();
        let active = ActiveDownloads::new();
        let dir = tempfile::tempdir().unwrap();
        let resp = dispatch(ctx(&catalog, &active, dir.path()), &Method::GET, "nonexistent", &uri("/nonexistent"), Bytes::new()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
