// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! The request router + cache shim: the HTTP surface in front of the
//! upstream frontend. Decodes the path (`path.rs`), serves cached bytes
//! with range semantics (`range.rs`) when a route matches something on
//! disk, synthesizes the adaptive manifest (`manifest.rs`) or rewrites the
//! proxied video-info JSON, and falls back to the reverse proxy
//! (`proxy.rs`) for everything else. One `Service` per accepted
//! connection, a route table matched once per request, thin per-route
//! functions.

mod api;
mod manifest;
mod path;
mod proxy;
mod range;

use crate::body::{self, Body};
use crate::byterange::ByteRangeCache;
use crate::cached::{self, CachedStreams};
use crate::eviction::EvictionService;
use crate::progress::ActiveDownloads;
use crate::upstream::UpstreamCatalog;
use crate::watcher::Watcher;
use bytes::Bytes;
use db::Catalog;
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::http1;
use hyper_util::server::graceful::GracefulShutdown;
use path::{CachedKind, Path as RoutePath};
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything a route handler needs: the catalog, the in-memory
/// watcher/eviction state, the upstream frontend to fall back to, and the
/// byte-range cache the media parser keeps warm.
pub struct AppState<U> {
    pub catalog: Catalog,
    pub upstream_frontend: url::Url,
    pub http: reqwest::Client,
    pub active: ActiveDownloads,
    pub watcher: Arc<Watcher<U>>,
    pub eviction: Arc<EvictionService<U>>,
    pub videos_dir: PathBuf,
    pub byte_ranges: ByteRangeCache,
    pub clocks: Arc<dyn base::clock::Clocks>,
}

/// Binds `listen_port` and serves until `cancel` fires, then finishes
/// in-flight requests before returning.
pub async fn serve<U: UpstreamCatalog + 'static>(
    state: Arc<AppState<U>>,
    listen_port: u16,
    cancel: CancellationToken,
) -> Result<(), base::Error> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], listen_port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| base::Error::wrap(base::ErrorKind::Unavailable, e))?;
    info!(%addr, "request router listening");

    let graceful = GracefulShutdown::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let state = state.clone();
                let service = hyper::service::service_fn(move |req| {
                    let state = state.clone();
                    async move { Ok::<_, std::convert::Infallible>(route(state, req).await) }
                });
                let conn = http1::Builder::new().serve_connection(io, service);
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        warn!(%peer, error = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("request router draining in-flight connections");
    graceful.shutdown().await;
    Ok(())
}

async fn route<U: UpstreamCatalog>(state: Arc<AppState<U>>, req: Request<Incoming>) -> Response<Body> {
    match RoutePath::decode(req.uri().path()) {
        RoutePath::Health => json(StatusCode::OK, serde_json::json!({ "status": "ok" })),
        RoutePath::DownloaderApi(suffix) => downloader_api(&state, req, &suffix).await,
        RoutePath::Watch => watch(&state, req).await,
        RoutePath::VideoInfo(video_id) => video_info(&state, req, &video_id).await,
        RoutePath::ManifestDash(video_id) => manifest_dash(&state, req, &video_id).await,
        RoutePath::VideoPlayback => videoplayback(&state, req).await,
        RoutePath::Cached(video_id, kind) => cached_route(&state, req, &video_id, kind).await,
        RoutePath::LatestVersion => latest_version(&state, req).await,
        RoutePath::Proxy => proxy::proxy(&state.http, &state.upstream_frontend, req).await,
    }
}

fn json(status: StatusCode, value: serde_json::Value) -> Response<Body> {
    let payload = serde_json::to_vec(&value).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(body::full(Bytes::from(payload)))
        .expect("hardcoded response should be valid")
}

fn query_param(uri: &http::Uri, key: &str) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn content_type_for_path(path: &FsPath) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "mp4" | "m4v" => "video/mp4",
        "m4a" => "audio/mp4",
        "webm" => "video/webm",
        "webp" => "image/webp",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

async fn downloader_api<U: UpstreamCatalog>(
    state: &Arc<AppState<U>>,
    req: Request<Incoming>,
    suffix: &str,
) -> Response<Body> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let (_, incoming) = req.into_parts();
    let body = match incoming.collect().await {
        Ok(c) => c.to_bytes(),
        Err(_) => Bytes::new(),
    };
    let ctx = api::Context {
        catalog: &state.catalog,
        active: &state.active,
        videos_dir: &state.videos_dir,
        watcher_stats: state.watcher.stats(),
        eviction_stats: state.eviction.stats(),
        now: state.clocks.now(),
    };
    api::dispatch(ctx, &method, suffix, &uri, body).await
}

/// `downloaded` / `downloading` / `queued` / `not_cached`, used to badge
/// `/watch`.
fn badge_status<U: UpstreamCatalog>(state: &AppState<U>, video_id: &str) -> &'static str {
    if state.active.snapshot_one(video_id).is_some() {
        return "downloading";
    }
    if let Ok(Some(item)) = state.catalog.get_queue_item(video_id) {
        if !item.status.is_terminal() {
            return "queued";
        }
    }
    if let Ok(Some(download)) = state.catalog.get_download(video_id) {
        if download.files_deleted_at.is_none() {
            return "downloaded";
        }
    }
    "not_cached"
}

/// Inserts a small status badge right after the opening `<body...>` tag.
/// Leaves the document untouched if no `<body` tag is found, which only
/// happens against a malformed or unexpected upstream page.
fn inject_badge(html: &str, status: &str) -> String {
    let Some(body_idx) = html.find("<body") else {
        return html.to_string();
    };
    let Some(tag_end) = html[body_idx..].find('>') else {
        return html.to_string();
    };
    let insert_at = body_idx + tag_end + 1;
    let badge = format!(
        r#"<div id="streamvault-badge" data-status="{status}" style="display:none">{status}</div>"#
    );
    let mut out = String::with_capacity(html.len() + badge.len());
    out.push_str(&html[..insert_at]);
    out.push_str(&badge);
    out.push_str(&html[insert_at..]);
    out
}

/// Fetches `upstream/<path+query from req>` and returns its status/headers
/// with the body already buffered, or an already-built error `Response`
/// the caller should return as-is on failure.
async fn proxy_collect(
    http: &reqwest::Client,
    upstream: &url::Url,
    req: &Request<Incoming>,
) -> Result<Response<Bytes>, Response<Body>> {
    let mut target = upstream.clone();
    target.set_path(req.uri().path());
    target.set_query(req.uri().query());
    let resp = http
        .get(target)
        .timeout(std::time::Duration::from_secs(30))
        .send()
        .await
        .map_err(|e| json(StatusCode::BAD_GATEWAY, serde_json::json!({ "error": e.to_string() })))?;
    let mut builder = Response::builder().status(resp.status());
    for (name, value) in resp.headers().iter() {
        builder = builder.header(name, value);
    }
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| json(StatusCode::BAD_GATEWAY, serde_json::json!({ "error": e.to_string() })))?;
    builder
        .body(bytes)
        .map_err(|_| json(StatusCode::BAD_GATEWAY, serde_json::json!({ "error": "malformed upstream response" })))
}

async fn watch<U: UpstreamCatalog>(state: &Arc<AppState<U>>, req: Request<Incoming>) -> Response<Body> {
    let video_id = query_param(req.uri(), "v");
    let upstream_resp = match proxy_collect(&state.http, &state.upstream_frontend, &req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let Some(video_id) = video_id.filter(|v| path::is_valid_video_id(v)) else {
        let (parts, body) = upstream_resp.into_parts();
        return Response::from_parts(parts, body::full(body));
    };
    let status = badge_status(state, &video_id);
    let (parts, body) = upstream_resp.into_parts();
    let html = String::from_utf8_lossy(&body).into_owned();
    let rewritten = inject_badge(&html, status);
    let mut response = Response::from_parts(parts, body::full(Bytes::from(rewritten)));
    response.headers_mut().remove(http::header::CONTENT_LENGTH);
    response
}

/// Rewrites `adaptiveFormats[].url` for every itag streamvault has cached,
/// and nulls out any manifest-URL-shaped field (the upstream schema names
/// it differently across deployments; matching by suffix covers all of
/// them) so the client fetches the synthesized manifest instead.
fn rewrite_video_info(mut value: serde_json::Value, video_id: &str, streams: &CachedStreams) -> serde_json::Value {
    if let Some(obj) = value.as_object_mut() {
        if let Some(formats) = obj.get_mut("adaptiveFormats").and_then(|v| v.as_array_mut()) {
            for format in formats.iter_mut() {
                let Some(itag) = format.get("itag").and_then(|v| v.as_i64()) else { continue };
                if streams.find_itag(itag as i32).is_some() {
                    let url = format!("/videoplayback?v={video_id}&itag={itag}");
                    format["url"] = serde_json::Value::String(url);
                }
            }
        }
        let manifest_keys: Vec<String> = obj
            .keys()
            .filter(|k| k.to_ascii_lowercase().contains("manifesturl"))
            .cloned()
            .collect();
        for key in manifest_keys {
            obj.insert(key, serde_json::Value::Null);
        }
    }
    value
}

async fn video_info<U: UpstreamCatalog>(state: &Arc<AppState<U>>, req: Request<Incoming>, video_id: &str) -> Response<Body> {
    let upstream_resp = match proxy_collect(&state.http, &state.upstream_frontend, &req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if !path::is_valid_video_id(video_id) {
        let (parts, body) = upstream_resp.into_parts();
        return Response::from_parts(parts, body::full(body));
    }
    let streams = cached::get_cached_streams(&state.videos_dir, video_id);
    if streams.video.is_empty() && streams.audio.is_empty() {
        let (parts, body) = upstream_resp.into_parts();
        return Response::from_parts(parts, body::full(body));
    }
    let (parts, body) = upstream_resp.into_parts();
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return Response::from_parts(parts, body::full(body)),
    };
    let rewritten = rewrite_video_info(value, video_id, &streams);
    let payload = serde_json::to_vec(&rewritten).unwrap_or_else(|_| body.to_vec());
    let mut response = Response::from_parts(parts, body::full(Bytes::from(payload)));
    response.headers_mut().remove(http::header::CONTENT_LENGTH);
    response
}

async fn manifest_dash<U: UpstreamCatalog>(state: &Arc<AppState<U>>, req: Request<Incoming>, video_id: &str) -> Response<Body> {
    if !path::is_valid_video_id(video_id) {
        return proxy::proxy(&state.http, &state.upstream_frontend, req).await;
    }
    let streams = cached::get_cached_streams(&state.videos_dir, video_id);
    let (Some(video), Some(audio)) = (streams.video.first(), streams.audio.first()) else {
        return proxy::proxy(&state.http, &state.upstream_frontend, req).await;
    };
    let metadata = match state.catalog.get_download(video_id) {
        Ok(Some(d)) => d.metadata,
        _ => db::DownloadMetadata::default(),
    };
    let xml = manifest::build(video_id, video, audio, &metadata, &state.byte_ranges);
    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/dash+xml")
        .body(body::full(Bytes::from(xml)))
        .expect("hardcoded response should be valid")
}

async fn serve_file_with_range(path: &FsPath, range_header: Option<&str>) -> Response<Body> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(_) => return not_found(),
    };
    let size = meta.len();
    let content_type = content_type_for_path(path);

    match range::parse_range(range_header, size) {
        range::ParsedRange::Unsatisfiable => Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(http::header::CONTENT_RANGE, format!("bytes */{size}"))
            .body(body::empty())
            .expect("hardcoded response should be valid"),
        range::ParsedRange::None => {
            let file = match tokio::fs::File::open(path).await {
                Ok(f) => f,
                Err(_) => return not_found(),
            };
            Response::builder()
                .status(StatusCode::OK)
                .header(http::header::CONTENT_TYPE, content_type)
                .header(http::header::CONTENT_LENGTH, size)
                .header(http::header::ACCEPT_RANGES, "bytes")
                .body(body::streaming(ReaderStream::new(file)))
                .expect("hardcoded response should be valid")
        }
        range::ParsedRange::Satisfiable(start, end) => {
            let mut file = match tokio::fs::File::open(path).await {
                Ok(f) => f,
                Err(_) => return not_found(),
            };
            if file.seek(std::io::SeekFrom::Start(start)).await.is_err() {
                return not_found();
            }
            let len = end - start + 1;
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(http::header::CONTENT_TYPE, content_type)
                .header(http::header::CONTENT_LENGTH, len)
                .header(http::header::CONTENT_RANGE, format!("bytes {start}-{end}/{size}"))
                .header(http::header::ACCEPT_RANGES, "bytes")
                .body(body::streaming(ReaderStream::new(file.take(len))))
                .expect("hardcoded response should be valid")
        }
    }
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(body::full(Bytes::from_static(br#"{"error":"not found"}"#)))
        .expect("hardcoded response should be valid")
}

async fn videoplayback<U: UpstreamCatalog>(state: &Arc<AppState<U>>, req: Request<Incoming>) -> Response<Body> {
    let video_id = query_param(req.uri(), "v");
    let itag = query_param(req.uri(), "itag").and_then(|s| s.parse::<i32>().ok());
    let range_header = req
        .headers()
        .get(http::header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(video_id) = video_id.filter(|v| path::is_valid_video_id(v)) else {
        return proxy::proxy(&state.http, &state.upstream_frontend, req).await;
    };

    let streams = cached::get_cached_streams(&state.videos_dir, &video_id);
    if let Some(itag) = itag {
        if let Some(stream) = streams.find_itag(itag) {
            return serve_file_with_range(&stream.path, range_header.as_deref()).await;
        }
    }
    if let Some(muxed) = &streams.muxed {
        return serve_file_with_range(muxed, range_header.as_deref()).await;
    }
    proxy::proxy(&state.http, &state.upstream_frontend, req).await
}

async fn cached_route<U: UpstreamCatalog>(
    state: &Arc<AppState<U>>,
    req: Request<Incoming>,
    video_id: &str,
    kind: CachedKind,
) -> Response<Body> {
    if !path::is_valid_video_id(video_id) {
        return not_found();
    }
    let range_header = req
        .headers()
        .get(http::header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let streams = cached::get_cached_streams(&state.videos_dir, video_id);
    let path = match kind {
        CachedKind::Muxed => streams.muxed,
        CachedKind::Thumbnail => streams.thumbnail,
        CachedKind::Metadata => streams.metadata,
    };
    match path {
        Some(path) => serve_file_with_range(&path, range_header.as_deref()).await,
        None => not_found(),
    }
}

async fn latest_version<U: UpstreamCatalog>(state: &Arc<AppState<U>>, req: Request<Incoming>) -> Response<Body> {
    let range_header = req
        .headers()
        .get(http::header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Some(id) = query_param(req.uri(), "id").filter(|id| path::is_valid_video_id(id)) {
        let streams = cached::get_cached_streams(&state.videos_dir, &id);
        if let Some(muxed) = streams.muxed {
            return serve_file_with_range(&muxed, range_header.as_deref()).await;
        }
    }
    not_found()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_badge_places_div_right_after_body_tag() {
        let html = r#"<html><body class="x"><h1>hi</h1></body></html>"#;
        let out = inject_badge(html, "downloaded");
        assert!(out.contains(r#"data-status="downloaded""#));
        assert!(out.find("streamvault-badge").unwrap() < out.find("<h1>").unwrap());
    }

    #[test]
    fn inject_badge_leaves_malformed_html_untouched() {
        let html = "not html at all";
        assert_eq!(inject_badge(html, "downloaded"), html);
    }

    #[test]
    fn content_type_mapping_covers_known_extensions() {
        assert_eq!(content_type_for_path(FsPath::new("a.mp4")), "video/mp4");
        assert_eq!(content_type_for_path(FsPath::new("a.webm")), "video/webm");
        assert_eq!(content_type_for_path(FsPath::new("a.webp")), "image/webp");
        assert_eq!(content_type_for_path(FsPath::new("a.bin")), "application/octet-stream");
    }

    #[test]
    fn rewrite_video_info_points_surviving_itags_at_local_playback() {
        let value = serde_json::json!({
            "adaptiveFormats": [
                {"itag": 137, "url": "https://upstream.example/sig1"},
                {"itag": 999, "url": "https://upstream.example/sig2"},
            ],
            "dashManifestUrl": "https://upstream.example/manifest.mpd",
        });
        let mut streams = CachedStreams::default();
        streams.video.push(cached::CachedStream {
            itag: 137,
            path: PathBuf::from("/tmp/x_video_137.mp4"),
            ext: "mp4".to_string(),
        });

        let rewritten = rewrite_video_info(value, "dQw4w9WgXcQ", &streams);
        let formats = rewritten["adaptiveFormats"].as_array().unwrap();
        assert_eq!(formats[0]["url"], "/videoplayback?v=dQw4w9WgXcQ&itag=137");
        assert_eq!(formats[1]["url"], "https://upstream.example/sig2");
        assert!(rewritten["dashManifestUrl"].is_null());
    }

    #[test]
    fn query_param_reads_named_value() {
        let uri: http::Uri = "/videoplayback?v=dQw4w9WgXcQ&itag=137".parse().unwrap();
        assert_eq!(query_param(&uri, "v").as_deref(), Some("dQw4w9WgXcQ"));
        assert_eq!(query_param(&uri, "itag").as_deref(), Some("137"));
        assert_eq!(query_param(&uri, "missing"), None);
    }
}
