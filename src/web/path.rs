// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! Decodes request paths into the route table from `## 4.10`, in match
//! order. `videoId` segments are validated against the canonical
//! 11-character ID shape at the door; anything else falls through to the
//! reverse proxy rather than getting a 404, since an unrecognized local
//! path might still be valid on the upstream frontend.

#[derive(Debug, Eq, PartialEq)]
pub(super) enum CachedKind {
    Muxed,
    Thumbnail,
    Metadata,
}

#[derive(Debug, Eq, PartialEq)]
pub(super) enum Path {
    Health,
    /// The suffix after `/api/downloader/`, e.g. `"queue"` or
    /// `"queue/dQw4w9WgXcQ"`; the control-plane API module does its own
    /// method-based dispatch on this.
    DownloaderApi(String),
    Watch,
    VideoInfo(String),
    ManifestDash(String),
    VideoPlayback,
    Cached(String, CachedKind),
    LatestVersion,
    Proxy,
}

/// The canonical 11-character video ID shape: `[A-Za-z0-9_-]{11}`.
pub(super) fn is_valid_video_id(s: &str) -> bool {
    s.len() == 11 && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl Path {
    pub(super) fn decode(path: &str) -> Self {
        if path == "/health" {
            return Path::Health;
        }
        if let Some(rest) = path.strip_prefix("/api/downloader/") {
            return Path::DownloaderApi(rest.to_string());
        }
        if path == "/watch" {
            return Path::Watch;
        }
        if let Some(id) = path.strip_prefix("/api/v1/videos/") {
            return Path::VideoInfo(id.to_string());
        }
        if let Some(id) = path.strip_prefix("/companion/api/manifest/dash/id/") {
            return Path::ManifestDash(id.to_string());
        }
        if path == "/videoplayback" || path.starts_with("/videoplayback?") {
            return Path::VideoPlayback;
        }
        if let Some(rest) = path.strip_prefix("/cached/") {
            return match rest.split_once('/') {
                None if is_valid_video_id(rest) => Path::Cached(rest.to_string(), CachedKind::Muxed),
                Some((id, "thumbnail")) if is_valid_video_id(id) => {
                    Path::Cached(id.to_string(), CachedKind::Thumbnail)
                }
                Some((id, "metadata")) if is_valid_video_id(id) => {
                    Path::Cached(id.to_string(), CachedKind::Metadata)
                }
                _ => Path::Proxy,
            };
        }
        if path == "/latest_version" || path.starts_with("/latest_version?") {
            return Path::LatestVersion;
        }
        Path::Proxy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_fixed_routes() {
        assert_eq!(Path::decode("/health"), Path::Health);
        assert_eq!(Path::decode("/watch"), Path::Watch);
        assert_eq!(Path::decode("/latest_version"), Path::LatestVersion);
        assert_eq!(Path::decode("/videoplayback"), Path::VideoPlayback);
        assert_eq!(Path::decode("/videoplayback?v=dQw4w9WgXcQ&itag=137"), Path::VideoPlayback);
    }

    #[test]
    fn decodes_downloader_api_suffix() {
        assert_eq!(
            Path::decode("/api/downloader/queue"),
            Path::DownloaderApi("queue".to_string())
        );
        assert_eq!(
            Path::decode("/api/downloader/queue/dQw4w9WgXcQ"),
            Path::DownloaderApi("queue/dQw4w9WgXcQ".to_string())
        );
    }

    #[test]
    fn decodes_video_info_and_manifest() {
        assert_eq!(
            Path::decode("/api/v1/videos/dQw4w9WgXcQ"),
            Path::VideoInfo("dQw4w9WgXcQ".to_string())
        );
        assert_eq!(
            Path::decode("/companion/api/manifest/dash/id/dQw4w9WgXcQ"),
            Path::ManifestDash("dQw4w9WgXcQ".to_string())
        );
    }

    #[test]
    fn decodes_cached_variants() {
        assert_eq!(
            Path::decode("/cached/dQw4w9WgXcQ"),
            Path::Cached("dQw4w9WgXcQ".to_string(), CachedKind::Muxed)
        );
        assert_eq!(
            Path::decode("/cached/dQw4w9WgXcQ/thumbnail"),
            Path::Cached("dQw4w9WgXcQ".to_string(), CachedKind::Thumbnail)
        );
        assert_eq!(
            Path::decode("/cached/dQw4w9WgXcQ/metadata"),
            Path::Cached("dQw4w9WgXcQ".to_string(), CachedKind::Metadata)
        );
        assert_eq!(Path::decode("/cached/bad-id"), Path::Proxy);
    }

    #[test]
    fn falls_through_to_proxy() {
        assert_eq!(Path::decode("/some/random/upstream/path"), Path::Proxy);
    }

    #[test]
    fn validates_video_id_shape() {
        assert!(is_valid_video_id("dQw4w9WgXcQ"));
        assert!(!is_valid_video_id("short"));
        assert!(!is_valid_video_id("has space!!"));
    }
}
