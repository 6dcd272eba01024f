// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! `getCachedStreams` (`## 8` testable property 10): given a `videoId`,
//! reports which per-itag elementary streams, muxed container, thumbnail,
//! and metadata sidecar actually exist on disk right now. Callers in
//! `## 4.10` always re-derive this immediately before opening a file
//! rather than trusting a cached answer, since the cache directory can be
//! written to concurrently (`## 5`).

use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedStream {
    pub itag: i32,
    pub path: PathBuf,
    pub ext: String,
}

#[derive(Clone, Debug, Default)]
pub struct CachedStreams {
    pub video: Vec<CachedStream>,
    pub audio: Vec<CachedStream>,
    pub muxed: Option<PathBuf>,
    pub thumbnail: Option<PathBuf>,
    pub metadata: Option<PathBuf>,
}

impl CachedStreams {
    pub fn is_empty(&self) -> bool {
        self.video.is_empty() && self.audio.is_empty() && self.muxed.is_none()
    }

    pub fn find_video_itag(&self, itag: i32) -> Option<&CachedStream> {
        self.video.iter().find(|s| s.itag == itag)
    }

    pub fn find_audio_itag(&self, itag: i32) -> Option<&CachedStream> {
        self.audio.iter().find(|s| s.itag == itag)
    }

    pub fn find_itag(&self, itag: i32) -> Option<&CachedStream> {
        self.find_video_itag(itag).or_else(|| self.find_audio_itag(itag))
    }
}

fn parse_stream_filename(video_id: &str, kind: &str, name: &str) -> Option<(i32, String)> {
    let prefix = format!("{video_id}_{kind}_");
    let rest = name.strip_prefix(prefix.as_str())?;
    let (itag_str, ext) = rest.split_once('.')?;
    let itag = itag_str.parse::<i32>().ok()?;
    Some((itag, ext.to_string()))
}

/// Scans `videos_dir` for everything `addDownload` or the pipeline would
/// have written for `video_id`. An unknown `video_id` yields an entirely
/// empty [`CachedStreams`] (testable property 10).
pub fn get_cached_streams(videos_dir: &Path, video_id: &str) -> CachedStreams {
    let mut out = CachedStreams::default();

    let muxed = videos_dir.join(format!("{video_id}.mp4"));
    if muxed.is_file() {
        out.muxed = Some(muxed);
    }
    let thumbnail = videos_dir.join(format!("{video_id}.webp"));
    if thumbnail.is_file() {
        out.thumbnail = Some(thumbnail);
    }
    let metadata = videos_dir.join(format!("{video_id}.json"));
    if metadata.is_file() {
        out.metadata = Some(metadata);
    }

    let Ok(entries) = std::fs::read_dir(videos_dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else { continue };
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some((itag, ext)) = parse_stream_filename(video_id, "video", name) {
            out.video.push(CachedStream { itag, path: entry.path(), ext });
        } else if let Some((itag, ext)) = parse_stream_filename(video_id, "audio", name) {
            out.audio.push(CachedStream { itag, path: entry.path(), ext });
        }
    }
    out.video.sort_by_key(|s| s.itag);
    out.audio.sort_by_key(|s| s.itag);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_video_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let streams = get_cached_streams(dir.path(), "dQw4w9WgXcQ");
        assert!(streams.is_empty());
        assert!(streams.thumbnail.is_none());
    }

    #[test]
    fn finds_elementary_streams_and_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "dQw4w9WgXcQ_video_137.mp4",
            "dQw4w9WgXcQ_audio_140.m4a",
            "dQw4w9WgXcQ.mp4",
            "dQw4w9WgXcQ.webp",
            "dQw4w9WgXcQ.json",
            "other9999999_video_137.mp4",
        ] {
            std::fs::File::create(dir.path().join(name)).unwrap();
        }

        let streams = get_cached_streams(dir.path(), "dQw4w9WgXcQ");
        assert_eq!(streams.video.len(), 1);
        assert_eq!(streams.video[0].itag, 137);
        assert_eq!(streams.video[0].ext, "mp4");
        assert_eq!(streams.audio.len(), 1);
        assert_eq!(streams.audio[0].itag, 140);
        assert!(streams.muxed.is_some());
        assert!(streams.thumbnail.is_some());
        assert!(streams.metadata.is_some());
        assert!(!streams.is_empty());
    }

    #[test]
    fn find_itag_checks_both_video_and_audio() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("dQw4w9WgXcQ_video_137.mp4")).unwrap();
        std::fs::File::create(dir.path().join("dQw4w9WgXcQ_audio_140.m4a")).unwrap();
        let streams = get_cached_streams(dir.path(), "dQw4w9WgXcQ");
        assert!(streams.find_itag(137).is_some());
        assert!(streams.find_itag(140).is_some());
        assert!(streams.find_itag(999).is_none());
    }
}
