// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! Synthesizes the adaptive manifest XML for `GET
//! /companion/api/manifest/dash/id/:videoId` (`## 4.10` step 5): one video
//! and one audio `AdaptationSet`, each a single `Representation` pointing
//! at a cached elementary stream with a `SegmentBase` carrying the byte
//! ranges C11 reads off the file itself.

use crate::byterange::{ByteRangeCache, ByteRanges};
use crate::cached::CachedStream;
use db::DownloadMetadata;

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn representation(
    id: &str,
    itag: i32,
    mime_type: &str,
    bitrate: Option<i64>,
    width: Option<i32>,
    height: Option<i32>,
    video_id: &str,
    ranges: ByteRanges,
    extra: &str,
) -> String {
    let bandwidth = bitrate.unwrap_or(0).max(0);
    let dims = match (width, height) {
        (Some(w), Some(h)) => format!(r#" width="{w}" height="{h}""#),
        _ => String::new(),
    };
    format!(
        r#"    <Representation id="{id}" mimeType="{mime}" bandwidth="{bandwidth}"{dims}{extra}>
      <BaseURL>/videoplayback?v={video_id}&amp;itag={itag}</BaseURL>
      <SegmentBase indexRange="{index_range}">
        <Initialization range="{init_range}"/>
      </SegmentBase>
    </Representation>
"#,
        id = xml_escape(id),
        mime = xml_escape(mime_type),
        index_range = ranges.index_range(),
        init_range = ranges.init_range(),
    )
}

/// Builds the manifest body for a video with one cached video stream and
/// one cached audio stream. Byte ranges that fail to parse fall back to
/// `"0-0"` (`## 4.11`) rather than failing the whole manifest.
pub(super) fn build(
    video_id: &str,
    video: &CachedStream,
    audio: &CachedStream,
    metadata: &DownloadMetadata,
    byte_ranges: &ByteRangeCache,
) -> String {
    let video_ranges = byte_ranges.get(&video.path).unwrap_or_else(|_| ByteRanges::zero());
    let audio_ranges = byte_ranges.get(&audio.path).unwrap_or_else(|_| ByteRanges::zero());

    let video_mime = metadata
        .video_mime_type
        .clone()
        .unwrap_or_else(|| format!("video/{}", video.ext));
    let audio_mime = metadata
        .audio_mime_type
        .clone()
        .unwrap_or_else(|| format!("audio/{}", audio.ext));

    let video_rep = representation(
        &format!("video-{}", video.itag),
        video.itag,
        &video_mime,
        metadata.video_bitrate_bps,
        metadata.width,
        metadata.height,
        video_id,
        video_ranges,
        "",
    );
    let audio_rep = representation(
        &format!("audio-{}", audio.itag),
        audio.itag,
        &audio_mime,
        metadata.audio_bitrate_bps,
        None,
        None,
        video_id,
        audio_ranges,
        "",
    );

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" profiles="urn:mpeg:dash:profile:isoff-on-demand:2011">
  <Period>
    <AdaptationSet contentType="video" segmentAlignment="true">
{video_rep}    </AdaptationSet>
    <AdaptationSet contentType="audio" segmentAlignment="true">
{audio_rep}    </AdaptationSet>
  </Period>
</MPD>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn builds_one_video_and_one_audio_adaptation_set() {
        let dir = tempfile::tempdir().unwrap();
        let video = CachedStream {
            itag: 137,
            path: dir.path().join("v.mp4"),
            ext: "mp4".to_string(),
        };
        let audio = CachedStream {
            itag: 140,
            path: dir.path().join("a.m4a"),
            ext: "m4a".to_string(),
        };
        std::fs::write(&video.path, b"not a real container").unwrap();
        std::fs::write(&audio.path, b"not a real container").unwrap();

        let metadata = DownloadMetadata {
            video_mime_type: Some("video/mp4".to_string()),
            audio_mime_type: Some("audio/mp4".to_string()),
            width: Some(1920),
            height: Some(1080),
            ..Default::default()
        };
        let cache = ByteRangeCache::new();
        let xml = build("dQw4w9WgXcQ", &video, &audio, &metadata, &cache);

        assert!(xml.contains("<MPD"));
        assert_eq!(xml.matches("<AdaptationSet").count(), 2);
        assert!(xml.contains("contentType=\"video\""));
        assert!(xml.contains("contentType=\"audio\""));
        assert!(xml.contains("/videoplayback?v=dQw4w9WgXcQ&amp;itag=137"));
        assert!(xml.contains("/videoplayback?v=dQw4w9WgXcQ&amp;itag=140"));
        assert!(xml.contains(r#"indexRange="0-0""#));
        assert!(xml.contains(r#"width="1920" height="1080""#));
    }

    #[test]
    fn falls_back_to_ext_derived_mime_type_when_metadata_missing() {
        let video = CachedStream {
            itag: 137,
            path: PathBuf::from("/nonexistent/v.webm"),
            ext: "webm".to_string(),
        };
        let audio = CachedStream {
            itag: 140,
            path: PathBuf::from("/nonexistent/a.webm"),
            ext: "webm".to_string(),
        };
        let metadata = DownloadMetadata::default();
        let cache = ByteRangeCache::new();
        let xml = build("dQw4w9WgXcQ", &video, &audio, &metadata, &cache);
        assert!(xml.contains("video/webm"));
        assert!(xml.contains("audio/webm"));
        assert!(xml.contains(r#"indexRange="0-0""#));
    }
}
