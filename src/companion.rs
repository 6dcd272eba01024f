// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! The companion client (C3): fetches signed video metadata and picks the
//! best-matched video/audio streams for a quality preference.

use crate::config::QualityPreference;
use crate::error::NetworkError;
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct Format {
    pub itag: i32,
    pub url: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub bitrate: Option<u64>,
    #[serde(rename = "contentLength")]
    pub content_length: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct VideoInfo {
    pub title: String,
    pub author: String,
    #[serde(rename = "channelId")]
    pub channel_id: String,
    #[serde(rename = "lengthSeconds")]
    pub length_seconds: u32,
    #[serde(rename = "adaptiveFormats", default)]
    pub adaptive_formats: Vec<Format>,
    #[serde(rename = "combinedFormats", default)]
    pub combined_formats: Vec<Format>,
    #[serde(rename = "thumbnailUrl", default)]
    pub thumbnail_url: Option<String>,
}

/// The outcome of `selectBestStreams`: either a separate video+audio pair
/// or a single combined format.
#[derive(Clone, Debug)]
pub enum SelectedStreams {
    Separate { video: Format, audio: Format },
    Combined(Format),
}

pub struct CompanionClient {
    http: reqwest::Client,
    base_url: url::Url,
    shared_secret: String,
}

impl CompanionClient {
    pub fn new(http: reqwest::Client, base_url: url::Url, shared_secret: String) -> Self {
        CompanionClient {
            http,
            base_url,
            shared_secret,
        }
    }

    #[tracing::instrument(skip(self), fields(video_id = %video_id))]
    pub async fn get_video_info(&self, video_id: &str) -> Result<VideoInfo, NetworkError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| NetworkError::InvalidResponse {
                url: self.base_url.to_string(),
                message: "companion base URL cannot be a base".to_string(),
            })?
            .push("videos")
            .push(video_id);
        let resp = self
            .http
            .get(url.clone())
            .header("X-Companion-Secret", &self.shared_secret)
            .send()
            .await
            .map_err(NetworkError::Network)?;
        if !resp.status().is_success() {
            return Err(NetworkError::InvalidResponse {
                url: url.to_string(),
                message: format!("companion returned {}", resp.status()),
            });
        }
        resp.json::<VideoInfo>()
            .await
            .map_err(NetworkError::Network)
    }
}

/// `selectBestStreams`: see `## 4.3 Companion client (C3)`.
pub fn select_best_streams(
    info: &VideoInfo,
    preference: QualityPreference,
) -> Option<SelectedStreams> {
    if info.adaptive_formats.is_empty() {
        return select_best_combined(&info.combined_formats).map(SelectedStreams::Combined);
    }

    let (video_formats, audio_formats): (Vec<&Format>, Vec<&Format>) = info
        .adaptive_formats
        .iter()
        .partition(|f| f.mime_type.starts_with("video/"));

    let video = select_video(&video_formats, preference)?;
    let audio = select_audio(&audio_formats)?;
    Some(SelectedStreams::Separate {
        video: video.clone(),
        audio: audio.clone(),
    })
}

fn select_video<'a>(formats: &[&'a Format], preference: QualityPreference) -> Option<&'a Format> {
    if formats.is_empty() {
        return None;
    }
    let key = |f: &&Format| (f.height.unwrap_or(0), f.bitrate.unwrap_or(0));
    match preference {
        QualityPreference::Best => formats.iter().max_by_key(key).copied(),
        QualityPreference::Worst => formats.iter().min_by_key(key).copied(),
        QualityPreference::MaxHeight(n) => {
            let mut eligible: Vec<&&Format> = formats
                .iter()
                .filter(|f| f.height.unwrap_or(0) <= n)
                .collect();
            if eligible.is_empty() {
                formats.iter().min_by_key(key).copied()
            } else {
                eligible.sort_by_key(|f| key(f));
                eligible.last().map(|f| **f)
            }
        }
    }
}

fn select_audio<'a>(formats: &[&'a Format]) -> Option<&'a Format> {
    formats.iter().max_by_key(|f| f.bitrate.unwrap_or(0)).copied()
}

fn select_best_combined(formats: &[Format]) -> Option<Format> {
    formats
        .iter()
        .max_by_key(|f| (f.height.unwrap_or(0), f.bitrate.unwrap_or(0)))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(itag: i32, mime: &str, height: Option<u32>, bitrate: u64) -> Format {
        Format {
            itag,
            url: format!("https://example.test/{itag}"),
            mime_type: mime.to_string(),
            bitrate: Some(bitrate),
            content_length: Some(1000),
            width: height.map(|h| h * 16 / 9),
            height,
        }
    }

    fn info_with(formats: Vec<Format>) -> VideoInfo {
        VideoInfo {
            title: "t".into(),
            author: "a".into(),
            channel_id: "c".into(),
            length_seconds: 100,
            adaptive_formats: formats,
            combined_formats: vec![],
            thumbnail_url: None,
        }
    }

    #[test]
    fn best_picks_highest_height_then_bitrate() {
        let info = info_with(vec![
            fmt(1, "video/mp4", Some(480), 1_000_000),
            fmt(2, "video/mp4", Some(1080), 3_000_000),
            fmt(3, "audio/mp4", None, 128_000),
        ]);
        let sel = select_best_streams(&info, QualityPreference::Best).unwrap();
        match sel {
            SelectedStreams::Separate { video, audio } => {
                assert_eq!(video.itag, 2);
                assert_eq!(audio.itag, 3);
            }
            _ => panic!("expected separate streams"),
        }
    }

    #[test]
    fn max_height_falls_back_to_min_when_none_qualify() {
        let info = info_with(vec![
            fmt(1, "video/mp4", Some(1080), 3_000_000),
            fmt(2, "video/mp4", Some(1440), 5_000_000),
            fmt(3, "audio/mp4", None, 128_000),
        ]);
        let sel = select_best_streams(&info, QualityPreference::MaxHeight(720)).unwrap();
        match sel {
            SelectedStreams::Separate { video, .. } => assert_eq!(video.itag, 1),
            _ => panic!("expected separate streams"),
        }
    }

    #[test]
    fn max_height_picks_largest_under_cap() {
        let info = info_with(vec![
            fmt(1, "video/mp4", Some(480), 1_000_000),
            fmt(2, "video/mp4", Some(720), 2_000_000),
            fmt(3, "video/mp4", Some(1080), 3_000_000),
            fmt(4, "audio/mp4", None, 128_000),
        ]);
        let sel = select_best_streams(&info, QualityPreference::MaxHeight(720)).unwrap();
        match sel {
            SelectedStreams::Separate { video, .. } => assert_eq!(video.itag, 2),
            _ => panic!("expected separate streams"),
        }
    }

    #[test]
    fn falls_back_to_combined_when_no_adaptive_formats() {
        let info = VideoInfo {
            title: "t".into(),
            author: "a".into(),
            channel_id: "c".into(),
            length_seconds: 100,
            adaptive_formats: vec![],
            combined_formats: vec![fmt(5, "video/mp4", Some(360), 500_000)],
            thumbnail_url: None,
        };
        let sel = select_best_streams(&info, QualityPreference::Best).unwrap();
        match sel {
            SelectedStreams::Combined(f) => assert_eq!(f.itag, 5),
            _ => panic!("expected combined"),
        }
    }
}
