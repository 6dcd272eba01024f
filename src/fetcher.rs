// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! The stream fetcher (C4): HTTP GET with resume, a token-bucket rate
//! limiter, live-speed sampling, throttle detection, and cancellation.
//! Grounded on the progress-sampling/speed-smoothing shape of a typical
//! async download-engine command loop: a `tokio::select!` between the
//! next response chunk and the cancellation signal, with a periodic
//! progress callback gated by a minimum sample interval.

use crate::error::DownloadError;
use futures::StreamExt;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
/// Exponential smoothing factor for the live speed estimate.
const SPEED_EMA_ALPHA: f64 = 0.3;

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// bytes/sec; a rolling average below this after one full window trips detection.
    pub speed_threshold_bytes_per_sec: u64,
    pub detection_window: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct FetchOptions {
    pub rate_limit_bytes_per_sec: u64,
    pub resume: bool,
    pub throttle: Option<ThrottleConfig>,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, bytes_written: u64, total: Option<u64>, speed_bytes_per_sec: f64);
}

impl<F: Fn(u64, Option<u64>, f64) + Send + Sync> ProgressSink for F {
    fn on_progress(&self, bytes_written: u64, total: Option<u64>, speed_bytes_per_sec: f64) {
        self(bytes_written, total, speed_bytes_per_sec)
    }
}

/// A simple token bucket: capacity and fill rate both equal `rate`
/// bytes/sec. `take` blocks (via `tokio::time::sleep`) just long enough to
/// keep the average rate at or below `rate`.
struct TokenBucket {
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_bytes_per_sec: u64) -> Self {
        TokenBucket {
            rate: rate_bytes_per_sec as f64,
            tokens: rate_bytes_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    async fn take(&mut self, n: u64) {
        if self.rate <= 0.0 {
            return;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
        self.last_refill = now;

        let need = n as f64;
        if self.tokens >= need {
            self.tokens -= need;
            return;
        }
        let deficit = need - self.tokens;
        let delay = Duration::from_secs_f64(deficit / self.rate);
        tokio::time::sleep(delay).await;
        self.tokens = 0.0;
        self.last_refill = Instant::now();
    }
}

/// A sliding window of recent (instant, bytes) samples, used to detect
/// sustained below-threshold speed without being fooled by brief stalls.
struct ThrottleWindow {
    window: Duration,
    samples: std::collections::VecDeque<(Instant, u64)>,
    first_sample_at: Instant,
}

impl ThrottleWindow {
    fn new(window: Duration) -> Self {
        ThrottleWindow {
            window,
            samples: std::collections::VecDeque::new(),
            first_sample_at: Instant::now(),
        }
    }

    fn record(&mut self, now: Instant, bytes_this_tick: u64) {
        self.samples.push_back((now, bytes_this_tick));
        let cutoff = now - self.window;
        while let Some(&(t, _)) = self.samples.front() {
            if t < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Returns the rolling average bytes/sec once a full window has elapsed
    /// since the first sample; `None` before that (can't judge yet).
    fn rolling_average(&self, now: Instant) -> Option<f64> {
        if now.duration_since(self.first_sample_at) < self.window {
            return None;
        }
        let total: u64 = self.samples.iter().map(|&(_, b)| b).sum();
        Some(total as f64 / self.window.as_secs_f64())
    }
}

/// Downloads `url` to `output_path`, honoring [`FetchOptions`].
///
/// Distinguished failures: [`DownloadError::StartFresh`] if `resume` was
/// requested but the server ignored the `Range` header (caller should
/// discard the partial file and retry without counting it as a retry), and
/// [`DownloadError::Throttled`] if sustained speed fell under the
/// configured threshold (caller should re-fetch with fresh signed URLs).
pub async fn download_to_file(
    http: &reqwest::Client,
    url: &str,
    output_path: &Path,
    opts: &FetchOptions,
    cancel: &CancellationToken,
    progress: &dyn ProgressSink,
) -> Result<(), DownloadError> {
    let mut existing_len = 0u64;
    if opts.resume {
        if let Ok(meta) = tokio::fs::metadata(output_path).await {
            existing_len = meta.len();
        }
    }

    let mut req = http.get(url);
    if existing_len > 0 {
        req = req.header(reqwest::header::RANGE, format!("bytes={existing_len}-"));
    }
    let resp = req
        .send()
        .await
        .map_err(|e| DownloadError::DownloadFailed(e.to_string()))?;

    let status = resp.status();
    if existing_len > 0 && status == reqwest::StatusCode::OK {
        // Upstream ignored our Range header; start over, uncounted.
        return Err(DownloadError::StartFresh);
    }
    if status != reqwest::StatusCode::PARTIAL_CONTENT && status != reqwest::StatusCode::OK {
        return Err(DownloadError::DownloadFailed(format!(
            "unexpected status {status}"
        )));
    }

    let append = status == reqwest::StatusCode::PARTIAL_CONTENT;
    let total = resp
        .content_length()
        .map(|len| if append { len + existing_len } else { len });

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(output_path)
        .await
        .map_err(DownloadError::Filesystem)?;

    let mut bucket = TokenBucket::new(opts.rate_limit_bytes_per_sec);
    let mut throttle_window = opts.throttle.map(|t| ThrottleWindow::new(t.detection_window));
    let mut written = existing_len;
    let mut last_sample = Instant::now();
    let mut last_sample_bytes = existing_len;
    let mut speed_ema = 0.0f64;

    let mut stream = resp.bytes_stream();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = file.flush().await;
                return Err(DownloadError::Cancelled);
            }
            next = stream.next() => next,
        };
        let chunk = match chunk {
            None => break,
            Some(Ok(c)) => c,
            Some(Err(e)) => {
                let _ = file.flush().await;
                return Err(DownloadError::DownloadFailed(e.to_string()));
            }
        };

        bucket.take(chunk.len() as u64).await;
        file.write_all(&chunk).await.map_err(DownloadError::Filesystem)?;
        written += chunk.len() as u64;

        let now = Instant::now();
        if let Some(win) = throttle_window.as_mut() {
            win.record(now, chunk.len() as u64);
            if let Some(avg) = win.rolling_average(now) {
                if let Some(cfg) = opts.throttle {
                    if avg < cfg.speed_threshold_bytes_per_sec as f64 {
                        let _ = file.flush().await;
                        return Err(DownloadError::Throttled);
                    }
                }
            }
        }

        if now.duration_since(last_sample) >= MIN_SAMPLE_INTERVAL {
            let elapsed = now.duration_since(last_sample).as_secs_f64();
            let instantaneous = (written - last_sample_bytes) as f64 / elapsed;
            speed_ema = SPEED_EMA_ALPHA * instantaneous + (1.0 - SPEED_EMA_ALPHA) * speed_ema;
            progress.on_progress(written, total, speed_ema);
            last_sample = now;
            last_sample_bytes = written;
        }
    }

    file.flush().await.map_err(DownloadError::Filesystem)?;
    progress.on_progress(written, total, speed_ema);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_bucket_does_not_delay_under_capacity() {
        let mut bucket = TokenBucket::new(1_000_000);
        let start = Instant::now();
        bucket.take(1000).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn throttle_window_requires_full_window_before_judging() {
        let mut win = ThrottleWindow::new(Duration::from_secs(1));
        let t0 = Instant::now();
        win.record(t0, 10);
        assert!(win.rolling_average(t0).is_none());
        assert!(win
            .rolling_average(t0 + Duration::from_millis(500))
            .is_none());
        win.record(t0 + Duration::from_millis(1100), 10);
        assert!(win
            .rolling_average(t0 + Duration::from_millis(1100))
            .is_some());
    }
}
