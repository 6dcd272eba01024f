// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! The queue processor (C7): a long-lived task that gates concurrency,
//! dispatches ready items to the pipeline, and drives the retry/backoff
//! state machine. Grounded on `db::writer`'s dispatch-loop shape and the
//! top-level task-spawning style of a `run` subcommand's async entry
//! point: one tick fires on a timer and on key events via a notify
//! channel, the way a `Syncer` wakes on both a timer and explicit pokes.

use crate::pipeline::{Pipeline, PipelineOutcome};
use db::{Catalog, QueueItem};
use jiff::{Span, Timestamp};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_minutes: u32,
    pub throttle_max_retries: u32,
}

/// Matches the error message against the classifier's pattern sets in
/// `## 4.7`. Case-insensitive.
fn classify(message: &str) -> Classification {
    let lower = message.to_lowercase();
    const PERMANENT: &[&str] = &[
        "unavailable",
        "private",
        "deleted",
        "removed",
        "age-restrict",
        "copyright",
        "blocked",
        "sign-in",
        "login required",
        "members-only",
    ];
    const TEMPORARY: &[&str] = &["no suitable stream", "processing", "try later", "temporarily"];

    if PERMANENT.iter().any(|p| lower.contains(p)) {
        Classification::Permanent
    } else if TEMPORARY.iter().any(|p| lower.contains(p)) {
        Classification::Temporary
    } else {
        Classification::Transient
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Classification {
    Permanent,
    Temporary,
    Transient,
}

/// Computes the next retry delay for the `k`-th automatic retry:
/// `baseDelay × 4^(k-1)`. See testable property 7.
fn backoff_delay(base_delay_minutes: u32, k: u32) -> Span {
    let multiplier = 4i64.checked_pow(k.saturating_sub(1)).unwrap_or(i64::MAX);
    Span::new().minutes(base_delay_minutes as i64 * multiplier)
}

/// Applies the failure classifier and policy from `## 4.7`, returning the
/// catalog mutation to perform.
fn handle_failure(catalog: &Catalog, video_id: &str, message: &str, prior_retry_count: i32, policy: RetryPolicy, now: Timestamp) {
    let classification = classify(message);
    let new_retry_count = prior_retry_count + 1;

    let result = if classification == Classification::Permanent {
        catalog.update_queue_status(video_id, db::QueueStatus::Failed, Some(message), now)
    } else if new_retry_count as u32 > policy.max_retries {
        let msg = format!("{message} (max retries reached)");
        catalog.update_queue_status(video_id, db::QueueStatus::Failed, Some(&msg), now)
    } else {
        let delay = backoff_delay(policy.base_delay_minutes, new_retry_count as u32);
        let next_retry_at = now.checked_add(delay).unwrap_or(now);
        catalog.schedule_retry(video_id, message, new_retry_count, next_retry_at)
    };
    if let Err(e) = result {
        warn!(video_id, error = %e, "failed to record queue failure");
    }
}

/// Shared state for the queue processor's active-dispatch gate.
pub struct QueueProcessor {
    catalog: Catalog,
    pipeline: Arc<Pipeline>,
    policy: RetryPolicy,
    max_concurrent: u32,
    active_count: AtomicUsize,
    pub notify: Arc<Notify>,
}

impl QueueProcessor {
    pub fn new(catalog: Catalog, pipeline: Arc<Pipeline>, policy: RetryPolicy, max_concurrent: u32) -> Self {
        QueueProcessor {
            catalog,
            pipeline,
            policy,
            max_concurrent,
            active_count: AtomicUsize::new(0),
            notify: Arc::new(Notify::new()),
        }
    }

    /// One tick of the dispatch algorithm in `## 4.7`.
    pub async fn tick(self: &Arc<Self>) {
        if self.active_count.load(Ordering::SeqCst) as u32 >= self.max_concurrent {
            return;
        }
        let now = Timestamp::now();
        let item = match self.catalog.get_next_queue_item(now) {
            Ok(Some(item)) => item,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "failed to query next queue item");
                return;
            }
        };

        // Claim: the linearization point for "at most one concurrent fetch
        // per videoId" (invariant 5).
        if let Err(e) = self.catalog.update_queue_status(&item.video_id, db::QueueStatus::Downloading, None, now) {
            warn!(video_id = %item.video_id, error = %e, "failed to claim queue item, skipping");
            return;
        }

        self.active_count.fetch_add(1, Ordering::SeqCst);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.dispatch_one(item).await;
            this.active_count.fetch_sub(1, Ordering::SeqCst);
            this.notify.notify_one();
        });
    }

    async fn dispatch_one(&self, item: QueueItem) {
        let video_id = item.video_id.clone();
        let cancel = CancellationToken::new();
        let now = Timestamp::now();
        let outcome = self.pipeline.run(&item, &cancel, now).await;
        let now = Timestamp::now();
        match outcome {
            PipelineOutcome::Completed => {
                info!(video_id, "download completed");
            }
            PipelineOutcome::RestartedWithoutRetry => {
                info!(video_id, "restarting without resume, not counted as a retry");
            }
            PipelineOutcome::Throttled => {
                if (item.throttle_retry_count as u32) < self.policy.throttle_max_retries {
                    let new_count = item.throttle_retry_count + 1;
                    if let Err(e) =
                        self.catalog
                            .increment_throttle_retry(&video_id, "download throttled", new_count)
                    {
                        warn!(video_id, error = %e, "failed to record throttle retry");
                    }
                } else {
                    handle_failure(&self.catalog, &video_id, "download throttled", item.retry_count, self.policy, now);
                }
            }
            PipelineOutcome::Failed(message) => {
                handle_failure(&self.catalog, &video_id, &message, item.retry_count, self.policy, now);
            }
        }
    }

    /// Runs the tick loop until `cancel` fires, waking on the processor
    /// interval or on an explicit [`Self::notify`] (enqueue/complete/fail).
    pub async fn run_loop(self: Arc<Self>, tick_interval: std::time::Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("queue processor shutting down");
                    return;
                }
                _ = tokio::time::sleep(tick_interval) => {}
                _ = self.notify.notified() => {}
            }
            self.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_permanent_case_insensitively() {
        assert_eq!(classify("Video is UNAVAILABLE"), Classification::Permanent);
        assert_eq!(classify("This video is private"), Classification::Permanent);
    }

    #[test]
    fn classifies_temporary() {
        assert_eq!(classify("no suitable stream found"), Classification::Temporary);
    }

    #[test]
    fn classifies_transient_otherwise() {
        assert_eq!(classify("connection reset by peer"), Classification::Transient);
    }

    #[test]
    fn backoff_matches_law() {
        assert_eq!(backoff_delay(1, 1), Span::new().minutes(1));
        assert_eq!(backoff_delay(1, 2), Span::new().minutes(4));
        assert_eq!(backoff_delay(1, 3), Span::new().minutes(16));
        assert_eq!(backoff_delay(1, 4), Span::new().minutes(64));
    }

    #[test]
    fn handle_failure_permanent_does_not_touch_retry_count() {
        let catalog = db::testutil::test_catalog();
        let now: Timestamp = "2024-01-15T10:00:00Z".parse().unwrap();
        db::testutil::enqueue_manual(&catalog, "dQw4w9WgXcQ", "alice");
        catalog
            .update_queue_status("dQw4w9WgXcQ", db::QueueStatus::Downloading, None, now)
            .unwrap();
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay_minutes: 1,
            throttle_max_retries: 3,
        };
        handle_failure(&catalog, "dQw4w9WgXcQ", "Video is unavailable", 0, policy, now);
        let item = catalog.get_queue_item("dQw4w9WgXcQ").unwrap().unwrap();
        assert_eq!(item.status, db::QueueStatus::Failed);
        assert_eq!(item.retry_count, 0);
        assert!(item.next_retry_at.is_none());
    }

    #[test]
    fn handle_failure_schedules_backoff_for_transient() {
        let catalog = db::testutil::test_catalog();
        let now: Timestamp = "2024-01-15T10:00:00Z".parse().unwrap();
        db::testutil::enqueue_manual(&catalog, "dQw4w9WgXcQ", "alice");
        catalog
            .update_queue_status("dQw4w9WgXcQ", db::QueueStatus::Downloading, None, now)
            .unwrap();
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay_minutes: 1,
            throttle_max_retries: 3,
        };
        handle_failure(&catalog, "dQw4w9WgXcQ", "network blip", 0, policy, now);
        let item = catalog.get_queue_item("dQw4w9WgXcQ").unwrap().unwrap();
        assert_eq!(item.status, db::QueueStatus::Pending);
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.next_retry_at.unwrap(), now.checked_add(Span::new().minutes(1)).unwrap());
    }

    #[test]
    fn handle_failure_fails_after_max_retries() {
        let catalog = db::testutil::test_catalog();
        let now: Timestamp = "2024-01-15T10:00:00Z".parse().unwrap();
        db::testutil::enqueue_manual(&catalog, "dQw4w9WgXcQ", "alice");
        catalog
            .update_queue_status("dQw4w9WgXcQ", db::QueueStatus::Downloading, None, now)
            .unwrap();
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay_minutes: 1,
            throttle_max_retries: 3,
        };
        handle_failure(&catalog, "dQw4w9WgXcQ", "network blip", 3, policy, now);
        let item = catalog.get_queue_item("dQw4w9WgXcQ").unwrap().unwrap();
        assert_eq!(item.status, db::QueueStatus::Failed);
        assert!(item.error_message.unwrap().contains("(max retries reached)"));
    }
}
