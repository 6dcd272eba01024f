// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! Clock interface and implementations for testability.
//!
//! Everything in this crate that compares timestamps (retry scheduling,
//! the subscription watcher's quick-check, eviction's age cutoff) goes
//! through a [`Clocks`] implementation rather than calling
//! `jiff::Timestamp::now()` or `tokio::time::sleep` directly, so tests can
//! substitute [`SimulatedClocks`] and assert on exact scheduling without
//! waiting in real time.

use async_trait::async_trait;
use jiff::{Span, Timestamp};
use std::sync::Mutex;
use std::time::Duration;

/// Abstract interface to the system clock.
#[async_trait]
pub trait Clocks: Send + Sync + 'static {
    /// Returns the current wall-clock time.
    fn now(&self) -> Timestamp;

    /// Suspends the caller for approximately `dur`.
    async fn sleep(&self, dur: Duration);
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks;

#[async_trait]
impl Clocks for RealClocks {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }

    async fn sleep(&self, dur: Duration) {
        tokio::time::sleep(dur).await;
    }
}

/// A clock whose wall-clock time only advances when explicitly told to
/// (construction, or a call to [`SimulatedClocks::advance`]) or implicitly
/// when `sleep` is awaited — `sleep` never actually suspends, it jumps the
/// clock forward by `dur` and returns immediately. This lets tests exercise
/// multi-hour backoff schedules or multi-day eviction windows instantly.
#[derive(Clone)]
pub struct SimulatedClocks(std::sync::Arc<Mutex<Timestamp>>);

impl SimulatedClocks {
    pub fn new(start: Timestamp) -> Self {
        SimulatedClocks(std::sync::Arc::new(Mutex::new(start)))
    }

    pub fn advance(&self, span: Span) {
        let mut g = self.0.lock().unwrap();
        *g = g.checked_add(span).expect("simulated clock overflow");
    }
}

#[async_trait]
impl Clocks for SimulatedClocks {
    fn now(&self) -> Timestamp {
        *self.0.lock().unwrap()
    }

    async fn sleep(&self, dur: Duration) {
        let span = Span::try_from(dur).expect("duration fits in a jiff::Span");
        self.advance(span);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_sleep_advances_without_waiting() {
        let clocks = SimulatedClocks::new("2024-01-15T10:00:00Z".parse().unwrap());
        let before = clocks.now();
        clocks.sleep(Duration::from_secs(3600)).await;
        let after = clocks.now();
        assert_eq!((after - before).total(jiff::Unit::Second).unwrap(), 3600.0);
    }
}
