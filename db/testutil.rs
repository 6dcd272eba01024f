// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! Test helpers shared with dependent crates. Gated behind the `testutil`
//! feature rather than plain `#[cfg(test)]` so other crates in the
//! workspace can build fixtures against a real [`Catalog`] in their own
//! test binaries.

use jiff::Timestamp;

use crate::catalog::{AddToQueue, Catalog};
use crate::types::Source;

/// Opens an in-memory catalog with schema already applied.
pub fn test_catalog() -> Catalog {
    Catalog::open_in_memory().expect("in-memory catalog should always open")
}

/// A fixed instant convenient for deterministic fixtures.
pub fn test_now() -> Timestamp {
    "2024-01-15T10:00:00Z".parse().unwrap()
}

/// Enqueues a manual request for `video_id` on behalf of `user_id` at
/// [`test_now`], returning the resulting queue row.
pub fn enqueue_manual(cat: &Catalog, video_id: &str, user_id: &str) -> crate::types::QueueItem {
    cat.add_to_queue(
        AddToQueue {
            video_id: video_id.to_string(),
            user_id: Some(user_id.to_string()),
            priority: Some(0),
            source: Source::Manual,
            owner_user_ids: None,
        },
        test_now(),
    )
    .expect("enqueue should succeed in test fixtures")
}
