// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! The catalog store: durable local state for downloads, the download
//! queue, per-user ownership, and channel exclusions. See `catalog.rs`
//! for the single entry point, [`Catalog`].

mod catalog;
mod error;
mod schema;
mod types;
mod upgrade;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use crate::catalog::{AddToQueue, Catalog, UserDownloadStats};
pub use crate::error::{Error, ErrorKind};
pub use crate::types::{
    ChannelExclusion, Download, DownloadInput, DownloadMetadata, QueueItem, QueueStatus, Source,
    VideoUserStatus,
};
