// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! The error taxonomies layered on top of `base::Error` for each
//! component family that isn't the catalog (which has its own, in
//! `db::Error`). See `# 7. ERROR HANDLING DESIGN`.

use base::ErrorKind;

/// Network/proxy errors: talking to the upstream frontend, the upstream
/// DB, or the companion endpoint.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    #[error("invalid response from {url}: {message}")]
    InvalidResponse { url: String, message: String },
}

impl From<NetworkError> for base::Error {
    fn from(e: NetworkError) -> base::Error {
        let kind = match &e {
            NetworkError::Timeout { .. } => ErrorKind::DeadlineExceeded,
            NetworkError::Network(_) => ErrorKind::Unavailable,
            NetworkError::InvalidResponse { .. } => ErrorKind::Unknown,
        };
        base::Error::wrap(kind, e)
    }
}

/// Errors from the download pipeline (C4/C6). `Throttled` and `StartFresh`
/// are distinguished so the pipeline and queue processor can special-case
/// them instead of treating them as an ordinary failure; see §9.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("no suitable streams found")]
    NoStreams,

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("mux failed: {0}")]
    MuxFailed(#[from] MuxerError),

    #[error("filesystem error: {0}")]
    Filesystem(#[source] std::io::Error),

    #[error("download cancelled")]
    Cancelled,

    /// Sustained below-threshold speed; re-fetch fresh URLs rather than resume.
    #[error("download throttled")]
    Throttled,

    /// The upstream refused a `Range` request with a `200`; discard the
    /// partial file and restart without counting it as a retry.
    #[error("upstream does not support resume, must start fresh")]
    StartFresh,
}

impl From<NetworkError> for DownloadError {
    fn from(e: NetworkError) -> DownloadError {
        DownloadError::DownloadFailed(e.to_string())
    }
}

impl From<DownloadError> for base::Error {
    fn from(e: DownloadError) -> base::Error {
        let kind = match &e {
            DownloadError::NoStreams => ErrorKind::NotFound,
            DownloadError::Cancelled => ErrorKind::Cancelled,
            DownloadError::Filesystem(_) => ErrorKind::Internal,
            _ => ErrorKind::Unknown,
        };
        base::Error::wrap(kind, e)
    }
}

/// Errors serving a cached file or range from C10.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid range")]
    InvalidRange,

    #[error("filesystem error: {0}")]
    Filesystem(#[source] std::io::Error),
}

impl From<ServeError> for base::Error {
    fn from(e: ServeError) -> base::Error {
        let kind = match &e {
            ServeError::NotFound(_) => ErrorKind::NotFound,
            ServeError::InvalidRange => ErrorKind::OutOfRange,
            ServeError::Filesystem(_) => ErrorKind::Internal,
        };
        base::Error::wrap(kind, e)
    }
}

/// Errors from the external muxer process (C5).
#[derive(Debug, thiserror::Error)]
pub enum MuxerError {
    #[error("muxer binary not found")]
    MuxerNotFound,

    #[error("input not found: {0}")]
    InputNotFound(String),

    #[error("muxer process exited with {exit_code:?}: {stderr_tail}")]
    ProcessError {
        exit_code: Option<i32>,
        stderr_tail: String,
    },
}

impl From<MuxerError> for base::Error {
    fn from(e: MuxerError) -> base::Error {
        let kind = match &e {
            MuxerError::MuxerNotFound => ErrorKind::Unavailable,
            MuxerError::InputNotFound(_) => ErrorKind::NotFound,
            MuxerError::ProcessError { .. } => ErrorKind::Internal,
        };
        base::Error::wrap(kind, e)
    }
}

/// Errors from a single candidate during an eviction sweep; tagged with the
/// videoId so the sweep's error ring can report which video failed.
#[derive(Debug, thiserror::Error)]
#[error("eviction error for {video_id}: {source}")]
pub struct EvictionError {
    pub video_id: String,
    #[source]
    pub source: EvictionErrorKind,
}

#[derive(Debug, thiserror::Error)]
pub enum EvictionErrorKind {
    #[error("catalog error: {0}")]
    Db(#[from] db::Error),

    #[error("filesystem error: {0}")]
    Fs(#[source] std::io::Error),

    #[error("{0}")]
    Unknown(String),
}
