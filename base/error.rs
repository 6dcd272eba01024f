// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.
//
// Error handling follows the shape moonfire-nvr's `base::Error` used
// before it replaced `failure` with `thiserror`: a fixed, gRPC-style
// `ErrorKind` carried alongside an optional source error and message.

use std::fmt;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/0e00c430827e81d61e1e7164ef04ca21ccbfaa77/include/grpcpp/impl/codegen/status_code_enum.h),
/// a general-purpose classification of errors.
#[derive(Copy, Clone, Eq, PartialEq, Debug, thiserror::Error)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    #[error("cancelled")] Cancelled,
    #[error("unknown")] Unknown,
    #[error("invalid argument")] InvalidArgument,
    #[error("deadline exceeded")] DeadlineExceeded,
    #[error("not found")] NotFound,
    #[error("already exists")] AlreadyExists,
    #[error("permission denied")] PermissionDenied,
    #[error("unauthenticated")] Unauthenticated,
    #[error("resource exhausted")] ResourceExhausted,
    #[error("failed precondition")] FailedPrecondition,
    #[error("aborted")] Aborted,
    #[error("out of range")] OutOfRange,
    #[error("unimplemented")] Unimplemented,
    #[error("internal")] Internal,
    #[error("unavailable")] Unavailable,
    #[error("data loss")] DataLoss,
}

/// An error tagged with an [`ErrorKind`], optionally wrapping a source error.
///
/// This is the common currency type crossing component boundaries: every
/// cross-component call in this crate returns `Result<T, Error>` (or a more
/// specific error enum that carries an `ErrorKind` the same way) so callers
/// can dispatch on `.kind()` without string-matching.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error {
            kind,
            msg: Some(msg.into()),
            source: None,
        }
    }

    pub fn wrap<E: std::error::Error + Send + Sync + 'static>(kind: ErrorKind, source: E) -> Self {
        Error {
            kind,
            msg: None,
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            kind,
            msg: None,
            source: None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.msg, &self.source) {
            (Some(m), _) => write!(f, "{}: {}", self.kind, m),
            (None, Some(s)) => write!(f, "{}: {}", self.kind, s),
            (None, None) => fmt::Display::fmt(&self.kind, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T, E> {
    /// Annotates an error with the given kind.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T, E> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(k, e))
    }
}

/// Like `anyhow::bail!`, but the first argument specifies an [`ErrorKind`].
///
/// ```
/// use streamvault_base::bail_t;
/// let e = || -> Result<(), streamvault_base::Error> {
///     bail_t!(Unauthenticated, "unknown user: {}", "alice");
/// }().unwrap_err();
/// assert_eq!(e.kind(), streamvault_base::ErrorKind::Unauthenticated);
/// assert_eq!(e.to_string(), "unauthenticated: unknown user: alice");
/// ```
#[macro_export]
macro_rules! bail_t {
    ($t:ident, $e:expr) => {
        return Err($crate::Error::new($crate::ErrorKind::$t, $e));
    };
    ($t:ident, $fmt:expr, $($arg:tt)+) => {
        return Err($crate::Error::new($crate::ErrorKind::$t, format!($fmt, $($arg)+)));
    };
}

/// Tags a freshly built error with an [`ErrorKind`], the `format_err!` cousin of [`bail_t!`].
///
/// ```
/// use streamvault_base::format_err_t;
/// let e = format_err_t!(Unauthenticated, "unknown user: {}", "alice");
/// assert_eq!(e.kind(), streamvault_base::ErrorKind::Unauthenticated);
/// ```
#[macro_export]
macro_rules! format_err_t {
    ($t:ident, $e:expr) => {
        $crate::Error::new($crate::ErrorKind::$t, $e)
    };
    ($t:ident, $fmt:expr, $($arg:tt)+) => {
        $crate::Error::new($crate::ErrorKind::$t, format!($fmt, $($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let e = format_err_t!(NotFound, "video {}", "dQw4w9WgXcQ");
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert_eq!(e.to_string(), "not found: video dQw4w9WgXcQ");
    }

    #[test]
    fn wrap_preserves_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let e = Error::wrap(ErrorKind::Internal, io_err);
        assert_eq!(e.kind(), ErrorKind::Internal);
        assert!(std::error::Error::source(&e).is_some());
    }
}
