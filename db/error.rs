// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

use std::fmt;

/// Classification of catalog failures, matching the taxonomy the rest of
/// the system uses to decide what to do with a failure (retry, surface to
/// the operator, 404 the request, ...).
#[derive(Copy, Clone, Eq, PartialEq, Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("connection error")]
    Connection,
    #[error("query error")]
    Query,
    #[error("not found")]
    NotFound,
    #[error("constraint violation")]
    Constraint,
    #[error("unknown catalog error")]
    Unknown,
}

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

    pub fn kind(&self) -> ErrorKind {
        self.kind
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

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Error {
        let kind = match &e {
            rusqlite::Error::QueryReturnedNoRows => ErrorKind::NotFound,
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ErrorKind::Constraint
            }
            _ => ErrorKind::Query,
        };
        Error {
            kind,
            msg: None,
            source: Some(Box::new(e)),
        }
    }
}

impl From<rusqlite::Error> for base::Error {
    fn from(e: rusqlite::Error) -> base::Error {
        let err: Error = e.into();
        base::Error::wrap(
            match err.kind() {
                ErrorKind::NotFound => base::ErrorKind::NotFound,
                ErrorKind::Constraint => base::ErrorKind::AlreadyExists,
                ErrorKind::Connection => base::ErrorKind::Unavailable,
                _ => base::ErrorKind::Internal,
            },
            err,
        )
    }
}

impl From<Error> for base::Error {
    fn from(e: Error) -> base::Error {
        let kind = match e.kind() {
            ErrorKind::NotFound => base::ErrorKind::NotFound,
            ErrorKind::Constraint => base::ErrorKind::AlreadyExists,
            ErrorKind::Connection => base::ErrorKind::Unavailable,
            ErrorKind::Query | ErrorKind::Unknown => base::ErrorKind::Internal,
        };
        base::Error::wrap(kind, e)
    }
}
