//! Error types for sessions, locks, services and the watcher.

use extsvc_backend::BackendError;
use thiserror::Error;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("lock key must not be empty")]
    EmptyLockKey,

    #[error("key {0} does not exist")]
    NoSuchKey(String),

    /// Another session holds the lock.
    #[error("lock {0} is held by another session")]
    AlreadyHeld(String),

    #[error("release of {0} rejected: held by another session")]
    ReleaseRejected(String),

    #[error("no session held for lock {0}")]
    NoSession(String),

    #[error("lock {0} is not locked")]
    NotLocked(String),

    #[error("lock {key} is locked by session {holder}")]
    LockedByOther { key: String, holder: String },

    /// A stored service definition could not be decoded.
    #[error("invalid definition at {key}: {source}")]
    Definition {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("encoding error: {0}")]
    Encode(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The backend could not be reached.
    BackendUnavailable,
    /// A key, session or check does not exist.
    NotFound,
    /// A compare-and-swap lost against another session.
    Contention,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Backend(e) if e.is_unavailable() => ErrorKind::BackendUnavailable,
            Error::Backend(e) if e.is_not_found() => ErrorKind::NotFound,
            Error::NoSuchKey(_) => ErrorKind::NotFound,
            Error::AlreadyHeld(_) | Error::ReleaseRejected(_) | Error::LockedByOther { .. } => {
                ErrorKind::Contention
            }
            _ => ErrorKind::Other,
        }
    }

    pub fn is_contention(&self) -> bool {
        self.kind() == ErrorKind::Contention
    }

    pub fn is_unavailable(&self) -> bool {
        self.kind() == ErrorKind::BackendUnavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        let unavailable = Error::from(BackendError::Unavailable("refused".into()));
        assert_eq!(unavailable.kind(), ErrorKind::BackendUnavailable);
        assert!(unavailable.is_unavailable());

        let missing = Error::from(BackendError::Status {
            status: 404,
            body: String::new(),
        });
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert_eq!(Error::NoSuchKey("k".into()).kind(), ErrorKind::NotFound);

        assert!(Error::AlreadyHeld("k".into()).is_contention());
        assert!(
            Error::LockedByOther {
                key: "k".into(),
                holder: "s".into()
            }
            .is_contention()
        );
        assert_eq!(Error::EmptyLockKey.kind(), ErrorKind::Other);
    }
}
