//! Error type shared by every runtime-interaction component

use std::time::Duration;
use thiserror::Error;

/// Coarse classification callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AmbiguousTarget,
    Transient,
    Unsupported,
    Timeout,
    Protocol,
    ResourceExhausted,
    InvalidPath,
}

#[derive(Debug, Error)]
pub enum CriError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("ambiguous target: {0}")]
    AmbiguousTarget(String),

    #[error("engine error: {0}")]
    Transient(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("helper protocol error: {0}")]
    Protocol(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("gateway queue is full")]
    QueueFull,

    #[error("container {0} has no merged dir and no mount covers the path")]
    InvalidMergedDir(String),

    #[error("too many symlinks while resolving {0}")]
    TooManySymlinks(String),

    #[error("no writable mount encloses {0}")]
    NoWritableMount(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CriError>;

impl CriError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CriError::NotFound(_) => ErrorKind::NotFound,
            CriError::AmbiguousTarget(_) => ErrorKind::AmbiguousTarget,
            CriError::Transient(_) | CriError::Io(_) => ErrorKind::Transient,
            CriError::Unsupported(_) | CriError::NoWritableMount(_) => ErrorKind::Unsupported,
            CriError::Timeout(_) => ErrorKind::Timeout,
            CriError::Protocol(_) => ErrorKind::Protocol,
            CriError::ResourceExhausted(_) | CriError::QueueFull => ErrorKind::ResourceExhausted,
            CriError::InvalidMergedDir(_) | CriError::TooManySymlinks(_) => ErrorKind::InvalidPath,
        }
    }

    /// Exit code reported for an exec that failed with this error
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CriError::Timeout(_) => Some(-1),
            _ => None,
        }
    }

    pub fn transient(e: impl std::fmt::Display) -> Self {
        CriError::Transient(e.to_string())
    }

    pub fn protocol(e: impl std::fmt::Display) -> Self {
        CriError::Protocol(e.to_string())
    }
}

impl From<bollard::errors::Error> for CriError {
    fn from(e: bollard::errors::Error) -> Self {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => CriError::NotFound(message),
            bollard::errors::Error::IOError { err } => CriError::Io(err),
            other => CriError::Transient(other.to_string()),
        }
    }
}

impl From<hyper::Error> for CriError {
    fn from(e: hyper::Error) -> Self {
        CriError::Transient(e.to_string())
    }
}

impl From<http::Error> for CriError {
    fn from(e: http::Error) -> Self {
        CriError::Transient(e.to_string())
    }
}

impl From<serde_json::Error> for CriError {
    fn from(e: serde_json::Error) -> Self {
        CriError::Protocol(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for CriError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CriError::Timeout(Duration::ZERO)
    }
}
