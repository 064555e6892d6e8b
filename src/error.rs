//! Error taxonomy for the counting core.
//!
//! Configuration failures are fatal at startup. Storage failures are
//! recoverable: the gateway falls back to local files and the allocator falls
//! back to its in-memory seed. Detector and tracker failures only cost the
//! current frame.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CountError {
    /// Zone resource missing or malformed.
    #[error("config error: {0}")]
    Config(String),

    /// Durable store lookup or write failed.
    #[error("remote store error: {0}")]
    RemoteStore(String),

    /// Local fallback write failed.
    #[error("local fallback error: {0}")]
    LocalFallback(String),

    #[error("detector error: {0}")]
    Detector(String),

    #[error("tracker error: {0}")]
    Tracker(String),
}

impl CountError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn remote(msg: impl std::fmt::Display) -> Self {
        Self::RemoteStore(msg.to_string())
    }

    pub fn fallback(msg: impl std::fmt::Display) -> Self {
        Self::LocalFallback(msg.to_string())
    }

    /// True for failures that must stop the process before the frame loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

impl From<rusqlite::Error> for CountError {
    fn from(err: rusqlite::Error) -> Self {
        Self::RemoteStore(err.to_string())
    }
}

pub type CountResult<T> = std::result::Result<T, CountError>;
