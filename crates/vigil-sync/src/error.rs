//! Error types for the sync layer.
//!
//! Everything here resolves inside the subsystem: transport errors feed the
//! retry state machine, history errors degrade to empty windows. Nothing is
//! thrown across a subscriber boundary.

use thiserror::Error;

/// Transport-level failure.
///
/// Carried as strings so the transport seam stays object-safe and fakes can
/// construct any failure shape.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Dial or upgrade failed before a stream was opened. Also covers an
    /// unusable feed URL, which no amount of retrying will fix.
    #[error("connect failed: {0}")]
    Connect(String),
    /// The open stream failed mid-session.
    #[error("stream error: {0}")]
    Stream(String),
}

/// Historical fetch failure.
///
/// The cache catches these, logs, and serves an empty window; they are never
/// cached as a negative result.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Request could not be sent or the body could not be decoded.
    #[error("history request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The endpoint answered with a non-success status.
    #[error("history request returned status {0}")]
    Status(u16),
}

/// Configuration file failure.
///
/// A missing file is not an error (defaults apply); an unreadable or
/// malformed one is.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid JSON for [`crate::SyncConfig`].
    #[error("invalid config file: {0}")]
    Json(#[from] serde_json::Error),
}
