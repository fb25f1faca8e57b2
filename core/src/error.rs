//! Error taxonomy for matching and sync.
//!
//! A missing match is not an error: it is `MatchMethod::NoMatch`. Storage and
//! configuration failures travel as `anyhow::Error`.

use thiserror::Error;

/// Failure of a single match attempt. The enrichment loop retries these and
/// never lets them escape a meal.
#[derive(Error, Debug)]
pub enum MatchError {
    #[error("transient network failure: {0}")]
    TransientNetworkFailure(String),

    #[error("reference store error: {0:#}")]
    Store(anyhow::Error),
}

/// Failure reported by a completion API client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompletionError {
    #[error("completion API timed out")]
    Timeout,

    #[error("completion API unreachable: {0}")]
    Network(String),

    #[error("invalid model response: {0}")]
    InvalidModelResponse(String),
}

/// Failure reported by a remote backend client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("remote conflict (server updated at {server_updated_at:?})")]
    Conflict { server_updated_at: Option<String> },

    #[error("remote record not found")]
    NotFound,

    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl RemoteError {
    /// Worth retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }
}

/// Terminal outcome of pushing one queue entry, as surfaced to the UI.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("remote unavailable, change stays queued: {0}")]
    RemoteUnavailable(String),

    #[error("conflict resolved by policy")]
    RemoteConflict,

    #[error("gave up after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}
