use courier_shared::ProtocolError;
use courier_store::StoreError;
use thiserror::Error;

use crate::schedule::ScheduleRejection;

/// Errors returned by the [`Courier`](crate::Courier) facade.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Schedule rejected: {0}")]
    Schedule(#[from] ScheduleRejection),

    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),

    #[error("No pending message {local_id} in {key}")]
    UnknownEntry { key: String, local_id: String },

    #[error("Entry {0} is not in a retryable state")]
    NotRetryable(String),

    #[error("State lock poisoned")]
    LockPoisoned,
}

/// Failure of a single send call, as reported by the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Connection dropped, timeout, ... The same request may succeed later.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The server refused the request with an error code.
    #[error("Rejected by server: {code}")]
    Rejected { code: String },
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SendError::Transport(_) => true,
            SendError::Rejected { code } => {
                courier_shared::constants::RETRYABLE_SEND_ERROR_CODES.contains(&code.as_str())
            }
        }
    }
}

/// Network-level failure from a [`Fetcher`](crate::download::Fetcher) or a
/// body stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct FetchError(pub String);

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        Self(e.to_string())
    }
}

/// A [`ChunkSink`](crate::download::ChunkSink) could not take the data.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct SinkError(pub String);

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

/// Terminal outcome of a failed download.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Download cancelled")]
    Cancelled,

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("URL rejected with {status} after {refreshes} refreshes")]
    UrlExpired { status: u16, refreshes: u32 },

    #[error("URL refresh failed: {0}")]
    Refresh(FetchError),

    #[error("Transport error after retries: {0}")]
    Transport(FetchError),

    #[error("Body ended at {received} of {total} bytes")]
    Incomplete { received: u64, total: u64 },

    #[error("Server cannot satisfy the requested range")]
    RangeNotSatisfiable,

    #[error("Chunk sink failed: {0}")]
    Sink(#[from] SinkError),
}
