use thiserror::Error;

/// Transport-level failure from a [`crate::fetch::PageFetcher`].
///
/// The `Display` text is what the failure analyzer inspects, so timeout and
/// TLS variants keep those words in their messages.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out after {0}s")]
    Timeout(u64),
    #[error("ssl/tls certificate error: {0}")]
    Tls(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("empty response for {0}")]
    EmptyResponse(String),
}

/// Failure reading or writing a persisted store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("bad timestamp {0:?}")]
    Timestamp(String),
}
