use thiserror::Error;

/// Error taxonomy for the cache stream engine.
///
/// Every variant is cheaply `Clone`-able so the same error can be handed to
/// a pending `Stream Request`, published on a progress channel, and stashed
/// as `last_error` all from one occurrence.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("request timed out waiting for response headers")]
    RequestTimedOut,

    #[error("read timed out waiting for the next chunk")]
    ReadTimedOut,

    #[error("origin responded with unexpected status {0}")]
    HttpStatusCode(u16),

    #[error("origin range response did not match the requested range")]
    HttpRange,

    #[error("origin content changed since the partial download was saved")]
    CacheSourceChanged,

    #[error("cache was reset")]
    CacheReset,

    #[error("partial file length did not match the expected content length")]
    InvalidCacheLength,

    #[error("download stopped because the stream is no longer retained")]
    DownloadStopped,

    #[error("cache stream has been disposed")]
    CacheStreamDisposed,

    #[error("stream response was cancelled")]
    StreamResponseCancelled,

    #[error("response exceeded the configured max buffer size")]
    ExceededMaxBufferSize,

    #[error("invalid byte range")]
    InvalidRange,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("network error: {0}")]
    Network(String),
}

impl CacheError {
    /// True for the three "cache consistency" variants of spec.md §7 —
    /// these cannot be retried and must trigger `reset_cache` instead.
    pub fn is_invalid_cache(&self) -> bool {
        matches!(
            self,
            Self::CacheSourceChanged | Self::CacheReset | Self::InvalidCacheLength
        )
    }

    /// Maps onto the loopback server's HTTP status codes (spec.md §6).
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Self::InvalidRange | Self::HttpRange => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::DownloadStopped | Self::CacheStreamDisposed => StatusCode::SERVICE_UNAVAILABLE,
            Self::RequestTimedOut | Self::ReadTimedOut => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        Self::Io(format!("metadata JSON error: {e}"))
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::RequestTimedOut
        } else if let Some(status) = e.status() {
            Self::HttpStatusCode(status.as_u16())
        } else {
            Self::Network(e.to_string())
        }
    }
}
