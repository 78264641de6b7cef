use thiserror::Error;

/// Failures raised by the cache store, its codec, or record lookups.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {message}")]
    Backend { message: String },
    #[error("cache entry could not be encoded or decoded: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("cache entry compression failed: {0}")]
    Compression(String),
    #[error("record lookup failed: {message}")]
    Record { message: String },
}

impl CacheError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend {
            message: err.to_string(),
        }
    }

    pub fn record(err: impl std::fmt::Display) -> Self {
        Self::Record {
            message: err.to_string(),
        }
    }
}
