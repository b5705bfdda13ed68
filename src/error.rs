use thiserror::Error;

/// Errors surfaced by the fetcher and the response cache.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid proxy {proxy}: {source}")]
    Proxy {
        proxy: String,
        source: reqwest::Error,
    },
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl FetchError {
    /// Whether retrying the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(error) => is_transient(error),
            _ => false,
        }
    }
}

/// Connection (TLS included), timeout, body/chunked-transfer and decoding
/// failures are transient, as is a missing or invalid URL scheme. Redirect
/// loops and everything else are not.
pub(crate) fn is_transient(error: &reqwest::Error) -> bool {
    error.is_connect()
        || error.is_timeout()
        || error.is_request()
        || error.is_body()
        || error.is_decode()
        || error.is_builder()
}
