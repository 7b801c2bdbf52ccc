pub mod cache;
pub mod http_json;
pub mod octopus;

pub use cache::CachingFetcher;
pub use http_json::{HttpJsonFetcher, HttpSettings};
pub use octopus::{Account, OctopusClient};

use serde_json::Value;

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("{url} returned HTTP {status}")]
    Status { status: u16, url: String },
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("bad pagination cursor '{0}'")]
    Pagination(String),
    #[error("tariff code is not electricity or gas: {0}")]
    UnknownUtility(String),
    #[error("malformed tariff code: {0}")]
    MalformedTariff(String),
    #[error("no pricing links for tariff {tariff_code} in product {product_code}")]
    TariffNotFound { tariff_code: String, product_code: String },
    #[error("response cache error: {0}")]
    Cache(String),
}

impl FetchError {
    /// Transport failures, rate limiting and server errors are worth another try.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport { .. } => true,
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// GET a JSON document.
///
/// `url` is either absolute or relative to the API prefix; `query` is
/// appended as URL parameters.
#[async_trait::async_trait]
pub trait JsonFetcher: Send + Sync {
    async fn get_json(&self, url: &str, query: &[(String, String)]) -> Result<Value, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        let status = |status| FetchError::Status { status, url: "u".into() };
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(FetchError::Transport { url: "u".into(), message: "reset".into() }.is_retryable());
        assert!(!FetchError::Pagination("x".into()).is_retryable());
    }
}
