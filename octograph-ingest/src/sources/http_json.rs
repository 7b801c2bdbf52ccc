use std::time::Duration;

use serde_json::Value;
use tokio::{sync::Mutex, time::Instant};

use super::{FetchError, JsonFetcher};

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub api_prefix: String,
    pub api_key: String,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Minimum spacing between consecutive requests.
    pub min_request_interval: Duration,
}

/// Authenticated JSON client for the provider API.
///
/// Requests are spaced at least `min_request_interval` apart across all
/// callers and retried with linear backoff when [`FetchError::is_retryable`].
pub struct HttpJsonFetcher {
    client: reqwest::Client,
    settings: HttpSettings,
    last_request: Mutex<Option<Instant>>,
}

impl HttpJsonFetcher {
    pub fn new(settings: HttpSettings) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| FetchError::Transport {
                url: settings.api_prefix.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            settings,
            last_request: Mutex::new(None),
        })
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!(
                "{}/{}",
                self.settings.api_prefix.trim_end_matches('/'),
                url.trim_start_matches('/')
            )
        }
    }

    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(at) = *last {
            let ready_at = at + self.settings.min_request_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn get_once(&self, url: &str, query: &[(String, String)]) -> Result<Value, FetchError> {
        self.throttle().await;
        metrics::counter!("octopus_api_requests_total").increment(1);

        let response = self
            .client
            .get(url)
            .basic_auth(&self.settings.api_key, Some(""))
            .query(query)
            .send()
            .await
            .map_err(|e| FetchError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        response.json::<Value>().await.map_err(|e| FetchError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl JsonFetcher for HttpJsonFetcher {
    async fn get_json(&self, url: &str, query: &[(String, String)]) -> Result<Value, FetchError> {
        let url = self.resolve(url);

        let mut attempt: u32 = 0;
        loop {
            match self.get_once(&url, query).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    let sleep_for = self.settings.retry_backoff * attempt;
                    tracing::warn!(error = %e, attempt, url = %url, "Octopus API request failed, retrying");
                    metrics::counter!("octopus_api_retry_total").increment(1);
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    metrics::counter!("octopus_api_errors_total").increment(1);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::get, Json, Router};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn settings(api_prefix: String) -> HttpSettings {
        HttpSettings {
            api_prefix,
            api_key: "sk_test".into(),
            max_retries: 2,
            retry_backoff: Duration::from_millis(1),
            min_request_interval: Duration::ZERO,
        }
    }

    /// Serves `/flaky/`, which fails `failures` times before answering.
    async fn serve(failures: usize) -> (String, Arc<AtomicUsize>) {
        async fn flaky(
            State((hits, failures)): State<(Arc<AtomicUsize>, usize)>,
            headers: HeaderMap,
        ) -> (StatusCode, Json<Value>) {
            let n = hits.fetch_add(1, Ordering::SeqCst);
            if !headers.contains_key("authorization") {
                return (StatusCode::UNAUTHORIZED, Json(Value::Null));
            }
            if n < failures {
                (StatusCode::SERVICE_UNAVAILABLE, Json(Value::Null))
            } else {
                (StatusCode::OK, Json(serde_json::json!({ "ok": true })))
            }
        }

        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/v1/flaky/", get(flaky))
            .with_state((hits.clone(), failures));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}/v1"), hits)
    }

    #[test]
    fn relative_paths_join_the_api_prefix() {
        let fetcher = HttpJsonFetcher::new(settings("https://api.octopus.energy/v1/".into())).unwrap();
        assert_eq!(fetcher.resolve("accounts/A-1/"), "https://api.octopus.energy/v1/accounts/A-1/");
        assert_eq!(
            fetcher.resolve("https://api.octopus.energy/v1/products/?page=2"),
            "https://api.octopus.energy/v1/products/?page=2"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_requests_wait_for_the_minimum_interval() {
        let fetcher = HttpJsonFetcher::new(HttpSettings {
            min_request_interval: Duration::from_millis(500),
            ..settings("http://127.0.0.1:9/v1".into())
        })
        .unwrap();

        let start = Instant::now();
        fetcher.throttle().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        fetcher.throttle().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
        fetcher.throttle().await;
        assert!(start.elapsed() >= Duration::from_millis(1000));

        tokio::time::advance(Duration::from_secs(2)).await;
        let idle = Instant::now();
        fetcher.throttle().await;
        assert_eq!(idle.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let (prefix, hits) = serve(2).await;
        let fetcher = HttpJsonFetcher::new(settings(prefix)).unwrap();

        let value = fetcher.get_json("flaky/", &[]).await.unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let (prefix, hits) = serve(10).await;
        let fetcher = HttpJsonFetcher::new(settings(prefix)).unwrap();

        let err = fetcher.get_json("flaky/", &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
