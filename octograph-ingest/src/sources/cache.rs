use std::path::{Path, PathBuf};

use serde_json::Value;

use super::{FetchError, JsonFetcher};

/// Serves responses from a directory of JSON files, fetching and storing on
/// a miss. Entries never expire.
pub struct CachingFetcher<F> {
    inner: F,
    dir: PathBuf,
}

impl<F> CachingFetcher<F> {
    pub fn new(inner: F, dir: impl Into<PathBuf>) -> Self {
        Self { inner, dir: dir.into() }
    }

    fn path_for(&self, url: &str, query: &[(String, String)]) -> PathBuf {
        self.dir.join(format!("{}.json", cache_file_name(url, query)))
    }
}

/// Request URL with its query, every character outside `[0-9A-Za-z-]`
/// replaced by `_`.
pub fn cache_file_name(url: &str, query: &[(String, String)]) -> String {
    let mut key = url.to_string();
    for (i, (k, v)) in query.iter().enumerate() {
        key.push(if i == 0 { '?' } else { '&' });
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

async fn read_cached(path: &Path) -> Result<Option<Value>, FetchError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| FetchError::Cache(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FetchError::Cache(format!("{}: {e}", path.display()))),
    }
}

#[async_trait::async_trait]
impl<F> JsonFetcher for CachingFetcher<F>
where
    F: JsonFetcher,
{
    async fn get_json(&self, url: &str, query: &[(String, String)]) -> Result<Value, FetchError> {
        let path = self.path_for(url, query);
        if let Some(value) = read_cached(&path).await? {
            metrics::counter!("octopus_api_cache_hits_total").increment(1);
            tracing::debug!(path = %path.display(), "serving response from cache");
            return Ok(value);
        }

        let value = self.inner.get_json(url, query).await?;

        let bytes = serde_json::to_vec(&value).map_err(|e| FetchError::Cache(e.to_string()))?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| FetchError::Cache(format!("{}: {e}", self.dir.display())))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| FetchError::Cache(format!("{}: {e}", path.display())))?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl JsonFetcher for CountingFetcher {
        async fn get_json(&self, url: &str, _query: &[(String, String)]) -> Result<Value, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({ "url": url }))
        }
    }

    fn query(page: &str) -> Vec<(String, String)> {
        vec![
            ("period_from".into(), "2023-01-01T00:00:00Z".into()),
            ("page".into(), page.into()),
        ]
    }

    #[test]
    fn file_names_keep_only_safe_characters() {
        assert_eq!(
            cache_file_name("accounts/A-1/", &query("2")),
            "accounts_A-1__period_from_2023-01-01T00_00_00Z_page_2"
        );
    }

    #[tokio::test]
    async fn second_request_is_served_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = CachingFetcher::new(CountingFetcher::default(), dir.path().join("cache"));

        let first = fetcher.get_json("products/VAR-22-11-01/", &query("1")).await.unwrap();
        let second = fetcher.get_json("products/VAR-22-11-01/", &query("1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fetcher.inner.calls.load(Ordering::SeqCst), 1);

        fetcher.get_json("products/VAR-22-11-01/", &query("2")).await.unwrap();
        assert_eq!(fetcher.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn corrupt_entries_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = CachingFetcher::new(CountingFetcher::default(), dir.path());
        std::fs::write(fetcher.path_for("accounts/A-1/", &[]), b"{not json").unwrap();

        let err = fetcher.get_json("accounts/A-1/", &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::Cache(_)));
    }
}
