use anyhow::{Context, Result};
use octograph_client::db::QuestDbLatestPointQuery;
use octograph_ingest::{
    config::{AppConfig, DateRange},
    metrics_server,
    observability,
    pipeline::{jobs_for_account, BatchPipeline},
    sinks::QuestDbIlpSink,
    sources::{CachingFetcher, FetchError, HttpJsonFetcher, HttpSettings, JsonFetcher, OctopusClient},
};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, time::Duration};

enum ApiFetcher {
    Direct(HttpJsonFetcher),
    Cached(CachingFetcher<HttpJsonFetcher>),
}

#[async_trait::async_trait]
impl JsonFetcher for ApiFetcher {
    async fn get_json(&self, url: &str, query: &[(String, String)]) -> Result<Value, FetchError> {
        match self {
            Self::Direct(f) => f.get_json(url, query).await,
            Self::Cached(f) => f.get_json(url, query).await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load and validate configuration before touching the network.
    let cfg = AppConfig::load()?;
    let settings = cfg.validate()?;
    let range = DateRange::from_args(std::env::args().skip(1), settings.tz)?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let octopus = &cfg.octopus;
    let http = HttpJsonFetcher::new(HttpSettings {
        api_prefix: octopus.api_prefix.clone(),
        api_key: octopus.api_key.clone(),
        max_retries: octopus.max_retries,
        retry_backoff: Duration::from_millis(octopus.retry_backoff_ms),
        min_request_interval: Duration::from_millis(octopus.min_request_interval_ms),
    })?;
    let fetcher = match &octopus.cache_dir {
        Some(dir) => ApiFetcher::Cached(CachingFetcher::new(http, dir)),
        None => ApiFetcher::Direct(http),
    };
    let client = OctopusClient::new(fetcher, settings.resolution);

    let account = client
        .retrieve_account(&octopus.account_number)
        .await
        .with_context(|| format!("failed to retrieve account {}", octopus.account_number))?;
    let jobs = jobs_for_account(&account, settings.included_meters.as_deref());
    tracing::info!(
        account = %account.number,
        meters = jobs.len(),
        from = %range.from,
        to = %range.to,
        "collecting"
    );

    let pool = PgPoolOptions::new()
        .max_connections(cfg.questdb.max_connections)
        .connect(&cfg.questdb.uri)
        .await?;
    let latest = QuestDbLatestPointQuery::new(pool, cfg.questdb.bucket.clone());

    let ilp_addr: SocketAddr = cfg
        .questdb
        .ilp_tcp_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid questdb.ilp_tcp_addr: {e}"))?;
    let sink = QuestDbIlpSink::new(
        ilp_addr,
        cfg.questdb.batch_size,
        cfg.questdb.max_retries,
        Duration::from_millis(cfg.questdb.retry_backoff_ms),
    );

    let pipeline = BatchPipeline::new(client, sink, latest, settings, range, cfg.questdb.bucket.clone());
    let report = pipeline.run(jobs).await;

    tracing::info!(
        meters = report.meters.len(),
        failed = report.failures.len(),
        points = report.written_points(),
        "run finished"
    );
    if report.has_failures() {
        anyhow::bail!("{} of {} meters failed", report.failures.len(), report.failures.len() + report.meters.len());
    }

    Ok(())
}
