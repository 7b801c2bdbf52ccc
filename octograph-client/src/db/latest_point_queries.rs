use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::domain::table_name;

/// Answers "when was the last point written for this series?" so that a run
/// can resume where the previous one stopped.
#[async_trait::async_trait]
pub trait LatestPointQuery: Send + Sync {
    async fn find_latest(
        &self,
        measurement: &str,
        field: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<Option<DateTime<Utc>>>;
}

#[derive(Debug, sqlx::FromRow)]
struct LatestRow {
    // QuestDB reports its designated timestamp as TIMESTAMP (UTC, no zone).
    latest: Option<NaiveDateTime>,
}

pub struct QuestDbLatestPointQuery {
    pool: PgPool,
    bucket: String,
}

impl QuestDbLatestPointQuery {
    pub fn new(pool: PgPool, bucket: impl Into<String>) -> Self {
        Self {
            pool,
            bucket: bucket.into(),
        }
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn build_latest_query<'a>(
    table: &str,
    field: &str,
    tags: &'a BTreeMap<String, String>,
) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::<Postgres>::new(format!(
        "SELECT max(timestamp) AS latest FROM {} WHERE {} IS NOT NULL",
        quote_ident(table),
        quote_ident(field),
    ));
    for (key, value) in tags {
        builder.push(" AND ");
        builder.push(quote_ident(key));
        builder.push(" = ");
        builder.push_bind(value.as_str());
    }
    builder
}

fn is_missing_table(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.message().contains("does not exist"),
        _ => false,
    }
}

#[async_trait::async_trait]
impl LatestPointQuery for QuestDbLatestPointQuery {
    async fn find_latest(
        &self,
        measurement: &str,
        field: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<Option<DateTime<Utc>>> {
        let table = table_name(&self.bucket, measurement);
        let mut builder = build_latest_query(&table, field, tags);

        match builder.build_query_as::<LatestRow>().fetch_optional(&self.pool).await {
            Ok(row) => Ok(row.and_then(|r| r.latest).map(|ts| ts.and_utc())),
            Err(e) if is_missing_table(&e) => {
                tracing::debug!(table = %table, "no table yet, nothing to resume from");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
