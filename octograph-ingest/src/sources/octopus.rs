//! Octopus Energy REST API: accounts, tariff pricing and consumption.

use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures::{Stream, TryStreamExt};
use octograph_client::{time::iso8601, Agreement};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;

use super::{FetchError, JsonFetcher};
use crate::{
    pipeline::{ConsumptionReading, ConsumptionSource, MeterRef, PriceRow, Pricing, PricingSource, Utility},
    transform::Resolution,
};

const CONSUMPTION_PAGE_SIZE: u32 = 25_000;
const PRICING_PAGE_SIZE: u32 = 1_500;

const TARIFF_KEYS: [&str; 3] = [
    "single_register_electricity_tariffs",
    "dual_register_electricity_tariffs",
    "single_register_gas_tariffs",
];

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub properties: Vec<Property>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Property {
    #[serde(default)]
    pub address_line_1: Option<String>,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub electricity_meter_points: Vec<ElectricityMeterPoint>,
    #[serde(default)]
    pub gas_meter_points: Vec<GasMeterPoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ElectricityMeterPoint {
    pub mpan: String,
    #[serde(default)]
    pub meters: Vec<Meter>,
    #[serde(default)]
    pub agreements: Vec<Agreement>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GasMeterPoint {
    pub mprn: String,
    #[serde(default)]
    pub meters: Vec<Meter>,
    #[serde(default)]
    pub agreements: Vec<Agreement>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Meter {
    pub serial_number: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Link {
    href: String,
    rel: String,
}

pub struct OctopusClient<F> {
    fetcher: F,
    group_by: Option<&'static str>,
}

impl<F> OctopusClient<F>
where
    F: JsonFetcher,
{
    /// Consumption is requested grouped to `resolution`.
    pub fn new(fetcher: F, resolution: Resolution) -> Self {
        Self {
            fetcher,
            group_by: resolution.group_by(),
        }
    }

    pub async fn retrieve_account(&self, account_number: &str) -> Result<Account, FetchError> {
        let path = format!("accounts/{account_number}/");
        let value = self.fetcher.get_json(&path, &[]).await?;
        decode(&path, value)
    }

    /// One page of `results` at a time, following `next` until it is null.
    fn pages<'a>(&'a self, path: &'a str, query: Vec<(String, String)>) -> impl Stream<Item = Result<Vec<Value>, FetchError>> + Send + 'a {
        try_stream! {
            let mut page: Option<String> = None;
            loop {
                let mut args = query.clone();
                if let Some(p) = &page {
                    args.push(("page".to_string(), p.clone()));
                }
                let mut body = self.fetcher.get_json(path, &args).await?;

                let results = match body.get_mut("results").map(Value::take) {
                    Some(Value::Array(rows)) => rows,
                    _ => Vec::new(),
                };
                let next = body.get("next").and_then(Value::as_str).map(str::to_string);
                yield results;

                match next {
                    Some(next) => page = Some(advance_cursor(&next, page.as_deref())?),
                    None => break,
                }
            }
        }
    }

    async fn fetch_paginated<T>(
        &self,
        path: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        page_size: u32,
        group_by: Option<&str>,
    ) -> Result<Vec<T>, FetchError>
    where
        T: DeserializeOwned + Send,
    {
        let mut query = vec![
            ("period_from".to_string(), iso8601(from)),
            ("period_to".to_string(), iso8601(to)),
            ("page_size".to_string(), page_size.to_string()),
        ];
        if let Some(group_by) = group_by {
            query.push(("group_by".to_string(), group_by.to_string()));
        }

        let pages: Vec<Vec<Value>> = self.pages(path, query).try_collect().await?;
        pages
            .into_iter()
            .flatten()
            .map(|row| decode(path, row))
            .collect()
    }
}

/// `page` parameter of a `next` URL, refusing a cursor that does not move.
fn advance_cursor(next: &str, current: Option<&str>) -> Result<String, FetchError> {
    let url = reqwest::Url::parse(next).map_err(|_| FetchError::Pagination(next.to_string()))?;
    let page = url
        .query_pairs()
        .find(|(k, _)| k == "page")
        .map(|(_, v)| v.into_owned())
        .ok_or_else(|| FetchError::Pagination(next.to_string()))?;
    if current == Some(page.as_str()) {
        return Err(FetchError::Pagination(next.to_string()));
    }
    Ok(page)
}

fn decode<T: DeserializeOwned>(url: &str, value: Value) -> Result<T, FetchError> {
    serde_json::from_value(value).map_err(|e| FetchError::Decode {
        url: url.to_string(),
        message: e.to_string(),
    })
}

/// Product code embedded in a tariff code: `E-1R-VAR-22-11-01-C` is
/// product `VAR-22-11-01` on the electricity side.
pub fn product_code(tariff_code: &str) -> Result<(String, Utility), FetchError> {
    let utility = match tariff_code.chars().next() {
        Some('E') => Utility::Electricity,
        Some('G') => Utility::Gas,
        _ => return Err(FetchError::UnknownUtility(tariff_code.to_string())),
    };
    let parts: Vec<&str> = tariff_code.split('-').collect();
    if parts.len() < 4 {
        return Err(FetchError::MalformedTariff(tariff_code.to_string()));
    }
    Ok((parts[2..parts.len() - 1].join("-"), utility))
}

/// Links of the tariff entry whose `code` is `tariff_code`, searched
/// across every region and payment option of the product.
fn find_links(product: &Value, tariff_code: &str) -> Option<Vec<Link>> {
    TARIFF_KEYS
        .iter()
        .filter_map(|key| product.get(key)?.as_object())
        .flat_map(|regions| regions.values())
        .filter_map(Value::as_object)
        .flat_map(|options| options.values())
        .find(|details| details.get("code").and_then(Value::as_str) == Some(tariff_code))
        .and_then(|details| serde_json::from_value(details.get("links")?.clone()).ok())
}

#[async_trait::async_trait]
impl<F> PricingSource for OctopusClient<F>
where
    F: JsonFetcher,
{
    async fn fetch_pricing(&self, tariff_code: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Pricing, FetchError> {
        let (product, _) = product_code(tariff_code)?;
        let product_path = format!("products/{product}/");
        let product_json = self.fetcher.get_json(&product_path, &[]).await?;

        let links = find_links(&product_json, tariff_code).ok_or_else(|| FetchError::TariffNotFound {
            tariff_code: tariff_code.to_string(),
            product_code: product.clone(),
        })?;

        let mut pricing = Pricing::new();
        for link in links.iter().filter(|l| l.rel != "self") {
            let rows: Vec<PriceRow> = self
                .fetch_paginated(&link.href, from, to, PRICING_PAGE_SIZE, None)
                .await?;
            tracing::debug!(tariff_code, component = %link.rel, rows = rows.len(), "fetched pricing component");
            pricing.insert(link.rel.clone(), rows);
        }
        Ok(pricing)
    }
}

#[async_trait::async_trait]
impl<F> ConsumptionSource for OctopusClient<F>
where
    F: JsonFetcher,
{
    async fn fetch_consumption(&self, meter: &MeterRef, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<ConsumptionReading>, FetchError> {
        let path = match meter.utility {
            Utility::Electricity => format!(
                "electricity-meter-points/{}/meters/{}/consumption/",
                meter.meter_point, meter.serial_number
            ),
            Utility::Gas => format!(
                "gas-meter-points/{}/meters/{}/consumption/",
                meter.meter_point, meter.serial_number
            ),
        };
        self.fetch_paginated(&path, from, to, CONSUMPTION_PAGE_SIZE, self.group_by)
            .await
    }
}
