use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;

use crate::config::{CatalogConfig, NetworkConfig};
use crate::domain::{LocalityKey, ProductDescriptor};
use crate::error::HarvestError;

/// Remote product catalog consulted by the Discover stage.
pub trait Catalog: Send + Sync {
    /// Every locality triple under the given regions.
    fn localities(&self, regions: &[String]) -> Result<Vec<LocalityKey>, HarvestError>;
    fn products(&self, locality: &LocalityKey) -> Result<Vec<ProductDescriptor>, HarvestError>;
}

/// Client for the FEMA Map Service Center advanced search.
#[derive(Clone)]
pub struct FemaCatalog {
    client: Client,
    base_url: String,
    product_description: String,
    rate_limit: Duration,
}

#[derive(Debug, Deserialize)]
struct Choice {
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct SearchResponse {
    #[serde(rename = "FLOOD_RISK_DB", default)]
    flood_risk_db: Vec<SearchProduct>,
}

#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct SearchProduct {
    #[serde(default)]
    product_NAME: Option<String>,
    #[serde(default)]
    product_DESCRIPTION: Option<String>,
    #[serde(default)]
    product_FILE_PATH: Option<String>,
    #[serde(default)]
    product_FILE_SIZE: Option<serde_json::Value>,
}

impl FemaCatalog {
    pub fn new(network: &NetworkConfig, catalog: &CatalogConfig) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&network.user_agent)
                .map_err(|err| HarvestError::ConfigInvalid(format!("network.user_agent: {err}")))?,
        );
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"),
        );
        headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(network.timeout())
            .build()
            .map_err(|err| HarvestError::CatalogHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: network.base_url.trim_end_matches('/').to_string(),
            product_description: catalog.product_description.clone(),
            rate_limit: network.rate_limit(),
        })
    }

    fn search_url(&self) -> String {
        format!("{}/portal/advanceSearch", self.base_url)
    }

    fn subregions(&self, region: &str) -> Result<Vec<String>, HarvestError> {
        let url = self.search_url();
        let response = self.send_with_retries(|| self.client.get(&url).query(&[("getCounty", region)]))?;
        let choices: Vec<Choice> = decode_json(response)?;
        Ok(choices.into_iter().map(|choice| choice.value).collect())
    }

    fn localities_in(&self, region: &str, subregion: &str) -> Result<Vec<String>, HarvestError> {
        let url = self.search_url();
        let response = self.send_with_retries(|| {
            self.client
                .get(&url)
                .query(&[("getCommunity", subregion), ("state", region)])
        })?;
        let choices: Vec<Choice> = decode_json(response)?;
        Ok(choices.into_iter().map(|choice| choice.value).collect())
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, HarvestError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(status, attempt, "catalog request retry");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    if !resp.status().is_success() {
                        let message = resp
                            .text()
                            .unwrap_or_else(|_| "catalog request failed".to_string());
                        return Err(HarvestError::CatalogStatus { status, message });
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(HarvestError::CatalogHttp(err.to_string()));
                }
            }
        }
    }
}

impl Catalog for FemaCatalog {
    fn localities(&self, regions: &[String]) -> Result<Vec<LocalityKey>, HarvestError> {
        let mut localities = Vec::new();
        for region in regions {
            let subregions = self.subregions(region)?;
            tracing::info!(region = %region, subregions = subregions.len(), "listing localities");
            for subregion in subregions {
                thread::sleep(self.rate_limit);
                for locality in self.localities_in(region, &subregion)? {
                    match LocalityKey::new(region, &subregion, &locality) {
                        Ok(key) => localities.push(key),
                        Err(err) => tracing::warn!(error = %err, "skipping malformed locality"),
                    }
                }
            }
        }
        localities.sort();
        localities.dedup();
        Ok(localities)
    }

    fn products(&self, locality: &LocalityKey) -> Result<Vec<ProductDescriptor>, HarvestError> {
        let url = self.search_url();
        let form = search_form(locality);
        let response = self.send_with_retries(|| self.client.post(&url).form(&form))?;
        let body = response
            .text()
            .map_err(|err| HarvestError::CatalogHttp(err.to_string()))?;
        parse_search_response(&body, &self.product_description)
    }
}

fn search_form(locality: &LocalityKey) -> Vec<(&'static str, String)> {
    vec![
        ("utf8", "\u{2713}".to_string()),
        ("affiliate", "fema".to_string()),
        ("query", String::new()),
        ("selstate", locality.region().to_string()),
        ("selcounty", locality.subregion().to_string()),
        ("selcommunity", locality.locality().to_string()),
        ("jurisdictionkey", String::new()),
        ("jurisdictionvalue", String::new()),
        ("searchedCid", locality.locality().to_string()),
        ("searchedDateStart", String::new()),
        ("searchedDateEnd", String::new()),
        ("txtstartdate", String::new()),
        ("txtenddate", String::new()),
        ("method", "search".to_string()),
    ]
}

/// Keeps `FLOOD_RISK_DB` entries whose description matches, dropping incomplete ones.
pub fn parse_search_response(
    body: &str,
    description: &str,
) -> Result<Vec<ProductDescriptor>, HarvestError> {
    let response: SearchResponse =
        serde_json::from_str(body).map_err(|err| HarvestError::CatalogDecode(err.to_string()))?;
    let mut products = Vec::new();
    for item in response.flood_risk_db {
        if item.product_DESCRIPTION.as_deref() != Some(description) {
            continue;
        }
        let (Some(name), Some(source_path)) = (item.product_NAME, item.product_FILE_PATH) else {
            continue;
        };
        let name = match name.parse() {
            Ok(name) => name,
            Err(err) => {
                tracing::warn!(error = %err, "skipping catalog product");
                continue;
            }
        };
        let size_hint = match item.product_FILE_SIZE {
            Some(serde_json::Value::String(value)) => Some(value),
            Some(serde_json::Value::Number(value)) => Some(value.to_string()),
            _ => None,
        };
        products.push(ProductDescriptor {
            name,
            source_path,
            size_hint,
        });
    }
    Ok(products)
}

fn decode_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, HarvestError> {
    response
        .json()
        .map_err(|err| HarvestError::CatalogDecode(err.to_string()))
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
