//! Marketplace listing API client
//!
//! Issues one page request through a caller supplied (proxied) client and
//! maps the response into a [`Page`] or a classified [`FetchError`].

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use url::Url;

use crate::models::TaskParams;
use crate::utils::error::FetchError;
use crate::utils::truncate_text;

/// Remote API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Scheme and host of the marketplace API
    pub base_url: String,

    /// Listing endpoint path
    pub items_path: String,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    /// Sent as `X-Api-Key` when set
    pub api_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.dmarket.com".to_string(),
            items_path: "/exchange/v1/market/items".to_string(),
            request_timeout_secs: 30,
            api_key: None,
        }
    }
}

impl ApiConfig {
    /// Request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Where the next page starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagePosition {
    /// Record offset, advanced by the page size
    Offset(u64),
    /// Opaque cursor returned by the previous page
    Cursor(String),
}

/// One decoded page of listing records
#[derive(Debug, Clone)]
pub struct Page {
    /// Raw records in response order
    pub records: Vec<Value>,
    /// Cursor for the next page, when the API returned one
    pub cursor: Option<String>,
    /// Time from request to decoded body
    pub latency: Duration,
}

/// Client for the listing endpoint
#[derive(Debug, Clone)]
pub struct MarketClient {
    endpoint: Url,
    api_key: Option<String>,
}

impl MarketClient {
    /// Create a client for the configured endpoint
    ///
    /// # Errors
    ///
    /// Returns `FetchError::InvalidUrl` if base URL and path do not form a URL
    pub fn new(config: &ApiConfig) -> Result<Self, FetchError> {
        let joined = format!(
            "{}/{}",
            config.base_url.trim_end_matches('/'),
            config.items_path.trim_start_matches('/')
        );
        let endpoint = Url::parse(&joined).map_err(|e| FetchError::InvalidUrl(format!("{joined}: {e}")))?;

        Ok(Self {
            endpoint,
            api_key: config.api_key.clone(),
        })
    }

    /// Listing endpoint URL
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Query parameters for one page request
    pub fn query(params: &TaskParams, position: &PagePosition) -> Vec<(String, String)> {
        let mut query = vec![
            ("gameId".to_string(), params.game_id.clone()),
            ("currency".to_string(), params.currency.clone()),
            ("limit".to_string(), params.page_size.to_string()),
        ];
        match position {
            PagePosition::Offset(offset) => query.push(("offset".to_string(), offset.to_string())),
            PagePosition::Cursor(cursor) => query.push(("cursor".to_string(), cursor.clone())),
        }
        query.extend(params.filters.iter().map(|(k, v)| (k.clone(), v.clone())));
        query
    }

    /// Fetch one page through `client`
    pub async fn fetch_page(
        &self,
        client: &Client,
        params: &TaskParams,
        position: &PagePosition,
    ) -> Result<Page, FetchError> {
        let started = Instant::now();

        let mut request = client
            .get(self.endpoint.clone())
            .query(&Self::query(params, position))
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key);
        }

        let response = request.send().await.map_err(classify)?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited {
                retry_after: retry_after(response.headers()),
            });
        }
        if status.is_server_error() {
            return Err(FetchError::ServerError(status.as_u16()));
        }
        if !status.is_success() {
            return Err(FetchError::Rejected(status.as_u16()));
        }

        let body = response.text().await.map_err(classify)?;
        let (records, cursor) = decode_body(&body)?;

        Ok(Page {
            records,
            cursor,
            latency: started.elapsed(),
        })
    }
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Http(err)
    }
}

/// `Retry-After` in its delta-seconds form
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Accepts a bare array or `{"objects": [...], "cursor": "..."}`
pub fn decode_body(body: &str) -> Result<(Vec<Value>, Option<String>), FetchError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| FetchError::Decode(format!("{e}: {}", truncate_text(body, 120))))?;

    match value {
        Value::Array(records) => Ok((records, None)),
        Value::Object(mut map) => {
            let records = match map.remove("objects") {
                Some(Value::Array(records)) => records,
                Some(Value::Null) | None => Vec::new(),
                Some(_) => return Err(FetchError::Decode("'objects' is not an array".to_string())),
            };
            let cursor = map
                .get("cursor")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            Ok((records, cursor))
        }
        _ => Err(FetchError::Decode("expected an array or an object".to_string())),
    }
}
