//! turnip.exchange client and island source.
//!
//! Listings are fetched with a single POST to `/islands/`. Rate-limit
//! state comes from the `X-Ratelimit-*` headers on every response and is
//! used to space requests evenly across the provider's window.

use super::{IslandSource, RateLimit, SourceError};
use crate::config::ExchangeConfig;
use crate::island::Island;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const HEADER_LIMIT: &str = "x-ratelimit-limit";
const HEADER_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_RESET: &str = "x-ratelimit-reset";

const ISLAND_URL_BASE: &str = "https://turnip.exchange/island";
const ID_PREFIX: &str = "turnip.exchange";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("try later (status {status})")]
    TryLater {
        status: u16,
        rate_limit: Option<RateLimitHeaders>,
    },
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("request was not successful: {0}")]
    NotSuccess(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct IslandsRequest {
    pub islander: String,
    pub fee: i64,
    pub category: String,
}

/// Treat an explicit `null` like a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Records are kept as raw JSON so one malformed listing cannot sink the
/// whole page.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct IslandsResponse {
    #[serde(deserialize_with = "null_as_default")]
    success: bool,
    #[serde(deserialize_with = "null_as_default")]
    message: String,
    #[serde(deserialize_with = "null_as_default")]
    islands: Vec<Value>,
}

/// An island as returned by the turnip.exchange API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExchangeIsland {
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub turnip_price: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub max_queue: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub turnip_code: String,
    #[serde(deserialize_with = "null_as_default")]
    pub hemisphere: String,
    #[serde(deserialize_with = "null_as_default")]
    pub fee: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub islander: String,
    #[serde(deserialize_with = "null_as_default")]
    pub category: String,
    #[serde(deserialize_with = "null_as_default")]
    pub island_time: String,
    #[serde(deserialize_with = "null_as_default")]
    pub create_time: String,
    #[serde(deserialize_with = "null_as_default")]
    pub description: String,
    /// Combined "current/capacity", e.g. "3/20".
    #[serde(deserialize_with = "null_as_default")]
    pub queued: String,
}

/// Decode each listing on its own, skipping the ones that do not fit.
fn decode_islands(records: Vec<Value>) -> Vec<ExchangeIsland> {
    records
        .into_iter()
        .filter_map(|record| match serde_json::from_value::<ExchangeIsland>(record) {
            Ok(island) => Some(island),
            Err(e) => {
                warn!(error = %e, "skipping malformed island listing");
                None
            }
        })
        .collect()
}

/// Raw values from the `X-Ratelimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: i64,
    pub remaining: i64,
    pub reset: i64,
}

#[derive(Debug, Clone)]
pub struct IslandsPage {
    pub islands: Vec<ExchangeIsland>,
    pub rate_limit: Option<RateLimitHeaders>,
}

pub fn parse_rate_limit_headers(headers: &HeaderMap) -> Option<RateLimitHeaders> {
    let get = |name: &str| -> Option<i64> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<i64>().ok())
    };

    Some(RateLimitHeaders {
        limit: get(HEADER_LIMIT)?,
        remaining: get(HEADER_REMAINING)?,
        reset: get(HEADER_RESET)?,
    })
}

pub struct TurnipExchangeClient {
    base_url: String,
    client: reqwest::Client,
}

impl TurnipExchangeClient {
    pub fn new(base_url: String) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { base_url, client })
    }

    pub async fn islands(&self, request: &IslandsRequest) -> Result<IslandsPage, ClientError> {
        let url = format!("{}/islands/", self.base_url.trim_end_matches('/'));

        let resp = self.client.post(&url).json(request).send().await?;

        // Parse rate-limit headers before consuming the response body
        let rate_limit = parse_rate_limit_headers(resp.headers());
        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(ClientError::TryLater {
                status: status.as_u16(),
                rate_limit,
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let data: IslandsResponse = resp.json().await?;
        if !data.success {
            return Err(ClientError::NotSuccess(data.message));
        }

        let listed = data.islands.len();
        let islands = decode_islands(data.islands);
        debug!(
            islands = islands.len(),
            skipped = listed - islands.len(),
            remaining = ?rate_limit.map(|r| r.remaining),
            "fetched islands"
        );

        Ok(IslandsPage {
            islands,
            rate_limit,
        })
    }
}

/// Parse a strict `"<current>/<capacity>"` queue string.
pub fn parse_queue(queued: &str) -> Option<(i64, i64)> {
    let (current, capacity) = queued.split_once('/')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(current) || !digits(capacity) {
        return None;
    }
    Some((current.parse().ok()?, capacity.parse().ok()?))
}

pub fn to_island(island: &ExchangeIsland) -> Island {
    let (in_queue, max_queue) = match parse_queue(&island.queued) {
        Some((current, capacity)) => (current, capacity),
        None => (-1, island.max_queue),
    };

    let id = if island.turnip_code.is_empty() {
        String::new()
    } else {
        format!("{}:{}", ID_PREFIX, island.turnip_code)
    };
    let url = if island.turnip_code.is_empty() {
        String::new()
    } else {
        format!("{}/{}", ISLAND_URL_BASE, island.turnip_code)
    };

    Island {
        id,
        name: island.name.clone(),
        turnip_price: island.turnip_price,
        in_queue,
        max_queue,
        fee: island.fee,
        islander: island.islander.clone(),
        category: island.category.clone(),
        created_at: island.create_time.clone(),
        description: island.description.clone(),
        url,
    }
}

pub struct TurnipExchangeSource {
    client: TurnipExchangeClient,
    request: IslandsRequest,
    rate_limit: RateLimit,
}

impl TurnipExchangeSource {
    pub fn new(config: &ExchangeConfig) -> Result<Self, ClientError> {
        Ok(Self {
            client: TurnipExchangeClient::new(config.base_url.clone())?,
            request: IslandsRequest {
                islander: config.islander.clone(),
                fee: config.fee,
                category: config.category.clone(),
            },
            rate_limit: RateLimit::default(),
        })
    }

    pub fn rate_limit(&self) -> RateLimit {
        self.rate_limit
    }

    fn is_rate_limited(&self) -> bool {
        let limited = self.rate_limit.is_limited(chrono::Utc::now().timestamp());
        if limited && self.rate_limit.remaining == 0 {
            debug!(reset = self.rate_limit.reset, "rate limited until reset");
        }
        limited
    }

    fn update_rate_limit(&mut self, headers: Option<RateLimitHeaders>) {
        match headers {
            Some(h) => {
                self.rate_limit = RateLimit::compute(
                    h.limit,
                    h.remaining,
                    h.reset,
                    chrono::Utc::now().timestamp(),
                );
            }
            None => warn!("missing or malformed rate-limit headers, keeping previous state"),
        }
    }
}

#[async_trait]
impl IslandSource for TurnipExchangeSource {
    fn name(&self) -> &str {
        "turnip.exchange"
    }

    async fn run(&mut self) -> Result<Vec<Island>, SourceError> {
        if self.is_rate_limited() {
            return Ok(Vec::new());
        }

        match self.client.islands(&self.request).await {
            Ok(page) => {
                self.update_rate_limit(page.rate_limit);
                Ok(page.islands.iter().map(to_island).collect())
            }
            Err(ClientError::TryLater { status, rate_limit }) => {
                self.update_rate_limit(rate_limit);
                Err(SourceError::Transient(format!("status {status}")))
            }
            Err(e) => Err(SourceError::Fatal(e.to_string())),
        }
    }
}
