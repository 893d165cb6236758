use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::candles::CandleSeries;
use crate::error::MarketError;

const RATE_LIMIT_RET_CODE: i64 = 10006;
const RATE_LIMIT_RESET_HEADER: &str = "X-Bapi-Limit-Reset-Timestamp";
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(30);

/// Bybit product category a symbol trades in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Linear,
    Spot,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Linear => "linear",
            Category::Spot => "spot",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FundingRate {
    pub symbol: String,
    pub rate: f64,
    /// Milliseconds since epoch, when known.
    pub next_funding_ms: Option<i64>,
}

/// Everything the bot needs from an exchange.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// `None` when the symbol is listed in no supported category.
    async fn validate_ticker(&self, symbol: &str) -> Result<Option<Category>, MarketError>;

    async fn fetch_candles(
        &self,
        symbol: &str,
        category: Category,
        interval: &str,
    ) -> Result<CandleSeries, MarketError>;

    /// Current funding rate of every linear perpetual.
    async fn funding_rates(&self) -> Result<Vec<FundingRate>, MarketError>;
}

/// Bybit v5 response envelope.
#[derive(Deserialize, Debug)]
pub(crate) struct Envelope<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct ListResult<T> {
    #[serde(default = "Vec::new")]
    pub list: Vec<T>,
}

#[derive(Clone)]
pub struct BybitClient {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) kline_limit: u32,
}

impl BybitClient {
    pub fn new(base_url: impl Into<String>, kline_limit: u32) -> Result<Self, MarketError> {
        let client = Client::builder()
            .pool_max_idle_per_host(16)
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            kline_limit,
        })
    }

    /// GET a v5 market endpoint and unwrap its `result`. A rate-limited call
    /// waits for the advertised reset (bounded) and is retried once.
    pub(crate) async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, MarketError> {
        let url = format!("{}{}", self.base_url, path);

        for attempt in 0..2 {
            let response = self.client.get(&url).query(query).send().await?;
            let status = response.status();
            let wait = rate_limit_wait(response.headers());

            if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN {
                warn!(%url, %status, attempt, "rate limited by bybit");
                backoff(wait, attempt).await?;
                continue;
            }

            let envelope: Envelope<T> = response.error_for_status()?.json().await?;
            match envelope.ret_code {
                0 => {
                    return envelope
                        .result
                        .ok_or_else(|| MarketError::Malformed(format!("{path}: missing result")));
                }
                RATE_LIMIT_RET_CODE => {
                    warn!(%url, attempt, "bybit rate limit retCode");
                    backoff(wait, attempt).await?;
                }
                code => {
                    return Err(MarketError::Api {
                        code,
                        message: envelope.ret_msg,
                    });
                }
            }
        }
        Err(MarketError::RateLimited)
    }
}

/// Sleeps before the retry, or gives up after the last attempt.
async fn backoff(wait: Duration, attempt: usize) -> Result<(), MarketError> {
    if attempt > 0 {
        return Err(MarketError::RateLimited);
    }
    debug!(wait_ms = wait.as_millis() as u64, "waiting for rate limit reset");
    tokio::time::sleep(wait).await;
    Ok(())
}

fn rate_limit_wait(headers: &HeaderMap) -> Duration {
    let reset_ms = headers
        .get(RATE_LIMIT_RESET_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok());

    let now_ms = chrono::Utc::now().timestamp_millis();
    match reset_ms {
        Some(reset) if reset > now_ms => {
            let wait = Duration::from_millis((reset - now_ms) as u64) + Duration::from_millis(250);
            wait.min(MAX_RATE_LIMIT_WAIT)
        }
        _ => Duration::from_secs(1),
    }
}

/// Calendar date (UTC) of a millisecond timestamp.
pub(crate) fn date_from_millis(ms: i64) -> Option<chrono::NaiveDate> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.date_naive())
}

#[async_trait]
impl MarketData for BybitClient {
    async fn validate_ticker(&self, symbol: &str) -> Result<Option<Category>, MarketError> {
        self.find_category(symbol).await
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        category: Category,
        interval: &str,
    ) -> Result<CandleSeries, MarketError> {
        self.fetch_klines(symbol, category, interval).await
    }

    async fn funding_rates(&self) -> Result<Vec<FundingRate>, MarketError> {
        self.fetch_funding_rates().await
    }
}
