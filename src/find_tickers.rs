use serde::Deserialize;
use tracing::debug;

use crate::error::MarketError;
use crate::exchange::{BybitClient, Category, FundingRate, ListResult};
use crate::klines::deserialize_f64_lenient;

const TRADING_STATUS: &str = "Trading";

#[derive(Deserialize, Debug)]
struct Instrument {
    symbol: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Ticker {
    symbol: String,
    #[serde(rename = "fundingRate", default, deserialize_with = "deserialize_f64_lenient")]
    funding_rate: Option<f64>,
    #[serde(rename = "nextFundingTime", default, deserialize_with = "deserialize_f64_lenient")]
    next_funding_time: Option<f64>,
}

fn is_listed(instruments: &[Instrument], symbol: &str) -> bool {
    instruments.iter().any(|i| {
        i.symbol == symbol && i.status.as_deref().is_none_or(|s| s == TRADING_STATUS)
    })
}

fn to_funding_rates(tickers: Vec<Ticker>) -> Vec<FundingRate> {
    tickers
        .into_iter()
        .filter_map(|t| {
            Some(FundingRate {
                rate: t.funding_rate?,
                next_funding_ms: t.next_funding_time.map(|ms| ms as i64),
                symbol: t.symbol,
            })
        })
        .collect()
}

impl BybitClient {
    async fn is_listed_in(&self, symbol: &str, category: Category) -> Result<bool, MarketError> {
        let query = vec![
            ("category", category.as_str().to_string()),
            ("symbol", symbol.to_string()),
        ];
        let result: ListResult<Instrument> =
            self.get("/v5/market/instruments-info", &query).await?;
        Ok(is_listed(&result.list, symbol))
    }

    /// Linear perpetuals win over spot when a symbol trades in both.
    pub(crate) async fn find_category(&self, symbol: &str) -> Result<Option<Category>, MarketError> {
        let (linear, spot) = futures::future::join(
            self.is_listed_in(symbol, Category::Linear),
            self.is_listed_in(symbol, Category::Spot),
        )
        .await;

        let category = match (linear, spot) {
            (Ok(true), _) => Some(Category::Linear),
            (_, Ok(true)) => Some(Category::Spot),
            (Err(e), _) | (_, Err(e)) => return Err(e),
            _ => None,
        };
        debug!(symbol, ?category, "ticker lookup");
        Ok(category)
    }

    pub(crate) async fn fetch_funding_rates(&self) -> Result<Vec<FundingRate>, MarketError> {
        let query = vec![("category", Category::Linear.as_str().to_string())];
        let result: ListResult<Ticker> = self.get("/v5/market/tickers", &query).await?;
        Ok(to_funding_rates(result.list))
    }
}
