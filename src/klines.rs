use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt;
use tracing::{debug, warn};

use crate::candles::{Candle, CandleSeries};
use crate::error::MarketError;
use crate::exchange::{BybitClient, Category, ListResult, date_from_millis};

/// One row of `/v5/market/kline`:
/// `[startTime, open, high, low, close, volume, turnover]`, all strings.
#[derive(Deserialize, Debug)]
struct RawKline(
    #[serde(deserialize_with = "deserialize_f64_lenient")] Option<f64>,
    #[serde(deserialize_with = "deserialize_f64_lenient")] Option<f64>,
    #[serde(deserialize_with = "deserialize_f64_lenient")] Option<f64>,
    #[serde(deserialize_with = "deserialize_f64_lenient")] Option<f64>,
    #[serde(deserialize_with = "deserialize_f64_lenient")] Option<f64>,
    #[serde(deserialize_with = "deserialize_f64_lenient")] Option<f64>,
    #[serde(deserialize_with = "deserialize_f64_lenient")] Option<f64>,
);

impl RawKline {
    fn to_candle(&self) -> Option<Candle> {
        let date = date_from_millis(self.0? as i64)?;
        Some(Candle::new(date, self.1?, self.2?, self.3?, self.4?))
    }
}

struct LenientF64Visitor;

impl<'de> Visitor<'de> for LenientF64Visitor {
    type Value = Option<f64>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a float, an integer, or a string representing a number")
    }

    fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E> {
        Ok(Some(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
        Ok(Some(v as f64))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
        Ok(Some(v as f64))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        if v.trim().is_empty() {
            Ok(None)
        } else {
            v.trim().parse::<f64>().map(Some).map_err(E::custom)
        }
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E> {
        Ok(None)
    }
}

/// Accepts numbers, numeric strings, empty strings and null.
pub(crate) fn deserialize_f64_lenient<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(LenientF64Visitor)
}

/// Bybit lists klines newest first; rows with missing fields are skipped.
fn parse_klines(rows: &[RawKline]) -> CandleSeries {
    let candles: Vec<Candle> = rows.iter().filter_map(RawKline::to_candle).collect();
    if candles.len() < rows.len() {
        warn!(
            skipped = rows.len() - candles.len(),
            "dropped incomplete kline rows"
        );
    }
    CandleSeries::new(candles)
}

impl BybitClient {
    pub(crate) async fn fetch_klines(
        &self,
        symbol: &str,
        category: Category,
        interval: &str,
    ) -> Result<CandleSeries, MarketError> {
        let query = vec![
            ("category", category.as_str().to_string()),
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", self.kline_limit.to_string()),
        ];

        let result: ListResult<RawKline> = self.get("/v5/market/kline", &query).await?;
        let series = parse_klines(&result.list);
        debug!(symbol, %category, interval, candles = series.len(), "klines downloaded");
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bybit_kline_rows_oldest_first() {
        let raw = r#"{"list":[
            ["1670716800000","17127.5","17269","17071","17090.5","12000","205000000"],
            ["1670630400000","17071","17150","17000","17127.5","15000","256000000"]
        ]}"#;
        let result: ListResult<RawKline> = serde_json::from_str(raw).unwrap();
        let series = parse_klines(&result.list);

        assert_eq!(series.len(), 2);
        let first = series.as_slice()[0];
        assert_eq!(first.date.to_string(), "2022-12-10");
        assert_eq!(first.open, 17071.0);
        assert_eq!(first.high, 17150.0);
        assert_eq!(first.low, 17000.0);
        assert_eq!(first.close, 17127.5);
        assert_eq!(series.last().map(|c| c.close), Some(17090.5));
    }

    #[test]
    fn incomplete_rows_are_skipped() {
        let raw = r#"{"list":[
            ["1670716800000","","17269","17071","17090.5","0","0"],
            ["1670630400000","17071","17150","17000","17127.5","0","0"]
        ]}"#;
        let result: ListResult<RawKline> = serde_json::from_str(raw).unwrap();
        assert_eq!(parse_klines(&result.list).len(), 1);
    }

    #[test]
    fn lenient_numbers_accept_strings_and_null() {
        #[derive(Deserialize)]
        struct Probe {
            #[serde(deserialize_with = "deserialize_f64_lenient")]
            v: Option<f64>,
        }

        let parse = |raw: &str| serde_json::from_str::<Probe>(raw).map(|p| p.v);
        assert_eq!(parse(r#"{"v":"-0.0125"}"#).unwrap(), Some(-0.0125));
        assert_eq!(parse(r#"{"v":3}"#).unwrap(), Some(3.0));
        assert_eq!(parse(r#"{"v":""}"#).unwrap(), None);
        assert_eq!(parse(r#"{"v":null}"#).unwrap(), None);
        assert!(parse(r#"{"v":"abc"}"#).is_err());
    }
}
