use std::sync::Arc;

use async_trait::async_trait;

use crate::exchange::{FundingRate, MarketData};
use crate::report;

/// The periodic funding check a scan job runs. `Ok(None)` means nothing
/// worth telling the conversation.
#[async_trait]
pub trait FundingScanner: Send + Sync {
    async fn check_extreme_funding(&self, threshold: f64) -> anyhow::Result<Option<String>>;
}

/// Rates strictly below `threshold`, most negative first.
pub fn extreme_rates(rates: &[FundingRate], threshold: f64) -> Vec<FundingRate> {
    let mut hits: Vec<FundingRate> = rates
        .iter()
        .filter(|r| r.rate.is_finite() && r.rate < threshold)
        .cloned()
        .collect();
    hits.sort_by(|a, b| a.rate.total_cmp(&b.rate));
    hits
}

/// The `count` most negative rates.
pub fn top_negative(rates: &[FundingRate], count: usize) -> Vec<FundingRate> {
    let mut sorted = extreme_rates(rates, 0.0);
    sorted.truncate(count);
    sorted
}

pub struct FundingMonitor {
    market: Arc<dyn MarketData>,
}

impl FundingMonitor {
    pub fn new(market: Arc<dyn MarketData>) -> Self {
        Self { market }
    }

    /// Listing for an explicit request; always produces text.
    pub async fn top_funding_report(&self, count: usize) -> anyhow::Result<String> {
        let rates = self.market.funding_rates().await?;
        Ok(report::render_top_funding(&top_negative(&rates, count)))
    }
}

#[async_trait]
impl FundingScanner for FundingMonitor {
    async fn check_extreme_funding(&self, threshold: f64) -> anyhow::Result<Option<String>> {
        let rates = self.market.funding_rates().await?;
        let hits = extreme_rates(&rates, threshold);
        if hits.is_empty() {
            return Ok(None);
        }
        Ok(Some(report::render_extreme_funding(&hits, threshold)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::candles::CandleSeries;
    use crate::error::MarketError;
    use crate::exchange::Category;

    pub(crate) fn rate(symbol: &str, rate: f64) -> FundingRate {
        FundingRate {
            symbol: symbol.to_string(),
            rate,
            next_funding_ms: None,
        }
    }

    struct FixedRates(Vec<FundingRate>);

    #[async_trait]
    impl MarketData for FixedRates {
        async fn validate_ticker(&self, _: &str) -> Result<Option<Category>, MarketError> {
            Ok(None)
        }

        async fn fetch_candles(
            &self,
            _: &str,
            _: Category,
            _: &str,
        ) -> Result<CandleSeries, MarketError> {
            Ok(CandleSeries::default())
        }

        async fn funding_rates(&self) -> Result<Vec<FundingRate>, MarketError> {
            if self.0.is_empty() {
                return Err(MarketError::RateLimited);
            }
            Ok(self.0.clone())
        }
    }

    #[test]
    fn extreme_rates_are_strictly_below_threshold() {
        let rates = vec![
            rate("A", -0.01),
            rate("B", -0.015),
            rate("C", -0.03),
            rate("D", -0.02),
            rate("E", f64::NAN),
        ];
        let hits = extreme_rates(&rates, -0.015);
        let symbols: Vec<_> = hits.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["C", "D"]);
    }

    #[test]
    fn top_negative_skips_positive_rates() {
        let rates = vec![rate("A", 0.01), rate("B", -0.001), rate("C", -0.002)];
        let top = top_negative(&rates, 10);
        let symbols: Vec<_> = top.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["C", "B"]);
        assert_eq!(top_negative(&rates, 1).len(), 1);
    }

    #[tokio::test]
    async fn monitor_reports_only_when_something_is_extreme() {
        let calm = FundingMonitor::new(Arc::new(FixedRates(vec![rate("A", -0.001)])));
        assert_eq!(calm.check_extreme_funding(-0.015).await.unwrap(), None);

        let hot = FundingMonitor::new(Arc::new(FixedRates(vec![rate("HOTUSDT", -0.05)])));
        let text = hot.check_extreme_funding(-0.015).await.unwrap().unwrap();
        assert!(text.contains("HOTUSDT"));
        assert!(text.contains("-5.0000%"));
    }

    #[tokio::test]
    async fn monitor_propagates_exchange_failures() {
        let broken = FundingMonitor::new(Arc::new(FixedRates(Vec::new())));
        assert!(broken.check_extreme_funding(-0.015).await.is_err());
        assert!(broken.top_funding_report(10).await.is_err());
    }
}
