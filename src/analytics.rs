//! Volatility and risk statistics over a daily candle series.
//!
//! [`compute_report`] is pure: it reads the series, allocates its own
//! scratch buffers and returns either a complete [`StatReport`] or
//! [`AnalyticsError::InsufficientData`]. There is no partial report.

use chrono::NaiveDate;

use crate::candles::CandleSeries;
use crate::error::AnalyticsError;
use crate::indicators::{mean, percentile, std_dev, true_ranges, wilder_average};

/// 28-period ATR plus one warm-up bar for the first true range.
pub const MIN_CANDLES: usize = 29;

const ATR_SHORT: usize = 14;
const ATR_LONG: usize = 28;
const DAYS_PER_WEEK: usize = 7;

/// Percentile ranks of the pump distribution used as staged entry (DCA) levels.
pub const DCA_PERCENTILES: [u8; 6] = [75, 80, 85, 90, 95, 99];

#[derive(Debug, Clone, PartialEq)]
pub struct StatReport {
    pub candle_count: usize,

    // close to close
    pub vol_day: f64,
    pub vol_week: f64,
    pub max_daily_surge: f64,
    pub max_daily_crash: f64,

    // open to high
    pub max_pump_val: f64,
    pub max_pump_date: NaiveDate,
    pub avg_pump: f64,
    pub std_pump: f64,

    // open to low
    pub max_dump_val: f64,
    pub max_dump_date: NaiveDate,
    pub avg_dump: f64,
    pub std_dump: f64,

    pub atr_14: f64,
    pub atr_28: f64,
    pub atr_relative: f64,

    pub p75_pump: f64,
    pub p80_pump: f64,
    pub p85_pump: f64,
    pub p90_pump: f64,
    pub p95_pump: f64,
    pub p99_pump: f64,
}

impl StatReport {
    /// `(percentile rank, pump level)` pairs in ascending rank order.
    pub fn dca_levels(&self) -> [(u8, f64); 6] {
        let values = [
            self.p75_pump,
            self.p80_pump,
            self.p85_pump,
            self.p90_pump,
            self.p95_pump,
            self.p99_pump,
        ];
        std::array::from_fn(|i| (DCA_PERCENTILES[i], values[i]))
    }
}

/// Intraday excursion summary (pump or dump) for one series.
struct Excursion {
    extreme: f64,
    extreme_date: NaiveDate,
    avg: f64,
    std: f64,
}

fn insufficient(reason: impl Into<String>) -> AnalyticsError {
    AnalyticsError::InsufficientData(reason.into())
}

/// Daily close-to-close returns, `close_i / close_{i-1} - 1`.
fn daily_returns(closes: &[f64]) -> Vec<f64> {
    closes.windows(2).map(|w| w[1] / w[0] - 1.0).collect()
}

/// Compounded returns of non-overlapping 7-day blocks; the trailing partial
/// week is dropped.
fn weekly_returns(daily: &[f64]) -> Vec<f64> {
    daily
        .chunks_exact(DAYS_PER_WEEK)
        .map(|week| week.iter().map(|r| 1.0 + r).product::<f64>() - 1.0)
        .collect()
}

/// `pick` decides whether a candidate replaces the current extreme; ties keep
/// the earliest date.
fn excursion(
    values: &[(NaiveDate, f64)],
    pick: impl Fn(f64, f64) -> bool,
) -> Option<Excursion> {
    let (first_date, first_val) = *values.first()?;
    let (extreme_date, extreme) = values.iter().skip(1).fold(
        (first_date, first_val),
        |(best_date, best), &(date, v)| {
            if pick(v, best) { (date, v) } else { (best_date, best) }
        },
    );

    let raw: Vec<f64> = values.iter().map(|(_, v)| *v).collect();
    Some(Excursion {
        extreme,
        extreme_date,
        avg: mean(&raw)?,
        std: std_dev(&raw)?,
    })
}

pub fn compute_report(series: &CandleSeries) -> Result<StatReport, AnalyticsError> {
    let candles = series.as_slice();

    if candles.len() < MIN_CANDLES {
        return Err(insufficient(format!(
            "need at least {MIN_CANDLES} candles, got {}",
            candles.len()
        )));
    }
    if let Some(bad) = candles.iter().find(|c| !c.has_usable_prices()) {
        return Err(insufficient(format!("unusable prices on {}", bad.date)));
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let returns = daily_returns(&closes);
    let weekly = weekly_returns(&returns);

    let vol_day = std_dev(&returns).ok_or_else(|| insufficient("no daily returns"))?;
    let vol_week = std_dev(&weekly).ok_or_else(|| insufficient("no complete week"))?;
    let max_daily_surge = returns.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let max_daily_crash = returns.iter().copied().fold(f64::INFINITY, f64::min);

    let pumps: Vec<(NaiveDate, f64)> = candles
        .iter()
        .map(|c| (c.date, c.high / c.open - 1.0))
        .collect();
    let dumps: Vec<(NaiveDate, f64)> = candles
        .iter()
        .map(|c| (c.date, c.low / c.open - 1.0))
        .collect();

    let pump = excursion(&pumps, |v, best| v > best).ok_or_else(|| insufficient("no bars"))?;
    let dump = excursion(&dumps, |v, best| v < best).ok_or_else(|| insufficient("no bars"))?;

    let tr = true_ranges(candles);
    let atr_14 = wilder_average(&tr, ATR_SHORT).ok_or_else(|| insufficient("ATR 14 warm-up"))?;
    let atr_28 = wilder_average(&tr, ATR_LONG).ok_or_else(|| insufficient("ATR 28 warm-up"))?;
    let last_close = *closes.last().ok_or_else(|| insufficient("no closes"))?;

    let mut sorted_pumps: Vec<f64> = pumps.iter().map(|(_, v)| *v).collect();
    sorted_pumps.sort_by(f64::total_cmp);
    let mut levels = [0.0; 6];
    for (slot, rank) in levels.iter_mut().zip(DCA_PERCENTILES) {
        *slot = percentile(&sorted_pumps, f64::from(rank))
            .ok_or_else(|| insufficient("empty pump distribution"))?;
    }
    let [p75_pump, p80_pump, p85_pump, p90_pump, p95_pump, p99_pump] = levels;

    Ok(StatReport {
        candle_count: candles.len(),
        vol_day,
        vol_week,
        max_daily_surge,
        max_daily_crash,
        max_pump_val: pump.extreme,
        max_pump_date: pump.extreme_date,
        avg_pump: pump.avg,
        std_pump: pump.std,
        max_dump_val: dump.extreme,
        max_dump_date: dump.extreme_date,
        avg_dump: dump.avg,
        std_dump: dump.std,
        atr_14,
        atr_28,
        atr_relative: atr_28 / last_close,
        p75_pump,
        p80_pump,
        p85_pump,
        p90_pump,
        p95_pump,
        p99_pump,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candles::Candle;
    use crate::candles::tests::day;
    use proptest::prelude::*;

    /// Closes alternate +2% / -2%, every bar spans exactly its open and close
    /// plus padding so the true range stays one unit.
    fn alternating_series(len: usize) -> CandleSeries {
        let mut candles = Vec::with_capacity(len);
        let mut prev_close: f64 = 10.0;
        for i in 0..len {
            let close = if i == 0 {
                10.0
            } else if i % 2 == 1 {
                prev_close * 1.02
            } else {
                prev_close * 0.98
            };
            let open = prev_close;
            let low = open.min(close) - 0.3;
            let high = low + 1.0;
            candles.push(Candle::new(day(i as i64), open, high, low, close));
            prev_close = close;
        }
        CandleSeries::new(candles)
    }

    fn flat_series(len: usize) -> CandleSeries {
        CandleSeries::new(
            (0..len)
                .map(|i| Candle::new(day(i as i64), 1.0, 1.0, 1.0, 1.0))
                .collect(),
        )
    }

    #[test]
    fn alternating_two_percent_worked_example() {
        let series = alternating_series(30);
        let report = compute_report(&series).unwrap();

        assert!((report.atr_14 - 1.0).abs() < 1e-9, "atr_14 = {}", report.atr_14);
        assert!((report.atr_28 - 1.0).abs() < 1e-9, "atr_28 = {}", report.atr_28);

        // 15 returns of +0.02 and 14 of -0.02
        let mu = 0.02 / 29.0;
        let expected = (0.02f64.powi(2) - mu * mu).sqrt();
        assert!((report.vol_day - expected).abs() < 1e-9);
        assert!((report.vol_day - 0.02).abs() < 1e-3);

        assert!((report.max_daily_surge - 0.02).abs() < 1e-12);
        assert!((report.max_daily_crash + 0.02).abs() < 1e-12);
        assert_eq!(report.candle_count, 30);

        // 4 full weeks alternate between 4 up/3 down and 3 up/4 down days
        let up_week = 1.02f64.powi(4) * 0.98f64.powi(3) - 1.0;
        let down_week = 1.02f64.powi(3) * 0.98f64.powi(4) - 1.0;
        let expected_week = (up_week - down_week).abs() / 2.0;
        assert!((report.vol_week - expected_week).abs() < 1e-12, "vol_week = {}", report.vol_week);

        let last_close = 10.0 * 1.02f64.powi(15) * 0.98f64.powi(14);
        assert!((series.last().unwrap().close - last_close).abs() < 1e-9);
        assert!((report.atr_relative - 1.0 / last_close).abs() < 1e-9);
    }

    #[test]
    fn too_few_candles_is_insufficient() {
        let err = compute_report(&flat_series(MIN_CANDLES - 1)).unwrap_err();
        assert!(matches!(err, AnalyticsError::InsufficientData(_)));
        assert!(compute_report(&CandleSeries::default()).is_err());
    }

    #[test]
    fn exactly_minimum_candles_is_enough() {
        let report = compute_report(&flat_series(MIN_CANDLES)).unwrap();
        assert_eq!(report.vol_day, 0.0);
        assert_eq!(report.atr_28, 0.0);
        assert_eq!(report.p99_pump, 0.0);
    }

    #[test]
    fn unusable_price_anywhere_is_insufficient() {
        let mut candles: Vec<Candle> = flat_series(40).as_slice().to_vec();
        candles[17].low = 0.0;
        let err = compute_report(&CandleSeries::new(candles.clone())).unwrap_err();
        assert!(matches!(err, AnalyticsError::InsufficientData(_)));

        candles[17].low = 1.0;
        candles[30].close = f64::NAN;
        assert!(compute_report(&CandleSeries::new(candles)).is_err());
    }

    #[test]
    fn weekly_volatility_drops_trailing_partial_week() {
        // 29 returns -> 4 full weeks, 1 trailing return ignored
        let daily: Vec<f64> = (0..29).map(|i| if i == 28 { 5.0 } else { 0.01 }).collect();
        let weekly = weekly_returns(&daily);
        assert_eq!(weekly.len(), 4);
        let expected = 1.01f64.powi(7) - 1.0;
        assert!(weekly.iter().all(|w| (w - expected).abs() < 1e-12));
    }

    #[test]
    fn extremes_record_their_dates() {
        let mut candles: Vec<Candle> = flat_series(35).as_slice().to_vec();
        candles[5].high = 1.5;
        candles[9].low = 0.7;
        let report = compute_report(&CandleSeries::new(candles)).unwrap();

        assert!((report.max_pump_val - 0.5).abs() < 1e-12);
        assert_eq!(report.max_pump_date, day(5));
        assert!((report.max_dump_val + 0.3).abs() < 1e-12);
        assert_eq!(report.max_dump_date, day(9));
    }

    #[test]
    fn dca_levels_follow_percentile_order() {
        let report = compute_report(&alternating_series(60)).unwrap();
        let ranks: Vec<u8> = report.dca_levels().iter().map(|(r, _)| *r).collect();
        assert_eq!(ranks, DCA_PERCENTILES.to_vec());
        assert_eq!(report.dca_levels()[0].1, report.p75_pump);
        assert_eq!(report.dca_levels()[5].1, report.p99_pump);
    }

    fn arb_candle() -> impl Strategy<Value = (f64, f64, f64, f64)> {
        // open, upward excursion, downward excursion, close position within range
        (0.01f64..1_000.0, 0.0f64..0.5, 0.0f64..0.5, 0.0f64..=1.0)
    }

    fn arb_series(min: usize, max: usize) -> impl Strategy<Value = CandleSeries> {
        prop::collection::vec(arb_candle(), min..max).prop_map(|bars| {
            CandleSeries::new(
                bars.into_iter()
                    .enumerate()
                    .map(|(i, (open, up, down, at))| {
                        let high = open * (1.0 + up);
                        let low = open * (1.0 - down * 0.9);
                        let close = low + (high - low) * at;
                        Candle::new(day(i as i64), open, high, low, close.max(low))
                    })
                    .collect(),
            )
        })
    }

    proptest! {
        #[test]
        fn valid_series_always_yields_report(series in arb_series(MIN_CANDLES, 120)) {
            prop_assert!(compute_report(&series).is_ok());
        }

        #[test]
        fn short_series_never_yields_report(series in arb_series(0, MIN_CANDLES)) {
            prop_assert!(compute_report(&series).is_err());
        }

        #[test]
        fn report_invariants_hold(series in arb_series(MIN_CANDLES, 120)) {
            let r = compute_report(&series).unwrap();

            let levels = r.dca_levels();
            for pair in levels.windows(2) {
                prop_assert!(pair[0].1 <= pair[1].1);
            }
            prop_assert!(r.max_pump_val >= r.avg_pump);
            prop_assert!(r.max_dump_val <= r.avg_dump);
            prop_assert!(r.std_pump >= 0.0);
            prop_assert!(r.std_dump >= 0.0);
            prop_assert!(r.max_daily_surge >= r.max_daily_crash);
        }

        #[test]
        fn computation_is_repeatable(series in arb_series(MIN_CANDLES, 80)) {
            let first = compute_report(&series).unwrap();
            let second = compute_report(&series).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
