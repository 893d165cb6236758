use crate::candles::Candle;
use ta::Next;
use ta::indicators::TrueRange;

/// True range of every bar that has a predecessor, i.e. `candles.len() - 1` values.
pub fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    let mut indicator = TrueRange::new();
    candles
        .iter()
        .map(|candle| indicator.next(candle))
        .skip(1)
        .collect()
}

/// Wilder-smoothed average: seeded with the simple mean of the first `period`
/// values, then `(prev * (n - 1) + x) / n` for every later value.
pub fn wilder_average(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }

    let n = period as f64;
    let seed = values[..period].iter().sum::<f64>() / n;
    Some(
        values[period..]
            .iter()
            .fold(seed, |avg, &x| (avg * (n - 1.0) + x) / n),
    )
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let mu = mean(values)?;
    let variance = values.iter().map(|x| (x - mu).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

/// Percentile with linear interpolation between the closest ranks
/// (rank = p/100 * (n-1)). Expects `sorted` in ascending order.
pub fn percentile(sorted: &[f64], pct: f64) -> Option<f64> {
    if sorted.is_empty() || !(0.0..=100.0).contains(&pct) {
        return None;
    }

    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}
