use chrono::DateTime;
use comfy_table::{
    Attribute, Cell, CellAlignment, ContentArrangement, Table, modifiers::UTF8_ROUND_CORNERS,
    presets::UTF8_BORDERS_ONLY,
};

use crate::analytics::StatReport;
use crate::exchange::FundingRate;

fn pct(value: f64) -> String {
    format!("{:.2}%", value * 100.0)
}

fn funding_pct(value: f64) -> String {
    format!("{:.4}%", value * 100.0)
}

fn format_timestamp(ts_ms: i64) -> String {
    match DateTime::from_timestamp_millis(ts_ms) {
        Some(dt) => dt.format("%d-%m-%Y %H:%M").to_string(),
        None => "Unknown Time".to_string(),
    }
}

fn new_table(header: Vec<Cell>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

/// Full volatility report for one symbol, one line per statistic so it reads
/// well in chat clients with proportional fonts. The only place numbers get
/// rounded.
pub fn render_stat_report(symbol: &str, report: &StatReport) -> String {
    let mut lines = vec![
        format!("📊 {symbol} based on {} candles", report.candle_count),
        String::new(),
        "📝 DAILY STATS (close to close)".to_string(),
        format!("Volatility (Day): {}", pct(report.vol_day)),
        format!("Volatility (Week): {}", pct(report.vol_week)),
        format!("Max daily surge: {}", pct(report.max_daily_surge)),
        format!("Max daily crash: {}", pct(report.max_daily_crash)),
        String::new(),
        "⬆️ INTRADAY PUMP EXTREMES (open / high)".to_string(),
        format!(
            "Biggest pump: {} on {}",
            pct(report.max_pump_val),
            report.max_pump_date
        ),
        format!("Average pump: {}", pct(report.avg_pump)),
        format!("Pump deviation (std): {}", pct(report.std_pump)),
        String::new(),
        "⬇️ INTRADAY DUMP EXTREMES (open / low)".to_string(),
        format!(
            "Worst dump: {} on {}",
            pct(report.max_dump_val),
            report.max_dump_date
        ),
        format!("Average dump: {}", pct(report.avg_dump)),
        format!("Dump deviation (std): {}", pct(report.std_dump)),
        String::new(),
        // six decimals keep sub-cent meme coins readable
        "📏 ATR (Average True Range)".to_string(),
        format!("ATR 14: {:.6}", report.atr_14),
        format!("ATR 28: {:.6}", report.atr_28),
        format!("ATR 28 to close: {}", pct(report.atr_relative)),
        String::new(),
        "📈 MARTINGALE BASED ON PERCENTILES".to_string(),
    ];
    for (step, (rank, level)) in report.dca_levels().iter().enumerate() {
        lines.push(format!("{} DCA ({rank}%): {}", ordinal(step + 1), pct(*level)));
    }
    lines.join("\n")
}

fn ordinal(n: usize) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

fn funding_table(rates: &[FundingRate]) -> Table {
    let mut table = new_table(vec![
        Cell::new("Rank").add_attribute(Attribute::Bold),
        Cell::new("Symbol").add_attribute(Attribute::Bold),
        Cell::new("Funding")
            .add_attribute(Attribute::Bold)
            .set_alignment(CellAlignment::Right),
        Cell::new("Next funding (UTC)").add_attribute(Attribute::Bold),
    ]);

    for (rank, rate) in rates.iter().enumerate() {
        let next = rate
            .next_funding_ms
            .map(format_timestamp)
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(rank + 1),
            Cell::new(&rate.symbol),
            Cell::new(funding_pct(rate.rate)).set_alignment(CellAlignment::Right),
            Cell::new(next),
        ]);
    }
    table
}

pub fn render_top_funding(rates: &[FundingRate]) -> String {
    if rates.is_empty() {
        return "No negative funding rates right now.".to_string();
    }
    format!(
        "💸 Top {} negative funding rates\n{}",
        rates.len(),
        funding_table(rates)
    )
}

pub fn render_extreme_funding(rates: &[FundingRate], threshold: f64) -> String {
    format!(
        "🚨 Funding below {}\n{}",
        funding_pct(threshold),
        funding_table(rates)
    )
}
