//! Display helpers for the headless renderer.

use crate::feed::session::LiveMetrics;
use crate::models::{Trade, TradeSide};

pub fn format_number(n: f64, decimals: usize) -> String {
    if n >= 1_000_000_000.0 {
        format!("{:.*}B", decimals, n / 1_000_000_000.0)
    } else if n >= 1_000_000.0 {
        format!("{:.*}M", decimals, n / 1_000_000.0)
    } else if n >= 1_000.0 {
        format!("{:.*}K", decimals, n / 1_000.0)
    } else {
        format!("{:.*}", decimals, n)
    }
}

pub fn format_currency(n: f64) -> String {
    format!("${}", format_number(n, 2))
}

/// `abcd...wxyz`. Addresses too short to shorten come back unchanged.
pub fn shorten_address(address: &str, chars: usize) -> String {
    let len = address.chars().count();
    if len <= chars * 2 {
        return address.to_string();
    }
    let head: String = address.chars().take(chars).collect();
    let tail: String = address.chars().skip(len - chars).collect();
    format!("{}...{}", head, tail)
}

/// Compact relative age: `42s`, `5m`, `3h`, `2d`, `4mo`, `1y`.
pub fn format_time_ago(ts_ms: i64, now_ms: i64) -> String {
    let secs = ((now_ms - ts_ms).max(0) as f64) / 1000.0;
    let minutes = secs / 60.0;
    let hours = minutes / 60.0;
    let days = hours / 24.0;

    if secs < 59.5 {
        format!("{}s", secs.round() as i64)
    } else if minutes < 59.5 {
        format!("{}m", minutes.round() as i64)
    } else if hours < 23.5 {
        format!("{}h", hours.round() as i64)
    } else if days < 29.5 {
        format!("{}d", days.round() as i64)
    } else if days < 365.0 {
        format!("{}mo", (days / 30.0).round().max(1.0) as i64)
    } else {
        format!("{}y", (days / 365.0).round() as i64)
    }
}

/// One line per trade: age, side, trader, amounts, price.
pub fn format_trade_row(trade: &Trade, now_ms: i64) -> String {
    let side = match trade.side {
        TradeSide::Buy => "BUY ",
        TradeSide::Sell => "SELL",
    };
    format!(
        "{:>4} {} {} {} {} | {} tokens @ ${:.6}",
        format_time_ago(trade.timestamp, now_ms),
        side,
        shorten_address(&trade.trader, 4),
        format_number(trade.currency_amount, 3),
        trade.currency_symbol,
        format_number(trade.token_amount, 2),
        trade.price_usd,
    )
}

pub fn format_metrics(metrics: &LiveMetrics) -> String {
    let money = |v: Option<f64>| v.map(format_currency).unwrap_or_else(|| "-".to_string());
    format!(
        "mcap {} | ath {} | vol24h {} | holders {} | price {}",
        money(metrics.market_cap),
        money(metrics.all_time_high),
        money(metrics.volume_24h),
        metrics
            .holder_count
            .map(|h| format_number(h as f64, 0))
            .unwrap_or_else(|| "-".to_string()),
        metrics
            .price_usd
            .map(|p| format!("${:.6}", p))
            .unwrap_or_else(|| "-".to_string()),
    )
}
