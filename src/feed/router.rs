//! Push message routing
//!
//! Classifies inbound feed messages, filters them against the active scope,
//! normalizes payloads and hands the result to the caller's handlers. The
//! router holds no state of its own; deduplication is delegated through
//! [`MessageHandlers::is_duplicate_tx`].

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::models::{MetricsSnapshot, SubscriptionScope, Trade, TradeSide};

pub const MSG_FEED_TRANSACTION: &str = "feed-transaction";
pub const MSG_METRICS: &str = "metrics";

/// Scope and currency fallbacks the dispatch path reads for every message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteContext {
    pub scope: Option<SubscriptionScope>,
    pub fallback_currency: String,
    pub fallback_currency_logo: Option<String>,
}

/// Sinks for routed messages.
pub trait MessageHandlers {
    /// Check-and-mark. Must record `tx_hash` as seen.
    fn is_duplicate_tx(&mut self, tx_hash: &str) -> bool;
    fn on_transaction(&mut self, trade: Trade);
    fn on_metrics(&mut self, update: MetricsSnapshot);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NoScope,
    MissingPayload,
    TokenMismatch,
    PoolMismatch,
    UnsupportedInteraction,
    Duplicate,
    EmptyMetrics,
    /// Failed to parse; set by the dispatch boundary, not by `route`
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Transaction,
    Metrics,
    Dropped(DropReason),
    /// Message type this client does not handle
    Ignored,
}

#[derive(Debug, Deserialize)]
struct FeedTransactionData {
    #[serde(rename = "tokenInteraction")]
    token_interaction: Option<TokenInteraction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenInteraction {
    #[serde(default)]
    token_address: Option<String>,
    #[serde(default)]
    interaction_type: Option<String>,
    #[serde(default)]
    tx_hash: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    wallet_address: Option<String>,
    #[serde(default)]
    amount_currency: Option<f64>,
    #[serde(default)]
    amount_tokens: Option<f64>,
    #[serde(default)]
    token_usd_price: Option<f64>,
    #[serde(default)]
    currency_token: Option<CurrencyToken>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrencyToken {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    logo_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MetricsData {
    #[serde(default)]
    address: Option<MetricsAddress>,
    #[serde(default)]
    price: Option<MetricsPrice>,
    #[serde(default)]
    token: Option<MetricsToken>,
    #[serde(default)]
    activity: Option<MetricsActivity>,
}

#[derive(Debug, Deserialize)]
struct MetricsAddress {
    #[serde(default)]
    pool: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MetricsPrice {
    #[serde(default)]
    usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricsToken {
    #[serde(default)]
    supply: Option<f64>,
    #[serde(default)]
    num_holders: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MetricsActivity {
    #[serde(rename = "1d", default)]
    one_day: Option<ActivityWindow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivityWindow {
    #[serde(default)]
    volume_buy_usd: Option<f64>,
    #[serde(default)]
    volume_sell_usd: Option<f64>,
}

/// Parse a raw text frame and route it.
pub fn route_text<H: MessageHandlers>(
    text: &str,
    ctx: &RouteContext,
    handlers: &mut H,
) -> Result<RouteOutcome> {
    let message: Value = serde_json::from_str(text).context("feed message is not JSON")?;
    route(&message, ctx, handlers)
}

/// Route one decoded message. Unknown types are ignored, not errors.
pub fn route<H: MessageHandlers>(
    message: &Value,
    ctx: &RouteContext,
    handlers: &mut H,
) -> Result<RouteOutcome> {
    let msg_type = message.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match msg_type {
        MSG_FEED_TRANSACTION => route_transaction(message, ctx, handlers),
        MSG_METRICS => route_metrics(message, ctx, handlers),
        _ => Ok(RouteOutcome::Ignored),
    }
}

fn route_transaction<H: MessageHandlers>(
    message: &Value,
    ctx: &RouteContext,
    handlers: &mut H,
) -> Result<RouteOutcome> {
    let Some(scope) = ctx.scope.as_ref() else {
        return Ok(RouteOutcome::Dropped(DropReason::NoScope));
    };
    let Some(data) = message.get("data") else {
        return Ok(RouteOutcome::Dropped(DropReason::MissingPayload));
    };

    let data: FeedTransactionData =
        serde_json::from_value(data.clone()).context("malformed feed-transaction payload")?;
    let Some(tx) = data.token_interaction else {
        return Ok(RouteOutcome::Dropped(DropReason::MissingPayload));
    };

    if let Some(token) = tx.token_address.as_deref().filter(|t| !t.is_empty()) {
        if token != scope.token {
            return Ok(RouteOutcome::Dropped(DropReason::TokenMismatch));
        }
    }

    let Some(side) = tx.interaction_type.as_deref().and_then(TradeSide::parse) else {
        return Ok(RouteOutcome::Dropped(DropReason::UnsupportedInteraction));
    };

    let Some(tx_hash) = tx.tx_hash.filter(|h| !h.is_empty()) else {
        return Ok(RouteOutcome::Dropped(DropReason::MissingPayload));
    };

    if handlers.is_duplicate_tx(&tx_hash) {
        return Ok(RouteOutcome::Dropped(DropReason::Duplicate));
    }

    let (currency_symbol, currency_logo) = match tx.currency_token {
        Some(currency) => (
            currency
                .symbol
                .unwrap_or_else(|| ctx.fallback_currency.clone()),
            currency
                .logo_url
                .or_else(|| ctx.fallback_currency_logo.clone()),
        ),
        None => (
            ctx.fallback_currency.clone(),
            ctx.fallback_currency_logo.clone(),
        ),
    };

    handlers.on_transaction(Trade {
        tx_hash,
        timestamp: tx
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        trader: tx.wallet_address.unwrap_or_default(),
        side,
        currency_amount: tx.amount_currency.unwrap_or(0.0),
        currency_symbol,
        currency_logo,
        token_amount: tx.amount_tokens.unwrap_or(0.0),
        price_usd: tx.token_usd_price.unwrap_or(0.0),
    });

    Ok(RouteOutcome::Transaction)
}

fn route_metrics<H: MessageHandlers>(
    message: &Value,
    ctx: &RouteContext,
    handlers: &mut H,
) -> Result<RouteOutcome> {
    let Some(scope) = ctx.scope.as_ref() else {
        return Ok(RouteOutcome::Dropped(DropReason::NoScope));
    };

    let data: MetricsData = match message.get("data") {
        Some(Value::Null) | None => MetricsData::default(),
        Some(data) => {
            serde_json::from_value(data.clone()).context("malformed metrics payload")?
        }
    };

    if let Some(pool) = data.address.as_ref().and_then(|a| a.pool.as_deref()) {
        if !pool.is_empty() && pool != scope.pool {
            return Ok(RouteOutcome::Dropped(DropReason::PoolMismatch));
        }
    }

    let update = derive_metrics(&data);
    if update.is_empty() {
        return Ok(RouteOutcome::Dropped(DropReason::EmptyMetrics));
    }

    handlers.on_metrics(update);
    Ok(RouteOutcome::Metrics)
}

fn derive_metrics(data: &MetricsData) -> MetricsSnapshot {
    let price_usd = data.price.as_ref().and_then(|p| p.usd);
    let supply = data.token.as_ref().and_then(|t| t.supply);
    let holders = data.token.as_ref().and_then(|t| t.num_holders);
    let day = data.activity.as_ref().and_then(|a| a.one_day.as_ref());

    MetricsSnapshot {
        market_cap: match (price_usd, supply) {
            (Some(price), Some(supply)) => Some(price * supply),
            _ => None,
        },
        price_usd,
        holder_count: holders
            .filter(|h| h.is_finite() && *h >= 0.0)
            .map(|h| h as u64),
        volume_24h: day.map(|w| w.volume_buy_usd.unwrap_or(0.0) + w.volume_sell_usd.unwrap_or(0.0)),
        ..Default::default()
    }
}
