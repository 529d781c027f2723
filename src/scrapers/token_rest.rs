//! Token REST API client
//!
//! Pull side of the feed: token metadata and paginated trade history.
//! Every request carries the `x-api-key` header when one is configured.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::FeedConfig;
use crate::feed::history::{FetchError, HistoryFetcher, HistoryQuery};
use crate::models::{Page, PoolInfo, TokenInfo, Trade, TradeSide};

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawToken {
    address: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    decimals: u8,
    #[serde(default)]
    logo_url: Option<String>,
    #[serde(default)]
    supply: f64,
    #[serde(default)]
    num_holders: u64,
    #[serde(default)]
    pools: Vec<RawPool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPool {
    address: String,
    #[serde(default)]
    dex: String,
    #[serde(default)]
    liquidity_usd: f64,
    #[serde(default)]
    fdv_usd: f64,
    #[serde(default)]
    volume_24h: f64,
    #[serde(default)]
    ath_usd: f64,
    #[serde(default)]
    currency_token: Option<RawCurrency>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCurrency {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    logo_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    transaction_hash: String,
    #[serde(default)]
    wallet_address: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    amount_tokens: f64,
    #[serde(default)]
    token_usd_price: f64,
    #[serde(default)]
    amount_currency: f64,
    #[serde(default)]
    currency_token: Option<RawCurrency>,
    created_at: String,
}

/// POST body for `/tokens/transactions`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionsRequest<'a> {
    chain: &'a str,
    limit: usize,
    order: &'static str,
    token_address: &'a str,
    #[serde(rename = "type")]
    kinds: [&'static str; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pool_address: Option<&'a [String]>,
}

#[derive(Clone)]
pub struct TokenRestClient {
    client: Client,
    base_url: String,
    chain: String,
    default_currency: String,
}

impl TokenRestClient {
    pub fn new(config: &FeedConfig) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = config.api_key.as_deref() {
            headers.insert(
                "x-api-key",
                key.parse().context("Invalid API key header value")?,
            );
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Duration::from_secs(60))
            .default_headers(headers)
            .build()
            .context("Failed to build TokenRestClient")?;

        Ok(Self {
            client,
            base_url: config.api_base.trim_end_matches('/').to_string(),
            chain: config.chain.clone(),
            default_currency: config.default_currency.clone(),
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(
        resp: reqwest::Response,
    ) -> Result<T, FetchError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<T>()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))
    }
}

fn transport_error(e: reqwest::Error) -> FetchError {
    FetchError::Transport(e.to_string())
}

fn normalize_token(raw: RawToken, default_currency: &str) -> TokenInfo {
    let primary = raw.pools.first();
    let market_cap = primary.map(|p| p.fdv_usd).unwrap_or(0.0);
    let all_time_high = primary.map(|p| p.ath_usd).unwrap_or(0.0) * raw.supply;
    let volume_24h = primary.map(|p| p.volume_24h).unwrap_or(0.0);

    let pools = raw
        .pools
        .into_iter()
        .map(|p| {
            let (symbol, logo) = match p.currency_token {
                Some(c) => (c.symbol, c.logo_url),
                None => (None, None),
            };
            PoolInfo {
                pool_address: p.address,
                dex: p.dex,
                liquidity: p.liquidity_usd,
                currency_symbol: symbol.unwrap_or_else(|| default_currency.to_string()),
                currency_logo: logo,
            }
        })
        .collect();

    TokenInfo {
        address: raw.address,
        symbol: raw.symbol,
        name: raw.name,
        image: raw.logo_url,
        decimals: raw.decimals,
        market_cap,
        all_time_high,
        volume_24h,
        holders: raw.num_holders,
        pools,
    }
}

fn normalize_trade(raw: RawTransaction, default_currency: &str) -> Option<Trade> {
    let side = TradeSide::parse(&raw.kind)?;
    let timestamp = match chrono::DateTime::parse_from_rfc3339(&raw.created_at) {
        Ok(ts) => ts.timestamp_millis(),
        Err(e) => {
            warn!(error = %e, tx_hash = %raw.transaction_hash, "Skipping trade with bad createdAt");
            return None;
        }
    };
    let (symbol, logo) = match raw.currency_token {
        Some(c) => (c.symbol, c.logo_url),
        None => (None, None),
    };

    Some(Trade {
        tx_hash: raw.transaction_hash,
        timestamp,
        trader: raw.wallet_address,
        side,
        currency_amount: raw.amount_currency,
        currency_symbol: symbol.unwrap_or_else(|| default_currency.to_string()),
        currency_logo: logo,
        token_amount: raw.amount_tokens,
        price_usd: raw.token_usd_price,
    })
}

/// `has_more` follows the raw row count so skipped rows do not end paging early.
fn page_from_rows(rows: Vec<RawTransaction>, limit: usize, default_currency: &str) -> Page {
    let raw_count = rows.len();
    let trades: Vec<Trade> = rows
        .into_iter()
        .filter_map(|row| normalize_trade(row, default_currency))
        .collect();

    Page {
        cursor_timestamp: trades.last().map(|t| t.timestamp),
        has_more: raw_count == limit,
        trades,
    }
}

#[async_trait]
impl HistoryFetcher for TokenRestClient {
    async fn fetch_page(&self, query: &HistoryQuery) -> Result<Page, FetchError> {
        let body = TransactionsRequest {
            chain: &self.chain,
            limit: query.limit,
            order: "desc",
            token_address: &query.token,
            kinds: ["buy", "sell"],
            from: query.cursor,
            pool_address: if query.pools.is_empty() {
                None
            } else {
                Some(query.pools.as_slice())
            },
        };

        let resp = self
            .client
            .post(self.url("/tokens/transactions"))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let envelope: Envelope<Vec<RawTransaction>> = Self::read_json(resp).await?;
        let rows = envelope.data.unwrap_or_default();
        debug!(rows = rows.len(), cursor = ?query.cursor, "history page received");
        Ok(page_from_rows(rows, query.limit, &self.default_currency))
    }

    async fn fetch_token_info(&self, address: &str) -> Result<TokenInfo, FetchError> {
        let resp = self
            .client
            .get(self.url(&format!("/tokens/{}", address)))
            .query(&[("chain", self.chain.as_str())])
            .send()
            .await
            .map_err(transport_error)?;

        let envelope: Envelope<RawToken> = Self::read_json(resp).await?;
        let raw = envelope
            .data
            .ok_or_else(|| FetchError::InvalidResponse("token response has no data".to_string()))?;
        Ok(normalize_token(raw, &self.default_currency))
    }
}
