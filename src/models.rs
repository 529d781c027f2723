//! Shared data model for the token feed.
//!
//! Trades and metric snapshots are normalized here from both the pull
//! (REST history) and push (WebSocket feed) shapes, so everything past the
//! scrapers works with one representation.

use serde::{Deserialize, Serialize};

/// Minimum length accepted for a token address typed by a user.
pub const MIN_ADDRESS_LEN: usize = 32;

/// Trade direction. Anything else on the wire is dropped before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "buy" => Some(TradeSide::Buy),
            "sell" => Some(TradeSide::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

/// A single swap against the observed token. Identity is `tx_hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub tx_hash: String,
    /// Epoch milliseconds
    pub timestamp: i64,
    pub trader: String,
    pub side: TradeSide,
    pub currency_amount: f64,
    pub currency_symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency_logo: Option<String>,
    pub token_amount: f64,
    pub price_usd: f64,
}

/// Partial pool/token metrics. Every field is independently optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_cap: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_time_high: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_24h: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_usd: Option<f64>,
}

impl MetricsSnapshot {
    pub fn is_empty(&self) -> bool {
        self.pool_address.is_none()
            && self.market_cap.is_none()
            && self.all_time_high.is_none()
            && self.volume_24h.is_none()
            && self.holder_count.is_none()
            && self.price_usd.is_none()
    }

    /// Merge `newer` over `self` field by field.
    ///
    /// Last write wins for every field except `all_time_high`, which only
    /// moves up.
    pub fn merge(&mut self, newer: MetricsSnapshot) {
        if newer.pool_address.is_some() {
            self.pool_address = newer.pool_address;
        }
        if newer.market_cap.is_some() {
            self.market_cap = newer.market_cap;
        }
        if newer.volume_24h.is_some() {
            self.volume_24h = newer.volume_24h;
        }
        if newer.holder_count.is_some() {
            self.holder_count = newer.holder_count;
        }
        if newer.price_usd.is_some() {
            self.price_usd = newer.price_usd;
        }
        if let Some(ath) = newer.all_time_high {
            match self.all_time_high {
                Some(current) if ath <= current => {}
                _ => self.all_time_high = Some(ath),
            }
        }
    }
}

/// The (token, primary pool) pair currently being observed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionScope {
    pub token: String,
    pub pool: String,
}

impl SubscriptionScope {
    pub fn new(token: impl Into<String>, pool: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            pool: pool.into(),
        }
    }
}

/// One page of pulled history, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub trades: Vec<Trade>,
    /// Timestamp of the last (oldest) trade, used as the next cursor
    pub cursor_timestamp: Option<i64>,
    pub has_more: bool,
}

impl Page {
    /// Build a page from a fetched batch. A full batch implies more may exist.
    pub fn from_batch(trades: Vec<Trade>, requested: usize) -> Self {
        let cursor_timestamp = trades.last().map(|t| t.timestamp);
        let has_more = trades.len() == requested;
        Self {
            trades,
            cursor_timestamp,
            has_more,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub pool_address: String,
    pub dex: String,
    pub liquidity: f64,
    pub currency_symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency_logo: Option<String>,
}

/// Resolved token metadata. The first pool is the primary pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub address: String,
    pub symbol: String,
    pub name: String,
    pub image: Option<String>,
    pub decimals: u8,
    pub market_cap: f64,
    pub all_time_high: f64,
    pub volume_24h: f64,
    pub holders: u64,
    pub pools: Vec<PoolInfo>,
}

impl TokenInfo {
    pub fn primary_pool(&self) -> Option<&PoolInfo> {
        self.pools.first()
    }

    pub fn scope(&self) -> Option<SubscriptionScope> {
        self.primary_pool()
            .map(|p| SubscriptionScope::new(self.address.clone(), p.pool_address.clone()))
    }

    pub fn pool_addresses(&self) -> Vec<String> {
        self.pools.iter().map(|p| p.pool_address.clone()).collect()
    }

    /// Metrics baseline the live view starts from before any push arrives.
    pub fn baseline_metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pool_address: self.primary_pool().map(|p| p.pool_address.clone()),
            market_cap: Some(self.market_cap),
            all_time_high: Some(self.all_time_high),
            volume_24h: Some(self.volume_24h),
            holder_count: Some(self.holders),
            price_usd: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentSearch {
    pub address: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    Empty,
    TooShort(usize),
}

impl std::fmt::Display for AddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressError::Empty => write!(f, "Please enter a token address"),
            AddressError::TooShort(len) => write!(
                f,
                "Invalid address: {} characters (expected at least {})",
                len, MIN_ADDRESS_LEN
            ),
        }
    }
}

impl std::error::Error for AddressError {}

/// Trim and sanity-check a user-supplied token address.
pub fn validate_token_address(input: &str) -> Result<String, AddressError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AddressError::Empty);
    }
    let len = trimmed.chars().count();
    if len < MIN_ADDRESS_LEN {
        return Err(AddressError::TooShort(len));
    }
    Ok(trimmed.to_string())
}
