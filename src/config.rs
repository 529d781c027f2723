//! Feed configuration
//!
//! Loaded from a TOML file (missing file means defaults), then overridden
//! from the environment.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Runtime configuration for the feed service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// REST base URL (token metadata + transaction history)
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Push transport URL
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Sent as `x-api-key` on REST requests and the WS handshake
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_chain")]
    pub chain: String,

    /// History page size
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Currency shown when a trade omits its own currency metadata
    #[serde(default = "default_currency")]
    pub default_currency: String,

    /// Metrics batching window (ms)
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,

    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,

    /// Transport retry ceiling
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    /// Fixed delay between reconnect attempts (ms)
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Scroll offset (px) under which the viewport is at the newest edge
    #[serde(default = "default_newest_edge_threshold_px")]
    pub newest_edge_threshold_px: f64,

    /// Distance (px) from the end of the list that triggers the next page
    #[serde(default = "default_load_more_threshold_px")]
    pub load_more_threshold_px: f64,

    #[serde(default = "default_recent_searches_limit")]
    pub recent_searches_limit: usize,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_api_base() -> String {
    "http://localhost:3000/v1".to_string()
}

fn default_ws_url() -> String {
    "ws://localhost:3000/ws/v1/rooms".to_string()
}

fn default_chain() -> String {
    "solana".to_string()
}

fn default_page_size() -> usize {
    500
}

fn default_currency() -> String {
    "SOL".to_string()
}

fn default_batch_interval_ms() -> u64 {
    100
}

fn default_dedup_capacity() -> usize {
    100
}

fn default_pending_capacity() -> usize {
    500
}

fn default_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_interval_ms() -> u64 {
    3000
}

fn default_newest_edge_threshold_px() -> f64 {
    50.0
}

fn default_load_more_threshold_px() -> f64 {
    200.0
}

fn default_recent_searches_limit() -> usize {
    10
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "./tokenscope.db".to_string()
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            ws_url: default_ws_url(),
            api_key: None,
            chain: default_chain(),
            page_size: default_page_size(),
            default_currency: default_currency(),
            batch_interval_ms: default_batch_interval_ms(),
            dedup_capacity: default_dedup_capacity(),
            pending_capacity: default_pending_capacity(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            newest_edge_threshold_px: default_newest_edge_threshold_px(),
            load_more_threshold_px: default_load_more_threshold_px(),
            recent_searches_limit: default_recent_searches_limit(),
            port: default_port(),
            db_path: default_db_path(),
        }
    }
}

impl FeedConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Load the TOML file named by `TOKENSCOPE_CONFIG` (or `explicit`), then
    /// apply environment overrides.
    pub fn from_env(explicit: Option<&Path>) -> Self {
        dotenv::dotenv().ok();

        let path = explicit
            .map(|p| p.to_string_lossy().into_owned())
            .or_else(|| std::env::var("TOKENSCOPE_CONFIG").ok())
            .unwrap_or_else(|| "tokenscope.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default feed config ({}): {}", path, e);
            Self::default()
        });
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TOKENSCOPE_API_BASE") {
            self.api_base = v;
        }
        if let Ok(v) = std::env::var("TOKENSCOPE_WS_URL") {
            self.ws_url = v;
        }
        if let Ok(v) = std::env::var("TOKENSCOPE_API_KEY") {
            if !v.trim().is_empty() {
                self.api_key = Some(v.trim().to_string());
            }
        }
        if let Some(port) = std::env::var("TOKENSCOPE_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
        {
            self.port = port;
        }
        if let Ok(v) = std::env::var("TOKENSCOPE_DB_PATH") {
            self.db_path = v;
        }
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}
