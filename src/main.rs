//! TokenScope - live trade feed for a single token
//!
//! Serves the reconciled feed over HTTP/WebSocket, or with `--headless`
//! logs it as formatted rows.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tokenscope_backend::{
    api::{self, AppState},
    config::FeedConfig,
    feed::{FeedHandle, FeedSession, FeedSnapshot, SessionCommand},
    format::{format_metrics, format_trade_row},
    models::validate_token_address,
    scrapers::{FeedWebSocketClient, TokenRestClient},
    storage::{MemoryRecentSearches, RecentSearchStore, SqliteRecentSearches},
};

/// Rows logged per headless refresh
const HEADLESS_ROWS: usize = 10;

#[derive(Parser, Debug)]
#[command(name = "tokenscope")]
#[command(about = "Live token trade feed reconciled with paginated history")]
struct Cli {
    /// Token address to select on startup
    #[arg(long)]
    token: Option<String>,

    /// TOML config file (falls back to TOKENSCOPE_CONFIG, then tokenscope.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// API listen port
    #[arg(long)]
    port: Option<u16>,

    /// Log the feed instead of serving it
    #[arg(long)]
    headless: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = FeedConfig::from_env(cli.config.as_deref());
    if let Some(port) = cli.port {
        config.port = port;
    }

    let initial_token = match cli.token.as_deref() {
        Some(token) => Some(validate_token_address(token).context("Invalid --token")?),
        None if cli.headless => bail!("--headless requires --token"),
        None => None,
    };

    info!(api_base = %config.api_base, ws_url = %config.ws_url, "🚀 Starting tokenscope");

    let fetcher = Arc::new(TokenRestClient::new(&config)?);
    let store: Arc<dyn RecentSearchStore> = if cli.headless {
        Arc::new(MemoryRecentSearches::new(config.recent_searches_limit))
    } else {
        Arc::new(SqliteRecentSearches::new(
            &config.db_path,
            config.recent_searches_limit,
        )?)
    };

    let (ws_client, transport_rx) = FeedWebSocketClient::new(&config);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (session, handle) =
        FeedSession::new(&config, fetcher, store.clone(), control_tx, transport_rx);

    let transport_task = tokio::spawn(async move { ws_client.run(control_rx).await });
    let session_task = tokio::spawn(session.run());

    if let Some(address) = initial_token {
        handle.send(SessionCommand::SelectToken(address));
    }

    let result = if cli.headless {
        run_headless(handle.clone()).await;
        Ok(())
    } else {
        serve(
            config.port,
            AppState {
                feed: handle.clone(),
                recent: store,
            },
        )
        .await
    };

    handle.send(SessionCommand::Shutdown);
    if let Err(e) = session_task.await {
        warn!(error = %e, "feed session task failed");
    }
    transport_task.abort();
    result
}

/// Initialize tracing with an env filter
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokenscope_backend=info,tokenscope=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(port: u16, state: AppState) -> Result<()> {
    let app = api::router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")
}

/// Log the head of the feed whenever it changes, until Ctrl-C.
async fn run_headless(handle: FeedHandle) {
    let mut rx = handle.subscribe();
    let mut last_head: Option<String> = None;
    let mut last_metrics = String::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                return;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let snapshot = rx.borrow_and_update().clone();
                render(&snapshot, &mut last_head, &mut last_metrics);
            }
        }
    }
}

fn render(snapshot: &FeedSnapshot, last_head: &mut Option<String>, last_metrics: &mut String) {
    if let Some(err) = snapshot.resolve_error.as_deref() {
        warn!(error = %err, "token lookup failed");
    }

    let metrics = format_metrics(&snapshot.metrics);
    if metrics != *last_metrics {
        let symbol = snapshot.token.as_ref().map(|t| t.symbol.as_str()).unwrap_or("?");
        info!("📈 {} {}", symbol, metrics);
        *last_metrics = metrics;
    }

    let head = snapshot.trades.first().map(|t| t.tx_hash.clone());
    if head == *last_head {
        return;
    }
    *last_head = head;

    let now_ms = chrono::Utc::now().timestamp_millis();
    info!(
        trades = snapshot.trades.len(),
        pending = snapshot.pending_count,
        transport = ?snapshot.transport,
        "feed updated"
    );
    for trade in snapshot.trades.iter().take(HEADLESS_ROWS) {
        info!("  {}", format_trade_row(trade, now_ms));
    }
}
