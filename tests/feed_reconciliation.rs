//! End-to-end reconciliation against a scripted history source.
//!
//! History is a fixed newest-first list served page by page with the same
//! cursor semantics as the real API; live traffic is fed as raw JSON frames.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use tokenscope_backend::config::FeedConfig;
use tokenscope_backend::feed::history::{ApplyOutcome, FetchError, HistoryFetcher, HistoryQuery};
use tokenscope_backend::feed::reconciler::{FeedReconciler, ReconcilerSettings, ViewportMetrics};
use tokenscope_backend::feed::router::{DropReason, RouteOutcome};
use tokenscope_backend::feed::{FeedSession, FeedSnapshot, SessionCommand, TransportEvent};
use tokenscope_backend::models::{Page, PoolInfo, SubscriptionScope, TokenInfo, Trade, TradeSide};
use tokenscope_backend::storage::MemoryRecentSearches;

const TOKEN: &str = "Mint111111111111111111111111111111111111111";
const POOL: &str = "Pool111111111111111111111111111111111111111";

struct ScriptedHistory {
    trades: Vec<Trade>,
    calls: Mutex<Vec<HistoryQuery>>,
}

impl ScriptedHistory {
    /// `count` trades, newest first, one second apart.
    fn new(count: i64) -> Self {
        let trades = (0..count)
            .map(|i| Trade {
                tx_hash: format!("hist-{i}"),
                timestamp: 1_000_000 - i * 1_000,
                trader: format!("Wallet{i}"),
                side: if i % 2 == 0 { TradeSide::Buy } else { TradeSide::Sell },
                currency_amount: 1.0,
                currency_symbol: "SOL".to_string(),
                currency_logo: None,
                token_amount: 100.0,
                price_usd: 0.01,
            })
            .collect();
        Self {
            trades,
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl HistoryFetcher for ScriptedHistory {
    async fn fetch_page(&self, query: &HistoryQuery) -> Result<Page, FetchError> {
        self.calls.lock().push(query.clone());
        let batch: Vec<Trade> = self
            .trades
            .iter()
            .filter(|t| query.cursor.map_or(true, |c| t.timestamp < c))
            .take(query.limit)
            .cloned()
            .collect();
        Ok(Page::from_batch(batch, query.limit))
    }

    async fn fetch_token_info(&self, address: &str) -> Result<TokenInfo, FetchError> {
        Ok(TokenInfo {
            address: address.to_string(),
            symbol: "SCR".to_string(),
            name: "Scripted".to_string(),
            image: None,
            decimals: 6,
            market_cap: 10.0,
            all_time_high: 20.0,
            volume_24h: 1.0,
            holders: 2,
            pools: vec![PoolInfo {
                pool_address: POOL.to_string(),
                dex: "dex".to_string(),
                liquidity: 1.0,
                currency_symbol: "SOL".to_string(),
                currency_logo: None,
            }],
        })
    }
}

fn live_frame(hash: &str) -> String {
    json!({
        "type": "feed-transaction",
        "data": {"tokenInteraction": {
            "tokenAddress": TOKEN,
            "interactionType": "buy",
            "txHash": hash,
            "timestamp": 2_000_000,
            "walletAddress": "LiveWallet"
        }}
    })
    .to_string()
}

fn settings(page_size: usize) -> ReconcilerSettings {
    ReconcilerSettings {
        page_size,
        ..Default::default()
    }
}

fn hashes(trades: &[Trade]) -> Vec<String> {
    trades.iter().map(|t| t.tx_hash.clone()).collect()
}

async fn load_next(rec: &mut FeedReconciler, history: &ScriptedHistory) -> ApplyOutcome {
    let req = rec.request_next_page().expect("a page should be requestable");
    let result = history.fetch_page(&req.query).await;
    rec.apply_page(req.generation, result)
}

#[tokio::test]
async fn pages_chain_by_cursor_until_short_page() {
    let history = ScriptedHistory::new(7);
    let (metrics_tx, _metrics_rx) = mpsc::unbounded_channel();
    let mut rec = FeedReconciler::new(settings(3), metrics_tx);
    rec.set_scope(
        Some(TOKEN.to_string()),
        Some(SubscriptionScope::new(TOKEN, POOL)),
        vec![POOL.to_string()],
        None,
        None,
    );

    for _ in 0..3 {
        assert_eq!(load_next(&mut rec, &history).await, ApplyOutcome::Applied);
    }
    assert!(!rec.has_more());
    assert!(rec.request_next_page().is_none());

    let calls = history.calls.lock().clone();
    let cursors: Vec<Option<i64>> = calls.iter().map(|q| q.cursor).collect();
    assert_eq!(cursors, vec![None, Some(998_000), Some(995_000)]);
    assert!(calls.iter().all(|q| q.pools == vec![POOL.to_string()]));

    let feed = rec.materialized();
    assert_eq!(feed.len(), 7);
    assert!(feed.windows(2).all(|w| w[0].timestamp > w[1].timestamp));
}

#[tokio::test]
async fn live_and_history_merge_without_duplicates() {
    let history = ScriptedHistory::new(5);
    let (metrics_tx, _metrics_rx) = mpsc::unbounded_channel();
    let mut rec = FeedReconciler::new(settings(500), metrics_tx);
    rec.set_scope(
        Some(TOKEN.to_string()),
        Some(SubscriptionScope::new(TOKEN, POOL)),
        vec![POOL.to_string()],
        None,
        None,
    );
    load_next(&mut rec, &history).await;

    assert_eq!(rec.ingest_text(&live_frame("L1")), RouteOutcome::Transaction);

    // User scrolls down; live traffic is held back
    rec.on_viewport(ViewportMetrics {
        scroll_top: 300.0,
        scroll_height: 20_000.0,
        client_height: 800.0,
    });
    rec.ingest_text(&live_frame("L2"));
    rec.ingest_text(&live_frame("L3"));
    assert_eq!(
        rec.ingest_text(&live_frame("L2")),
        RouteOutcome::Dropped(DropReason::Duplicate)
    );
    assert_eq!(rec.pending_count(), 2);
    assert_eq!(rec.materialized()[0].tx_hash, "L1");

    // Back at the top: pending lands ahead of everything, newest first
    rec.on_viewport(ViewportMetrics {
        scroll_top: 0.0,
        scroll_height: 20_000.0,
        client_height: 800.0,
    });
    let feed = hashes(&rec.materialized());
    assert_eq!(&feed[..4], &["L3", "L2", "L1", "hist-0"]);

    let unique: HashSet<&String> = feed.iter().collect();
    assert_eq!(unique.len(), feed.len());
}

#[tokio::test]
async fn scope_change_discards_in_flight_page() {
    let history = ScriptedHistory::new(5);
    let (metrics_tx, _metrics_rx) = mpsc::unbounded_channel();
    let mut rec = FeedReconciler::new(settings(500), metrics_tx);
    rec.set_scope(
        Some(TOKEN.to_string()),
        Some(SubscriptionScope::new(TOKEN, POOL)),
        vec![POOL.to_string()],
        None,
        None,
    );

    let stale = rec.request_next_page().unwrap();
    rec.set_scope(
        Some("OtherMint".to_string()),
        Some(SubscriptionScope::new("OtherMint", "OtherPool")),
        vec!["OtherPool".to_string()],
        None,
        None,
    );
    let result = history.fetch_page(&stale.query).await;
    assert_eq!(rec.apply_page(stale.generation, result), ApplyOutcome::Stale);
    assert!(rec.materialized().is_empty());

    // Live traffic for the old token no longer matches
    assert_eq!(
        rec.ingest_text(&live_frame("late")),
        RouteOutcome::Dropped(DropReason::TokenMismatch)
    );
}

async fn wait_for<F: Fn(&FeedSnapshot) -> bool>(
    rx: &mut tokio::sync::watch::Receiver<FeedSnapshot>,
    pred: F,
) -> FeedSnapshot {
    loop {
        let snap = rx.borrow_and_update().clone();
        if pred(&snap) {
            return snap;
        }
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("timed out waiting for snapshot")
            .expect("session exited");
    }
}

#[tokio::test]
async fn session_pages_on_demand_and_flushes_pending() {
    let config = FeedConfig {
        page_size: 4,
        ..Default::default()
    };
    let history = Arc::new(ScriptedHistory::new(10));
    let (control_tx, _control_rx) = mpsc::unbounded_channel();
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let (session, handle) = FeedSession::new(
        &config,
        history.clone(),
        Arc::new(MemoryRecentSearches::default()),
        control_tx,
        transport_rx,
    );
    let task = tokio::spawn(session.run());
    let mut rx = handle.subscribe();

    handle.send(SessionCommand::SelectToken(TOKEN.to_string()));
    wait_for(&mut rx, |s| s.trades.len() == 4).await;

    handle.send(SessionCommand::LoadMore);
    wait_for(&mut rx, |s| s.trades.len() == 8 && !s.is_fetching).await;
    handle.send(SessionCommand::LoadMore);
    let snap = wait_for(&mut rx, |s| s.trades.len() == 10 && !s.is_fetching).await;
    assert!(!snap.has_more);

    handle.send(SessionCommand::SetNewestEdge(false));
    wait_for(&mut rx, |s| !s.at_newest_edge).await;
    transport_tx
        .send(TransportEvent::Message(live_frame("L1")))
        .unwrap();
    let snap = wait_for(&mut rx, |s| s.pending_count == 1).await;
    assert_eq!(snap.trades[0].tx_hash, "hist-0");

    handle.send(SessionCommand::FlushPending);
    let snap = wait_for(&mut rx, |s| s.pending_count == 0 && s.trades.len() == 11).await;
    assert_eq!(snap.trades[0].tx_hash, "L1");
    assert!(snap.at_newest_edge);

    handle.send(SessionCommand::Shutdown);
    task.await.unwrap();
}
