//! Feed session
//!
//! The async driver around the synchronous core. One task owns the
//! reconciler and the subscription manager and multiplexes:
//! - commands from the presentation layer
//! - transport events (open/close/message)
//! - completed history and metadata fetches
//! - the metrics batcher deadline
//!
//! After an event that changes what the presentation layer shows, the
//! reconciled state is published as a [`FeedSnapshot`] on a watch channel.
//! Metric pushes only touch the batcher, so they publish once per window.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::FeedConfig;
use crate::feed::history::{ApplyOutcome, FetchError, HistoryFetcher, PageRequest};
use crate::feed::reconciler::{FeedReconciler, ReconcilerSettings, ViewportMetrics};
use crate::feed::router::RouteOutcome;
use crate::feed::subscriptions::{ControlMessage, SubscriptionManager};
use crate::models::{
    validate_token_address, MetricsSnapshot, Page, RecentSearch, TokenInfo, Trade,
};
use crate::storage::RecentSearchStore;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    SelectToken(String),
    Viewport(ViewportMetrics),
    SetNewestEdge(bool),
    /// Merge pending trades and scroll back to the newest edge
    FlushPending,
    LoadMore,
    Shutdown,
}

/// What the push transport reports back to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connecting,
    Open,
    Message(String),
    Closed,
    /// Retry ceiling exhausted; no further reconnects
    GaveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    Connecting,
    Open,
    #[default]
    Closed,
    GaveUp,
}

/// Header metrics for the selected token: seeded from metadata, then moved
/// by batched pushes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveMetrics {
    pub market_cap: Option<f64>,
    pub all_time_high: Option<f64>,
    pub volume_24h: Option<f64>,
    pub holder_count: Option<u64>,
    pub price_usd: Option<f64>,
}

impl LiveMetrics {
    pub fn seeded(info: &TokenInfo) -> Self {
        let mut live = Self::default();
        live.apply(info.baseline_metrics());
        live
    }

    /// Last write wins per field. The all-time-high never drops and is raised
    /// by a market cap above it.
    pub fn apply(&mut self, update: MetricsSnapshot) {
        let candidates = [self.all_time_high, update.all_time_high, update.market_cap];
        let ath = candidates
            .into_iter()
            .flatten()
            .filter(|v| v.is_finite())
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))));

        if update.market_cap.is_some() {
            self.market_cap = update.market_cap;
        }
        if update.volume_24h.is_some() {
            self.volume_24h = update.volume_24h;
        }
        if update.holder_count.is_some() {
            self.holder_count = update.holder_count;
        }
        if update.price_usd.is_some() {
            self.price_usd = update.price_usd;
        }
        self.all_time_high = ath;
    }
}

/// Everything the presentation layer renders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub token: Option<TokenInfo>,
    pub metrics: LiveMetrics,
    pub trades: Vec<Trade>,
    pub pending_count: usize,
    pub at_newest_edge: bool,
    pub has_more: bool,
    pub is_fetching: bool,
    pub last_error: Option<String>,
    /// Metadata lookup is in flight
    pub resolving: bool,
    pub resolve_error: Option<String>,
    pub transport: TransportStatus,
    pub recent_searches: Vec<RecentSearch>,
    pub scroll_to_top: bool,
}

/// Cloneable front door to a running session.
#[derive(Clone)]
pub struct FeedHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshots: watch::Receiver<FeedSnapshot>,
}

impl FeedHandle {
    pub fn new(
        commands: mpsc::UnboundedSender<SessionCommand>,
        snapshots: watch::Receiver<FeedSnapshot>,
    ) -> Self {
        Self {
            commands,
            snapshots,
        }
    }

    /// False once the session has exited.
    pub fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot> {
        self.snapshots.clone()
    }
}

type PageResult = (u64, Result<Page, FetchError>);
type TokenResult = (u64, Result<TokenInfo, FetchError>);
type RecentResult = (u64, Vec<RecentSearch>);

/// Synchronous session state; everything the loop mutates.
struct SessionCore {
    reconciler: FeedReconciler,
    subscriptions: SubscriptionManager,
    fetcher: Arc<dyn HistoryFetcher>,
    store: Arc<dyn RecentSearchStore>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    metrics_rx: mpsc::UnboundedReceiver<MetricsSnapshot>,
    page_tx: mpsc::UnboundedSender<PageResult>,
    token_tx: mpsc::UnboundedSender<TokenResult>,
    recent_tx: mpsc::UnboundedSender<RecentResult>,
    selection: u64,
    resolving: bool,
    resolve_error: Option<String>,
    token: Option<TokenInfo>,
    live: LiveMetrics,
    transport: TransportStatus,
    recent: Vec<RecentSearch>,
    /// Selection whose recent-search write last landed
    recent_selection: u64,
    scroll_to_top: bool,
    snapshot_tx: watch::Sender<FeedSnapshot>,
}

pub struct FeedSession {
    core: SessionCore,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    page_rx: mpsc::UnboundedReceiver<PageResult>,
    token_rx: mpsc::UnboundedReceiver<TokenResult>,
    recent_rx: mpsc::UnboundedReceiver<RecentResult>,
}

impl FeedSession {
    /// `control_tx` carries subscribe/unsubscribe frames to the transport;
    /// `transport_rx` carries its events back.
    pub fn new(
        config: &FeedConfig,
        fetcher: Arc<dyn HistoryFetcher>,
        store: Arc<dyn RecentSearchStore>,
        control_tx: mpsc::UnboundedSender<ControlMessage>,
        transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (Self, FeedHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (metrics_tx, metrics_rx) = mpsc::unbounded_channel();
        let (page_tx, page_rx) = mpsc::unbounded_channel();
        let (token_tx, token_rx) = mpsc::unbounded_channel();
        let (recent_tx, recent_rx) = mpsc::unbounded_channel();

        let recent = store.load().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load recent searches");
            Vec::new()
        });
        let initial = FeedSnapshot {
            at_newest_edge: true,
            recent_searches: recent.clone(),
            ..Default::default()
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        let core = SessionCore {
            reconciler: FeedReconciler::new(ReconcilerSettings::from_config(config), metrics_tx),
            subscriptions: SubscriptionManager::new(),
            fetcher,
            store,
            control_tx,
            metrics_rx,
            page_tx,
            token_tx,
            recent_tx,
            selection: 0,
            resolving: false,
            resolve_error: None,
            token: None,
            live: LiveMetrics::default(),
            transport: TransportStatus::Closed,
            recent,
            recent_selection: 0,
            scroll_to_top: false,
            snapshot_tx,
        };

        let session = Self {
            core,
            commands,
            transport_rx,
            page_rx,
            token_rx,
            recent_rx,
        };
        let handle = FeedHandle::new(command_tx, snapshot_rx);
        (session, handle)
    }

    /// Run until `Shutdown` or every handle is dropped.
    pub async fn run(self) {
        let FeedSession {
            mut core,
            mut commands,
            mut transport_rx,
            mut page_rx,
            mut token_rx,
            mut recent_rx,
        } = self;

        let mut transport_live = true;
        core.publish();

        loop {
            let deadline = core.reconciler.metrics_deadline();

            let changed = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(cmd) => core.handle_command(cmd),
                },
                event = transport_rx.recv(), if transport_live => match event {
                    Some(event) => core.handle_transport(event),
                    None => {
                        debug!("transport event channel closed");
                        transport_live = false;
                        false
                    }
                },
                Some((generation, result)) = page_rx.recv() => core.handle_page(generation, result),
                Some((selection, result)) = token_rx.recv() => core.handle_token(selection, result),
                Some((selection, recent)) = recent_rx.recv() => core.handle_recent(selection, recent),
                _ = wait_until(deadline) => core.poll_metrics(Instant::now()),
            };

            if changed {
                core.publish();
            }
        }

        core.teardown();
        core.publish();
        info!("feed session stopped");
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Every `handle_*` returns whether the published snapshot is now out of date.
impl SessionCore {
    fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::SelectToken(address) => {
                self.select_token(&address);
                true
            }
            SessionCommand::Viewport(viewport) => {
                let before = self.view_marks();
                let requested = match self.reconciler.on_viewport(viewport) {
                    Some(req) => {
                        self.spawn_page_fetch(req);
                        true
                    }
                    None => false,
                };
                requested || self.view_marks() != before
            }
            SessionCommand::SetNewestEdge(at_edge) => {
                let before = self.view_marks();
                self.reconciler.set_at_newest_edge(at_edge);
                self.view_marks() != before
            }
            SessionCommand::FlushPending => {
                let outcome = self.reconciler.flush_pending(true);
                self.scroll_to_top = outcome.scroll_to_top;
                true
            }
            SessionCommand::LoadMore => self.request_page(),
            SessionCommand::Shutdown => false,
        }
    }

    /// Edge flag and pending depth, the parts of the view a viewport change
    /// can move without fetching.
    fn view_marks(&self) -> (bool, usize) {
        (
            self.reconciler.is_at_newest_edge(),
            self.reconciler.pending_count(),
        )
    }

    fn select_token(&mut self, input: &str) {
        let address = match validate_token_address(input) {
            Ok(address) => address,
            Err(e) => {
                debug!(error = %e, "rejected token address");
                self.resolve_error = Some(e.to_string());
                return;
            }
        };

        self.selection += 1;
        self.resolving = true;
        self.resolve_error = None;

        let selection = self.selection;
        let fetcher = self.fetcher.clone();
        let token_tx = self.token_tx.clone();
        info!(%address, "resolving token");
        tokio::spawn(async move {
            let result = fetcher.fetch_token_info(&address).await;
            let _ = token_tx.send((selection, result));
        });
    }

    fn handle_token(&mut self, selection: u64, result: Result<TokenInfo, FetchError>) -> bool {
        if selection != self.selection {
            debug!(selection, current = self.selection, "discarding superseded token lookup");
            return false;
        }
        self.resolving = false;

        match result {
            Ok(info) => self.switch_token(info),
            Err(e) => {
                warn!(error = %e, "Failed to resolve token");
                self.resolve_error = Some(e.to_string());
            }
        }
        true
    }

    fn switch_token(&mut self, info: TokenInfo) {
        if let Some(old) = self.reconciler.scope().cloned() {
            if let Some(msg) = self.subscriptions.deactivate(&old) {
                self.send_control(msg);
            }
        }

        let scope = info.scope();
        let primary = info.primary_pool();
        let generation = self.reconciler.set_scope(
            Some(info.address.clone()),
            scope.clone(),
            info.pool_addresses(),
            primary.map(|p| p.currency_symbol.clone()),
            primary.and_then(|p| p.currency_logo.clone()),
        );
        self.live = LiveMetrics::seeded(&info);

        match scope.as_ref() {
            Some(scope) => {
                if let Some(msg) = self.subscriptions.activate(scope) {
                    self.send_control(msg);
                }
            }
            None => info!(token = %info.address, "token has no pools; live feed disabled"),
        }

        self.record_search(&info);
        info!(token = %info.address, symbol = %info.symbol, generation, "token selected");
        self.token = Some(info);
        self.request_page();
    }

    /// Store writes may hit disk, so they run on the blocking pool and the
    /// refreshed list comes back through `recent_tx`.
    fn record_search(&self, info: &TokenInfo) {
        let search = RecentSearch {
            address: info.address.clone(),
            name: info.name.clone(),
        };
        let selection = self.selection;
        let store = self.store.clone();
        let recent_tx = self.recent_tx.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.record(search) {
                warn!(error = %e, "Failed to record recent search");
                return;
            }
            match store.load() {
                Ok(recent) => {
                    let _ = recent_tx.send((selection, recent));
                }
                Err(e) => warn!(error = %e, "Failed to reload recent searches"),
            }
        });
    }

    fn handle_recent(&mut self, selection: u64, recent: Vec<RecentSearch>) -> bool {
        // A slower write for an earlier selection must not overwrite a newer list
        if selection < self.recent_selection {
            return false;
        }
        self.recent_selection = selection;
        self.recent = recent;
        true
    }

    fn request_page(&mut self) -> bool {
        match self.reconciler.request_next_page() {
            Some(req) => {
                self.spawn_page_fetch(req);
                true
            }
            None => false,
        }
    }

    fn spawn_page_fetch(&self, req: PageRequest) {
        let fetcher = self.fetcher.clone();
        let page_tx = self.page_tx.clone();
        debug!(generation = req.generation, cursor = ?req.query.cursor, "fetching history page");
        tokio::spawn(async move {
            let result = fetcher.fetch_page(&req.query).await;
            let _ = page_tx.send((req.generation, result));
        });
    }

    fn handle_page(&mut self, generation: u64, result: Result<Page, FetchError>) -> bool {
        match self.reconciler.apply_page(generation, result) {
            ApplyOutcome::Applied => true,
            ApplyOutcome::Stale => false,
            ApplyOutcome::Failed(e) => {
                warn!(error = %e, "History fetch failed");
                true
            }
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Connecting => {
                self.subscriptions.on_connecting();
                self.transport = TransportStatus::Connecting;
            }
            TransportEvent::Open => {
                self.transport = TransportStatus::Open;
                if let Some(msg) = self.subscriptions.on_open() {
                    info!(channels = msg.channels.len(), "resubscribing after open");
                    self.send_control(msg);
                }
            }
            TransportEvent::Message(text) => {
                // Metrics wait for the batcher; drops change nothing
                return self.reconciler.ingest_text(&text) == RouteOutcome::Transaction;
            }
            TransportEvent::Closed => {
                self.subscriptions.on_closed();
                self.transport = TransportStatus::Closed;
            }
            TransportEvent::GaveUp => {
                self.subscriptions.on_closed();
                self.transport = TransportStatus::GaveUp;
                error!("live feed unavailable; history remains browsable");
            }
        }
        true
    }

    fn send_control(&self, msg: ControlMessage) {
        if self.control_tx.send(msg).is_err() {
            debug!("transport gone; control message dropped");
        }
    }

    fn poll_metrics(&mut self, now: Instant) -> bool {
        if self.reconciler.poll_metrics(now) {
            self.drain_metrics();
            return true;
        }
        false
    }

    fn drain_metrics(&mut self) {
        while let Ok(update) = self.metrics_rx.try_recv() {
            self.live.apply(update);
        }
    }

    fn teardown(&mut self) {
        if self.reconciler.teardown() {
            self.drain_metrics();
        }
        if let Some(scope) = self.reconciler.scope().cloned() {
            if let Some(msg) = self.subscriptions.deactivate(&scope) {
                self.send_control(msg);
            }
        }
    }

    fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            token: self.token.clone(),
            metrics: self.live.clone(),
            trades: self.reconciler.materialized(),
            pending_count: self.reconciler.pending_count(),
            at_newest_edge: self.reconciler.is_at_newest_edge(),
            has_more: self.reconciler.has_more(),
            is_fetching: self.reconciler.is_fetching(),
            last_error: self.reconciler.last_error().map(|e| e.to_string()),
            resolving: self.resolving,
            resolve_error: self.resolve_error.clone(),
            transport: self.transport,
            recent_searches: self.recent.clone(),
            scroll_to_top: self.scroll_to_top,
        }
    }

    fn publish(&mut self) {
        let snapshot = self.snapshot();
        self.snapshot_tx.send_replace(snapshot);
        self.scroll_to_top = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::history::HistoryQuery;
    use crate::feed::subscriptions::ControlAction;
    use crate::models::{PoolInfo, TradeSide};
    use crate::storage::MemoryRecentSearches;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    const TOKEN: &str = "So11111111111111111111111111111111111111112";
    const POOL: &str = "Pool111111111111111111111111111111111111111";
    const TOKEN_B: &str = "TokenB11111111111111111111111111111111111111";
    /// Resolves to metadata with no pools
    const BARE_TOKEN: &str = "Bare1111111111111111111111111111111111111111";

    #[derive(Default)]
    struct StubFetcher {
        queries: Mutex<Vec<HistoryQuery>>,
    }

    #[async_trait]
    impl HistoryFetcher for StubFetcher {
        async fn fetch_page(&self, query: &HistoryQuery) -> Result<Page, FetchError> {
            self.queries.lock().push(query.clone());
            let trade = Trade {
                tx_hash: "hist-1".to_string(),
                timestamp: 1_000,
                trader: "w".to_string(),
                side: TradeSide::Buy,
                currency_amount: 1.0,
                currency_symbol: "SOL".to_string(),
                currency_logo: None,
                token_amount: 5.0,
                price_usd: 0.2,
            };
            Ok(Page::from_batch(vec![trade], query.limit))
        }

        async fn fetch_token_info(&self, address: &str) -> Result<TokenInfo, FetchError> {
            Ok(TokenInfo {
                address: address.to_string(),
                symbol: "TST".to_string(),
                name: "Test".to_string(),
                image: None,
                decimals: 6,
                market_cap: 1_000.0,
                all_time_high: 5_000.0,
                volume_24h: 10.0,
                holders: 3,
                pools: pools_for(address),
            })
        }
    }

    fn pools_for(address: &str) -> Vec<PoolInfo> {
        let pool_address = match address {
            BARE_TOKEN => return Vec::new(),
            TOKEN => POOL.to_string(),
            other => format!("{other}-pool"),
        };
        vec![PoolInfo {
            pool_address,
            dex: "raydium".to_string(),
            liquidity: 1.0,
            currency_symbol: "SOL".to_string(),
            currency_logo: None,
        }]
    }

    struct Harness {
        handle: FeedHandle,
        fetcher: Arc<StubFetcher>,
        transport_tx: mpsc::UnboundedSender<TransportEvent>,
        control_rx: mpsc::UnboundedReceiver<ControlMessage>,
        store: Arc<MemoryRecentSearches>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start() -> Harness {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let store = Arc::new(MemoryRecentSearches::default());
        let fetcher = Arc::new(StubFetcher::default());
        let (session, handle) = FeedSession::new(
            &FeedConfig::default(),
            fetcher.clone(),
            store.clone(),
            control_tx,
            transport_rx,
        );
        let task = tokio::spawn(session.run());
        Harness {
            handle,
            fetcher,
            transport_tx,
            control_rx,
            store,
            task,
        }
    }

    async fn wait_for<F: Fn(&FeedSnapshot) -> bool>(handle: &FeedHandle, pred: F) -> FeedSnapshot {
        let mut rx = handle.subscribe();
        loop {
            let snap = rx.borrow_and_update().clone();
            if pred(&snap) {
                return snap;
            }
            tokio::time::timeout(Duration::from_secs(5), rx.changed())
                .await
                .expect("snapshot did not arrive in time")
                .expect("session exited");
        }
    }

    #[test]
    fn test_live_metrics_ath_rises_with_market_cap() {
        let mut live = LiveMetrics {
            all_time_high: Some(5_000.0),
            ..Default::default()
        };
        live.apply(MetricsSnapshot {
            market_cap: Some(7_500.0),
            ..Default::default()
        });
        assert_eq!(live.all_time_high, Some(7_500.0));
        assert_eq!(live.market_cap, Some(7_500.0));

        live.apply(MetricsSnapshot {
            market_cap: Some(2_000.0),
            all_time_high: Some(6_000.0),
            ..Default::default()
        });
        assert_eq!(live.all_time_high, Some(7_500.0));
        assert_eq!(live.market_cap, Some(2_000.0));
    }

    #[tokio::test]
    async fn test_select_subscribes_and_loads_first_page() {
        let mut h = start();
        h.transport_tx.send(TransportEvent::Open).unwrap();
        h.handle.send(SessionCommand::SelectToken(format!("  {TOKEN} ")));

        let snap = wait_for(&h.handle, |s| {
            !s.trades.is_empty() && !s.recent_searches.is_empty()
        })
        .await;
        assert_eq!(snap.token.as_ref().unwrap().symbol, "TST");
        assert_eq!(snap.metrics.all_time_high, Some(5_000.0));
        assert_eq!(snap.recent_searches.len(), 1);
        assert!(!snap.has_more);

        let sub = h.control_rx.recv().await.unwrap();
        assert_eq!(
            sub.channels,
            vec![
                format!("pool:metrics:{POOL}"),
                format!("token:transactions:feed:{TOKEN}")
            ]
        );
        assert_eq!(h.store.load().unwrap()[0].address, TOKEN);

        h.handle.send(SessionCommand::Shutdown);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_address_is_reported() {
        let h = start();
        h.handle.send(SessionCommand::SelectToken("short".to_string()));
        let snap = wait_for(&h.handle, |s| s.resolve_error.is_some()).await;
        assert!(snap.token.is_none());
        assert!(!snap.resolving);
        h.handle.send(SessionCommand::Shutdown);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_live_trade_and_batched_metrics_reach_snapshot() {
        let h = start();
        h.handle.send(SessionCommand::SelectToken(TOKEN.to_string()));
        wait_for(&h.handle, |s| !s.trades.is_empty()).await;

        let tx = json!({
            "type": "feed-transaction",
            "data": {"tokenInteraction": {
                "tokenAddress": TOKEN, "interactionType": "sell",
                "txHash": "live-1", "timestamp": 2_000
            }}
        });
        h.transport_tx.send(TransportEvent::Message(tx.to_string())).unwrap();
        let metrics = json!({
            "type": "metrics",
            "data": {"address": {"pool": POOL}, "price": {"usd": 10.0}, "token": {"supply": 1000.0}}
        });
        h.transport_tx
            .send(TransportEvent::Message(metrics.to_string()))
            .unwrap();

        let snap = wait_for(&h.handle, |s| s.metrics.price_usd.is_some()).await;
        assert_eq!(snap.trades[0].tx_hash, "live-1");
        assert_eq!(snap.metrics.market_cap, Some(10_000.0));
        assert_eq!(snap.metrics.all_time_high, Some(10_000.0));

        h.handle.send(SessionCommand::Shutdown);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_resends_subscriptions() {
        let mut h = start();
        h.handle.send(SessionCommand::SelectToken(TOKEN.to_string()));
        wait_for(&h.handle, |s| s.token.is_some()).await;

        h.transport_tx.send(TransportEvent::Open).unwrap();
        let first = h.control_rx.recv().await.unwrap();
        h.transport_tx.send(TransportEvent::Closed).unwrap();
        h.transport_tx.send(TransportEvent::Connecting).unwrap();
        h.transport_tx.send(TransportEvent::Open).unwrap();
        let second = h.control_rx.recv().await.unwrap();
        assert_eq!(first.channels, second.channels);

        h.transport_tx.send(TransportEvent::GaveUp).unwrap();
        let snap = wait_for(&h.handle, |s| {
            s.transport == TransportStatus::GaveUp && !s.trades.is_empty()
        })
        .await;
        assert!(!snap.trades.is_empty(), "history survives a dead transport");

        h.handle.send(SessionCommand::Shutdown);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_switching_tokens_unsubscribes_before_subscribing() {
        let mut h = start();
        h.transport_tx.send(TransportEvent::Open).unwrap();

        h.handle.send(SessionCommand::SelectToken(TOKEN.to_string()));
        let first = h.control_rx.recv().await.unwrap();
        assert_eq!(first.action, ControlAction::Subscribe);

        h.handle.send(SessionCommand::SelectToken(TOKEN_B.to_string()));
        let leave = h.control_rx.recv().await.unwrap();
        let join = h.control_rx.recv().await.unwrap();
        assert_eq!(leave.action, ControlAction::Unsubscribe);
        assert_eq!(leave.channels, first.channels);
        assert_eq!(join.action, ControlAction::Subscribe);
        assert_eq!(
            join.channels,
            vec![
                format!("pool:metrics:{TOKEN_B}-pool"),
                format!("token:transactions:feed:{TOKEN_B}")
            ]
        );

        let snap = wait_for(&h.handle, |s| {
            s.token.as_ref().map(|t| t.address.as_str()) == Some(TOKEN_B)
        })
        .await;
        assert_eq!(snap.transport, TransportStatus::Open);

        h.handle.send(SessionCommand::Shutdown);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_token_without_pools_loads_history_only() {
        let mut h = start();
        h.transport_tx.send(TransportEvent::Open).unwrap();
        h.handle.send(SessionCommand::SelectToken(BARE_TOKEN.to_string()));

        let snap = wait_for(&h.handle, |s| !s.trades.is_empty()).await;
        assert!(snap.token.as_ref().unwrap().pools.is_empty());

        let queries = h.fetcher.queries.lock().clone();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].token, BARE_TOKEN);
        assert!(queries[0].pools.is_empty());
        assert!(h.control_rx.try_recv().is_err(), "no live channels to join");

        h.handle.send(SessionCommand::Shutdown);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_metric_burst_publishes_once_per_window() {
        let h = start();
        h.handle.send(SessionCommand::SelectToken(TOKEN.to_string()));
        wait_for(&h.handle, |s| {
            !s.trades.is_empty() && !s.recent_searches.is_empty() && !s.is_fetching
        })
        .await;

        let mut rx = h.handle.subscribe();
        rx.borrow_and_update();
        for i in 1..=50 {
            let metrics = json!({
                "type": "metrics",
                "data": {"address": {"pool": POOL}, "price": {"usd": i as f64}}
            });
            h.transport_tx
                .send(TransportEvent::Message(metrics.to_string()))
                .unwrap();
        }

        let quiet_until = Instant::now() + Duration::from_millis(400);
        let mut changes = 0;
        while let Ok(Ok(())) = tokio::time::timeout_at(quiet_until, rx.changed()).await {
            changes += 1;
            rx.borrow_and_update();
        }
        assert_eq!(changes, 1);
        assert_eq!(h.handle.snapshot().metrics.price_usd, Some(50.0));

        h.handle.send(SessionCommand::Shutdown);
        h.task.await.unwrap();
    }
}
