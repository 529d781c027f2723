//! Feed reconciliation
//!
//! Merges live pushes with pulled history into one deduplicated,
//! newest-first trade list. While the viewport sits at the newest edge, live
//! trades are spliced straight into the head of the first page. Once the
//! user scrolls away they are held in a bounded pending buffer so the list
//! under the user does not move, and are merged back in one step when the
//! viewport returns (or on an explicit flush).
//!
//! All mutation happens on one task. A scope change invalidates the dedup
//! window, the pending buffer, the batcher and the page cache before the
//! next message is looked at.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::FeedConfig;
use crate::feed::batcher::MetricsBatcher;
use crate::feed::dedup::TxDeduplicator;
use crate::feed::history::{ApplyOutcome, FetchError, PageRequest, PageSequence};
use crate::feed::router::{self, DropReason, MessageHandlers, RouteContext, RouteOutcome};
use crate::models::{MetricsSnapshot, Page, SubscriptionScope, Trade};

pub const DEFAULT_PENDING_CAPACITY: usize = 500;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub page_size: usize,
    pub dedup_capacity: usize,
    pub pending_capacity: usize,
    pub batch_interval: Duration,
    pub newest_edge_threshold_px: f64,
    pub load_more_threshold_px: f64,
    pub default_currency: String,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self::from_config(&FeedConfig::default())
    }
}

impl ReconcilerSettings {
    pub fn from_config(config: &FeedConfig) -> Self {
        Self {
            page_size: config.page_size,
            dedup_capacity: config.dedup_capacity,
            pending_capacity: config.pending_capacity,
            batch_interval: config.batch_interval(),
            newest_edge_threshold_px: config.newest_edge_threshold_px,
            load_more_threshold_px: config.load_more_threshold_px,
            default_currency: config.default_currency.clone(),
        }
    }
}

/// Scroll geometry reported by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportMetrics {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl ViewportMetrics {
    pub fn at_newest_edge(&self, threshold_px: f64) -> bool {
        self.scroll_top < threshold_px
    }

    pub fn near_end(&self, threshold_px: f64) -> bool {
        self.scroll_top + self.client_height >= self.scroll_height - threshold_px
    }
}

/// Live trades held back while the viewport is away from the newest edge.
/// Newest first; overflow drops from the tail.
#[derive(Debug)]
pub struct PendingBuffer {
    trades: VecDeque<Trade>,
    capacity: usize,
}

impl PendingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            trades: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, trade: Trade) {
        self.trades.push_front(trade);
        self.trades.truncate(self.capacity);
    }

    /// Take everything, newest first.
    pub fn drain(&mut self) -> Vec<Trade> {
        self.trades.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.trades.clear();
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trade> {
        self.trades.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushOutcome {
    pub flushed: usize,
    /// Presentation should scroll back to the newest item
    pub scroll_to_top: bool,
}

/// Dispatch-time view over the reconciler's mutable parts.
struct LiveSink<'a> {
    dedup: &'a mut TxDeduplicator,
    batcher: &'a mut MetricsBatcher,
    pages: &'a mut PageSequence,
    pending: &'a mut PendingBuffer,
    at_newest_edge: bool,
}

impl MessageHandlers for LiveSink<'_> {
    fn is_duplicate_tx(&mut self, tx_hash: &str) -> bool {
        self.dedup.is_duplicate(tx_hash)
    }

    fn on_transaction(&mut self, trade: Trade) {
        if self.at_newest_edge {
            if let Some(first) = self.pages.first_page_mut() {
                first.trades.insert(0, trade);
                return;
            }
            debug!(tx_hash = %trade.tx_hash, "no history page yet; holding live trade");
        }
        self.pending.push(trade);
    }

    fn on_metrics(&mut self, update: MetricsSnapshot) {
        self.batcher.batch_update(update);
    }
}

pub struct FeedReconciler {
    settings: ReconcilerSettings,
    context: RouteContext,
    dedup: TxDeduplicator,
    batcher: MetricsBatcher,
    pages: PageSequence,
    pending: PendingBuffer,
    at_newest_edge: bool,
}

impl FeedReconciler {
    /// Batched metric emissions go to `metrics_tx`.
    pub fn new(settings: ReconcilerSettings, metrics_tx: mpsc::UnboundedSender<MetricsSnapshot>) -> Self {
        Self {
            context: RouteContext {
                scope: None,
                fallback_currency: settings.default_currency.clone(),
                fallback_currency_logo: None,
            },
            dedup: TxDeduplicator::new(settings.dedup_capacity),
            batcher: MetricsBatcher::with_sender(settings.batch_interval, metrics_tx),
            pages: PageSequence::new(settings.page_size),
            pending: PendingBuffer::new(settings.pending_capacity),
            at_newest_edge: true,
            settings,
        }
    }

    /// Switch to a new token and live scope, restarting clean. History is
    /// keyed on `token` alone, so a token without a pool (no live scope) still
    /// pages. Returns the page generation that fetches must carry.
    pub fn set_scope(
        &mut self,
        token: Option<String>,
        scope: Option<SubscriptionScope>,
        pool_filter: Vec<String>,
        fallback_currency: Option<String>,
        fallback_currency_logo: Option<String>,
    ) -> u64 {
        self.pending.clear();
        self.at_newest_edge = true;
        self.dedup.clear();
        self.batcher.reset();

        self.context.scope = scope;
        self.context.fallback_currency =
            fallback_currency.unwrap_or_else(|| self.settings.default_currency.clone());
        self.context.fallback_currency_logo = fallback_currency_logo;

        self.pages.restart(token, pool_filter)
    }

    pub fn scope(&self) -> Option<&SubscriptionScope> {
        self.context.scope.as_ref()
    }

    pub fn context(&self) -> &RouteContext {
        &self.context
    }

    /// Dispatch boundary for raw frames: parse failures are logged and
    /// swallowed.
    pub fn ingest_text(&mut self, text: &str) -> RouteOutcome {
        match serde_json::from_str::<Value>(text) {
            Ok(message) => self.ingest(&message),
            Err(e) => {
                warn!(error = %e, "Failed to parse feed message");
                RouteOutcome::Dropped(DropReason::Malformed)
            }
        }
    }

    pub fn ingest(&mut self, message: &Value) -> RouteOutcome {
        let mut sink = LiveSink {
            dedup: &mut self.dedup,
            batcher: &mut self.batcher,
            pages: &mut self.pages,
            pending: &mut self.pending,
            at_newest_edge: self.at_newest_edge,
        };

        match router::route(message, &self.context, &mut sink) {
            Ok(RouteOutcome::Dropped(reason)) => {
                debug!(?reason, "feed message dropped");
                RouteOutcome::Dropped(reason)
            }
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Failed to process feed message");
                RouteOutcome::Dropped(DropReason::Malformed)
            }
        }
    }

    pub fn is_at_newest_edge(&self) -> bool {
        self.at_newest_edge
    }

    /// Update the newest-edge flag. Returning to the edge flushes pending.
    pub fn set_at_newest_edge(&mut self, at_edge: bool) -> FlushOutcome {
        let was = self.at_newest_edge;
        self.at_newest_edge = at_edge;
        if at_edge && !was {
            return self.flush_pending(false);
        }
        FlushOutcome::default()
    }

    /// Apply scroll geometry: updates the newest-edge flag and, when close to
    /// the end of the list, hands back the next page to fetch.
    pub fn on_viewport(&mut self, viewport: ViewportMetrics) -> Option<PageRequest> {
        self.set_at_newest_edge(viewport.at_newest_edge(self.settings.newest_edge_threshold_px));
        if viewport.near_end(self.settings.load_more_threshold_px) {
            return self.pages.next_request();
        }
        None
    }

    /// Merge the whole pending buffer ahead of the first page in one step.
    /// With `scroll_to_top` the viewport is treated as back at the edge.
    pub fn flush_pending(&mut self, scroll_to_top: bool) -> FlushOutcome {
        if scroll_to_top {
            self.at_newest_edge = true;
        }
        let Some(first) = self.pages.first_page_mut() else {
            // Nothing to splice into yet; held until the first page lands
            return FlushOutcome {
                flushed: 0,
                scroll_to_top,
            };
        };

        let mut merged = self.pending.drain();
        let flushed = merged.len();
        if flushed > 0 {
            merged.append(&mut first.trades);
            first.trades = merged;
            debug!(flushed, "pending trades merged into feed");
        }
        FlushOutcome {
            flushed,
            scroll_to_top,
        }
    }

    /// Next page if none is in flight and more may exist.
    pub fn request_next_page(&mut self) -> Option<PageRequest> {
        self.pages.next_request()
    }

    /// Apply a completed history fetch. Stale generations are discarded.
    pub fn apply_page(&mut self, generation: u64, result: Result<Page, FetchError>) -> ApplyOutcome {
        let outcome = self.pages.apply(generation, result);
        if outcome == ApplyOutcome::Applied && self.at_newest_edge && !self.pending.is_empty() {
            self.flush_pending(false);
        }
        outcome
    }

    pub fn generation(&self) -> u64 {
        self.pages.generation()
    }

    pub fn has_more(&self) -> bool {
        self.pages.has_more()
    }

    pub fn is_fetching(&self) -> bool {
        self.pages.is_fetching()
    }

    pub fn last_error(&self) -> Option<&FetchError> {
        self.pages.last_error()
    }

    pub fn pages(&self) -> &[Page] {
        self.pages.pages()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Trade> {
        self.pending.iter()
    }

    /// The list the presentation layer renders: pages in fetch order, first
    /// occurrence of each `tx_hash` kept.
    pub fn materialized(&self) -> Vec<Trade> {
        let total: usize = self.pages.pages().iter().map(|p| p.trades.len()).sum();
        let mut seen: HashSet<&str> = HashSet::with_capacity(total);
        let mut out = Vec::with_capacity(total);

        for trade in self.pages.pages().iter().flat_map(|p| p.trades.iter()) {
            if seen.insert(trade.tx_hash.as_str()) {
                out.push(trade.clone());
            }
        }
        out
    }

    pub fn metrics_deadline(&self) -> Option<Instant> {
        self.batcher.deadline()
    }

    /// Emit batched metrics if their window has closed.
    pub fn poll_metrics(&mut self, now: Instant) -> bool {
        self.batcher.poll_at(now)
    }

    /// Unmount: force out anything the batcher still holds.
    pub fn teardown(&mut self) -> bool {
        self.batcher.shutdown()
    }
}
