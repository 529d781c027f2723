//! Live feed core
//!
//! Synchronous state machines (dedup, batcher, router, subscriptions,
//! history pagination, reconciler) plus the async session that drives them.

pub mod batcher;
pub mod dedup;
pub mod history;
pub mod reconciler;
pub mod router;
pub mod session;
pub mod subscriptions;

pub use history::{FetchError, HistoryFetcher, HistoryQuery};
pub use reconciler::{FeedReconciler, ViewportMetrics};
pub use session::{FeedHandle, FeedSession, FeedSnapshot, SessionCommand, TransportEvent};
