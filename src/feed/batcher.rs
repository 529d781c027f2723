//! Metrics update batching
//!
//! Price ticks can arrive faster than a frame. Updates are merged into one
//! accumulator and emitted at most once per window, trailing edge only: the
//! first update of a quiet period arms the window, nothing is emitted until
//! it closes, and the emission carries everything merged in between.

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::models::MetricsSnapshot;

pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(100);

/// One-shot deadline with explicit start/cancel. Starting an armed timer is a
/// no-op, so a burst never pushes the deadline out.
#[derive(Debug, Clone)]
pub struct FlushTimer {
    interval: Duration,
    deadline: Option<Instant>,
}

impl FlushTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    /// Arm the timer at `now + interval` unless already armed.
    /// Returns true if this call armed it.
    pub fn start(&mut self, now: Instant) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(now + self.interval);
        true
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Disarm and return true if the deadline has passed.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Coalesces partial metric snapshots into periodic emissions on `metrics_tx`.
#[derive(Debug)]
pub struct MetricsBatcher {
    pending: Option<MetricsSnapshot>,
    timer: FlushTimer,
    metrics_tx: mpsc::UnboundedSender<MetricsSnapshot>,
}

impl MetricsBatcher {
    /// Create a batcher and the receiver its emissions arrive on.
    pub fn new(interval: Duration) -> (Self, mpsc::UnboundedReceiver<MetricsSnapshot>) {
        let (metrics_tx, metrics_rx) = mpsc::unbounded_channel();
        (Self::with_sender(interval, metrics_tx), metrics_rx)
    }

    pub fn with_sender(interval: Duration, metrics_tx: mpsc::UnboundedSender<MetricsSnapshot>) -> Self {
        Self {
            pending: None,
            timer: FlushTimer::new(interval),
            metrics_tx,
        }
    }

    pub fn batch_update(&mut self, partial: MetricsSnapshot) {
        self.batch_update_at(partial, Instant::now());
    }

    /// Merge `partial` into the accumulator and arm the window if idle.
    pub fn batch_update_at(&mut self, partial: MetricsSnapshot, now: Instant) {
        match self.pending.as_mut() {
            Some(acc) => acc.merge(partial),
            None => self.pending = Some(partial),
        }
        self.timer.start(now);
    }

    /// Emit now if the window has closed. Returns true if something was sent.
    pub fn poll_at(&mut self, now: Instant) -> bool {
        if self.timer.fire_if_due(now) {
            return self.flush();
        }
        false
    }

    /// Emit and clear the accumulator immediately if non-empty.
    pub fn flush(&mut self) -> bool {
        self.timer.cancel();
        match self.pending.take() {
            Some(snapshot) if !snapshot.is_empty() => {
                if self.metrics_tx.send(snapshot).is_err() {
                    debug!("metrics receiver dropped; discarding batch");
                    return false;
                }
                true
            }
            _ => false,
        }
    }

    /// Suppress the scheduled emission without emitting. The accumulator is
    /// kept and goes out with the next window or an explicit flush.
    pub fn cancel(&mut self) {
        self.timer.cancel();
    }

    /// Drop the accumulator and the scheduled emission. Used on scope change.
    pub fn reset(&mut self) {
        self.pending = None;
        self.timer.cancel();
    }

    /// Teardown: nothing accumulated is lost.
    pub fn shutdown(&mut self) -> bool {
        self.timer.cancel();
        self.flush()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}
