//! Channel subscription bookkeeping
//!
//! Tracks the channels the client *intends* to be subscribed to,
//! independently of whether the transport is up. The transport forgets
//! subscriptions across reconnects, so every (re)open resends the whole
//! intended set.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::models::SubscriptionScope;

pub fn pool_metrics_channel(pool: &str) -> String {
    format!("pool:metrics:{}", pool)
}

pub fn token_feed_channel(token: &str) -> String {
    format!("token:transactions:feed:{}", token)
}

/// Channels backing one scope: pool metrics + token transaction feed.
pub fn scope_channels(scope: &SubscriptionScope) -> Vec<String> {
    vec![pool_metrics_channel(&scope.pool), token_feed_channel(&scope.token)]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMetadata {
    #[serde(rename = "initiatedAt")]
    pub initiated_at: i64,
}

/// Outbound control frame: `{type, channels, accessToken, _metadata}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub action: ControlAction,
    pub channels: Vec<String>,
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "_metadata")]
    pub metadata: ControlMetadata,
}

impl ControlMessage {
    pub fn new(action: ControlAction, channels: Vec<String>) -> Self {
        Self {
            action,
            channels,
            access_token: String::new(),
            metadata: ControlMetadata {
                initiated_at: chrono::Utc::now().timestamp_millis(),
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Intended channel set plus the transport state it is reconciled against.
///
/// Every method returns the control frame to send right now, if any; the
/// caller owns the actual socket.
#[derive(Debug)]
pub struct SubscriptionManager {
    intended: BTreeSet<String>,
    state: ConnectionState,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            intended: BTreeSet::new(),
            state: ConnectionState::Closed,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn intended(&self) -> impl Iterator<Item = &String> {
        self.intended.iter()
    }

    pub fn is_intended(&self, channel: &str) -> bool {
        self.intended.contains(channel)
    }

    /// Add the scope's channels. Sends immediately only when open; otherwise
    /// the next open resyncs them.
    pub fn activate(&mut self, scope: &SubscriptionScope) -> Option<ControlMessage> {
        let channels = scope_channels(scope);
        for ch in &channels {
            self.intended.insert(ch.clone());
        }
        if !self.is_open() {
            debug!(?channels, "transport not open; subscribe deferred to resync");
            return None;
        }
        Some(ControlMessage::new(ControlAction::Subscribe, channels))
    }

    /// Remove the scope's channels and unsubscribe if open.
    pub fn deactivate(&mut self, scope: &SubscriptionScope) -> Option<ControlMessage> {
        let channels = scope_channels(scope);
        for ch in &channels {
            self.intended.remove(ch);
        }
        if !self.is_open() {
            return None;
        }
        Some(ControlMessage::new(ControlAction::Unsubscribe, channels))
    }

    pub fn on_connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// Transport opened (first time or after reconnect): resubscribe to the
    /// full intended set.
    pub fn on_open(&mut self) -> Option<ControlMessage> {
        self.state = ConnectionState::Open;
        if self.intended.is_empty() {
            return None;
        }
        Some(ControlMessage::new(
            ControlAction::Subscribe,
            self.intended.iter().cloned().collect(),
        ))
    }

    pub fn on_closed(&mut self) {
        self.state = ConnectionState::Closed;
    }
}
