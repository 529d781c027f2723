//! Push transport
//!
//! One WebSocket to the rooms endpoint. Inbound text frames are forwarded to
//! the session untouched; outbound control frames (subscribe/unsubscribe)
//! arrive on a channel. The connection is retried at a fixed interval up to
//! a ceiling of consecutive failures, after which the transport gives up and
//! the session degrades to history-only.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::FeedConfig;
use crate::feed::session::TransportEvent;
use crate::feed::subscriptions::ControlMessage;

const PING_INTERVAL: Duration = Duration::from_secs(30);

enum StreamEnd {
    /// Server closed or the socket dropped
    Disconnected,
    /// Session went away; stop for good
    Shutdown,
}

pub struct FeedWebSocketClient {
    url: String,
    api_key: Option<String>,
    max_attempts: u32,
    retry_interval: Duration,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl FeedWebSocketClient {
    /// Returns the client and the receiver its events arrive on.
    pub fn new(config: &FeedConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let client = Self {
            url: config.ws_url.clone(),
            api_key: config.api_key.clone(),
            max_attempts: config.reconnect_attempts.max(1),
            retry_interval: config.reconnect_interval(),
            event_tx,
        };
        (client, event_rx)
    }

    fn emit(&self, event: TransportEvent) -> bool {
        self.event_tx.send(event).is_ok()
    }

    /// Connect and keep reconnecting until the ceiling is hit or the control
    /// channel closes.
    pub async fn run(&self, mut control_rx: mpsc::UnboundedReceiver<ControlMessage>) {
        let mut failures = 0u32;

        loop {
            // Anything queued while down was meant for the old connection
            while control_rx.try_recv().is_ok() {}

            if !self.emit(TransportEvent::Connecting) {
                return;
            }

            match self.connect_and_stream(&mut control_rx).await {
                Ok(StreamEnd::Shutdown) => {
                    debug!("control channel closed; transport stopping");
                    return;
                }
                Ok(StreamEnd::Disconnected) => {
                    failures = 0;
                    warn!("feed socket disconnected; reconnecting in {:?}", self.retry_interval);
                    if !self.emit(TransportEvent::Closed) {
                        return;
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        error = %e,
                        attempt = failures,
                        max_attempts = self.max_attempts,
                        "feed socket connect failed"
                    );
                    if failures >= self.max_attempts {
                        error!(attempts = failures, "feed socket reconnect ceiling reached; giving up");
                        self.emit(TransportEvent::GaveUp);
                        return;
                    }
                }
            }

            sleep(self.retry_interval).await;
        }
    }

    async fn connect_and_stream(
        &self,
        control_rx: &mut mpsc::UnboundedReceiver<ControlMessage>,
    ) -> Result<StreamEnd> {
        info!(url = %self.url, "🔌 Connecting to feed socket");

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .context("Failed to build websocket request")?;
        if let Some(key) = self.api_key.as_deref() {
            if let Ok(hv) = key.parse() {
                request.headers_mut().insert("x-api-key", hv);
            }
        }

        let (ws_stream, response) = connect_async(request)
            .await
            .context("Failed to connect to feed socket")?;
        info!("✅ Feed socket connected (status: {})", response.status());

        if !self.emit(TransportEvent::Open) {
            return Ok(StreamEnd::Shutdown);
        }

        let (mut write, mut read) = ws_stream.split();
        let mut ping = interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping.tick().await;

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        return Ok(StreamEnd::Disconnected);
                    }
                }
                cmd = control_rx.recv() => {
                    let Some(msg) = cmd else {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(StreamEnd::Shutdown);
                    };
                    match msg.to_json() {
                        Ok(text) => {
                            debug!(action = ?msg.action, channels = ?msg.channels, "sending control frame");
                            if let Err(e) = write.send(Message::Text(text)).await {
                                warn!(error = %e, "Failed to send control frame");
                                return Ok(StreamEnd::Disconnected);
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to encode control frame"),
                    }
                }
                frame = read.next() => {
                    let Some(frame) = frame else {
                        return Ok(StreamEnd::Disconnected);
                    };
                    match frame {
                        Ok(Message::Text(text)) => {
                            if !self.emit(TransportEvent::Message(text)) {
                                return Ok(StreamEnd::Shutdown);
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "feed socket close");
                            return Ok(StreamEnd::Disconnected);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "feed socket read error");
                            return Ok(StreamEnd::Disconnected);
                        }
                    }
                }
            }
        }
    }
}
