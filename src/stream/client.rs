//! Real-time feed client
//!
//! One long-lived WebSocket connection per session, subscribed to trades on
//! the session asset and on the session wallets. Reconnects with capped
//! exponential backoff and tears the connection down when the heartbeat
//! sees no liveness.
//!
//! WebSocket endpoint: wss://pumpportal.fun/api/data
//! Documentation: https://pumpportal.fun/data-api/real-time

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

use super::heartbeat::Heartbeat;
use super::normalize::{normalize_trade, FeedTrade, NormalizedTransaction, PriceChange, PriceTracker};
use super::reconnect::ReconnectPolicy;

/// PumpPortal WebSocket URL
pub const PUMPPORTAL_WS_URL: &str = "wss://pumpportal.fun/api/data";

/// Subscription methods
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionMessage {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
}

impl SubscriptionMessage {
    /// Subscribe to trades on specific tokens
    pub fn subscribe_token_trades(mints: Vec<String>) -> Self {
        Self {
            method: "subscribeTokenTrade".to_string(),
            keys: Some(mints),
        }
    }

    /// Subscribe to trades by specific accounts (wallets)
    pub fn subscribe_account_trades(wallets: Vec<String>) -> Self {
        Self {
            method: "subscribeAccountTrade".to_string(),
            keys: Some(wallets),
        }
    }

    /// Unsubscribe from token trades
    pub fn unsubscribe_token_trades(mints: Vec<String>) -> Self {
        Self {
            method: "unsubscribeTokenTrade".to_string(),
            keys: Some(mints),
        }
    }

    /// Unsubscribe from account trades
    pub fn unsubscribe_account_trades(wallets: Vec<String>) -> Self {
        Self {
            method: "unsubscribeAccountTrade".to_string(),
            keys: Some(wallets),
        }
    }
}

/// Event delivered to subscribers
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Connected,
    Disconnected { reason: String },
    Transaction(NormalizedTransaction),
    PriceChange(PriceChange),
    /// Reconnect attempts exhausted; the client has stopped
    Error(String),
}

/// Feed client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub ws_url: String,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_multiplier: f64,
    /// 0 = infinite
    pub max_reconnect_attempts: u32,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub event_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_url: PUMPPORTAL_WS_URL.to_string(),
            reconnect_initial_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            reconnect_multiplier: 2.0,
            max_reconnect_attempts: 10,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            event_buffer: 1024,
        }
    }
}

impl StreamConfig {
    fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_initial_delay_ms),
            Duration::from_millis(self.reconnect_max_delay_ms),
            self.reconnect_multiplier,
            self.max_reconnect_attempts,
        )
    }
}

/// What one client watches
#[derive(Debug, Clone)]
pub struct StreamSubscription {
    pub asset_id: String,
    /// Own wallet addresses
    pub wallets: Vec<String>,
}

/// Reconnecting feed client
pub struct StreamClient {
    config: StreamConfig,
    subscription: StreamSubscription,
    own_wallets: HashSet<String>,
    event_tx: broadcast::Sender<StreamEvent>,
    cancel: CancellationToken,
    price_tracker: Mutex<PriceTracker>,
}

impl StreamClient {
    pub fn new(config: StreamConfig, subscription: StreamSubscription) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_buffer.max(16));
        let own_wallets = subscription.wallets.iter().cloned().collect();

        Self {
            config,
            subscription,
            own_wallets,
            event_tx,
            cancel: CancellationToken::new(),
            price_tracker: Mutex::new(PriceTracker::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.event_tx.subscribe()
    }

    pub fn asset_id(&self) -> &str {
        &self.subscription.asset_id
    }

    /// Spawn the connection loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        info!(
            asset = %self.subscription.asset_id,
            wallets = self.subscription.wallets.len(),
            url = %self.config.ws_url,
            "Starting feed client"
        );
        let client = Arc::clone(self);
        tokio::spawn(async move { client.run().await })
    }

    /// Stop the connection loop; unsubscribes if connected
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn emit(&self, event: StreamEvent) {
        // No receivers is fine
        let _ = self.event_tx.send(event);
    }

    async fn run(&self) {
        let mut policy = self.config.reconnect_policy();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.connect_and_stream(&mut policy).await {
                Ok(()) => {
                    info!(asset = %self.subscription.asset_id, "Feed client stopped");
                    break;
                }
                Err(e) => {
                    warn!(asset = %self.subscription.asset_id, error = %e, "Feed connection lost");
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }

            match policy.next_delay() {
                Some(delay) => {
                    warn!(
                        attempt = policy.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
                None => {
                    error!(
                        attempts = policy.attempts(),
                        "Max reconnect attempts reached"
                    );
                    self.emit(StreamEvent::Error(format!(
                        "Max reconnect attempts ({}) reached",
                        policy.attempts()
                    )));
                    self.cancel.cancel();
                    break;
                }
            }
        }
    }

    /// Returns Ok only when stopped through cancellation
    async fn connect_and_stream(&self, policy: &mut ReconnectPolicy) -> Result<()> {
        let url = url::Url::parse(&self.config.ws_url)
            .map_err(|e| Error::Config(format!("Invalid WebSocket URL: {}", e)))?;

        let connect = tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            connect_async(url),
        );

        let ws_stream = tokio::select! {
            result = connect => match result {
                Ok(Ok((stream, _))) => stream,
                Ok(Err(e)) => {
                    return Err(Error::StreamConnection(format!("WebSocket connect failed: {}", e)))
                }
                Err(_) => return Err(Error::StreamConnection("WebSocket connect timed out".to_string())),
            },
            _ = self.cancel.cancelled() => return Ok(()),
        };

        policy.reset();
        info!(asset = %self.subscription.asset_id, "Connected to feed");
        self.emit(StreamEvent::Connected);

        let (mut write, mut read) = ws_stream.split();

        for msg in self.subscribe_messages() {
            let json = serde_json::to_string(&msg)?;
            write
                .send(Message::Text(json))
                .await
                .map_err(|e| Error::StreamConnection(format!("Failed to subscribe: {}", e)))?;
        }
        debug!(asset = %self.subscription.asset_id, "Subscriptions sent");

        let mut heartbeat = Heartbeat::new(
            Duration::from_millis(self.config.ping_interval_ms),
            Duration::from_millis(self.config.pong_timeout_ms),
        );
        heartbeat.reset();
        let mut check_timer = tokio::time::interval(heartbeat.check_period());

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    for msg in self.unsubscribe_messages() {
                        if let Ok(json) = serde_json::to_string(&msg) {
                            let _ = write.send(Message::Text(json)).await;
                        }
                    }
                    let _ = write.send(Message::Close(None)).await;
                    break Ok(());
                }

                _ = check_timer.tick() => {
                    if heartbeat.is_timed_out() {
                        warn!(timeout_ms = heartbeat.timeout_ms(), "Heartbeat timed out, forcing reconnect");
                        break Err(Error::HeartbeatTimeout(heartbeat.timeout_ms()));
                    }
                    if heartbeat.should_ping() {
                        if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                            break Err(Error::StreamConnection(format!("Failed to send ping: {}", e)));
                        }
                        heartbeat.record_ping();
                        debug!("Sent ping");
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Close(_))) => {
                            info!("WebSocket closed by server");
                            break Err(Error::StreamDisconnected);
                        }
                        Some(Ok(Message::Text(text))) => {
                            heartbeat.record_activity();
                            self.handle_message(&text);
                        }
                        Some(Ok(_)) => heartbeat.record_activity(),
                        Some(Err(e)) => {
                            break Err(Error::StreamConnection(format!("WebSocket error: {}", e)));
                        }
                        None => break Err(Error::StreamDisconnected),
                    }
                }
            }
        };

        if let Err(e) = &result {
            self.emit(StreamEvent::Disconnected {
                reason: e.to_string(),
            });
        }
        result
    }

    fn subscribe_messages(&self) -> Vec<SubscriptionMessage> {
        let mut messages = vec![SubscriptionMessage::subscribe_token_trades(vec![
            self.subscription.asset_id.clone(),
        ])];
        if !self.subscription.wallets.is_empty() {
            messages.push(SubscriptionMessage::subscribe_account_trades(
                self.subscription.wallets.clone(),
            ));
        }
        messages
    }

    fn unsubscribe_messages(&self) -> Vec<SubscriptionMessage> {
        let mut messages = vec![SubscriptionMessage::unsubscribe_token_trades(vec![
            self.subscription.asset_id.clone(),
        ])];
        if !self.subscription.wallets.is_empty() {
            messages.push(SubscriptionMessage::unsubscribe_account_trades(
                self.subscription.wallets.clone(),
            ));
        }
        messages
    }

    /// Parse a text frame; acknowledgements and foreign assets are ignored
    fn handle_message(&self, text: &str) {
        let trade = match serde_json::from_str::<FeedTrade>(text) {
            Ok(trade) => trade,
            Err(_) => {
                debug!("Non-trade message: {}", preview(text, 100));
                return;
            }
        };

        let tx = normalize_trade(&trade, &self.own_wallets);
        if tx.asset_id != self.subscription.asset_id {
            return;
        }

        let change = tx.implied_price.and_then(|price| {
            self.price_tracker
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .observe(&tx.asset_id, price)
        });

        self.emit(StreamEvent::Transaction(tx));
        if let Some(change) = change {
            self.emit(StreamEvent::PriceChange(change));
        }
    }
}

/// At most `max` bytes of `text`, cut on a char boundary
fn preview(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let end = text
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|i| *i <= max)
        .last()
        .unwrap_or(0);
    &text[..end]
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
