//! Typed session event bus
//!
//! Every event is published on two topics: the asset it concerns and the
//! session that produced it. Subscribers pick either, so handlers for one
//! session never see another session's traffic unless they ask for the
//! whole asset.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::classifier::Strategy;
use crate::executor::{ExecutionRecord, ExecutionSummary};
use crate::planner::RuleViolation;
use crate::risk::TriggerKind;

use super::types::SessionStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StatusUpdate {
        session_id: String,
        asset_id: String,
        status: SessionStatus,
        strategy: Strategy,
        executed_volume: f64,
        target_volume: f64,
        trade_count: u64,
        pnl_sol: f64,
        summary: Option<ExecutionSummary>,
        timestamp: DateTime<Utc>,
    },
    TradeExecuted {
        session_id: String,
        asset_id: String,
        record: ExecutionRecord,
    },
    SessionStarted {
        session_id: String,
        asset_id: String,
        user_id: String,
        target_volume: f64,
        timestamp: DateTime<Utc>,
    },
    SessionStopped {
        session_id: String,
        asset_id: String,
        status: SessionStatus,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    EmergencyStop {
        session_id: String,
        asset_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    RuleTriggered {
        session_id: String,
        asset_id: String,
        trigger: TriggerKind,
        price: f64,
        profit_pct: f64,
        sell_fraction: f64,
        timestamp: DateTime<Utc>,
    },
    Error {
        session_id: String,
        asset_id: String,
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        violations: Vec<RuleViolation>,
        timestamp: DateTime<Utc>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::StatusUpdate { session_id, .. }
            | SessionEvent::TradeExecuted { session_id, .. }
            | SessionEvent::SessionStarted { session_id, .. }
            | SessionEvent::SessionStopped { session_id, .. }
            | SessionEvent::EmergencyStop { session_id, .. }
            | SessionEvent::RuleTriggered { session_id, .. }
            | SessionEvent::Error { session_id, .. } => session_id,
        }
    }

    pub fn asset_id(&self) -> &str {
        match self {
            SessionEvent::StatusUpdate { asset_id, .. }
            | SessionEvent::TradeExecuted { asset_id, .. }
            | SessionEvent::SessionStarted { asset_id, .. }
            | SessionEvent::SessionStopped { asset_id, .. }
            | SessionEvent::EmergencyStop { asset_id, .. }
            | SessionEvent::RuleTriggered { asset_id, .. }
            | SessionEvent::Error { asset_id, .. } => asset_id,
        }
    }

    /// Event name as serialized in the `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::StatusUpdate { .. } => "status_update",
            SessionEvent::TradeExecuted { .. } => "trade_executed",
            SessionEvent::SessionStarted { .. } => "session_started",
            SessionEvent::SessionStopped { .. } => "session_stopped",
            SessionEvent::EmergencyStop { .. } => "emergency_stop",
            SessionEvent::RuleTriggered { .. } => "rule_triggered",
            SessionEvent::Error { .. } => "error",
        }
    }

    pub fn error(session_id: &str, asset_id: &str, message: impl Into<String>) -> Self {
        SessionEvent::Error {
            session_id: session_id.to_string(),
            asset_id: asset_id.to_string(),
            message: message.into(),
            violations: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Topic {
    Asset(String),
    Session(String),
}

/// Broadcast channels keyed by asset and by session
pub struct EventBus {
    topics: DashMap<Topic, broadcast::Sender<SessionEvent>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: Topic) -> broadcast::Sender<SessionEvent> {
        self.topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// All events for an asset
    pub fn subscribe(&self, asset_id: &str) -> broadcast::Receiver<SessionEvent> {
        self.sender(Topic::Asset(asset_id.to_string())).subscribe()
    }

    /// Events of one session only
    pub fn subscribe_session(&self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        self.sender(Topic::Session(session_id.to_string())).subscribe()
    }

    /// Returns the number of receivers reached
    pub fn publish(&self, event: SessionEvent) -> usize {
        let mut delivered = 0;
        for topic in [
            Topic::Asset(event.asset_id().to_string()),
            Topic::Session(event.session_id().to_string()),
        ] {
            if let Some(tx) = self.topics.get(&topic) {
                delivered += tx.send(event.clone()).unwrap_or(0);
            }
        }
        trace!(kind = event.kind(), session_id = %event.session_id(), delivered, "Event published");
        delivered
    }

    /// Drop a finished session's topic
    pub fn close_session(&self, session_id: &str) {
        self.topics.remove(&Topic::Session(session_id.to_string()));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
