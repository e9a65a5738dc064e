//! Stream module - real-time feed ingestion
//!
//! A reconnecting WebSocket client with heartbeat, normalizing trade
//! notifications for one asset and one wallet set.

pub mod client;
pub mod heartbeat;
pub mod normalize;
pub mod reconnect;

pub use client::{StreamClient, StreamConfig, StreamEvent, StreamSubscription, SubscriptionMessage};
pub use heartbeat::Heartbeat;
pub use normalize::{NormalizedTransaction, PriceChange, PriceTracker, TransactionKind};
pub use reconnect::ReconnectPolicy;
