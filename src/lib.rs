//! Pump.fun Volume Engine Library
//!
//! Multi-wallet volume sessions for pump.fun tokens: market classification,
//! randomized allocation, venue execution and live take-profit/stop-loss
//! monitoring over the trade feed.

pub mod classifier;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod planner;
pub mod risk;
pub mod session;
pub mod stream;
pub mod venue;
pub mod wallet;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use session::{SessionManager, StartSessionRequest};
