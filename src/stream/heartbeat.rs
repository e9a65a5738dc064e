//! Application-level heartbeat
//!
//! Pings on a fixed interval while the feed is quiet. Any inbound frame
//! counts as liveness; if nothing arrives within the timeout after a ping,
//! the connection is considered dead and is torn down for reconnect.

use tokio::time::{Duration, Instant};
use tracing::debug;

/// Heartbeat state for one connection
#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    last_ping: Option<Instant>,
    last_seen: Instant,
    waiting_for_pong: bool,
}

impl Heartbeat {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            last_ping: None,
            last_seen: Instant::now(),
            waiting_for_pong: false,
        }
    }

    /// Reset on (re)connect
    pub fn reset(&mut self) {
        self.last_ping = None;
        self.last_seen = Instant::now();
        self.waiting_for_pong = false;
    }

    pub fn record_ping(&mut self) {
        self.last_ping = Some(Instant::now());
        self.waiting_for_pong = true;
    }

    /// Any inbound frame
    pub fn record_activity(&mut self) {
        let now = Instant::now();
        if self.waiting_for_pong {
            if let Some(ping) = self.last_ping {
                debug!(rtt_ms = (now - ping).as_millis() as u64, "Liveness confirmed");
            }
        }
        self.last_seen = now;
        self.waiting_for_pong = false;
    }

    /// No liveness since the outstanding ping, past the timeout
    pub fn is_timed_out(&self) -> bool {
        match (self.waiting_for_pong, self.last_ping) {
            (true, Some(ping)) => ping.elapsed() > self.timeout,
            _ => false,
        }
    }

    /// Quiet for a full interval and no ping outstanding
    pub fn should_ping(&self) -> bool {
        !self.waiting_for_pong && self.last_seen.elapsed() >= self.interval
    }

    /// How often to evaluate `should_ping` / `is_timed_out`
    pub fn check_period(&self) -> Duration {
        let half = self.interval.min(self.timeout) / 2;
        half.max(Duration::from_millis(10))
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}
