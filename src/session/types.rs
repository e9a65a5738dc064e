//! Session records and per-session settings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::classifier::{ClassifierConfig, Platform, Strategy};
use crate::error::{Error, Result};
use crate::executor::ExecutionSummary;
use crate::planner::{PlanRules, RandomizationConfig, RotationMode};
use crate::risk::RiskSettings;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Paused,
    Stopped,
    Completed,
    EmergencyStopped,
    Error,
}

impl SessionStatus {
    /// Terminal states are never left
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Stopped
                | SessionStatus::Completed
                | SessionStatus::EmergencyStopped
                | SessionStatus::Error
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, to) {
            (Pending, Running) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Pending | Running | Paused, Stopped | EmergencyStopped | Error) => true,
            (Running, Completed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Completed => "completed",
            SessionStatus::EmergencyStopped => "emergency_stopped",
            SessionStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for SessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(SessionStatus::Pending),
            "running" => Ok(SessionStatus::Running),
            "paused" => Ok(SessionStatus::Paused),
            "stopped" => Ok(SessionStatus::Stopped),
            "completed" => Ok(SessionStatus::Completed),
            "emergency_stopped" => Ok(SessionStatus::EmergencyStopped),
            "error" => Ok(SessionStatus::Error),
            other => Err(Error::Validation(format!("Unknown session status: {}", other))),
        }
    }
}

/// Per-session configuration, read-only during a cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Smallest cycle volume (SOL)
    pub min_volume_sol: f64,
    /// Base cycle volume before the strategy multiplier (SOL)
    pub base_volume_sol: f64,
    /// Per-cycle cap (SOL)
    pub max_volume_sol: f64,
    /// Session target when the caller gives none (SOL)
    pub target_volume_sol: f64,
    pub trade_interval_secs: u64,
    /// Share of buys in the generated flow
    pub buy_sell_ratio: f64,
    /// Maximum wallets in one plan
    pub wallet_count: usize,
    pub wallets_per_cycle: Option<usize>,
    pub rotation_mode: RotationMode,
    pub min_wallet_balance_sol: Option<f64>,
    /// Absolute cash PnL floor (SOL)
    pub min_profit_sol: Option<f64>,
    pub max_session_loss_pct: Option<f64>,
    pub max_price_drop_pct: Option<f64>,
    pub randomization: RandomizationConfig,
    pub risk: RiskSettings,
    pub platform: Platform,
    pub slippage_bps: u16,
    pub referrer: Option<String>,
    /// Fixed strategy; the classifier decides when unset
    pub strategy: Option<Strategy>,
    pub classifier: Option<ClassifierConfig>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            min_volume_sol: 0.01,
            base_volume_sol: 0.1,
            max_volume_sol: 0.5,
            target_volume_sol: 10.0,
            trade_interval_secs: 60,
            buy_sell_ratio: 0.5,
            wallet_count: 10,
            wallets_per_cycle: None,
            rotation_mode: RotationMode::All,
            min_wallet_balance_sol: Some(0.01),
            min_profit_sol: None,
            max_session_loss_pct: Some(50.0),
            max_price_drop_pct: None,
            randomization: RandomizationConfig::default(),
            risk: RiskSettings::default(),
            platform: Platform::Auto,
            slippage_bps: 1000,
            referrer: None,
            strategy: None,
            classifier: None,
        }
    }
}

impl SessionSettings {
    pub fn validate(&self) -> Result<()> {
        let volumes = [
            ("min_volume_sol", self.min_volume_sol),
            ("base_volume_sol", self.base_volume_sol),
            ("max_volume_sol", self.max_volume_sol),
            ("target_volume_sol", self.target_volume_sol),
        ];
        for (name, value) in volumes {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::Validation(format!("{} must be positive, got {}", name, value)));
            }
        }

        if self.min_volume_sol > self.max_volume_sol {
            return Err(Error::Validation(format!(
                "min_volume_sol ({}) exceeds max_volume_sol ({})",
                self.min_volume_sol, self.max_volume_sol
            )));
        }

        if self.trade_interval_secs == 0 {
            return Err(Error::Validation("trade_interval_secs must be at least 1".to_string()));
        }

        if !(0.0..=1.0).contains(&self.buy_sell_ratio) {
            return Err(Error::Validation(format!(
                "buy_sell_ratio must be within [0, 1], got {}",
                self.buy_sell_ratio
            )));
        }

        if self.wallet_count == 0 {
            return Err(Error::Validation("wallet_count must be at least 1".to_string()));
        }

        if self.wallets_per_cycle == Some(0) {
            return Err(Error::Validation("wallets_per_cycle must be at least 1".to_string()));
        }

        if self.slippage_bps > 10_000 {
            return Err(Error::Validation(format!(
                "slippage_bps must not exceed 10000, got {}",
                self.slippage_bps
            )));
        }

        crate::executor::fees::validate_referrer(self.referrer.as_deref())?;

        self.randomization.validate()?;
        self.risk.validate()
    }

    /// Rule snapshot for one cycle
    pub fn rules_for(&self, session: &Session) -> PlanRules {
        PlanRules {
            max_wallets: self.wallet_count,
            base_volume: self.base_volume_sol,
            max_volume: self.max_volume_sol,
            min_profit_sol: self.min_profit_sol,
            max_session_loss_pct: self.max_session_loss_pct,
            max_price_drop_pct: self.max_price_drop_pct,
            session_pnl_sol: session.pnl_sol,
            session_spent_sol: session.sol_spent,
            price_high: session.price_high,
            current_price: session.last_price,
        }
    }
}

/// One volume session for a (user, asset) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub asset_id: String,
    pub target_volume: f64,
    pub strategy: Strategy,
    pub status: SessionStatus,
    pub executed_volume: f64,
    pub trade_count: u64,
    pub failed_count: u64,
    pub skipped_count: u64,
    pub fee_count: u64,
    pub fees_paid: f64,
    pub sol_spent: f64,
    pub sol_received: f64,
    pub pnl_sol: f64,
    pub price_high: Option<f64>,
    pub price_low: Option<f64>,
    pub last_price: Option<f64>,
    pub cycle_count: u64,
    pub error_message: Option<String>,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(user_id: &str, asset_id: &str, target_volume: f64, strategy: Strategy) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            asset_id: asset_id.to_string(),
            target_volume,
            strategy,
            status: SessionStatus::Pending,
            executed_volume: 0.0,
            trade_count: 0,
            failed_count: 0,
            skipped_count: 0,
            fee_count: 0,
            fees_paid: 0.0,
            sol_spent: 0.0,
            sol_received: 0.0,
            pnl_sol: 0.0,
            price_high: None,
            price_low: None,
            last_price: None,
            cycle_count: 0,
            error_message: None,
            status_reason: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            ended_at: None,
        }
    }

    /// Move to `to`, rejecting transitions the lifecycle forbids
    pub fn transition(&mut self, to: SessionStatus, reason: Option<&str>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        self.status = to;
        self.updated_at = now;
        if let Some(reason) = reason {
            self.status_reason = Some(reason.to_string());
        }
        if to == SessionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.ended_at = Some(now);
        }
        Ok(())
    }

    /// Fold one batch into the running totals
    pub fn apply_summary(&mut self, summary: &ExecutionSummary) {
        self.executed_volume += summary.executed_volume();
        self.trade_count += summary.succeeded as u64;
        self.failed_count += summary.failed as u64;
        self.skipped_count += summary.skipped as u64;
        self.fee_count += summary.fee_count as u64;
        self.fees_paid += summary.fees_paid;
        self.sol_spent += summary.buy_volume;
        self.sol_received += summary.sell_volume;
        self.pnl_sol = self.sol_received - self.sol_spent - self.fees_paid;
        self.updated_at = Utc::now();
    }

    pub fn record_price(&mut self, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        self.last_price = Some(price);
        self.price_high = Some(self.price_high.map_or(price, |h| h.max(price)));
        self.price_low = Some(self.price_low.map_or(price, |l| l.min(price)));
    }

    pub fn target_reached(&self) -> bool {
        self.executed_volume + 1e-9 >= self.target_volume
    }

    pub fn remaining_volume(&self) -> f64 {
        (self.target_volume - self.executed_volume).max(0.0)
    }

    /// Cycle volume: the strategy-scaled base, shrunk to what is left of the
    /// target but never below the minimum
    pub fn cycle_volume(&self, settings: &SessionSettings) -> f64 {
        let scaled = settings.base_volume_sol * self.strategy.volume_multiplier();
        scaled.min(self.remaining_volume()).max(settings.min_volume_sol)
    }
}
