//! Per-session risk state
//!
//! Tracks a volume-weighted entry price, price marks, live profit and the
//! trailing floor, plus one flag per one-shot trigger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Profit/loss trigger kinds, highest priority first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    EmergencyStop,
    StopLoss,
    TrailingStop,
    TakeProfit,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerKind::EmergencyStop => write!(f, "emergency_stop"),
            TriggerKind::StopLoss => write!(f, "stop_loss"),
            TriggerKind::TrailingStop => write!(f, "trailing_stop"),
            TriggerKind::TakeProfit => write!(f, "take_profit"),
        }
    }
}

/// Trigger thresholds; a `None` threshold disables that trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    pub enabled: bool,
    /// Profit (%) that fires take-profit
    pub take_profit_pct: Option<f64>,
    /// Share of the position sold on take-profit (%)
    pub take_profit_sell_pct: f64,
    /// Loss (%) that fires stop-loss
    pub stop_loss_pct: Option<f64>,
    /// Profit (%) that arms the trailing stop
    pub trailing_activation_pct: Option<f64>,
    /// Floor distance below the high (%)
    pub trailing_distance_pct: f64,
    /// Loss (%) that fires emergency stop
    pub emergency_stop_pct: Option<f64>,
    /// Minimum gap between two sells
    pub cooldown_ms: u64,
    /// Prices older than this are not acted on
    pub max_price_age_ms: u64,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            take_profit_pct: Some(100.0),
            take_profit_sell_pct: 50.0,
            stop_loss_pct: Some(30.0),
            trailing_activation_pct: Some(50.0),
            trailing_distance_pct: 15.0,
            emergency_stop_pct: Some(50.0),
            cooldown_ms: 5_000,
            max_price_age_ms: 30_000,
        }
    }
}

impl RiskSettings {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("take_profit_pct", self.take_profit_pct),
            ("stop_loss_pct", self.stop_loss_pct),
            ("trailing_activation_pct", self.trailing_activation_pct),
            ("emergency_stop_pct", self.emergency_stop_pct),
        ];
        for (name, value) in positive {
            if let Some(v) = value {
                if !v.is_finite() || v <= 0.0 {
                    return Err(Error::Validation(format!("{} must be positive, got {}", name, v)));
                }
            }
        }

        if !(self.take_profit_sell_pct > 0.0 && self.take_profit_sell_pct <= 100.0) {
            return Err(Error::Validation(format!(
                "take_profit_sell_pct must be in (0, 100], got {}",
                self.take_profit_sell_pct
            )));
        }

        if !(self.trailing_distance_pct > 0.0 && self.trailing_distance_pct < 100.0) {
            return Err(Error::Validation(format!(
                "trailing_distance_pct must be in (0, 100), got {}",
                self.trailing_distance_pct
            )));
        }

        if let (Some(sl), Some(emergency)) = (self.stop_loss_pct, self.emergency_stop_pct) {
            if emergency < sl {
                return Err(Error::Validation(format!(
                    "emergency_stop_pct ({}) must not be below stop_loss_pct ({})",
                    emergency, sl
                )));
            }
        }

        Ok(())
    }

    /// Fraction of the position a trigger sells
    pub fn sell_fraction(&self, kind: TriggerKind) -> f64 {
        match kind {
            TriggerKind::TakeProfit => self.take_profit_sell_pct / 100.0,
            _ => 1.0,
        }
    }
}

/// Live risk state for one session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskState {
    /// Volume-weighted average entry price
    pub entry_price: Option<f64>,
    pub position_tokens: f64,
    pub cost_basis_sol: f64,
    pub current_price: Option<f64>,
    pub high_price: Option<f64>,
    pub low_price: Option<f64>,
    pub profit_pct: f64,
    /// Armed once profit crosses the activation threshold; only rises
    pub trailing_floor: Option<f64>,
    pub take_profit_fired: bool,
    pub stop_loss_fired: bool,
    pub trailing_stop_fired: bool,
    pub emergency_fired: bool,
    pub last_price_at: Option<DateTime<Utc>>,
    pub last_sell_at: Option<DateTime<Utc>>,
    pub in_flight: bool,
}

impl RiskState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Own-wallet buy: fold into the weighted entry price
    pub fn record_buy(&mut self, tokens: f64, sol: f64) {
        if tokens <= 0.0 || sol <= 0.0 || !tokens.is_finite() || !sol.is_finite() {
            return;
        }
        self.position_tokens += tokens;
        self.cost_basis_sol += sol;
        self.entry_price = Some(self.cost_basis_sol / self.position_tokens);
        self.refresh_profit();
    }

    /// Own-wallet sell: reduce the position at the entry price
    pub fn record_sell(&mut self, tokens: f64) {
        if tokens <= 0.0 || !tokens.is_finite() || self.position_tokens <= 0.0 {
            return;
        }
        let sold = tokens.min(self.position_tokens);
        let entry = self.entry_price.unwrap_or(0.0);
        self.position_tokens -= sold;
        self.cost_basis_sol = (self.cost_basis_sol - sold * entry).max(0.0);
        if self.position_tokens <= 0.0 {
            self.position_tokens = 0.0;
            self.cost_basis_sol = 0.0;
        }
    }

    /// Seed the entry price directly (no position tracking)
    pub fn set_entry_price(&mut self, price: f64) {
        if price > 0.0 && price.is_finite() {
            self.entry_price = Some(price);
            self.refresh_profit();
        }
    }

    /// New price observation
    pub fn update_price(&mut self, price: f64, at: DateTime<Utc>, settings: &RiskSettings) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }

        self.current_price = Some(price);
        self.last_price_at = Some(at);
        self.high_price = Some(self.high_price.map_or(price, |h| h.max(price)));
        self.low_price = Some(self.low_price.map_or(price, |l| l.min(price)));
        self.refresh_profit();

        if let Some(activation) = settings.trailing_activation_pct {
            let armed = self.trailing_floor.is_some();
            if armed || self.profit_pct >= activation {
                if let Some(high) = self.high_price {
                    let candidate = high * (1.0 - settings.trailing_distance_pct / 100.0);
                    self.trailing_floor = Some(self.trailing_floor.map_or(candidate, |f| f.max(candidate)));
                }
            }
        }
    }

    fn refresh_profit(&mut self) {
        self.profit_pct = match (self.entry_price, self.current_price) {
            (Some(entry), Some(price)) if entry > 0.0 => (price - entry) / entry * 100.0,
            _ => 0.0,
        };
    }

    pub fn loss_pct(&self) -> f64 {
        (-self.profit_pct).max(0.0)
    }

    pub fn mark_fired(&mut self, kind: TriggerKind) {
        match kind {
            TriggerKind::EmergencyStop => self.emergency_fired = true,
            TriggerKind::StopLoss => self.stop_loss_fired = true,
            TriggerKind::TrailingStop => self.trailing_stop_fired = true,
            TriggerKind::TakeProfit => self.take_profit_fired = true,
        }
    }

    /// Highest-priority trigger that is eligible and has not fired
    pub fn pending_trigger(&self, settings: &RiskSettings) -> Option<TriggerKind> {
        let price = self.current_price?;
        self.entry_price?;

        let loss = self.loss_pct();

        if let Some(threshold) = settings.emergency_stop_pct {
            if !self.emergency_fired && loss >= threshold {
                return Some(TriggerKind::EmergencyStop);
            }
        }

        if let Some(threshold) = settings.stop_loss_pct {
            if !self.stop_loss_fired && loss >= threshold {
                return Some(TriggerKind::StopLoss);
            }
        }

        if let Some(floor) = self.trailing_floor {
            if !self.trailing_stop_fired && price <= floor {
                return Some(TriggerKind::TrailingStop);
            }
        }

        if let Some(threshold) = settings.take_profit_pct {
            if !self.take_profit_fired && self.profit_pct >= threshold {
                return Some(TriggerKind::TakeProfit);
            }
        }

        None
    }

    /// Fails when the last price is older than allowed
    pub fn check_fresh(&self, now: DateTime<Utc>, max_age_ms: u64) -> Result<()> {
        let last = self.last_price_at.ok_or(Error::Staleness {
            age_ms: u64::MAX,
            max_age_ms,
        })?;
        let age_ms = (now - last).num_milliseconds().max(0) as u64;
        if age_ms > max_age_ms {
            return Err(Error::Staleness { age_ms, max_age_ms });
        }
        Ok(())
    }

    /// Still inside the cooldown after the last sell
    pub fn in_cooldown(&self, now: DateTime<Utc>, cooldown_ms: u64) -> bool {
        match self.last_sell_at {
            Some(last) => ((now - last).num_milliseconds().max(0) as u64) < cooldown_ms,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RiskSettings {
        RiskSettings {
            enabled: true,
            take_profit_pct: Some(50.0),
            take_profit_sell_pct: 50.0,
            stop_loss_pct: Some(20.0),
            trailing_activation_pct: Some(30.0),
            trailing_distance_pct: 10.0,
            emergency_stop_pct: Some(50.0),
            cooldown_ms: 0,
            max_price_age_ms: 10_000,
        }
    }

    #[test]
    fn test_vwap_entry_price() {
        let mut state = RiskState::new();
        state.record_buy(100.0, 1.0);
        state.record_buy(100.0, 3.0);
        assert_eq!(state.entry_price, Some(0.02));

        state.record_sell(50.0);
        assert_eq!(state.position_tokens, 150.0);
        assert_eq!(state.entry_price, Some(0.02));
        assert!((state.cost_basis_sol - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_trailing_floor_arms_and_only_rises() {
        let s = settings();
        let mut state = RiskState::new();
        state.set_entry_price(1.0);
        let now = Utc::now();

        state.update_price(1.2, now, &s);
        assert!(state.trailing_floor.is_none());

        state.update_price(1.5, now, &s);
        assert!((state.trailing_floor.unwrap() - 1.35).abs() < 1e-9);

        state.update_price(1.4, now, &s);
        assert!((state.trailing_floor.unwrap() - 1.35).abs() < 1e-9);

        state.update_price(2.0, now, &s);
        assert!((state.trailing_floor.unwrap() - 1.8).abs() < 1e-9);
        assert_eq!(state.high_price, Some(2.0));
        assert_eq!(state.low_price, Some(1.2));
    }

    #[test]
    fn test_priority_order() {
        let s = settings();
        let mut state = RiskState::new();
        state.set_entry_price(1.0);
        state.update_price(0.45, Utc::now(), &s);

        // Both stop-loss and emergency qualify; emergency wins
        assert_eq!(state.pending_trigger(&s), Some(TriggerKind::EmergencyStop));
        state.mark_fired(TriggerKind::EmergencyStop);
        assert_eq!(state.pending_trigger(&s), Some(TriggerKind::StopLoss));
        state.mark_fired(TriggerKind::StopLoss);
        assert_eq!(state.pending_trigger(&s), None);
    }

    #[test]
    fn test_staleness_and_cooldown() {
        let s = settings();
        let mut state = RiskState::new();
        let t0 = Utc::now();
        assert!(matches!(
            state.check_fresh(t0, 1_000),
            Err(Error::Staleness { .. })
        ));

        state.update_price(1.0, t0, &s);
        assert!(state.check_fresh(t0 + chrono::Duration::milliseconds(500), 1_000).is_ok());
        assert!(state.check_fresh(t0 + chrono::Duration::milliseconds(1_500), 1_000).is_err());

        state.last_sell_at = Some(t0);
        assert!(state.in_cooldown(t0 + chrono::Duration::milliseconds(100), 1_000));
        assert!(!state.in_cooldown(t0 + chrono::Duration::milliseconds(1_000), 1_000));
    }

    #[test]
    fn test_settings_validation() {
        assert!(settings().validate().is_ok());

        let bad = RiskSettings {
            emergency_stop_pct: Some(10.0),
            ..settings()
        };
        assert!(bad.validate().is_err());

        let bad = RiskSettings {
            take_profit_sell_pct: 0.0,
            ..settings()
        };
        assert!(bad.validate().is_err());
    }
}
