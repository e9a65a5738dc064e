//! Execution records and batch summaries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::platform::Platform;
use crate::planner::{AllocationRole, TradeIntent};

/// Remaining balance below this many tokens counts as empty
pub const EMPTY_BALANCE_EPSILON: f64 = 1e-9;

/// Outcome of one wallet's entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Skipped,
    Failed,
}

/// Why an entry did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    WalletNotAuthorized,
    InvalidVolume,
    InsufficientBalance,
    NoTokenBalance,
    PriceUnavailable,
    SlippageExceeded,
    Timeout,
    NetworkError,
    VenueError,
    Cancelled,
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReasonCode::WalletNotAuthorized => "wallet_not_authorized",
            ReasonCode::InvalidVolume => "invalid_volume",
            ReasonCode::InsufficientBalance => "insufficient_balance",
            ReasonCode::NoTokenBalance => "no_token_balance",
            ReasonCode::PriceUnavailable => "price_unavailable",
            ReasonCode::SlippageExceeded => "slippage_exceeded",
            ReasonCode::Timeout => "timeout",
            ReasonCode::NetworkError => "network_error",
            ReasonCode::VenueError => "venue_error",
            ReasonCode::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Append-only outcome of one wallet's entry in one cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub session_id: String,
    pub asset_id: String,
    pub wallet_id: String,
    pub role: AllocationRole,
    pub intent: TradeIntent,
    /// Venue the entry was routed to
    pub platform: Platform,
    /// Planned SOL notional
    pub requested_volume: f64,
    /// SOL notional actually traded
    pub executed_volume: f64,
    pub outcome: ExecutionOutcome,
    pub signature: Option<String>,
    pub tokens_sold: Option<f64>,
    pub remaining_tokens: Option<f64>,
    pub dust_prevented: bool,
    pub fee_amount: f64,
    pub fee_collected: bool,
    pub reason: Option<ReasonCode>,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Record with no trade attached yet
    pub fn pending(
        session_id: &str,
        asset_id: &str,
        wallet_id: &str,
        role: AllocationRole,
        intent: TradeIntent,
        platform: Platform,
        requested_volume: f64,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            asset_id: asset_id.to_string(),
            wallet_id: wallet_id.to_string(),
            role,
            intent,
            platform,
            requested_volume,
            executed_volume: 0.0,
            outcome: ExecutionOutcome::Skipped,
            signature: None,
            tokens_sold: None,
            remaining_tokens: None,
            dust_prevented: false,
            fee_amount: 0.0,
            fee_collected: false,
            reason: None,
            error: None,
            executed_at: Utc::now(),
        }
    }

    pub fn skipped(mut self, reason: ReasonCode, error: impl Into<String>) -> Self {
        self.outcome = ExecutionOutcome::Skipped;
        self.reason = Some(reason);
        self.error = Some(error.into());
        self.executed_at = Utc::now();
        self
    }

    pub fn failed(mut self, reason: ReasonCode, error: impl Into<String>) -> Self {
        self.outcome = ExecutionOutcome::Failed;
        self.reason = Some(reason);
        self.error = Some(error.into());
        self.executed_at = Utc::now();
        self
    }

    pub fn succeeded(mut self, signature: String, executed_volume: f64) -> Self {
        self.outcome = ExecutionOutcome::Success;
        self.signature = Some(signature);
        self.executed_volume = executed_volume;
        self.reason = None;
        self.error = None;
        self.executed_at = Utc::now();
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ExecutionOutcome::Success
    }

    /// Wallet holds no tokens after this entry
    pub fn left_wallet_empty(&self) -> bool {
        match self.remaining_tokens {
            Some(remaining) => remaining <= EMPTY_BALANCE_EPSILON,
            None => self.reason == Some(ReasonCode::NoTokenBalance),
        }
    }
}

/// Aggregate over one batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub buys: usize,
    pub sells: usize,
    /// SOL spent on successful buys
    pub buy_volume: f64,
    /// SOL notional of successful sells
    pub sell_volume: f64,
    pub fees_paid: f64,
    pub fee_count: usize,
    pub fee_failures: usize,
    pub dust_prevented: usize,
    /// Every sell entry left its wallet with no tokens
    pub all_wallets_empty: bool,
}

impl ExecutionSummary {
    /// Buy plus sell notional
    pub fn executed_volume(&self) -> f64 {
        self.buy_volume + self.sell_volume
    }
}

/// Aggregate a batch of records
pub fn summarize_executions(records: &[ExecutionRecord]) -> ExecutionSummary {
    let mut summary = ExecutionSummary {
        total: records.len(),
        ..Default::default()
    };

    let mut sell_entries = 0usize;
    let mut emptied = 0usize;

    for record in records {
        match record.outcome {
            ExecutionOutcome::Success => summary.succeeded += 1,
            ExecutionOutcome::Skipped => summary.skipped += 1,
            ExecutionOutcome::Failed => summary.failed += 1,
        }

        if record.intent == TradeIntent::Sell {
            sell_entries += 1;
            if record.left_wallet_empty() {
                emptied += 1;
            }
        }

        if record.is_success() {
            match record.intent {
                TradeIntent::Buy => {
                    summary.buys += 1;
                    summary.buy_volume += record.executed_volume;
                }
                TradeIntent::Sell => {
                    summary.sells += 1;
                    summary.sell_volume += record.executed_volume;
                }
            }

            if record.fee_collected {
                summary.fees_paid += record.fee_amount;
                summary.fee_count += 1;
            } else if record.fee_amount > 0.0 {
                summary.fee_failures += 1;
            }
        }

        if record.dust_prevented {
            summary.dust_prevented += 1;
        }
    }

    summary.all_wallets_empty = sell_entries > 0 && sell_entries == records.len() && emptied == sell_entries;
    summary
}
