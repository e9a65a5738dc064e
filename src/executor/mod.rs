//! Trade executor
//!
//! Executes one plan: resolves each wallet through custody, routes the trade
//! to the venue for the resolved platform, applies dust prevention on sells
//! and collects the platform fee. One wallet's failure never aborts the
//! batch; every entry produces exactly one [`ExecutionRecord`].

pub mod dust;
pub mod fees;
pub mod record;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classifier::{MarketPhase, Platform};
use crate::error::{Error, Result};
use crate::planner::{ExecutionPlan, RandomizationConfig, Randomizer, TradeIntent, TransactionEntry};
use crate::venue::Venue;
use crate::wallet::{SigningWallet, WalletCustody};

pub use dust::{apply_dust_prevention, DustDecision};
pub use fees::{FeeCollector, FeeOutcome};
pub use record::{summarize_executions, ExecutionOutcome, ExecutionRecord, ExecutionSummary, ReasonCode};

/// Executor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Remainders worth less than this (SOL) are sold too
    pub dust_floor_sol: f64,
    /// Timeout for each venue call
    pub venue_timeout_ms: u64,
    /// Timeout for each custody lookup
    pub custody_timeout_ms: u64,
    /// Timeout for each fee collection
    pub fee_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            dust_floor_sol: 0.001,
            venue_timeout_ms: 30_000,
            custody_timeout_ms: 5_000,
            fee_timeout_ms: 30_000,
        }
    }
}

/// Per-batch execution context
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub session_id: String,
    pub user_id: String,
    pub asset_id: String,
    pub platform: Platform,
    /// Used to resolve `Platform::Auto`
    pub phase: MarketPhase,
    pub slippage_bps: u16,
    pub referrer: Option<String>,
    /// Skip buys that would leave less than this (SOL)
    pub min_wallet_balance_sol: Option<f64>,
    pub randomization: RandomizationConfig,
    pub seed: Option<u64>,
    /// Remaining entries are skipped once cancelled
    pub cancel: Option<CancellationToken>,
}

impl ExecutionOptions {
    pub fn new(session_id: &str, user_id: &str, asset_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            asset_id: asset_id.to_string(),
            platform: Platform::Auto,
            phase: MarketPhase::BondingCurve,
            slippage_bps: 1000,
            referrer: None,
            min_wallet_balance_sol: None,
            randomization: RandomizationConfig::default(),
            seed: None,
            cancel: None,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false)
    }
}

async fn with_timeout<T>(operation: &str, timeout_ms: u64, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: operation.to_string(),
            timeout_ms,
        }),
    }
}

/// Executes plans against the venues
pub struct TradeExecutor {
    bonding_curve: Arc<dyn Venue>,
    aggregator: Arc<dyn Venue>,
    custody: Arc<dyn WalletCustody>,
    fees: Arc<dyn FeeCollector>,
    config: ExecutorConfig,
}

impl TradeExecutor {
    pub fn new(
        bonding_curve: Arc<dyn Venue>,
        aggregator: Arc<dyn Venue>,
        custody: Arc<dyn WalletCustody>,
        fees: Arc<dyn FeeCollector>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            bonding_curve,
            aggregator,
            custody,
            fees,
            config,
        }
    }

    /// Venue for a concrete platform
    pub fn venue(&self, platform: Platform) -> &Arc<dyn Venue> {
        match platform {
            Platform::Aggregator => &self.aggregator,
            Platform::BondingCurve | Platform::Auto => &self.bonding_curve,
        }
    }

    /// Current price on the venue the options resolve to
    pub async fn quote_price(&self, options: &ExecutionOptions) -> Result<f64> {
        let platform = options.platform.resolve(&options.asset_id, options.phase);
        with_timeout(
            "price",
            self.config.venue_timeout_ms,
            self.venue(platform).price(&options.asset_id),
        )
        .await
    }

    /// Execute every entry of a plan
    ///
    /// Concurrent entries run together; sequential entries run in order with
    /// a randomized pause between them.
    pub async fn execute_transactions(
        &self,
        plan: &ExecutionPlan,
        options: &ExecutionOptions,
    ) -> Vec<ExecutionRecord> {
        let platform = options.platform.resolve(&options.asset_id, options.phase);
        let randomizer = Mutex::new(Randomizer::new(options.randomization.clone(), options.seed));

        info!(
            session_id = %options.session_id,
            asset = %options.asset_id,
            platform = %platform,
            entries = plan.transactions.len(),
            "Executing plan"
        );

        let mut records = Vec::with_capacity(plan.transactions.len());
        let mut concurrent_batch: Vec<&TransactionEntry> = Vec::new();
        let mut sequential_count = 0usize;

        for entry in &plan.transactions {
            if entry.concurrent {
                concurrent_batch.push(entry);
                continue;
            }

            if !concurrent_batch.is_empty() {
                records.extend(self.run_concurrent(&concurrent_batch, options, platform, &randomizer).await);
                concurrent_batch.clear();
            }

            if sequential_count > 0 && !options.is_cancelled() {
                let delay = lock(&randomizer).jitter_trade_delay();
                if !delay.is_zero() {
                    debug!(delay_ms = delay.as_millis() as u64, "Pausing between trades");
                    tokio::time::sleep(delay).await;
                }
            }
            sequential_count += 1;

            records.push(self.execute_entry(entry, options, platform, &randomizer).await);
        }

        if !concurrent_batch.is_empty() {
            records.extend(self.run_concurrent(&concurrent_batch, options, platform, &randomizer).await);
        }

        let summary = summarize_executions(&records);
        info!(
            session_id = %options.session_id,
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            volume = summary.executed_volume(),
            "Plan executed"
        );

        records
    }

    async fn run_concurrent(
        &self,
        entries: &[&TransactionEntry],
        options: &ExecutionOptions,
        platform: Platform,
        randomizer: &Mutex<Randomizer>,
    ) -> Vec<ExecutionRecord> {
        join_all(
            entries
                .iter()
                .map(|entry| self.execute_entry(entry, options, platform, randomizer)),
        )
        .await
    }

    async fn execute_entry(
        &self,
        entry: &TransactionEntry,
        options: &ExecutionOptions,
        platform: Platform,
        randomizer: &Mutex<Randomizer>,
    ) -> ExecutionRecord {
        let record = ExecutionRecord::pending(
            &options.session_id,
            &options.asset_id,
            &entry.wallet.id,
            entry.role,
            entry.intent,
            platform,
            entry.volume,
        );

        if options.is_cancelled() {
            return record.skipped(ReasonCode::Cancelled, "Session cancelled");
        }

        if let Some(reason) = invalid_volume(entry) {
            warn!(wallet = %entry.wallet.id, "{}", reason);
            return record.skipped(ReasonCode::InvalidVolume, reason);
        }

        let resolved = with_timeout(
            "custody",
            self.config.custody_timeout_ms,
            self.custody
                .resolve(&entry.wallet.id, &options.user_id, &options.session_id),
        )
        .await;

        let wallet = match resolved {
            Ok(Some(wallet)) => wallet,
            Ok(None) => {
                warn!(
                    wallet = %entry.wallet.id,
                    session_id = %options.session_id,
                    "Wallet not authorized for session"
                );
                let err = Error::Authorization {
                    wallet_id: entry.wallet.id.clone(),
                    session_id: options.session_id.clone(),
                };
                return record.skipped(ReasonCode::WalletNotAuthorized, err.to_string());
            }
            Err(e) => {
                warn!(wallet = %entry.wallet.id, error = %e, "Custody lookup failed");
                return record.skipped(e.reason_code(), e.to_string());
            }
        };

        let venue = self.venue(platform).clone();
        let result = match entry.intent {
            TradeIntent::Buy => {
                let amount = lock(randomizer).jitter_amount(entry.volume);
                if !amount.is_finite() || amount <= 0.0 || amount > entry.volume {
                    warn!(wallet = %entry.wallet.id, amount, planned = entry.volume, "Jittered amount out of range");
                    return record.skipped(ReasonCode::InvalidVolume, format!("Invalid jittered amount {}", amount));
                }
                self.execute_buy(venue.as_ref(), &wallet, amount, options, record).await
            }
            TradeIntent::Sell => self.execute_sell(venue.as_ref(), &wallet, entry, options, record).await,
        };

        match result {
            Ok(record) if record.is_success() => {
                self.collect_fee(&wallet, options, record).await
            }
            Ok(record) => record,
            Err((record, e)) => {
                warn!(wallet = %entry.wallet.id, intent = %entry.intent, error = %e, "Trade failed");
                record.failed(e.reason_code(), e.to_string())
            }
        }
    }

    async fn execute_buy(
        &self,
        venue: &dyn Venue,
        wallet: &SigningWallet,
        amount: f64,
        options: &ExecutionOptions,
        record: ExecutionRecord,
    ) -> std::result::Result<ExecutionRecord, (ExecutionRecord, Error)> {
        let timeout_ms = self.config.venue_timeout_ms;

        if let Some(min_balance) = options.min_wallet_balance_sol {
            let balance = match with_timeout("sol_balance", timeout_ms, venue.sol_balance(&wallet.pubkey())).await {
                Ok(balance) => balance,
                Err(e) => return Err((record, e)),
            };
            if balance - amount < min_balance {
                info!(
                    wallet = %wallet.record.id,
                    balance,
                    amount,
                    min_balance,
                    "Buy skipped, balance floor"
                );
                return Ok(record.skipped(
                    ReasonCode::InsufficientBalance,
                    format!(
                        "Balance {:.4} SOL minus {:.4} is below floor {:.4}",
                        balance, amount, min_balance
                    ),
                ));
            }
        }

        match with_timeout(
            "buy",
            timeout_ms,
            venue.buy(wallet, &options.asset_id, amount, options.slippage_bps),
        )
        .await
        {
            Ok(signature) => Ok(record.succeeded(signature, amount)),
            Err(e) => Err((record, e)),
        }
    }

    async fn execute_sell(
        &self,
        venue: &dyn Venue,
        wallet: &SigningWallet,
        entry: &TransactionEntry,
        options: &ExecutionOptions,
        mut record: ExecutionRecord,
    ) -> std::result::Result<ExecutionRecord, (ExecutionRecord, Error)> {
        let timeout_ms = self.config.venue_timeout_ms;
        let asset = &options.asset_id;

        let available = match with_timeout("token_balance", timeout_ms, venue.token_balance(&wallet.pubkey(), asset)).await {
            Ok(balance) => balance,
            Err(e) => return Err((record, e)),
        };

        if available <= 0.0 {
            record.remaining_tokens = Some(0.0);
            return Ok(record.skipped(ReasonCode::NoTokenBalance, "Wallet holds no tokens"));
        }

        let price = match with_timeout("price", timeout_ms, venue.price(asset)).await {
            Ok(price) if price > 0.0 => price,
            Ok(_) => return Err((record, Error::PriceUnavailable(asset.to_string()))),
            Err(e) => return Err((record, e)),
        };

        let requested = match entry.sell_fraction {
            Some(fraction) => available * fraction,
            None => entry.volume / price,
        };

        let decision = apply_dust_prevention(available, requested, price, self.config.dust_floor_sol);
        if decision.dust_prevented {
            debug!(
                wallet = %wallet.record.id,
                available,
                requested,
                "Remainder would be dust, selling full balance"
            );
        }

        match with_timeout(
            "sell",
            timeout_ms,
            venue.sell(wallet, asset, decision.amount, options.slippage_bps),
        )
        .await
        {
            Ok(signature) => {
                record.tokens_sold = Some(decision.amount);
                record.remaining_tokens = Some((available - decision.amount).max(0.0));
                record.dust_prevented = decision.dust_prevented;
                Ok(record.succeeded(signature, decision.amount * price))
            }
            Err(e) => Err((record, e)),
        }
    }

    /// Collect the fee for an executed trade; failure is flagged, never reversed
    async fn collect_fee(
        &self,
        wallet: &SigningWallet,
        options: &ExecutionOptions,
        mut record: ExecutionRecord,
    ) -> ExecutionRecord {
        let outcome = with_timeout(
            "fee",
            self.config.fee_timeout_ms,
            self.fees
                .collect(wallet, record.executed_volume, options.referrer.as_deref()),
        )
        .await;

        match outcome {
            Ok(outcome) => {
                record.fee_amount = outcome.fee_amount;
                record.fee_collected = outcome.success;
                if !outcome.success {
                    warn!(wallet = %wallet.record.id, fee = outcome.fee_amount, "Fee collection incomplete");
                }
            }
            Err(e) => {
                warn!(wallet = %wallet.record.id, error = %e, "Fee collection failed");
                record.fee_collected = false;
            }
        }
        record
    }
}

fn lock(randomizer: &Mutex<Randomizer>) -> std::sync::MutexGuard<'_, Randomizer> {
    randomizer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn invalid_volume(entry: &TransactionEntry) -> Option<String> {
    match entry.sell_fraction {
        Some(fraction) if !fraction.is_finite() || fraction <= 0.0 || fraction > 1.0 => {
            Some(format!("Invalid sell fraction {}", fraction))
        }
        Some(_) => None,
        None if !entry.volume.is_finite() || entry.volume <= 0.0 => {
            Some(format!("Invalid volume {}", entry.volume))
        }
        None => None,
    }
}
