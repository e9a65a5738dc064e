//! Allocation planner
//!
//! Turns a strategy, a wallet set and a volume target into a rule-checked
//! list of per-wallet trade intents.

pub mod randomization;
pub mod rules;

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::classifier::types::Strategy;
use crate::error::{Error, Result};
use crate::wallet::WalletRecord;

pub use randomization::{RandomizationConfig, Randomizer};
pub use rules::{PlanRules, RuleViolation};

/// Role a wallet plays in one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationRole {
    Entry,
    Exit,
    Liquidity,
    ArbitrageBuy,
    ArbitrageSell,
    /// Out-of-band risk liquidation
    Liquidation,
}

impl AllocationRole {
    pub fn is_sell_role(&self) -> bool {
        matches!(
            self,
            AllocationRole::Exit | AllocationRole::ArbitrageSell | AllocationRole::Liquidation
        )
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeIntent {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeIntent::Buy => write!(f, "buy"),
            TradeIntent::Sell => write!(f, "sell"),
        }
    }
}

/// One wallet's share of the cycle volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationEntry {
    pub wallet: WalletRecord,
    pub role: AllocationRole,
    /// SOL notional
    pub amount: f64,
    pub concurrent: bool,
}

/// Executable per-wallet intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEntry {
    pub wallet: WalletRecord,
    pub role: AllocationRole,
    pub intent: TradeIntent,
    /// SOL notional; for sells, the SOL value to sell
    pub volume: f64,
    pub concurrent: bool,
    /// When set, sell this fraction of the live token balance instead of `volume`
    pub sell_fraction: Option<f64>,
}

/// Result of one planning call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub strategy: Strategy,
    pub total_volume: f64,
    pub allocations: Vec<AllocationEntry>,
    pub transactions: Vec<TransactionEntry>,
    pub violations: Vec<RuleViolation>,
}

impl ExecutionPlan {
    pub fn is_rejected(&self) -> bool {
        !self.violations.is_empty()
    }

    /// Total SOL allocated across entries
    pub fn allocated_volume(&self) -> f64 {
        self.allocations.iter().map(|a| a.amount).sum()
    }

    /// Plan that sells `fraction` of each wallet's token balance concurrently
    pub fn liquidation(wallets: &[WalletRecord], fraction: f64) -> Self {
        let fraction = fraction.clamp(0.0, 1.0);
        let transactions = wallets
            .iter()
            .map(|wallet| TransactionEntry {
                wallet: wallet.clone(),
                role: AllocationRole::Liquidation,
                intent: TradeIntent::Sell,
                volume: 0.0,
                concurrent: true,
                sell_fraction: Some(fraction),
            })
            .collect();

        Self {
            strategy: Strategy::Defensive,
            total_volume: 0.0,
            allocations: Vec::new(),
            transactions,
            violations: Vec::new(),
        }
    }
}

/// How wallets are chosen for each cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    /// Every wallet, every cycle
    #[default]
    All,
    /// Consecutive windows, advancing each cycle
    RoundRobin,
    /// Random subset each cycle
    Random,
}

impl std::str::FromStr for RotationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "all" => Ok(RotationMode::All),
            "round_robin" | "round-robin" => Ok(RotationMode::RoundRobin),
            "random" => Ok(RotationMode::Random),
            other => Err(Error::Validation(format!("Unknown rotation mode: {}", other))),
        }
    }
}

/// Builds execution plans
pub struct AllocationPlanner {
    randomizer: Mutex<Randomizer>,
}

impl AllocationPlanner {
    pub fn new(randomizer: Randomizer) -> Self {
        Self {
            randomizer: Mutex::new(randomizer),
        }
    }

    /// Planner with a fixed seed
    pub fn seeded(config: RandomizationConfig, seed: u64) -> Self {
        Self::new(Randomizer::new(config, Some(seed)))
    }

    /// Run `f` with exclusive access to the randomizer
    pub fn with_randomizer<T>(&self, f: impl FnOnce(&mut Randomizer) -> T) -> T {
        let mut guard = self
            .randomizer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Resolve the cycle volume: explicit value, else the strategy-scaled base
    pub fn resolve_volume(
        strategy: Strategy,
        total_volume: Option<f64>,
        rules: &PlanRules,
    ) -> Result<f64> {
        let volume = total_volume.unwrap_or(rules.base_volume * strategy.volume_multiplier());
        if !volume.is_finite() || volume <= 0.0 {
            return Err(Error::Validation(format!(
                "Total volume must be positive, got {}",
                volume
            )));
        }
        Ok(volume)
    }

    /// Build a plan for one cycle
    ///
    /// Input problems are errors; rule violations come back inside the plan
    /// with zero transactions.
    pub fn generate_execution_plan(
        &self,
        strategy: Strategy,
        wallets: &[WalletRecord],
        total_volume: Option<f64>,
        rules: &PlanRules,
    ) -> Result<ExecutionPlan> {
        if wallets.is_empty() {
            return Err(Error::Validation("No wallets supplied".to_string()));
        }

        let volume = Self::resolve_volume(strategy, total_volume, rules)?;

        let violations = rules.validate(wallets.len(), volume);
        if !violations.is_empty() {
            info!(
                strategy = %strategy,
                wallets = wallets.len(),
                volume,
                violations = violations.len(),
                "Plan rejected by rules"
            );
            return Ok(ExecutionPlan {
                strategy,
                total_volume: volume,
                allocations: Vec::new(),
                transactions: Vec::new(),
                violations,
            });
        }

        let allocations = match strategy {
            Strategy::Bullish => self.allocate_bullish(wallets, volume),
            Strategy::Defensive => allocate_even(wallets, volume, |_| AllocationRole::Liquidity),
            Strategy::Arbitrage => allocate_even(wallets, volume, |i| {
                if i % 2 == 0 {
                    AllocationRole::ArbitrageBuy
                } else {
                    AllocationRole::ArbitrageSell
                }
            }),
        };

        let transactions = derive_transactions(&allocations);

        debug!(
            strategy = %strategy,
            transactions = transactions.len(),
            volume,
            "Execution plan generated"
        );

        Ok(ExecutionPlan {
            strategy,
            total_volume: volume,
            allocations,
            transactions,
            violations: Vec::new(),
        })
    }

    /// Pick the wallets for one cycle
    pub fn select_wallets(
        &self,
        mode: RotationMode,
        wallets: &[WalletRecord],
        per_cycle: Option<usize>,
        cycle_index: u64,
    ) -> Vec<WalletRecord> {
        let count = per_cycle.unwrap_or(wallets.len()).min(wallets.len());
        if count == 0 {
            return Vec::new();
        }

        match mode {
            RotationMode::All => wallets.to_vec(),
            RotationMode::RoundRobin => {
                let start = (cycle_index as usize).wrapping_mul(count) % wallets.len();
                (0..count)
                    .map(|i| wallets[(start + i) % wallets.len()].clone())
                    .collect()
            }
            RotationMode::Random => self
                .with_randomizer(|r| r.sample_indices(wallets.len(), count))
                .into_iter()
                .map(|i| wallets[i].clone())
                .collect(),
        }
    }

    fn allocate_bullish(&self, wallets: &[WalletRecord], volume: f64) -> Vec<AllocationEntry> {
        let (order, slices) = self.with_randomizer(|r| {
            let mut order: Vec<WalletRecord> = wallets.to_vec();
            r.shuffle(&mut order);
            let slices = r.partition(volume, order.len());
            (order, slices)
        });

        order
            .into_iter()
            .zip(slices)
            .enumerate()
            .map(|(i, (wallet, amount))| AllocationEntry {
                wallet,
                role: if i % 2 == 0 {
                    AllocationRole::Entry
                } else {
                    AllocationRole::Exit
                },
                amount,
                concurrent: false,
            })
            .collect()
    }
}

impl Default for AllocationPlanner {
    fn default() -> Self {
        Self::new(Randomizer::default())
    }
}

fn allocate_even(
    wallets: &[WalletRecord],
    volume: f64,
    role_for: impl Fn(usize) -> AllocationRole,
) -> Vec<AllocationEntry> {
    let share = volume / wallets.len() as f64;
    wallets
        .iter()
        .enumerate()
        .map(|(i, wallet)| AllocationEntry {
            wallet: wallet.clone(),
            role: role_for(i),
            amount: share,
            concurrent: true,
        })
        .collect()
}

/// Map allocations to buy/sell intents
///
/// Liquidity entries alternate buy/sell by index to keep net volume flat.
pub fn derive_transactions(allocations: &[AllocationEntry]) -> Vec<TransactionEntry> {
    allocations
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let intent = match entry.role {
                role if role.is_sell_role() => TradeIntent::Sell,
                AllocationRole::Liquidity if i % 2 == 1 => TradeIntent::Sell,
                _ => TradeIntent::Buy,
            };
            TransactionEntry {
                wallet: entry.wallet.clone(),
                role: entry.role,
                intent,
                volume: entry.amount,
                concurrent: entry.concurrent,
                sell_fraction: None,
            }
        })
        .collect()
}
