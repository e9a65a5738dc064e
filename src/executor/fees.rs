//! Platform fee collection
//!
//! A fixed basis-point fee on the notional of every executed trade,
//! optionally split with a referrer, paid as SOL transfers from the trading
//! wallet.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::venue::chain::{parse_pubkey, sol_to_lamports, ChainClient};
use crate::wallet::SigningWallet;

/// Result of one collection attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeOutcome {
    pub success: bool,
    /// Total fee in SOL (platform + referrer)
    pub fee_amount: f64,
    pub referrer_amount: f64,
    pub signature: Option<String>,
}

impl FeeOutcome {
    pub fn none() -> Self {
        Self {
            success: true,
            fee_amount: 0.0,
            referrer_amount: 0.0,
            signature: None,
        }
    }
}

/// Fee collector collaborator
#[async_trait]
pub trait FeeCollector: Send + Sync {
    async fn collect(
        &self,
        signer: &SigningWallet,
        notional_sol: f64,
        referrer: Option<&str>,
    ) -> Result<FeeOutcome>;
}

/// Fee schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Fee on notional, basis points
    pub fee_bps: u16,
    /// Referrer share of the fee (%)
    pub referrer_share_pct: f64,
    /// Fees below this are not transferred
    pub min_fee_lamports: u64,
}

/// Platform and referrer shares of one fee
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeSplit {
    pub platform: f64,
    pub referrer: f64,
}

impl FeeSplit {
    pub fn total(&self) -> f64 {
        self.platform + self.referrer
    }
}

impl FeeSchedule {
    pub fn split(&self, notional_sol: f64, has_referrer: bool) -> FeeSplit {
        if !notional_sol.is_finite() || notional_sol <= 0.0 {
            return FeeSplit {
                platform: 0.0,
                referrer: 0.0,
            };
        }

        let fee = notional_sol * self.fee_bps as f64 / 10_000.0;
        let referrer = if has_referrer {
            fee * self.referrer_share_pct.clamp(0.0, 100.0) / 100.0
        } else {
            0.0
        };

        FeeSplit {
            platform: fee - referrer,
            referrer,
        }
    }
}

/// Collects fees as SOL transfers to the platform fee wallet
pub struct TransferFeeCollector {
    chain: Arc<ChainClient>,
    fee_wallet: Pubkey,
    schedule: FeeSchedule,
}

impl TransferFeeCollector {
    pub fn new(chain: Arc<ChainClient>, fee_wallet: Pubkey, schedule: FeeSchedule) -> Self {
        Self {
            chain,
            fee_wallet,
            schedule,
        }
    }
}

#[async_trait]
impl FeeCollector for TransferFeeCollector {
    async fn collect(
        &self,
        signer: &SigningWallet,
        notional_sol: f64,
        referrer: Option<&str>,
    ) -> Result<FeeOutcome> {
        let referrer = match referrer {
            Some(address) => Some(parse_pubkey(address)?),
            None => None,
        };

        let split = self.schedule.split(notional_sol, referrer.is_some());
        let platform_lamports = sol_to_lamports(split.platform);

        if sol_to_lamports(split.total()) < self.schedule.min_fee_lamports {
            debug!(wallet = %signer.record.id, fee = split.total(), "Fee below minimum, skipped");
            return Ok(FeeOutcome::none());
        }

        let signature = self
            .chain
            .transfer_sol(signer.keypair(), &self.fee_wallet, platform_lamports)
            .await?;

        let mut referrer_amount = 0.0;
        if let Some(referrer) = referrer {
            let referrer_lamports = sol_to_lamports(split.referrer);
            if referrer_lamports > 0 {
                match self
                    .chain
                    .transfer_sol(signer.keypair(), &referrer, referrer_lamports)
                    .await
                {
                    Ok(_) => referrer_amount = split.referrer,
                    Err(e) => {
                        warn!(wallet = %signer.record.id, error = %e, "Referrer fee transfer failed");
                        return Ok(FeeOutcome {
                            success: false,
                            fee_amount: split.total(),
                            referrer_amount: 0.0,
                            signature: Some(signature),
                        });
                    }
                }
            }
        }

        Ok(FeeOutcome {
            success: true,
            fee_amount: split.platform + referrer_amount,
            referrer_amount,
            signature: Some(signature),
        })
    }
}

/// Used when fees are disabled
pub struct NoFees;

#[async_trait]
impl FeeCollector for NoFees {
    async fn collect(
        &self,
        _signer: &SigningWallet,
        _notional_sol: f64,
        _referrer: Option<&str>,
    ) -> Result<FeeOutcome> {
        Ok(FeeOutcome::none())
    }
}

/// Validate a referrer address up front
pub fn validate_referrer(referrer: Option<&str>) -> Result<()> {
    if let Some(address) = referrer {
        parse_pubkey(address)
            .map_err(|_| Error::Validation(format!("Invalid referrer address: {}", address)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> FeeSchedule {
        FeeSchedule {
            fee_bps: 100,
            referrer_share_pct: 25.0,
            min_fee_lamports: 5_000,
        }
    }

    #[test]
    fn test_fee_split_without_referrer() {
        let split = schedule().split(2.0, false);
        assert!((split.platform - 0.02).abs() < 1e-12);
        assert_eq!(split.referrer, 0.0);
    }

    #[test]
    fn test_fee_split_with_referrer() {
        let split = schedule().split(2.0, true);
        assert!((split.total() - 0.02).abs() < 1e-12);
        assert!((split.referrer - 0.005).abs() < 1e-12);
        assert!((split.platform - 0.015).abs() < 1e-12);
    }

    #[test]
    fn test_fee_split_invalid_notional() {
        assert_eq!(schedule().split(f64::NAN, true).total(), 0.0);
        assert_eq!(schedule().split(-1.0, false).total(), 0.0);
    }

    #[test]
    fn test_validate_referrer() {
        assert!(validate_referrer(None).is_ok());
        assert!(validate_referrer(Some("11111111111111111111111111111111")).is_ok());
        assert!(validate_referrer(Some("bad")).is_err());
    }
}
