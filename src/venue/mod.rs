//! Swap venues
//!
//! Two interchangeable adapters sit behind [`Venue`]: the launch bonding
//! curve (PumpPortal local transactions) and the swap aggregator (Jupiter).
//! Both build transactions remotely and sign them locally.

pub mod aggregator;
pub mod bonding_curve;
pub mod chain;
pub mod curve;

use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;

use crate::error::Result;
use crate::wallet::SigningWallet;

pub use aggregator::AggregatorVenue;
pub use bonding_curve::BondingCurveVenue;
pub use chain::ChainClient;

/// Venue adapter
#[async_trait]
pub trait Venue: Send + Sync {
    fn name(&self) -> &'static str;

    /// Spend `sol_amount` SOL on the asset; returns the signature
    async fn buy(
        &self,
        wallet: &SigningWallet,
        asset_id: &str,
        sol_amount: f64,
        slippage_bps: u16,
    ) -> Result<String>;

    /// Sell `token_amount` whole tokens; returns the signature
    async fn sell(
        &self,
        wallet: &SigningWallet,
        asset_id: &str,
        token_amount: f64,
        slippage_bps: u16,
    ) -> Result<String>;

    /// SOL per whole token
    async fn price(&self, asset_id: &str) -> Result<f64>;

    /// Whole tokens held by `owner`
    async fn token_balance(&self, owner: &Pubkey, asset_id: &str) -> Result<f64>;

    /// SOL held by `owner`
    async fn sol_balance(&self, owner: &Pubkey) -> Result<f64>;
}

/// Slippage in basis points to whole percent, rounding up
pub fn slippage_pct(slippage_bps: u16) -> u32 {
    (slippage_bps as u32 + 99) / 100
}
