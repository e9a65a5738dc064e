//! Bonding-curve venue
//!
//! Uses the PumpPortal Local Transaction API to build the trade, signs it
//! with the session wallet and submits it over RPC. No API key is needed.
//!
//! API Documentation: https://pumpportal.fun/local-trading-api/trading-api

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::wallet::SigningWallet;

use super::chain::{parse_pubkey, ChainClient};
use super::curve::{derive_bonding_curve, BondingCurve};
use super::{slippage_pct, Venue};

/// PumpPortal Local Transaction API endpoint
pub const PUMPPORTAL_LOCAL_API_URL: &str = "https://pumpportal.fun/api/trade-local";

const VENUE_NAME: &str = "bonding_curve";

/// Trade action
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
}

/// Local trade request (returns a serialized unsigned transaction)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalTradeRequest {
    pub public_key: String,
    pub action: TradeAction,
    pub mint: String,
    /// SOL for buys, tokens for sells
    pub amount: String,
    /// "true" if amount is in SOL
    pub denominated_in_sol: String,
    /// Slippage percentage
    pub slippage: u32,
    /// Priority fee in SOL
    pub priority_fee: f64,
    pub pool: String,
}

impl LocalTradeRequest {
    fn new(
        wallet: &SigningWallet,
        action: TradeAction,
        mint: &str,
        amount: f64,
        slippage_bps: u16,
        priority_fee: f64,
    ) -> Self {
        Self {
            public_key: wallet.pubkey().to_string(),
            action,
            mint: mint.to_string(),
            amount: amount.to_string(),
            denominated_in_sol: matches!(action, TradeAction::Buy).to_string(),
            slippage: slippage_pct(slippage_bps),
            priority_fee,
            pool: "pump".to_string(),
        }
    }
}

/// Bonding-curve venue configuration
#[derive(Debug, Clone)]
pub struct BondingCurveVenueConfig {
    pub api_url: String,
    pub priority_fee_sol: f64,
    pub http_timeout: Duration,
}

impl Default for BondingCurveVenueConfig {
    fn default() -> Self {
        Self {
            api_url: PUMPPORTAL_LOCAL_API_URL.to_string(),
            priority_fee_sol: 0.0005,
            http_timeout: Duration::from_secs(10),
        }
    }
}

/// Trades on the launch bonding curve
pub struct BondingCurveVenue {
    client: Client,
    chain: Arc<ChainClient>,
    config: BondingCurveVenueConfig,
}

impl BondingCurveVenue {
    pub fn new(chain: Arc<ChainClient>, config: BondingCurveVenueConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            chain,
            config,
        })
    }

    /// Fetch the unsigned transaction bytes for a trade
    async fn build_transaction(&self, request: &LocalTradeRequest) -> Result<Vec<u8>> {
        debug!(
            action = ?request.action,
            mint = %request.mint,
            amount = %request.amount,
            "Requesting local transaction"
        );

        let response = self
            .client
            .post(&self.config.api_url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Execution {
                venue: VENUE_NAME.to_string(),
                message: format!("HTTP request failed: {}", e),
            })?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| Error::Execution {
            venue: VENUE_NAME.to_string(),
            message: format!("Failed to read response: {}", e),
        })?;

        if !status.is_success() {
            return Err(Error::Execution {
                venue: VENUE_NAME.to_string(),
                message: format!(
                    "Local API returned {}: {}",
                    status,
                    String::from_utf8_lossy(&bytes)
                ),
            });
        }

        Ok(bytes.to_vec())
    }

    async fn trade(&self, wallet: &SigningWallet, request: LocalTradeRequest) -> Result<String> {
        let tx_bytes = self.build_transaction(&request).await?;
        let signature = self
            .chain
            .sign_and_send(VENUE_NAME, &tx_bytes, wallet.keypair())
            .await?;

        info!(
            wallet = %wallet.record.id,
            action = ?request.action,
            amount = %request.amount,
            signature = %signature,
            "Bonding curve trade confirmed"
        );

        Ok(signature)
    }
}

#[async_trait]
impl Venue for BondingCurveVenue {
    fn name(&self) -> &'static str {
        VENUE_NAME
    }

    async fn buy(
        &self,
        wallet: &SigningWallet,
        asset_id: &str,
        sol_amount: f64,
        slippage_bps: u16,
    ) -> Result<String> {
        let request = LocalTradeRequest::new(
            wallet,
            TradeAction::Buy,
            asset_id,
            sol_amount,
            slippage_bps,
            self.config.priority_fee_sol,
        );
        self.trade(wallet, request).await
    }

    async fn sell(
        &self,
        wallet: &SigningWallet,
        asset_id: &str,
        token_amount: f64,
        slippage_bps: u16,
    ) -> Result<String> {
        let request = LocalTradeRequest::new(
            wallet,
            TradeAction::Sell,
            asset_id,
            token_amount,
            slippage_bps,
            self.config.priority_fee_sol,
        );
        self.trade(wallet, request).await
    }

    async fn price(&self, asset_id: &str) -> Result<f64> {
        let mint = parse_pubkey(asset_id)?;
        let curve_address = derive_bonding_curve(&mint);

        let data = self
            .chain
            .account_data(&curve_address)
            .await?
            .ok_or_else(|| Error::PriceUnavailable(format!("No bonding curve for {}", asset_id)))?;

        let curve = BondingCurve::decode(&data)?;
        if curve.complete {
            return Err(Error::PriceUnavailable(format!(
                "Bonding curve for {} is complete",
                asset_id
            )));
        }

        let decimals = self.chain.decimals(&mint).await?;
        curve.price_sol(decimals)
    }

    async fn token_balance(&self, owner: &Pubkey, asset_id: &str) -> Result<f64> {
        let mint = parse_pubkey(asset_id)?;
        self.chain.token_balance(owner, &mint).await
    }

    async fn sol_balance(&self, owner: &Pubkey) -> Result<f64> {
        self.chain.sol_balance(owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::WalletRecord;
    use solana_sdk::signature::Keypair;
    use solana_sdk::signer::Signer;

    fn wallet() -> SigningWallet {
        let keypair = Keypair::new();
        let record = WalletRecord::new("w1", "u1", keypair.pubkey().to_string());
        SigningWallet::new(record, keypair)
    }

    #[test]
    fn test_buy_request_serialization() {
        let wallet = wallet();
        let request = LocalTradeRequest::new(
            &wallet,
            TradeAction::Buy,
            "DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK",
            0.01,
            2500,
            0.0005,
        );

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"action\":\"buy\""));
        assert!(json.contains("\"denominatedInSol\":\"true\""));
        assert!(json.contains("\"slippage\":25"));
        assert!(json.contains(&format!("\"publicKey\":\"{}\"", wallet.pubkey())));
    }

    #[test]
    fn test_sell_request_denominated_in_tokens() {
        let request = LocalTradeRequest::new(&wallet(), TradeAction::Sell, "mint", 1234.5, 100, 0.0);
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"action\":\"sell\""));
        assert!(json.contains("\"denominatedInSol\":\"false\""));
        assert!(json.contains("\"amount\":\"1234.5\""));
    }
}
