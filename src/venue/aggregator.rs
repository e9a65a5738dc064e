//! Aggregator venue (Jupiter)
//!
//! Quote, then request a swap transaction for the quote, sign it locally and
//! submit it over RPC. Prices come from the aggregator price API quoted in SOL.

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::wallet::SigningWallet;

use super::chain::{parse_pubkey, sol_to_lamports, ChainClient};
use super::curve::WSOL_MINT_STR;
use super::Venue;

pub const JUPITER_API_URL: &str = "https://lite-api.jup.ag";

const VENUE_NAME: &str = "aggregator";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SwapRequest<'a> {
    quote_response: &'a serde_json::Value,
    user_public_key: String,
    wrap_and_unwrap_sol: bool,
    dynamic_compute_unit_limit: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapResponse {
    swap_transaction: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct PriceResponse {
    data: HashMap<String, Option<PriceEntry>>,
}

#[derive(Debug, Clone, Deserialize)]
struct PriceEntry {
    price: String,
}

/// Aggregator venue configuration
#[derive(Debug, Clone)]
pub struct AggregatorVenueConfig {
    pub api_url: String,
    pub http_timeout: Duration,
}

impl Default for AggregatorVenueConfig {
    fn default() -> Self {
        Self {
            api_url: JUPITER_API_URL.to_string(),
            http_timeout: Duration::from_secs(10),
        }
    }
}

/// Routes trades through the aggregator
pub struct AggregatorVenue {
    client: Client,
    chain: Arc<ChainClient>,
    config: AggregatorVenueConfig,
}

impl AggregatorVenue {
    pub fn new(chain: Arc<ChainClient>, config: AggregatorVenueConfig) -> Result<Self> {
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

    fn http_error(message: String) -> Error {
        Error::Execution {
            venue: VENUE_NAME.to_string(),
            message,
        }
    }

    async fn quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/swap/v1/quote", self.config.api_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("inputMint", input_mint.to_string()),
                ("outputMint", output_mint.to_string()),
                ("amount", amount.to_string()),
                ("slippageBps", slippage_bps.to_string()),
            ])
            .send()
            .await
            .map_err(|e| Self::http_error(format!("Quote request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::http_error(format!("Quote returned {}: {}", status, body)));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Deserialization(format!("Failed to parse quote: {}", e)))
    }

    async fn swap(
        &self,
        wallet: &SigningWallet,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<String> {
        if amount == 0 {
            return Err(Error::Validation("Swap amount rounds to zero".to_string()));
        }

        let quote = self.quote(input_mint, output_mint, amount, slippage_bps).await?;
        debug!(wallet = %wallet.record.id, input_mint, output_mint, amount, "Quote received");

        let request = SwapRequest {
            quote_response: &quote,
            user_public_key: wallet.pubkey().to_string(),
            wrap_and_unwrap_sol: true,
            dynamic_compute_unit_limit: true,
        };

        let url = format!("{}/swap/v1/swap", self.config.api_url);
        let response: SwapResponse = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::http_error(format!("Swap request failed: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Deserialization(format!("Failed to parse swap response: {}", e)))?;

        if let Some(error) = response.error {
            return Err(Self::http_error(error));
        }

        let encoded = response
            .swap_transaction
            .ok_or_else(|| Self::http_error("No transaction in swap response".to_string()))?;

        let tx_bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::Deserialization(format!("Invalid base64 transaction: {}", e)))?;

        let signature = self
            .chain
            .sign_and_send(VENUE_NAME, &tx_bytes, wallet.keypair())
            .await?;

        info!(
            wallet = %wallet.record.id,
            input_mint,
            output_mint,
            amount,
            signature = %signature,
            "Aggregator swap confirmed"
        );

        Ok(signature)
    }
}

#[async_trait]
impl Venue for AggregatorVenue {
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
        self.swap(
            wallet,
            WSOL_MINT_STR,
            asset_id,
            sol_to_lamports(sol_amount),
            slippage_bps,
        )
        .await
    }

    async fn sell(
        &self,
        wallet: &SigningWallet,
        asset_id: &str,
        token_amount: f64,
        slippage_bps: u16,
    ) -> Result<String> {
        let mint = parse_pubkey(asset_id)?;
        let decimals = self.chain.decimals(&mint).await?;
        let raw = (token_amount * 10f64.powi(decimals as i32)).floor().max(0.0) as u64;
        self.swap(wallet, asset_id, WSOL_MINT_STR, raw, slippage_bps)
            .await
    }

    async fn price(&self, asset_id: &str) -> Result<f64> {
        let url = format!("{}/price/v2", self.config.api_url);
        let response: PriceResponse = self
            .client
            .get(&url)
            .query(&[("ids", asset_id), ("vsToken", WSOL_MINT_STR)])
            .send()
            .await
            .map_err(|e| Error::PriceUnavailable(format!("{}: {}", asset_id, e)))?
            .json()
            .await
            .map_err(|e| Error::PriceUnavailable(format!("{}: {}", asset_id, e)))?;

        parse_price(&response, asset_id)
    }

    async fn token_balance(&self, owner: &Pubkey, asset_id: &str) -> Result<f64> {
        let mint = parse_pubkey(asset_id)?;
        self.chain.token_balance(owner, &mint).await
    }

    async fn sol_balance(&self, owner: &Pubkey) -> Result<f64> {
        self.chain.sol_balance(owner).await
    }
}

fn parse_price(response: &PriceResponse, asset_id: &str) -> Result<f64> {
    let entry = response
        .data
        .get(asset_id)
        .and_then(|e| e.as_ref())
        .ok_or_else(|| Error::PriceUnavailable(asset_id.to_string()))?;

    let price: f64 = entry
        .price
        .parse()
        .map_err(|_| Error::PriceUnavailable(format!("{}: bad price {}", asset_id, entry.price)))?;

    if !price.is_finite() || price <= 0.0 {
        return Err(Error::PriceUnavailable(asset_id.to_string()));
    }
    Ok(price)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_price() {
        let json = r#"{"data":{"MintA":{"id":"MintA","type":"derivedPrice","price":"0.0000321"},"MintB":null}}"#;
        let response: PriceResponse = serde_json::from_str(json).unwrap();

        let price = parse_price(&response, "MintA").unwrap();
        assert!((price - 0.0000321).abs() < 1e-12);
        assert!(matches!(
            parse_price(&response, "MintB"),
            Err(Error::PriceUnavailable(_))
        ));
        assert!(parse_price(&response, "MintC").is_err());
    }

    #[test]
    fn test_swap_request_serialization() {
        let quote = serde_json::json!({"inAmount": "1000"});
        let request = SwapRequest {
            quote_response: &quote,
            user_public_key: "11111111111111111111111111111111".to_string(),
            wrap_and_unwrap_sol: true,
            dynamic_compute_unit_limit: true,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"quoteResponse\":{\"inAmount\":\"1000\"}"));
        assert!(json.contains("\"wrapAndUnwrapSol\":true"));
    }
}
