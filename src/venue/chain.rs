//! Shared chain access for venues and fee collection
//!
//! Wraps the nonblocking RPC client: balances, mint decimals, signing and
//! submitting venue-built transactions, and plain SOL transfers.

use dashmap::DashMap;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    pubkey::Pubkey,
    signature::Keypair,
    signer::Signer,
    system_instruction,
    transaction::{Transaction, VersionedTransaction},
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::curve::LAMPORTS_PER_SOL;

/// Default decimals for pump.fun tokens
pub const DEFAULT_DECIMALS: u8 = 6;

/// Offset of `decimals` in an SPL mint account
const MINT_DECIMALS_OFFSET: usize = 44;

/// Offset of `amount` in an SPL token account
const TOKEN_AMOUNT_OFFSET: usize = 64;

pub fn sol_to_lamports(sol: f64) -> u64 {
    (sol * LAMPORTS_PER_SOL).round().max(0.0) as u64
}

pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL
}

/// Parse a base58 address
pub fn parse_pubkey(value: &str) -> Result<Pubkey> {
    Pubkey::from_str(value).map_err(|e| Error::Validation(format!("Invalid address {}: {}", value, e)))
}

/// Map a send failure to slippage when the program reported it
fn send_error(venue: &str, message: String) -> Error {
    let lower = message.to_lowercase();
    if lower.contains("slippage") || lower.contains("toomuchsolrequired") || lower.contains("0x1772") {
        Error::SlippageExceeded(message)
    } else {
        Error::Execution {
            venue: venue.to_string(),
            message,
        }
    }
}

/// RPC-backed chain client
pub struct ChainClient {
    rpc: Arc<RpcClient>,
    decimals_cache: DashMap<Pubkey, u8>,
}

impl ChainClient {
    pub fn new(rpc_url: &str, timeout: Duration) -> Self {
        let rpc = RpcClient::new_with_timeout_and_commitment(
            rpc_url.to_string(),
            timeout,
            CommitmentConfig::confirmed(),
        );
        Self {
            rpc: Arc::new(rpc),
            decimals_cache: DashMap::new(),
        }
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// Raw account data, None if the account does not exist
    pub async fn account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>> {
        let response = self
            .rpc
            .get_account_with_commitment(address, CommitmentConfig::confirmed())
            .await?;
        Ok(response.value.map(|account| account.data))
    }

    /// SOL balance of an address
    pub async fn sol_balance(&self, owner: &Pubkey) -> Result<f64> {
        let lamports = self.rpc.get_balance(owner).await?;
        Ok(lamports_to_sol(lamports))
    }

    /// Mint decimals, cached per mint
    pub async fn decimals(&self, mint: &Pubkey) -> Result<u8> {
        if let Some(decimals) = self.decimals_cache.get(mint) {
            return Ok(*decimals);
        }

        let data = self
            .account_data(mint)
            .await?
            .ok_or_else(|| Error::Rpc(format!("Mint account {} not found", mint)))?;

        if data.len() <= MINT_DECIMALS_OFFSET {
            return Err(Error::Rpc("Mint account data too short".to_string()));
        }

        let decimals = data[MINT_DECIMALS_OFFSET];
        self.decimals_cache.insert(*mint, decimals);
        Ok(decimals)
    }

    /// Token balance held in the owner's associated token account (whole tokens)
    pub async fn token_balance(&self, owner: &Pubkey, mint: &Pubkey) -> Result<f64> {
        let ata = spl_associated_token_account::get_associated_token_address(owner, mint);

        let data = match self.account_data(&ata).await? {
            Some(data) => data,
            None => return Ok(0.0),
        };

        if data.len() < TOKEN_AMOUNT_OFFSET + 8 {
            return Err(Error::Rpc("Token account data too short".to_string()));
        }

        let mut raw = [0u8; 8];
        raw.copy_from_slice(&data[TOKEN_AMOUNT_OFFSET..TOKEN_AMOUNT_OFFSET + 8]);
        let amount = u64::from_le_bytes(raw);

        let decimals = self.decimals(mint).await?;
        Ok(amount as f64 / 10f64.powi(decimals as i32))
    }

    /// Sign a venue-built, bincode-serialized transaction and submit it
    pub async fn sign_and_send(&self, venue: &str, tx_bytes: &[u8], signer: &Keypair) -> Result<String> {
        let unsigned: VersionedTransaction = bincode::deserialize(tx_bytes)
            .map_err(|e| Error::Deserialization(format!("Invalid transaction from {}: {}", venue, e)))?;

        let signed = VersionedTransaction::try_new(unsigned.message, &[signer]).map_err(|e| {
            Error::Execution {
                venue: venue.to_string(),
                message: format!("Signing failed: {}", e),
            }
        })?;

        debug!(venue = %venue, signer = %signer.pubkey(), "Submitting transaction");

        let signature = self
            .rpc
            .send_and_confirm_transaction(&signed)
            .await
            .map_err(|e| send_error(venue, e.to_string()))?;

        Ok(signature.to_string())
    }

    /// Transfer SOL from a signer
    pub async fn transfer_sol(&self, from: &Keypair, to: &Pubkey, lamports: u64) -> Result<String> {
        let instruction = system_instruction::transfer(&from.pubkey(), to, lamports);

        let blockhash = self.rpc.get_latest_blockhash().await?;

        let transaction = Transaction::new_signed_with_payer(
            &[instruction],
            Some(&from.pubkey()),
            &[from],
            blockhash,
        );

        let signature = self
            .rpc
            .send_and_confirm_transaction(&transaction)
            .await
            .map_err(|e| send_error("transfer", e.to_string()))?;

        info!(
            "Transfer complete: {} lamports to {} (sig: {})",
            lamports, to, signature
        );

        Ok(signature.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lamport_conversion() {
        assert_eq!(sol_to_lamports(1.5), 1_500_000_000);
        assert_eq!(sol_to_lamports(-1.0), 0);
        assert!((lamports_to_sol(250_000_000) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_send_error_classifies_slippage() {
        assert!(matches!(
            send_error("bonding_curve", "custom program error: 0x1772".to_string()),
            Error::SlippageExceeded(_)
        ));
        assert!(matches!(
            send_error("bonding_curve", "blockhash not found".to_string()),
            Error::Execution { .. }
        ));
    }

    #[test]
    fn test_parse_pubkey() {
        assert!(parse_pubkey("11111111111111111111111111111111").is_ok());
        assert!(matches!(parse_pubkey("not-a-key"), Err(Error::Validation(_))));
    }
}
