//! Core wallet types
//!
//! `WalletRecord` is the read-only view the engine plans with;
//! `SigningWallet` is the short-lived signing capability handed out by custody.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Wallet as seen by planning: identity, owner, public address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WalletRecord {
    /// Unique identifier
    pub id: String,
    /// Owning user
    pub owner_id: String,
    /// Base58 public address
    pub address: String,
}

impl WalletRecord {
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            address: address.into(),
        }
    }

    /// Parse the public address
    pub fn pubkey(&self) -> Result<Pubkey> {
        Pubkey::from_str(&self.address)
            .map_err(|e| Error::Validation(format!("Invalid address for {}: {}", self.id, e)))
    }
}

/// Signing capability for one wallet, valid for one execution batch
#[derive(Clone)]
pub struct SigningWallet {
    pub record: WalletRecord,
    keypair: Arc<Keypair>,
}

impl SigningWallet {
    pub fn new(record: WalletRecord, keypair: Keypair) -> Self {
        Self {
            record,
            keypair: Arc::new(keypair),
        }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl std::fmt::Debug for SigningWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningWallet")
            .field("record", &self.record)
            .field("keypair", &"<redacted>")
            .finish()
    }
}

/// Wallet entry from the wallets.json registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletEntry {
    /// Unique identifier: "vol-01"
    pub id: String,

    /// Owning user id
    pub owner: String,

    /// Public address; must match the keypair
    pub address: String,

    /// Path to keypair file (relative to the credentials directory)
    pub keypair_path: PathBuf,

    /// Disabled wallets are never listed or resolved
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// When the wallet was added
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl WalletEntry {
    pub fn record(&self) -> WalletRecord {
        WalletRecord::new(&self.id, &self.owner, &self.address)
    }
}

/// Wallet registry file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRegistry {
    /// Registry format version
    #[serde(default = "default_version")]
    pub version: String,

    /// List of wallet entries
    pub wallets: Vec<WalletEntry>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for WalletRegistry {
    fn default() -> Self {
        Self {
            version: default_version(),
            wallets: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signing_wallet_debug_redacts() {
        let keypair = Keypair::new();
        let record = WalletRecord::new("w1", "u1", keypair.pubkey().to_string());
        let wallet = SigningWallet::new(record, keypair);
        let text = format!("{:?}", wallet);
        assert!(text.contains("<redacted>"));
        assert_eq!(wallet.record.pubkey().unwrap(), wallet.pubkey());
    }

    #[test]
    fn test_registry_parse_defaults() {
        let json = r#"{
            "wallets": [
                {"id": "vol-01", "owner": "user-1", "address": "11111111111111111111111111111111", "keypair_path": "keys/vol-01.json"}
            ]
        }"#;
        let registry: WalletRegistry = serde_json::from_str(json).unwrap();
        assert_eq!(registry.version, "1.0");
        assert!(registry.wallets[0].enabled);
        assert_eq!(registry.wallets[0].record().owner_id, "user-1");
    }
}
