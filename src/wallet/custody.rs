//! Wallet custody
//!
//! Resolves signing capability for a wallet only after proving that the
//! wallet belongs to the requesting user and that the session is authorized
//! to sign for that user. Every mismatch fails closed.

use async_trait::async_trait;
use dashmap::DashMap;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::types::{SigningWallet, WalletEntry, WalletRecord, WalletRegistry};

/// Custody collaborator
#[async_trait]
pub trait WalletCustody: Send + Sync {
    /// Wallets owned by a user
    async fn list_wallets(&self, user_id: &str) -> Result<Vec<WalletRecord>>;

    /// Allow a session to sign for a user's wallets
    async fn authorize_session(&self, session_id: &str, user_id: &str) -> Result<()>;

    /// Withdraw a session's signing authorization
    async fn revoke_session(&self, session_id: &str);

    /// Signing capability, or None on any ownership mismatch
    async fn resolve(
        &self,
        wallet_id: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<SigningWallet>>;
}

/// File-backed custody using a wallets.json registry
///
/// Keypairs are read from disk on every resolve and never cached.
pub struct FileCustody {
    credentials_dir: PathBuf,
    wallets: HashMap<String, WalletEntry>,
    /// session id -> user id
    sessions: DashMap<String, String>,
}

impl FileCustody {
    /// Load the registry from `<credentials_dir>/wallets.json`
    pub fn load(credentials_dir: &Path) -> Result<Self> {
        let wallets_path = credentials_dir.join("wallets.json");

        let registry = if wallets_path.exists() {
            let content = std::fs::read_to_string(&wallets_path)
                .map_err(|e| Error::Config(format!("Failed to read wallets.json: {}", e)))?;

            serde_json::from_str::<WalletRegistry>(&content)
                .map_err(|e| Error::Config(format!("Failed to parse wallets.json: {}", e)))?
        } else {
            warn!("wallets.json not found, custody has no wallets");
            WalletRegistry::default()
        };

        Ok(Self::from_registry(credentials_dir, registry))
    }

    pub fn from_registry(credentials_dir: &Path, registry: WalletRegistry) -> Self {
        let wallets: HashMap<String, WalletEntry> = registry
            .wallets
            .into_iter()
            .map(|w| (w.id.clone(), w))
            .collect();

        info!("Loaded {} wallet entries", wallets.len());

        Self {
            credentials_dir: credentials_dir.to_path_buf(),
            wallets,
            sessions: DashMap::new(),
        }
    }

    fn session_owner(&self, session_id: &str) -> Option<String> {
        self.sessions.get(session_id).map(|u| u.value().clone())
    }

    async fn read_keypair(&self, entry: &WalletEntry) -> Result<Keypair> {
        let full_path = if entry.keypair_path.is_absolute() {
            entry.keypair_path.clone()
        } else {
            self.credentials_dir.join(&entry.keypair_path)
        };

        debug!("Loading keypair for {} from {:?}", entry.id, full_path);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = tokio::fs::metadata(&full_path).await {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    return Err(Error::InsecureKeypair(format!(
                        "Keypair {} has insecure permissions {:o}. Run 'chmod 600 {}'",
                        entry.id,
                        mode & 0o777,
                        full_path.display()
                    )));
                }
            }
        }

        let keypair_bytes = tokio::fs::read(&full_path).await.map_err(|e| {
            Error::InvalidKeypair(format!("Failed to read keypair for {}: {}", entry.id, e))
        })?;

        let keypair_json: Vec<u8> = serde_json::from_slice(&keypair_bytes).map_err(|e| {
            Error::InvalidKeypair(format!("Failed to parse keypair for {}: {}", entry.id, e))
        })?;

        Keypair::from_bytes(&keypair_json)
            .map_err(|e| Error::InvalidKeypair(format!("Invalid keypair for {}: {}", entry.id, e)))
    }
}

#[async_trait]
impl WalletCustody for FileCustody {
    async fn list_wallets(&self, user_id: &str) -> Result<Vec<WalletRecord>> {
        let mut wallets: Vec<WalletRecord> = self
            .wallets
            .values()
            .filter(|w| w.enabled && w.owner == user_id)
            .map(|w| w.record())
            .collect();
        wallets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(wallets)
    }

    async fn authorize_session(&self, session_id: &str, user_id: &str) -> Result<()> {
        if let Some(existing) = self.session_owner(session_id) {
            if existing != user_id {
                return Err(Error::Authorization {
                    wallet_id: "*".to_string(),
                    session_id: session_id.to_string(),
                });
            }
        }
        self.sessions
            .insert(session_id.to_string(), user_id.to_string());
        info!(session_id = %session_id, user_id = %user_id, "Session authorized for signing");
        Ok(())
    }

    async fn revoke_session(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            info!(session_id = %session_id, "Session signing authorization revoked");
        }
    }

    async fn resolve(
        &self,
        wallet_id: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<SigningWallet>> {
        match self.session_owner(session_id) {
            Some(owner) if owner == user_id => {}
            _ => {
                warn!(session_id = %session_id, wallet_id = %wallet_id, "Session not authorized for user");
                return Ok(None);
            }
        }

        let entry = match self.wallets.get(wallet_id) {
            Some(entry) if entry.enabled && entry.owner == user_id => entry,
            _ => {
                warn!(wallet_id = %wallet_id, user_id = %user_id, "Wallet not owned by user");
                return Ok(None);
            }
        };

        let keypair = self.read_keypair(entry).await?;
        if keypair.pubkey().to_string() != entry.address {
            warn!(
                wallet_id = %wallet_id,
                "Keypair does not match registered address"
            );
            return Ok(None);
        }

        Ok(Some(SigningWallet::new(entry.record(), keypair)))
    }
}
