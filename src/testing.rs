//! Deterministic doubles for the venue, custody and fee seams

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::executor::fees::{FeeCollector, FeeOutcome};
use crate::venue::Venue;
use crate::wallet::{SigningWallet, WalletCustody, WalletRecord};

#[derive(Debug, Clone, PartialEq)]
pub enum VenueCall {
    Buy { wallet_id: String, sol: f64 },
    Sell { wallet_id: String, tokens: f64 },
}

/// Scripted venue with in-memory balances
pub struct MockVenue {
    name: &'static str,
    price: Mutex<f64>,
    tokens: DashMap<Pubkey, f64>,
    sol: DashMap<Pubkey, f64>,
    failing_wallets: DashSet<String>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<VenueCall>>,
    counter: AtomicU64,
}

impl MockVenue {
    pub fn new(name: &'static str, price: f64) -> Self {
        Self {
            name,
            price: Mutex::new(price),
            tokens: DashMap::new(),
            sol: DashMap::new(),
            failing_wallets: DashSet::new(),
            delay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }

    pub fn set_price(&self, price: f64) {
        *self.price.lock().unwrap() = price;
    }

    pub fn set_tokens(&self, owner: &Pubkey, amount: f64) {
        self.tokens.insert(*owner, amount);
    }

    pub fn set_sol(&self, owner: &Pubkey, amount: f64) {
        self.sol.insert(*owner, amount);
    }

    pub fn tokens_of(&self, owner: &Pubkey) -> f64 {
        self.tokens.get(owner).map(|v| *v).unwrap_or(0.0)
    }

    pub fn fail_wallet(&self, wallet_id: &str) {
        self.failing_wallets.insert(wallet_id.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<VenueCall> {
        self.calls.lock().unwrap().clone()
    }

    async fn maybe_fail(&self, wallet: &SigningWallet) -> Result<()> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_wallets.contains(&wallet.record.id) {
            return Err(Error::Execution {
                venue: self.name.to_string(),
                message: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    fn signature(&self) -> String {
        format!("{}-sig-{}", self.name, self.counter.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl Venue for MockVenue {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn buy(&self, wallet: &SigningWallet, _asset_id: &str, sol_amount: f64, _slippage_bps: u16) -> Result<String> {
        self.maybe_fail(wallet).await?;
        let price = *self.price.lock().unwrap();
        *self.tokens.entry(wallet.pubkey()).or_insert(0.0) += sol_amount / price;
        *self.sol.entry(wallet.pubkey()).or_insert(0.0) -= sol_amount;
        self.calls.lock().unwrap().push(VenueCall::Buy {
            wallet_id: wallet.record.id.clone(),
            sol: sol_amount,
        });
        Ok(self.signature())
    }

    async fn sell(&self, wallet: &SigningWallet, _asset_id: &str, token_amount: f64, _slippage_bps: u16) -> Result<String> {
        self.maybe_fail(wallet).await?;
        let price = *self.price.lock().unwrap();
        let mut held = self.tokens.entry(wallet.pubkey()).or_insert(0.0);
        let sold = token_amount.min(*held);
        *held -= sold;
        drop(held);
        *self.sol.entry(wallet.pubkey()).or_insert(0.0) += sold * price;
        self.calls.lock().unwrap().push(VenueCall::Sell {
            wallet_id: wallet.record.id.clone(),
            tokens: token_amount,
        });
        Ok(self.signature())
    }

    async fn price(&self, asset_id: &str) -> Result<f64> {
        let price = *self.price.lock().unwrap();
        if price <= 0.0 {
            return Err(Error::PriceUnavailable(asset_id.to_string()));
        }
        Ok(price)
    }

    async fn token_balance(&self, owner: &Pubkey, _asset_id: &str) -> Result<f64> {
        Ok(self.tokens_of(owner))
    }

    async fn sol_balance(&self, owner: &Pubkey) -> Result<f64> {
        Ok(self.sol.get(owner).map(|v| *v).unwrap_or(10.0))
    }
}

/// In-memory custody with real keypairs
pub struct MockCustody {
    wallets: HashMap<String, (WalletRecord, Keypair)>,
    denied: DashSet<String>,
}

impl MockCustody {
    /// `count` wallets owned by `owner`, ids w0..wN
    pub fn with_wallets(owner: &str, count: usize) -> Self {
        let wallets = (0..count)
            .map(|i| {
                let keypair = Keypair::new();
                let record = WalletRecord::new(format!("w{}", i), owner, keypair.pubkey().to_string());
                (record.id.clone(), (record, keypair))
            })
            .collect();
        Self {
            wallets,
            denied: DashSet::new(),
        }
    }

    pub fn records(&self) -> Vec<WalletRecord> {
        let mut records: Vec<WalletRecord> = self.wallets.values().map(|(r, _)| r.clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn pubkey(&self, wallet_id: &str) -> Pubkey {
        self.wallets[wallet_id].1.pubkey()
    }

    pub fn deny(&self, wallet_id: &str) {
        self.denied.insert(wallet_id.to_string());
    }
}

#[async_trait]
impl WalletCustody for MockCustody {
    async fn list_wallets(&self, user_id: &str) -> Result<Vec<WalletRecord>> {
        Ok(self
            .records()
            .into_iter()
            .filter(|r| r.owner_id == user_id)
            .collect())
    }

    async fn authorize_session(&self, _session_id: &str, _user_id: &str) -> Result<()> {
        Ok(())
    }

    async fn revoke_session(&self, _session_id: &str) {}

    async fn resolve(&self, wallet_id: &str, user_id: &str, _session_id: &str) -> Result<Option<SigningWallet>> {
        if self.denied.contains(wallet_id) {
            return Ok(None);
        }
        Ok(self
            .wallets
            .get(wallet_id)
            .filter(|(record, _)| record.owner_id == user_id)
            .map(|(record, keypair)| SigningWallet::new(record.clone(), keypair.insecure_clone())))
    }
}

/// Fee collector that records notionals
pub struct RecordingFees {
    fee_bps: u16,
    fail: AtomicBool,
    collected: Mutex<Vec<f64>>,
}

impl RecordingFees {
    pub fn new(fee_bps: u16) -> Self {
        Self {
            fee_bps,
            fail: AtomicBool::new(false),
            collected: Mutex::new(Vec::new()),
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn collected(&self) -> Vec<f64> {
        self.collected.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeeCollector for RecordingFees {
    async fn collect(&self, _signer: &SigningWallet, notional_sol: f64, _referrer: Option<&str>) -> Result<FeeOutcome> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Execution {
                venue: "fees".to_string(),
                message: "scripted fee failure".to_string(),
            });
        }
        let fee = notional_sol * self.fee_bps as f64 / 10_000.0;
        self.collected.lock().unwrap().push(notional_sol);
        Ok(FeeOutcome {
            success: true,
            fee_amount: fee,
            referrer_amount: 0.0,
            signature: Some("fee-sig".to_string()),
        })
    }
}
