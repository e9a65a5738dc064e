//! Feed message normalization
//!
//! Raw trade notifications become [`NormalizedTransaction`]s; consecutive
//! trade-implied prices are diffed into [`PriceChange`] events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Trade notification from the feed
///
/// Amounts arrive in whole tokens and SOL.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedTrade {
    pub signature: String,
    pub mint: String,
    pub trader_public_key: String,
    pub tx_type: String,
    #[serde(default)]
    pub token_amount: f64,
    #[serde(default)]
    pub sol_amount: f64,
    #[serde(default)]
    pub bonding_curve_key: Option<String>,
    #[serde(default)]
    pub v_tokens_in_bonding_curve: Option<f64>,
    #[serde(default)]
    pub v_sol_in_bonding_curve: Option<f64>,
    #[serde(default)]
    pub market_cap_sol: Option<f64>,
    /// Present on transfer notifications
    #[serde(default)]
    pub to: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Buy,
    Sell,
    Transfer,
    Unknown,
}

impl TransactionKind {
    fn from_tx_type(tx_type: &str) -> Self {
        match tx_type.to_lowercase().as_str() {
            "buy" => TransactionKind::Buy,
            "sell" => TransactionKind::Sell,
            "transfer" => TransactionKind::Transfer,
            _ => TransactionKind::Unknown,
        }
    }
}

/// Feed transaction in a fixed shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTransaction {
    pub signature: String,
    pub asset_id: String,
    pub kind: TransactionKind,
    pub trader: String,
    pub accounts: Vec<String>,
    /// Token change for the trader (positive on buy)
    pub token_delta: f64,
    /// SOL change for the trader (negative on buy)
    pub sol_delta: f64,
    pub is_own_wallet: bool,
    /// SOL per token implied by the trade
    pub implied_price: Option<f64>,
    pub received_at: DateTime<Utc>,
}

/// Normalize one trade notification
pub fn normalize_trade(trade: &FeedTrade, own_wallets: &HashSet<String>) -> NormalizedTransaction {
    let kind = TransactionKind::from_tx_type(&trade.tx_type);

    let (token_delta, sol_delta) = match kind {
        TransactionKind::Buy => (trade.token_amount, -trade.sol_amount),
        TransactionKind::Sell => (-trade.token_amount, trade.sol_amount),
        TransactionKind::Transfer => (-trade.token_amount, 0.0),
        TransactionKind::Unknown => (0.0, 0.0),
    };

    let mut accounts = vec![trade.trader_public_key.clone()];
    if let Some(curve) = &trade.bonding_curve_key {
        accounts.push(curve.clone());
    }
    if let Some(to) = &trade.to {
        accounts.push(to.clone());
    }

    let is_own_wallet = accounts.iter().any(|a| own_wallets.contains(a));

    NormalizedTransaction {
        signature: trade.signature.clone(),
        asset_id: trade.mint.clone(),
        kind,
        trader: trade.trader_public_key.clone(),
        accounts,
        token_delta,
        sol_delta,
        is_own_wallet,
        implied_price: implied_price(trade, kind),
        received_at: Utc::now(),
    }
}

/// Execution price of a buy/sell, else the curve's virtual reserve ratio
fn implied_price(trade: &FeedTrade, kind: TransactionKind) -> Option<f64> {
    if matches!(kind, TransactionKind::Buy | TransactionKind::Sell)
        && trade.token_amount > 0.0
        && trade.sol_amount > 0.0
    {
        return Some(trade.sol_amount / trade.token_amount);
    }

    match (trade.v_sol_in_bonding_curve, trade.v_tokens_in_bonding_curve) {
        (Some(sol), Some(tokens)) if sol > 0.0 && tokens > 0.0 => Some(sol / tokens),
        _ => None,
    }
}

/// Change between consecutive trade-implied prices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceChange {
    pub asset_id: String,
    pub previous: f64,
    pub current: f64,
    pub change_pct: f64,
    pub observed_at: DateTime<Utc>,
}

/// Diffs consecutive prices
#[derive(Debug, Default)]
pub struct PriceTracker {
    last: Option<f64>,
}

impl PriceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a price; returns a change when it differs from the previous one
    pub fn observe(&mut self, asset_id: &str, price: f64) -> Option<PriceChange> {
        if !price.is_finite() || price <= 0.0 {
            return None;
        }

        let previous = self.last.replace(price)?;
        if (price - previous).abs() <= f64::EPSILON * previous {
            return None;
        }

        Some(PriceChange {
            asset_id: asset_id.to_string(),
            previous,
            current: price,
            change_pct: (price - previous) / previous * 100.0,
            observed_at: Utc::now(),
        })
    }

    pub fn last(&self) -> Option<f64> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(tx_type: &str, trader: &str, tokens: f64, sol: f64) -> FeedTrade {
        let json = serde_json::json!({
            "signature": "sig",
            "mint": "MintPump",
            "traderPublicKey": trader,
            "txType": tx_type,
            "tokenAmount": tokens,
            "solAmount": sol,
            "bondingCurveKey": "Curve",
            "vTokensInBondingCurve": 1000.0,
            "vSolInBondingCurve": 30.0,
            "marketCapSol": 30.0
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_normalize_buy() {
        let own: HashSet<String> = ["Me".to_string()].into_iter().collect();
        let tx = normalize_trade(&trade("buy", "Me", 1000.0, 0.5), &own);

        assert_eq!(tx.kind, TransactionKind::Buy);
        assert!(tx.is_own_wallet);
        assert_eq!(tx.token_delta, 1000.0);
        assert_eq!(tx.sol_delta, -0.5);
        assert_eq!(tx.implied_price, Some(0.0005));
        assert_eq!(tx.accounts, vec!["Me".to_string(), "Curve".to_string()]);
    }

    #[test]
    fn test_normalize_foreign_sell() {
        let own = HashSet::new();
        let tx = normalize_trade(&trade("sell", "Other", 200.0, 0.1), &own);
        assert_eq!(tx.kind, TransactionKind::Sell);
        assert!(!tx.is_own_wallet);
        assert_eq!(tx.token_delta, -200.0);
    }

    #[test]
    fn test_unknown_type_uses_curve_price() {
        let tx = normalize_trade(&trade("create", "Dev", 0.0, 0.0), &HashSet::new());
        assert_eq!(tx.kind, TransactionKind::Unknown);
        assert_eq!(tx.implied_price, Some(0.03));
    }

    #[test]
    fn test_integer_amounts_accepted() {
        let json = r#"{"signature":"s","mint":"m","traderPublicKey":"t","txType":"buy","tokenAmount":1000,"solAmount":1}"#;
        let trade: FeedTrade = serde_json::from_str(json).unwrap();
        assert_eq!(trade.token_amount, 1000.0);
    }

    #[test]
    fn test_price_tracker_diffs() {
        let mut tracker = PriceTracker::new();
        assert!(tracker.observe("m", 1.0).is_none());
        assert!(tracker.observe("m", 1.0).is_none());

        let change = tracker.observe("m", 1.1).unwrap();
        assert_eq!(change.previous, 1.0);
        assert!((change.change_pct - 10.0).abs() < 1e-9);

        assert!(tracker.observe("m", f64::NAN).is_none());
        assert_eq!(tracker.last(), Some(1.1));
    }
}
