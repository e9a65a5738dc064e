//! Bonding curve account decoding
//!
//! # WARNING: The account layout may change without notice
//! Pump.fun has modified their account layouts in the past.
//! If decoding fails, the structure below may need updating.

use borsh::{BorshDeserialize, BorshSerialize};
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Pump.fun program ID
pub const PUMP_PROGRAM_ID_STR: &str = "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P";

/// Wrapped SOL mint, used as the quote side on the aggregator
pub const WSOL_MINT_STR: &str = "So11111111111111111111111111111111111111112";

lazy_static::lazy_static! {
    /// Pump.fun program ID as Pubkey
    pub static ref PUMP_PROGRAM_ID: Pubkey =
        Pubkey::from_str(PUMP_PROGRAM_ID_STR).expect("Invalid pump program ID");
}

/// BondingCurve account discriminator (first 8 bytes of account data)
pub const BONDING_CURVE_DISCRIMINATOR: [u8; 8] = [23, 183, 248, 55, 96, 216, 172, 96];

/// Lamports per SOL
pub const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

/// BondingCurve account state
///
/// Newer accounts carry extra trailing fields; only the prefix is decoded.
#[derive(Debug, Clone, BorshDeserialize, BorshSerialize)]
pub struct BondingCurve {
    _discriminator: [u8; 8],

    /// Virtual SOL reserves (lamports) used for pricing
    pub virtual_sol_reserves: u64,

    /// Virtual token reserves (base units) used for pricing
    pub virtual_token_reserves: u64,

    pub real_sol_reserves: u64,

    pub real_token_reserves: u64,

    pub token_total_supply: u64,

    /// Curve completed and liquidity migrated
    pub complete: bool,
}

impl BondingCurve {
    #[cfg(test)]
    pub fn new_for_test(virtual_sol_reserves: u64, virtual_token_reserves: u64, complete: bool) -> Self {
        Self {
            _discriminator: BONDING_CURVE_DISCRIMINATOR,
            virtual_sol_reserves,
            virtual_token_reserves,
            real_sol_reserves: 0,
            real_token_reserves: virtual_token_reserves,
            token_total_supply: 1_000_000_000_000_000,
            complete,
        }
    }

    /// Decode from account data, checking the discriminator
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::BondingCurveDecode(
                "Account data too short".to_string(),
            ));
        }

        if data[..8] != BONDING_CURVE_DISCRIMINATOR {
            return Err(Error::BondingCurveDecode(format!(
                "Wrong discriminator: expected {:?}, got {:?}",
                BONDING_CURVE_DISCRIMINATOR,
                &data[..8]
            )));
        }

        let mut reader = data;
        BorshDeserialize::deserialize(&mut reader)
            .map_err(|e| Error::BondingCurveDecode(format!("Borsh decode failed: {}", e)))
    }

    /// Price in SOL per whole token
    pub fn price_sol(&self, decimals: u8) -> Result<f64> {
        if self.virtual_token_reserves == 0 {
            return Err(Error::BondingCurveDecode(
                "Virtual token reserves are zero".to_string(),
            ));
        }

        let sol = self.virtual_sol_reserves as f64 / LAMPORTS_PER_SOL;
        let tokens = self.virtual_token_reserves as f64 / 10f64.powi(decimals as i32);
        Ok(sol / tokens)
    }
}

/// Derive the bonding curve PDA for a mint
pub fn derive_bonding_curve(mint: &Pubkey) -> Pubkey {
    let seeds = &[b"bonding-curve".as_ref(), mint.as_ref()];
    Pubkey::find_program_address(seeds, &PUMP_PROGRAM_ID).0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(curve: &BondingCurve) -> Vec<u8> {
        borsh::to_vec(curve).unwrap()
    }

    #[test]
    fn test_price_in_sol_per_token() {
        // 30 SOL against 1,000,000,000 whole tokens at 6 decimals
        let curve = BondingCurve::new_for_test(30_000_000_000, 1_000_000_000_000_000, false);
        let price = curve.price_sol(6).unwrap();
        assert!((price - 0.00000003).abs() < 1e-12);
    }

    #[test]
    fn test_decode_ignores_trailing_fields() {
        let curve = BondingCurve::new_for_test(30_000_000_000, 1_000_000_000_000_000, true);
        let mut data = encode(&curve);
        data.extend_from_slice(&[0u8; 32]);

        let decoded = BondingCurve::decode(&data).unwrap();
        assert_eq!(decoded.virtual_sol_reserves, 30_000_000_000);
        assert!(decoded.complete);
    }

    #[test]
    fn test_decode_rejects_wrong_discriminator() {
        let curve = BondingCurve::new_for_test(1, 1, false);
        let mut data = encode(&curve);
        data[0] = 0;
        assert!(matches!(
            BondingCurve::decode(&data),
            Err(Error::BondingCurveDecode(_))
        ));
        assert!(BondingCurve::decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_zero_reserves_is_error() {
        let curve = BondingCurve::new_for_test(1, 0, false);
        assert!(curve.price_sol(6).is_err());
    }

    #[test]
    fn test_pda_deterministic() {
        let mint = Pubkey::new_unique();
        assert_eq!(derive_bonding_curve(&mint), derive_bonding_curve(&mint));
    }
}
