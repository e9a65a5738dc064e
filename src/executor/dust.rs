//! Dust prevention for sells

use serde::{Deserialize, Serialize};

/// Sell amount after dust handling
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DustDecision {
    /// Tokens to sell
    pub amount: f64,
    /// The remainder would have been dust, so the full balance is sold
    pub dust_prevented: bool,
}

/// Decide the sell amount so no unsellable remainder is left behind
///
/// `requested` is clamped to `available`. If the remainder's SOL value
/// (`remaining * price`) is positive but below `floor_sol`, sell everything.
pub fn apply_dust_prevention(available: f64, requested: f64, price: f64, floor_sol: f64) -> DustDecision {
    if available <= 0.0 || requested <= 0.0 {
        return DustDecision {
            amount: 0.0,
            dust_prevented: false,
        };
    }

    if requested >= available {
        return DustDecision {
            amount: available,
            dust_prevented: false,
        };
    }

    let remaining = available - requested;
    let remaining_value = remaining * price.max(0.0);

    if remaining_value < floor_sol {
        DustDecision {
            amount: available,
            dust_prevented: true,
        }
    } else {
        DustDecision {
            amount: requested,
            dust_prevented: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sells_everything_when_remainder_is_dust() {
        // 0.05 tokens left at 0.001 SOL is far below a 0.001 SOL floor
        let decision = apply_dust_prevention(100.0, 99.95, 0.001, 0.001);
        assert_eq!(decision.amount, 100.0);
        assert!(decision.dust_prevented);
    }

    #[test]
    fn test_keeps_meaningful_remainder() {
        let decision = apply_dust_prevention(100.0, 50.0, 0.001, 0.001);
        assert_eq!(decision.amount, 50.0);
        assert!(!decision.dust_prevented);
    }

    #[test]
    fn test_clamps_to_available() {
        let decision = apply_dust_prevention(10.0, 25.0, 0.5, 0.001);
        assert_eq!(decision.amount, 10.0);
        assert!(!decision.dust_prevented);
    }

    #[test]
    fn test_nothing_to_sell() {
        let decision = apply_dust_prevention(0.0, 5.0, 1.0, 0.001);
        assert_eq!(decision.amount, 0.0);
    }
}
