//! Randomization Module
//!
//! Unpredictable wallet order, slice sizes and trade timing.
//! Seedable so tests can pin the sequence.

use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Randomization configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomizationConfig {
    pub enabled: bool,

    // Inter-trade delay for sequential entries
    pub trade_delay_min_ms: u64,
    pub trade_delay_max_ms: u64,

    // Per-entry amount jitter (applied by the executor, downward only)
    pub amount_jitter_pct: f64,

    // Scheduler timing
    pub vary_interval: bool,
    pub interval_jitter_pct: f64,

    /// Fixed seed for the scheduler and executor randomizers
    pub seed: Option<u64>,
}

impl Default for RandomizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trade_delay_min_ms: 500,
            trade_delay_max_ms: 3000,
            amount_jitter_pct: 0.0,
            vary_interval: true,
            interval_jitter_pct: 15.0,
            seed: None,
        }
    }
}

impl RandomizationConfig {
    pub fn validate(&self) -> Result<()> {
        let jitters = [
            ("amount_jitter_pct", self.amount_jitter_pct),
            ("interval_jitter_pct", self.interval_jitter_pct),
        ];
        for (name, value) in jitters {
            if !value.is_finite() || !(0.0..100.0).contains(&value) {
                return Err(Error::Validation(format!("{} must be within [0, 100), got {}", name, value)));
            }
        }

        if self.trade_delay_min_ms > self.trade_delay_max_ms {
            return Err(Error::Validation(format!(
                "trade_delay_min_ms ({}) exceeds trade_delay_max_ms ({})",
                self.trade_delay_min_ms, self.trade_delay_max_ms
            )));
        }

        Ok(())
    }
}

/// Jitter fraction in [0, 0.99]; NaN counts as none
fn jitter_fraction(pct: f64) -> f64 {
    if pct.is_nan() {
        return 0.0;
    }
    (pct / 100.0).clamp(0.0, 0.99)
}

/// Randomizer for wallet ordering and timing
pub struct Randomizer {
    config: RandomizationConfig,
    rng: StdRng,
}

impl Randomizer {
    /// Create a new randomizer with optional seed
    pub fn new(config: RandomizationConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    /// Create randomizer from entropy (random seed)
    pub fn from_entropy(config: RandomizationConfig) -> Self {
        Self::new(config, None)
    }

    pub fn config(&self) -> &RandomizationConfig {
        &self.config
    }

    /// Shuffle in place
    ///
    /// Shuffling is part of allocation, so it happens even when timing
    /// jitter is disabled.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }

    /// Split `total` into `parts` random positive slices summing to `total`
    ///
    /// Draws `parts - 1` cut points in (0, total), sorts them and uses the
    /// consecutive differences as slice sizes.
    pub fn partition(&mut self, total: f64, parts: usize) -> Vec<f64> {
        if parts == 0 {
            return Vec::new();
        }
        if parts == 1 || total <= 0.0 {
            return vec![total / parts as f64; parts];
        }

        let mut cuts: Vec<f64> = (0..parts - 1)
            .map(|_| self.rng.gen_range(0.0..total))
            .collect();
        cuts.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mut slices = Vec::with_capacity(parts);
        let mut previous = 0.0;
        for cut in cuts {
            slices.push(cut - previous);
            previous = cut;
        }
        slices.push(total - previous);
        slices
    }

    /// Pick `count` distinct indices out of `len`
    pub fn sample_indices(&mut self, len: usize, count: usize) -> Vec<usize> {
        rand::seq::index::sample(&mut self.rng, len, count.min(len)).into_vec()
    }

    /// Randomized delay between sequential trades
    pub fn jitter_trade_delay(&mut self) -> Duration {
        if !self.config.enabled {
            return Duration::ZERO;
        }

        let min = self.config.trade_delay_min_ms;
        let max = self.config.trade_delay_max_ms.max(min);
        Duration::from_millis(self.rng.gen_range(min..=max))
    }

    /// Randomize a trade amount
    ///
    /// Only scales down, so a batch never exceeds its planned volume.
    pub fn jitter_amount(&mut self, base: f64) -> f64 {
        let jitter = jitter_fraction(self.config.amount_jitter_pct);
        if !self.config.enabled || jitter == 0.0 {
            return base;
        }

        let factor = self.rng.gen_range((1.0 - jitter)..=1.0);
        base * factor
    }

    /// Randomize the scheduler interval
    pub fn jitter_interval(&mut self, base_interval: Duration) -> Duration {
        if !self.config.enabled || !self.config.vary_interval {
            return base_interval;
        }

        let jitter = jitter_fraction(self.config.interval_jitter_pct);
        if jitter == 0.0 {
            return base_interval;
        }

        let factor = self.rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_secs_f64(base_interval.as_secs_f64() * factor)
    }
}

impl Default for Randomizer {
    fn default() -> Self {
        Self::from_entropy(RandomizationConfig::default())
    }
}
