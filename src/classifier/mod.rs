//! Market status classifier
//!
//! Derives the market phase and protocol state for a tracked asset from
//! metrics updates and maps them to the allocation strategy.
//!
//! Status updates are debounced: a new status is only broadcast when phase,
//! state or strategy changed, or when the configured emit interval elapsed.

pub mod platform;
pub mod types;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub use platform::{ExternalPlatform, Platform};
pub use types::{
    ClassifierConfig, ClassifierStatus, MarketPhase, MetricsSnapshot, ProtocolState, RawMetrics,
    Strategy,
};

/// Per-asset tracking state
struct TrackedAsset {
    config: ClassifierConfig,
    current: ClassifierStatus,
    last_emitted: Option<ClassifierStatus>,
    last_emit_at: Option<Instant>,
}

/// Status classifier for all engaged assets
pub struct StatusClassifier {
    default_config: ClassifierConfig,
    tracked: DashMap<String, TrackedAsset>,
    /// asset -> time the emergency flag was raised (sticky)
    emergency: DashMap<String, DateTime<Utc>>,
    status_tx: broadcast::Sender<ClassifierStatus>,
}

impl StatusClassifier {
    pub fn new(default_config: ClassifierConfig) -> Self {
        let (status_tx, _) = broadcast::channel(256);
        Self {
            default_config,
            tracked: DashMap::new(),
            emergency: DashMap::new(),
            status_tx,
        }
    }

    /// Start tracking an asset, or return the existing status if already tracked
    pub fn engage(&self, asset_id: &str, config: Option<ClassifierConfig>) -> ClassifierStatus {
        let slot = match self.tracked.entry(asset_id.to_string()) {
            Entry::Occupied(existing) => {
                debug!(asset = %asset_id, "Classifier already engaged");
                return existing.get().current.clone();
            }
            Entry::Vacant(slot) => slot,
        };

        let config = config.unwrap_or_else(|| self.default_config.clone());
        let status = Self::classify(asset_id, &MetricsSnapshot::default(), &config);
        slot.insert(TrackedAsset {
            config,
            current: status.clone(),
            last_emitted: None,
            last_emit_at: None,
        });

        info!(
            asset = %asset_id,
            phase = %status.phase,
            strategy = %status.strategy,
            "Classifier engaged"
        );
        status
    }

    /// Stop tracking an asset. Returns false if it was not tracked.
    pub fn disengage(&self, asset_id: &str) -> bool {
        let removed = self.tracked.remove(asset_id).is_some();
        if removed {
            info!(asset = %asset_id, "Classifier disengaged");
        }
        removed
    }

    pub fn is_engaged(&self, asset_id: &str) -> bool {
        self.tracked.contains_key(asset_id)
    }

    /// Feed a metrics update. Returns the status if one was emitted.
    pub fn update_metrics(
        &self,
        asset_id: &str,
        raw: &RawMetrics,
    ) -> Result<Option<ClassifierStatus>> {
        let mut entry = self
            .tracked
            .get_mut(asset_id)
            .ok_or_else(|| Error::Validation(format!("Asset {} is not engaged", asset_id)))?;

        let snapshot = MetricsSnapshot::from(raw);
        let status = Self::classify(asset_id, &snapshot, &entry.config);
        entry.current = status.clone();

        let now = Instant::now();
        let interval = Duration::from_millis(entry.config.emit_interval_ms);
        let should_emit = match (&entry.last_emitted, entry.last_emit_at) {
            (Some(previous), Some(at)) => {
                status.materially_differs(previous) || now.duration_since(at) >= interval
            }
            _ => true,
        };

        if !should_emit {
            debug!(asset = %asset_id, "Classifier status unchanged, not emitting");
            return Ok(None);
        }

        if let Some(previous) = &entry.last_emitted {
            if status.materially_differs(previous) {
                info!(
                    asset = %asset_id,
                    phase = %status.phase,
                    state = %status.protocol_state,
                    strategy = %status.strategy,
                    "Market status changed"
                );
            }
        }

        entry.last_emitted = Some(status.clone());
        entry.last_emit_at = Some(now);
        drop(entry);

        // No receivers is fine
        let _ = self.status_tx.send(status.clone());
        Ok(Some(status))
    }

    /// Latest computed status (emitted or not)
    pub fn current_status(&self, asset_id: &str) -> Option<ClassifierStatus> {
        self.tracked.get(asset_id).map(|t| t.current.clone())
    }

    /// Subscribe to emitted statuses for all assets
    pub fn subscribe(&self) -> broadcast::Receiver<ClassifierStatus> {
        self.status_tx.subscribe()
    }

    /// Raise the sticky emergency flag for an asset
    pub fn emergency_stop(&self, asset_id: &str) {
        warn!(asset = %asset_id, "Classifier emergency stop raised");
        self.emergency.entry(asset_id.to_string()).or_insert_with(Utc::now);
    }

    pub fn is_emergency_stopped(&self, asset_id: &str) -> bool {
        self.emergency.contains_key(asset_id)
    }

    /// Explicitly clear the emergency flag (operator action)
    pub fn clear_emergency(&self, asset_id: &str) -> bool {
        self.emergency.remove(asset_id).is_some()
    }

    /// Full classification for one snapshot
    pub fn classify(
        asset_id: &str,
        metrics: &MetricsSnapshot,
        config: &ClassifierConfig,
    ) -> ClassifierStatus {
        let phase = determine_phase(metrics, config);
        let protocol_state = classify_state(metrics, config);
        let strategy = select_strategy(phase, protocol_state);

        ClassifierStatus {
            asset_id: asset_id.to_string(),
            phase,
            protocol_state,
            strategy,
            metrics: metrics.clone(),
            config: config.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Forced overrides win; otherwise assume pre-migration
pub fn determine_phase(metrics: &MetricsSnapshot, config: &ClassifierConfig) -> MarketPhase {
    if let Some(forced) = config.force_phase {
        return forced;
    }
    if metrics.migrated {
        return MarketPhase::Amm;
    }
    MarketPhase::BondingCurve
}

/// Priority: momentum > stabilizing > capturing > stabilizing fallback
pub fn classify_state(metrics: &MetricsSnapshot, config: &ClassifierConfig) -> ProtocolState {
    let momentum = metrics.price_change_pct >= config.momentum_price_change_pct
        && metrics.volume >= config.momentum_min_volume
        && metrics.volume > 0.0
        && metrics.holder_count >= config.momentum_min_holders;
    if momentum {
        return ProtocolState::Momentum;
    }

    let falling = metrics.price_change_pct <= -config.stabilizing_price_drop_pct;
    let thin = metrics.liquidity < config.liquidity_floor;
    if falling || thin {
        return ProtocolState::Stabilizing;
    }

    let capturing = metrics.supply_ratio() >= config.capture_min_supply_ratio
        && metrics.liquidity >= config.capture_min_liquidity;
    if capturing {
        return ProtocolState::Capturing;
    }

    ProtocolState::Stabilizing
}

/// Fixed (phase, state) -> strategy table
pub fn select_strategy(phase: MarketPhase, state: ProtocolState) -> Strategy {
    match (phase, state) {
        (MarketPhase::BondingCurve, _) => Strategy::Bullish,
        (_, ProtocolState::Stabilizing) => Strategy::Defensive,
        (_, ProtocolState::Capturing) => Strategy::Arbitrage,
        _ => Strategy::Bullish,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASSET: &str = "7GCihgDB8fe6KNjn2MYtkzZcRjQy3t9GHdC8uHYmW2hrpump";

    fn migrated_config() -> ClassifierConfig {
        ClassifierConfig {
            force_phase: Some(MarketPhase::Amm),
            ..Default::default()
        }
    }

    fn momentum_metrics() -> RawMetrics {
        RawMetrics {
            price: Some(0.00004),
            price_change_pct: Some(12.0),
            volume: Some(80.0),
            holder_count: Some(400),
            liquidity: Some(60.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_disengage_twice() {
        let classifier = StatusClassifier::new(ClassifierConfig::default());
        classifier.engage(ASSET, None);
        assert!(classifier.disengage(ASSET));
        assert!(!classifier.disengage(ASSET));
    }

    #[test]
    fn test_engage_returns_existing() {
        let classifier = StatusClassifier::new(ClassifierConfig::default());
        classifier.engage(ASSET, Some(migrated_config()));
        // Second engage ignores the new config and keeps tracking state
        let status = classifier.engage(ASSET, None);
        assert_eq!(status.phase, MarketPhase::Amm);
    }

    #[test]
    fn test_concurrent_engage_keeps_first_config() {
        let classifier = std::sync::Arc::new(StatusClassifier::new(ClassifierConfig::default()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let classifier = std::sync::Arc::clone(&classifier);
                std::thread::spawn(move || {
                    let config = if i % 2 == 0 { Some(migrated_config()) } else { None };
                    classifier.engage(ASSET, config).phase
                })
            })
            .collect();
        let phases: Vec<MarketPhase> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let tracked = classifier.current_status(ASSET).unwrap().phase;
        assert!(phases.iter().all(|phase| *phase == tracked));
    }

    #[test]
    fn test_update_requires_engage() {
        let classifier = StatusClassifier::new(ClassifierConfig::default());
        let result = classifier.update_metrics(ASSET, &RawMetrics::default());
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_pre_migration_always_bullish() {
        let config = ClassifierConfig::default();
        let metrics = MetricsSnapshot {
            price_change_pct: -40.0,
            ..Default::default()
        };
        let status = StatusClassifier::classify(ASSET, &metrics, &config);
        assert_eq!(status.phase, MarketPhase::BondingCurve);
        assert_eq!(status.protocol_state, ProtocolState::Stabilizing);
        assert_eq!(status.strategy, Strategy::Bullish);
    }

    #[test]
    fn test_state_priority() {
        let config = ClassifierConfig::default();

        let momentum = MetricsSnapshot::from(&momentum_metrics());
        assert_eq!(classify_state(&momentum, &config), ProtocolState::Momentum);

        // Momentum beats thin liquidity
        let thin_momentum = MetricsSnapshot {
            liquidity: 0.5,
            ..momentum.clone()
        };
        assert_eq!(
            classify_state(&thin_momentum, &config),
            ProtocolState::Momentum
        );

        let falling = MetricsSnapshot {
            price_change_pct: -15.0,
            liquidity: 100.0,
            circulating_supply: 900.0,
            total_supply: 1000.0,
            ..Default::default()
        };
        assert_eq!(classify_state(&falling, &config), ProtocolState::Stabilizing);

        let capturing = MetricsSnapshot {
            price_change_pct: 1.0,
            liquidity: 50.0,
            circulating_supply: 700.0,
            total_supply: 1000.0,
            ..Default::default()
        };
        assert_eq!(classify_state(&capturing, &config), ProtocolState::Capturing);

        let fallback = MetricsSnapshot {
            liquidity: 10.0,
            circulating_supply: 100.0,
            total_supply: 1000.0,
            ..Default::default()
        };
        assert_eq!(classify_state(&fallback, &config), ProtocolState::Stabilizing);
    }

    #[test]
    fn test_strategy_table() {
        assert_eq!(
            select_strategy(MarketPhase::Amm, ProtocolState::Stabilizing),
            Strategy::Defensive
        );
        assert_eq!(
            select_strategy(MarketPhase::Amm, ProtocolState::Capturing),
            Strategy::Arbitrage
        );
        assert_eq!(
            select_strategy(MarketPhase::Amm, ProtocolState::Momentum),
            Strategy::Bullish
        );
        assert_eq!(
            select_strategy(MarketPhase::BondingCurve, ProtocolState::Capturing),
            Strategy::Bullish
        );
    }

    #[test]
    fn test_migrated_flag_sets_amm_phase() {
        let raw = RawMetrics {
            migrated: Some(true),
            ..Default::default()
        };
        let phase = determine_phase(&MetricsSnapshot::from(&raw), &ClassifierConfig::default());
        assert_eq!(phase, MarketPhase::Amm);

        let forced = ClassifierConfig {
            force_phase: Some(MarketPhase::BondingCurve),
            ..Default::default()
        };
        assert_eq!(
            determine_phase(&MetricsSnapshot::from(&raw), &forced),
            MarketPhase::BondingCurve
        );
    }

    #[tokio::test]
    async fn test_emit_debounce() {
        tokio::time::pause();

        let classifier = StatusClassifier::new(ClassifierConfig::default());
        classifier.engage(ASSET, Some(migrated_config()));
        let mut rx = classifier.subscribe();

        // First update always emits
        let first = classifier.update_metrics(ASSET, &momentum_metrics()).unwrap();
        assert!(first.is_some());
        assert!(rx.try_recv().is_ok());

        // Same classification inside the interval is suppressed
        let second = classifier.update_metrics(ASSET, &momentum_metrics()).unwrap();
        assert!(second.is_none());
        assert!(rx.try_recv().is_err());

        // A material change emits immediately
        let falling = RawMetrics {
            price_change_pct: Some(-30.0),
            ..momentum_metrics()
        };
        let third = classifier.update_metrics(ASSET, &falling).unwrap().unwrap();
        assert_eq!(third.strategy, Strategy::Defensive);

        // Unchanged again, but the emit interval elapsed
        tokio::time::advance(Duration::from_millis(30_001)).await;
        let fourth = classifier.update_metrics(ASSET, &falling).unwrap();
        assert!(fourth.is_some());

        // current_status tracks every update, emitted or not
        assert_eq!(
            classifier.current_status(ASSET).unwrap().strategy,
            Strategy::Defensive
        );
    }

    #[test]
    fn test_emergency_flag_is_sticky() {
        let classifier = StatusClassifier::new(ClassifierConfig::default());
        classifier.engage(ASSET, None);
        assert!(!classifier.is_emergency_stopped(ASSET));

        classifier.emergency_stop(ASSET);
        classifier.disengage(ASSET);
        assert!(classifier.is_emergency_stopped(ASSET));

        assert!(classifier.clear_emergency(ASSET));
        assert!(!classifier.is_emergency_stopped(ASSET));
    }
}
