//! Risk monitor
//!
//! Consumes one session's stream, keeps the [`RiskState`] current and fires
//! one-shot take-profit / stop-loss / trailing-stop / emergency-stop
//! liquidations through the shared [`TradeExecutor`].
//!
//! Evaluation is single-flight: while a liquidation is running, further
//! ticks update marks but never start a second sell.

pub mod state;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classifier::StatusClassifier;
use crate::error::{Error, Result};
use crate::executor::{summarize_executions, ExecutionOptions, ExecutionRecord, TradeExecutor};
use crate::planner::ExecutionPlan;
use crate::session::{EventBus, SessionEvent};
use crate::stream::{StreamEvent, TransactionKind};
use crate::wallet::WalletRecord;

pub use state::{RiskSettings, RiskState, TriggerKind};

/// Callbacks into the owning session
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// Records produced by a risk-triggered sell
    async fn record_liquidation(&self, session_id: &str, records: Vec<ExecutionRecord>);

    /// Emergency stop fired; the session must terminate
    async fn escalate_emergency(&self, session_id: &str, reason: &str);
}

/// Risk monitor for one session
pub struct RiskManager {
    settings: RiskSettings,
    options: ExecutionOptions,
    wallets: Vec<WalletRecord>,
    state: Mutex<RiskState>,
    executor: Arc<TradeExecutor>,
    events: Arc<EventBus>,
    hooks: Option<Arc<dyn SessionHooks>>,
    /// Live market phase for `Platform::Auto` routing
    classifier: Option<Arc<StatusClassifier>>,
    cancel: CancellationToken,
}

impl RiskManager {
    pub fn new(
        settings: RiskSettings,
        mut options: ExecutionOptions,
        wallets: Vec<WalletRecord>,
        executor: Arc<TradeExecutor>,
        events: Arc<EventBus>,
    ) -> Self {
        // Liquidations must not be skipped by the cycle token
        options.cancel = None;
        Self {
            settings,
            options,
            wallets,
            state: Mutex::new(RiskState::new()),
            executor,
            events,
            hooks: None,
            classifier: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn SessionHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<StatusClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.options.session_id
    }

    pub fn settings(&self) -> &RiskSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, RiskState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the live state
    pub fn snapshot(&self) -> RiskState {
        self.lock().clone()
    }

    /// Seed the entry price before any own-wallet fill is observed
    pub fn seed_entry_price(&self, price: f64) {
        self.lock().set_entry_price(price);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Consume stream events until stopped or the stream closes
    pub fn start(self: &Arc<Self>, mut rx: broadcast::Receiver<StreamEvent>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            info!(session_id = %this.session_id(), asset = %this.options.asset_id, "Risk monitor started");
            loop {
                let event = tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    event = rx.recv() => event,
                };

                match event {
                    Ok(event) => {
                        if let Err(e) = this.handle_event(&event).await {
                            match e {
                                Error::Staleness { .. } => debug!(session_id = %this.session_id(), error = %e, "Evaluation skipped"),
                                _ => warn!(session_id = %this.session_id(), error = %e, "Risk evaluation failed"),
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(session_id = %this.session_id(), skipped, "Risk monitor lagging behind stream");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            info!(session_id = %this.session_id(), "Risk monitor stopped");
        })
    }

    /// Apply one stream event and evaluate the triggers
    pub async fn handle_event(&self, event: &StreamEvent) -> Result<Option<TriggerKind>> {
        match event {
            StreamEvent::Transaction(tx) if tx.asset_id == self.options.asset_id => {
                if tx.is_own_wallet {
                    let mut state = self.lock();
                    match tx.kind {
                        TransactionKind::Buy => state.record_buy(tx.token_delta, -tx.sol_delta),
                        TransactionKind::Sell => state.record_sell(-tx.token_delta),
                        _ => {}
                    }
                }
                if let Some(price) = tx.implied_price {
                    self.on_price(price, tx.received_at);
                }
                self.evaluate(Utc::now()).await
            }
            StreamEvent::PriceChange(change) if change.asset_id == self.options.asset_id => {
                self.on_price(change.current, change.observed_at);
                self.evaluate(Utc::now()).await
            }
            StreamEvent::Error(message) => {
                error!(session_id = %self.session_id(), error = %message, "Feed lost, risk monitor stopping");
                self.events.publish(SessionEvent::error(
                    self.session_id(),
                    &self.options.asset_id,
                    format!("Risk monitor stopped: {}", message),
                ));
                self.stop();
                Ok(None)
            }
            StreamEvent::Disconnected { reason } => {
                warn!(session_id = %self.session_id(), reason = %reason, "Feed disconnected, waiting for reconnect");
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Execution options with the phase as of now
    fn current_options(&self) -> ExecutionOptions {
        let mut options = self.options.clone();
        if let Some(status) = self
            .classifier
            .as_ref()
            .and_then(|c| c.current_status(&options.asset_id))
        {
            options.phase = status.phase;
        }
        options
    }

    /// Record a price observation
    pub fn on_price(&self, price: f64, at: DateTime<Utc>) {
        self.lock().update_price(price, at, &self.settings);
    }

    /// Fire the highest-priority eligible trigger, if any
    pub async fn evaluate(&self, now: DateTime<Utc>) -> Result<Option<TriggerKind>> {
        if self.is_stopped() || !self.settings.enabled {
            return Ok(None);
        }

        let (kind, price, profit_pct) = {
            let mut state = self.lock();
            if state.in_flight {
                return Ok(None);
            }
            let Some(kind) = state.pending_trigger(&self.settings) else {
                return Ok(None);
            };
            state.check_fresh(now, self.settings.max_price_age_ms)?;
            if state.in_cooldown(now, self.settings.cooldown_ms) {
                debug!(session_id = %self.session_id(), trigger = %kind, "Trigger deferred, cooldown");
                return Ok(None);
            }
            state.mark_fired(kind);
            state.in_flight = true;
            (kind, state.current_price.unwrap_or_default(), state.profit_pct)
        };

        self.fire(kind, price, profit_pct).await;
        Ok(Some(kind))
    }

    async fn fire(&self, kind: TriggerKind, price: f64, profit_pct: f64) {
        let sell_fraction = self.settings.sell_fraction(kind);
        let session_id = self.session_id().to_string();
        let asset_id = self.options.asset_id.clone();

        info!(
            session_id = %session_id,
            trigger = %kind,
            price,
            profit_pct,
            sell_fraction,
            "Risk trigger fired"
        );

        self.events.publish(SessionEvent::RuleTriggered {
            session_id: session_id.clone(),
            asset_id: asset_id.clone(),
            trigger: kind,
            price,
            profit_pct,
            sell_fraction,
            timestamp: Utc::now(),
        });

        let plan = ExecutionPlan::liquidation(&self.wallets, sell_fraction);
        let options = self.current_options();
        let records = self.executor.execute_transactions(&plan, &options).await;

        let summary = summarize_executions(&records);
        if summary.succeeded == 0 && summary.total > 0 {
            error!(session_id = %session_id, trigger = %kind, failed = summary.failed, "Liquidation sold nothing");
        }

        for record in records.iter().filter(|r| r.is_success()) {
            self.events.publish(SessionEvent::TradeExecuted {
                session_id: session_id.clone(),
                asset_id: asset_id.clone(),
                record: record.clone(),
            });
        }

        {
            let mut state = self.lock();
            state.in_flight = false;
            state.last_sell_at = Some(Utc::now());
        }

        if let Some(hooks) = &self.hooks {
            hooks.record_liquidation(&session_id, records).await;
        }

        if kind == TriggerKind::EmergencyStop {
            self.stop();
            let reason = format!("Emergency stop at {:.2}% profit", profit_pct);
            if let Some(hooks) = &self.hooks {
                hooks.escalate_emergency(&session_id, &reason).await;
            }
        }
    }
}

impl Drop for RiskManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Platform;
    use crate::executor::ExecutorConfig;
    use crate::stream::PriceChange;
    use crate::testing::{MockCustody, MockVenue, RecordingFees, VenueCall};

    #[derive(Default)]
    struct RecordingHooks {
        liquidations: Mutex<Vec<usize>>,
        emergencies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SessionHooks for RecordingHooks {
        async fn record_liquidation(&self, _session_id: &str, records: Vec<ExecutionRecord>) {
            self.liquidations.lock().unwrap().push(records.len());
        }

        async fn escalate_emergency(&self, session_id: &str, _reason: &str) {
            self.emergencies.lock().unwrap().push(session_id.to_string());
        }
    }

    struct Harness {
        venue: Arc<MockVenue>,
        hooks: Arc<RecordingHooks>,
        events: Arc<EventBus>,
        manager: Arc<RiskManager>,
    }

    fn harness(settings: RiskSettings) -> Harness {
        let venue = Arc::new(MockVenue::new("bonding_curve", 1.0));
        let custody = Arc::new(MockCustody::with_wallets("user-1", 2));
        for record in custody.records() {
            venue.set_tokens(&custody.pubkey(&record.id), 100.0);
        }
        let executor = Arc::new(TradeExecutor::new(
            venue.clone(),
            venue.clone(),
            custody.clone(),
            Arc::new(RecordingFees::new(100)),
            ExecutorConfig::default(),
        ));

        let mut options = ExecutionOptions::new("s1", "user-1", "mint");
        options.platform = Platform::BondingCurve;
        options.randomization.enabled = false;

        let events = Arc::new(EventBus::new(64));
        let hooks = Arc::new(RecordingHooks::default());
        let manager = Arc::new(
            RiskManager::new(settings, options, custody.records(), executor, events.clone())
                .with_hooks(hooks.clone()),
        );
        manager.seed_entry_price(1.0);

        Harness {
            venue,
            hooks,
            events,
            manager,
        }
    }

    fn settings() -> RiskSettings {
        RiskSettings {
            enabled: true,
            take_profit_pct: Some(50.0),
            take_profit_sell_pct: 50.0,
            stop_loss_pct: Some(20.0),
            trailing_activation_pct: Some(30.0),
            trailing_distance_pct: 10.0,
            emergency_stop_pct: Some(50.0),
            cooldown_ms: 0,
            max_price_age_ms: 60_000,
        }
    }

    fn price_event(price: f64) -> StreamEvent {
        StreamEvent::PriceChange(PriceChange {
            asset_id: "mint".into(),
            previous: 1.0,
            current: price,
            change_pct: 0.0,
            observed_at: Utc::now(),
        })
    }

    fn triggered(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<TriggerKind> {
        let mut fired = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::RuleTriggered { trigger, .. } = event {
                fired.push(trigger);
            }
        }
        fired
    }

    #[tokio::test]
    async fn test_emergency_fires_once_and_stops_monitoring() {
        let h = harness(settings());
        let mut rx = h.events.subscribe_session("s1");

        let fired = h.manager.handle_event(&price_event(0.49)).await.unwrap();
        assert_eq!(fired, Some(TriggerKind::EmergencyStop));
        assert!(h.manager.is_stopped());

        assert_eq!(h.manager.handle_event(&price_event(0.3)).await.unwrap(), None);

        assert_eq!(triggered(&mut rx), vec![TriggerKind::EmergencyStop]);
        assert_eq!(h.hooks.emergencies.lock().unwrap().len(), 1);
        assert_eq!(h.hooks.liquidations.lock().unwrap().clone(), vec![2]);

        let snapshot = h.manager.snapshot();
        assert!(snapshot.emergency_fired);
        assert!(!snapshot.stop_loss_fired);
        assert!(!snapshot.in_flight);
    }

    #[tokio::test]
    async fn test_take_profit_then_trailing_each_fire_once() {
        let h = harness(settings());
        let mut rx = h.events.subscribe_session("s1");

        for price in [1.2, 1.6, 1.7, 1.65, 1.5, 1.45, 1.4, 1.3] {
            h.venue.set_price(price);
            h.manager.handle_event(&price_event(price)).await.unwrap();
        }

        assert_eq!(
            triggered(&mut rx),
            vec![TriggerKind::TakeProfit, TriggerKind::TrailingStop]
        );

        // Take-profit sold half of each 100-token balance
        let first_sells: Vec<f64> = h
            .venue
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                VenueCall::Sell { tokens, .. } => Some(tokens),
                _ => None,
            })
            .take(2)
            .collect();
        assert_eq!(first_sells, vec![50.0, 50.0]);

        let snapshot = h.manager.snapshot();
        assert!(snapshot.take_profit_fired && snapshot.trailing_stop_fired);
        assert!(!h.manager.is_stopped());
        assert!(h.hooks.emergencies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_price_refuses_to_act() {
        let h = harness(RiskSettings {
            max_price_age_ms: 1_000,
            ..settings()
        });

        let now = Utc::now();
        h.manager.on_price(0.4, now - chrono::Duration::seconds(5));

        let result = h.manager.evaluate(now).await;
        assert!(matches!(result, Err(Error::Staleness { .. })));
        assert!(!h.manager.snapshot().emergency_fired);
        assert!(h.venue.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cooldown_defers_without_consuming_trigger() {
        let h = harness(RiskSettings {
            cooldown_ms: 60_000,
            emergency_stop_pct: None,
            ..settings()
        });

        h.venue.set_price(1.6);
        assert_eq!(
            h.manager.handle_event(&price_event(1.6)).await.unwrap(),
            Some(TriggerKind::TakeProfit)
        );

        h.venue.set_price(0.7);
        assert_eq!(h.manager.handle_event(&price_event(0.7)).await.unwrap(), None);

        let snapshot = h.manager.snapshot();
        assert!(!snapshot.stop_loss_fired);
        assert!(snapshot.take_profit_fired);
    }

    #[tokio::test]
    async fn test_feed_loss_reports_session_error_and_stops() {
        let h = harness(settings());
        let mut rx = h.events.subscribe_session("s1");
        let (feed_tx, feed_rx) = broadcast::channel(4);
        let task = h.manager.start(feed_rx);

        feed_tx
            .send(StreamEvent::Error("Max reconnect attempts (3) reached".into()))
            .unwrap();

        // Exits with the feed sender still alive
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(h.manager.is_stopped());

        match rx.try_recv().unwrap() {
            SessionEvent::Error { session_id, message, .. } => {
                assert_eq!(session_id, "s1");
                assert!(message.contains("Max reconnect attempts"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert_eq!(h.manager.handle_event(&price_event(0.3)).await.unwrap(), None);
        assert!(h.venue.calls().is_empty());
        drop(feed_tx);
    }

    #[tokio::test]
    async fn test_liquidation_follows_migration() {
        use crate::classifier::{ClassifierConfig, RawMetrics};

        let bonding = Arc::new(MockVenue::new("bonding_curve", 1.0));
        let aggregator = Arc::new(MockVenue::new("aggregator", 1.0));
        let custody = Arc::new(MockCustody::with_wallets("user-1", 1));
        let pubkey = custody.pubkey("w0");
        bonding.set_tokens(&pubkey, 100.0);
        aggregator.set_tokens(&pubkey, 100.0);
        let executor = Arc::new(TradeExecutor::new(
            bonding.clone(),
            aggregator.clone(),
            custody.clone(),
            Arc::new(RecordingFees::new(100)),
            ExecutorConfig::default(),
        ));

        let asset = "TokenMintpump";
        let classifier = Arc::new(StatusClassifier::new(ClassifierConfig::default()));
        classifier.engage(asset, None);

        // Options captured while still on the bonding curve
        let mut options = ExecutionOptions::new("s1", "user-1", asset);
        options.platform = Platform::Auto;
        options.randomization.enabled = false;

        let manager = RiskManager::new(
            RiskSettings {
                emergency_stop_pct: None,
                ..settings()
            },
            options,
            custody.records(),
            executor,
            Arc::new(EventBus::new(16)),
        )
        .with_classifier(classifier.clone());
        manager.seed_entry_price(1.0);

        classifier
            .update_metrics(
                asset,
                &RawMetrics {
                    price: Some(0.5),
                    migrated: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();

        aggregator.set_price(0.5);
        let change = StreamEvent::PriceChange(PriceChange {
            asset_id: asset.into(),
            previous: 1.0,
            current: 0.5,
            change_pct: -50.0,
            observed_at: Utc::now(),
        });
        assert_eq!(
            manager.handle_event(&change).await.unwrap(),
            Some(TriggerKind::StopLoss)
        );

        assert!(bonding.calls().is_empty());
        assert_eq!(
            aggregator.calls(),
            vec![VenueCall::Sell {
                wallet_id: "w0".to_string(),
                tokens: 100.0
            }]
        );
    }

    #[tokio::test]
    async fn test_own_wallet_fills_update_entry_price() {
        use crate::stream::NormalizedTransaction;

        let h = harness(RiskSettings {
            enabled: false,
            ..settings()
        });
        let manager = RiskManager::new(
            RiskSettings {
                enabled: false,
                ..settings()
            },
            ExecutionOptions::new("s2", "user-1", "mint"),
            Vec::new(),
            Arc::clone(&h.manager.executor),
            h.events.clone(),
        );

        let fill = |kind: TransactionKind, tokens: f64, sol: f64, own: bool| {
            StreamEvent::Transaction(NormalizedTransaction {
                signature: "sig".into(),
                asset_id: "mint".into(),
                kind,
                trader: "w".into(),
                accounts: vec!["w".into()],
                token_delta: if kind == TransactionKind::Buy { tokens } else { -tokens },
                sol_delta: if kind == TransactionKind::Buy { -sol } else { sol },
                is_own_wallet: own,
                implied_price: Some(sol / tokens),
                received_at: Utc::now(),
            })
        };

        manager.handle_event(&fill(TransactionKind::Buy, 100.0, 1.0, true)).await.unwrap();
        manager.handle_event(&fill(TransactionKind::Buy, 100.0, 3.0, true)).await.unwrap();
        manager.handle_event(&fill(TransactionKind::Buy, 100.0, 9.0, false)).await.unwrap();

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.entry_price, Some(0.02));
        assert_eq!(snapshot.position_tokens, 200.0);
        assert_eq!(snapshot.high_price, Some(0.09));
        assert_eq!(snapshot.low_price, Some(0.01));
    }
}
