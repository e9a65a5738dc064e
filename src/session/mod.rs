//! Session manager
//!
//! Top-level state machine. Starting a session engages the classifier,
//! authorizes custody, takes the write lease and spawns the cycle scheduler
//! (plus a stream-fed risk monitor when risk triggers are enabled).
//! Stopping cancels all of it and writes the terminal status last; an
//! in-flight cycle that finishes afterwards never touches the session again.

pub mod events;
pub mod scheduler;
pub mod store;
pub mod types;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::classifier::{MarketPhase, RawMetrics, StatusClassifier};
use crate::error::{Error, Result};
use crate::executor::{summarize_executions, ExecutionOptions, ExecutionRecord, TradeExecutor};
use crate::planner::AllocationPlanner;
use crate::risk::{RiskManager, RiskState, SessionHooks};
use crate::stream::{StreamClient, StreamConfig, StreamSubscription};
use crate::wallet::{WalletCustody, WalletRecord};

pub use events::{EventBus, SessionEvent};
pub use store::{JsonFileStore, MemoryStore, SessionStore};
pub use types::{Session, SessionSettings, SessionStatus};

/// Manager-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionManagerConfig {
    /// Write lease lifetime, renewed every cycle
    pub lease_ttl_secs: u64,
    pub event_capacity: usize,
    /// Start a stream-fed risk monitor for sessions with risk enabled
    pub monitor_risk: bool,
    pub stream: StreamConfig,
    /// Used when neither the caller nor the store supplies settings
    pub default_settings: SessionSettings,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 300,
            event_capacity: 1024,
            monitor_risk: true,
            stream: StreamConfig::default(),
            default_settings: SessionSettings::default(),
        }
    }
}

/// Input to [`SessionManager::start_session`]
#[derive(Debug, Clone, Default)]
pub struct StartSessionRequest {
    pub user_id: String,
    pub asset_id: String,
    /// Falls back to the settings' target
    pub target_volume: Option<f64>,
    /// Falls back to stored settings, then the manager default
    pub settings: Option<SessionSettings>,
}

/// Live state of one running session
struct SessionRuntime {
    session_id: String,
    user_id: String,
    asset_id: String,
    session: Mutex<Session>,
    settings: SessionSettings,
    wallets: Vec<WalletRecord>,
    cancel: CancellationToken,
    in_flight: AtomicBool,
    cycle_index: AtomicU64,
    scheduler: std::sync::Mutex<Option<JoinHandle<()>>>,
    monitor: std::sync::Mutex<Option<(Arc<StreamClient>, Arc<RiskManager>)>>,
}

impl SessionRuntime {
    fn execution_options(&self, phase: MarketPhase) -> ExecutionOptions {
        let mut options = ExecutionOptions::new(&self.session_id, &self.user_id, &self.asset_id);
        options.platform = self.settings.platform;
        options.phase = phase;
        options.slippage_bps = self.settings.slippage_bps;
        options.referrer = self.settings.referrer.clone();
        options.min_wallet_balance_sol = self.settings.min_wallet_balance_sol;
        options.randomization = self.settings.randomization.clone();
        options.seed = self.settings.randomization.seed;
        options.cancel = Some(self.cancel.clone());
        options
    }

    fn stop_monitor(&self) {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some((stream, risk)) = monitor {
            risk.stop();
            stream.stop();
        }
    }

    fn risk_snapshot(&self) -> Option<RiskState> {
        self.monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|(_, risk)| risk.snapshot())
    }

    fn take_scheduler(&self) -> Option<JoinHandle<()>> {
        self.scheduler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

struct ManagerInner {
    instance_id: String,
    config: SessionManagerConfig,
    store: Arc<dyn SessionStore>,
    classifier: Arc<StatusClassifier>,
    planner: Arc<AllocationPlanner>,
    executor: Arc<TradeExecutor>,
    custody: Arc<dyn WalletCustody>,
    events: Arc<EventBus>,
    runtimes: DashMap<String, Arc<SessionRuntime>>,
    /// (user, asset) pairs with a start in progress
    starting: DashMap<(String, String), ()>,
}

/// Holds a (user, asset) start slot; released on drop
struct StartReservation<'a> {
    starting: &'a DashMap<(String, String), ()>,
    key: (String, String),
}

impl<'a> StartReservation<'a> {
    fn acquire(starting: &'a DashMap<(String, String), ()>, user_id: &str, asset_id: &str) -> Option<Self> {
        let key = (user_id.to_string(), asset_id.to_string());
        match starting.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(Self { starting, key })
            }
        }
    }
}

impl Drop for StartReservation<'_> {
    fn drop(&mut self) {
        self.starting.remove(&self.key);
    }
}

impl ManagerInner {
    fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.config.lease_ttl_secs)
    }

    /// Store failures are logged; in-memory state stays authoritative
    async fn persist(&self, session: &Session) {
        if let Err(e) = self.store.save_session(session).await {
            error!(session_id = %session.id, error = %e, "Failed to persist session");
        }
    }

    /// Cancel, write the terminal status, release everything
    async fn terminate(&self, session_id: &str, to: SessionStatus, reason: &str) -> Result<Session> {
        let Some((_, rt)) = self.runtimes.remove(session_id) else {
            // Not running in this process: settle the stored row
            let mut session = self
                .store
                .load_session(session_id)
                .await?
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
            if session.status.is_terminal() {
                return Ok(session);
            }
            session.transition(to, Some(reason))?;
            self.store.save_session(&session).await?;
            self.publish_terminal(&session, to, reason);
            return Ok(session);
        };

        rt.cancel.cancel();
        rt.stop_monitor();

        let session = {
            let mut session = rt.session.lock().await;
            if session.status.is_terminal() {
                // Completed concurrently
                return Ok(session.clone());
            }
            session.transition(to, Some(reason))?;
            self.persist(&session).await;
            session.clone()
        };

        if to == SessionStatus::EmergencyStopped {
            self.classifier.emergency_stop(&rt.asset_id);
        }

        self.release(&rt).await;
        self.publish_terminal(&session, to, reason);

        info!(session_id = %session_id, status = %to, reason, "Session terminated");
        Ok(session)
    }

    /// Cleanup after the scheduler itself ended the session
    async fn finish(&self, rt: &SessionRuntime, status: SessionStatus, reason: Option<String>) {
        self.runtimes.remove(&rt.session_id);
        rt.stop_monitor();
        self.release(rt).await;
        self.events.publish(SessionEvent::SessionStopped {
            session_id: rt.session_id.clone(),
            asset_id: rt.asset_id.clone(),
            status,
            reason,
            timestamp: Utc::now(),
        });
        self.events.close_session(&rt.session_id);
        info!(session_id = %rt.session_id, status = %status, "Session finished");
    }

    async fn release(&self, rt: &SessionRuntime) {
        let shared = self.runtimes.iter().any(|r| r.asset_id == rt.asset_id);
        if !shared {
            self.classifier.disengage(&rt.asset_id);
        }
        self.custody.revoke_session(&rt.session_id).await;
        if let Err(e) = self.store.release_lease(&rt.session_id, &self.instance_id).await {
            warn!(session_id = %rt.session_id, error = %e, "Failed to release session lease");
        }
    }

    fn publish_terminal(&self, session: &Session, status: SessionStatus, reason: &str) {
        if status == SessionStatus::EmergencyStopped {
            self.events.publish(SessionEvent::EmergencyStop {
                session_id: session.id.clone(),
                asset_id: session.asset_id.clone(),
                reason: reason.to_string(),
                timestamp: Utc::now(),
            });
        }
        self.events.publish(SessionEvent::SessionStopped {
            session_id: session.id.clone(),
            asset_id: session.asset_id.clone(),
            status,
            reason: Some(reason.to_string()),
            timestamp: Utc::now(),
        });
        self.events.close_session(&session.id);
    }

    async fn record_liquidation(&self, session_id: &str, records: Vec<ExecutionRecord>) {
        if let Err(e) = self.store.append_executions(&records).await {
            error!(session_id = %session_id, error = %e, "Failed to append liquidation records");
        }

        let Some(rt) = self.runtimes.get(session_id).map(|r| Arc::clone(r.value())) else {
            return;
        };

        let summary = summarize_executions(&records);
        let mut session = rt.session.lock().await;
        if rt.cancel.is_cancelled() || session.status.is_terminal() {
            return;
        }
        session.apply_summary(&summary);
        self.persist(&session).await;
        self.events.publish(SessionEvent::StatusUpdate {
            session_id: session.id.clone(),
            asset_id: session.asset_id.clone(),
            status: session.status,
            strategy: session.strategy,
            executed_volume: session.executed_volume,
            target_volume: session.target_volume,
            trade_count: session.trade_count,
            pnl_sol: session.pnl_sol,
            summary: Some(summary),
            timestamp: Utc::now(),
        });
    }
}

/// Risk callbacks routed back into the manager
struct ManagerHooks(Weak<ManagerInner>);

#[async_trait]
impl SessionHooks for ManagerHooks {
    async fn record_liquidation(&self, session_id: &str, records: Vec<ExecutionRecord>) {
        if let Some(inner) = self.0.upgrade() {
            inner.record_liquidation(session_id, records).await;
        }
    }

    async fn escalate_emergency(&self, session_id: &str, reason: &str) {
        if let Some(inner) = self.0.upgrade() {
            if let Err(e) = inner
                .terminate(session_id, SessionStatus::EmergencyStopped, reason)
                .await
            {
                error!(session_id = %session_id, error = %e, "Emergency escalation failed");
            }
        }
    }
}

/// Starts, runs and stops volume sessions
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(
        config: SessionManagerConfig,
        store: Arc<dyn SessionStore>,
        classifier: Arc<StatusClassifier>,
        planner: Arc<AllocationPlanner>,
        executor: Arc<TradeExecutor>,
        custody: Arc<dyn WalletCustody>,
    ) -> Self {
        let events = Arc::new(EventBus::new(config.event_capacity));
        Self {
            inner: Arc::new(ManagerInner {
                instance_id: Uuid::new_v4().to_string(),
                config,
                store,
                classifier,
                planner,
                executor,
                custody,
                events,
                runtimes: DashMap::new(),
                starting: DashMap::new(),
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Start a session for (user, asset)
    pub async fn start_session(&self, request: StartSessionRequest) -> Result<Session> {
        let inner = &self.inner;
        let StartSessionRequest {
            user_id,
            asset_id,
            target_volume,
            settings,
        } = request;

        if user_id.trim().is_empty() || asset_id.trim().is_empty() {
            return Err(Error::Validation("user_id and asset_id are required".to_string()));
        }

        let settings = match settings {
            Some(settings) => settings,
            None => inner
                .store
                .load_settings(&user_id, &asset_id)
                .await?
                .unwrap_or_else(|| inner.config.default_settings.clone()),
        };
        settings.validate()?;

        let target = target_volume.unwrap_or(settings.target_volume_sol);
        if !target.is_finite() || target <= 0.0 {
            return Err(Error::Validation(format!("Target volume must be positive, got {}", target)));
        }

        if inner.classifier.is_emergency_stopped(&asset_id) {
            return Err(Error::Validation(format!(
                "Emergency stop is active for {}; clear it before starting",
                asset_id
            )));
        }

        let Some(_reservation) = StartReservation::acquire(&inner.starting, &user_id, &asset_id) else {
            return Err(Error::Validation(format!(
                "A session is already starting for {} on {}",
                user_id, asset_id
            )));
        };

        let running_here = inner
            .runtimes
            .iter()
            .any(|r| r.user_id == user_id && r.asset_id == asset_id);
        if running_here || inner.store.find_active(&user_id, &asset_id).await?.is_some() {
            return Err(Error::Validation(format!(
                "An active session already exists for {} on {}",
                user_id, asset_id
            )));
        }

        let wallets = inner.custody.list_wallets(&user_id).await?;
        if wallets.is_empty() {
            return Err(Error::Validation(format!("User {} has no wallets", user_id)));
        }

        if let Err(e) = inner.store.save_settings(&user_id, &asset_id, &settings).await {
            warn!(error = %e, "Failed to persist session settings");
        }

        let mut session = Session::new(&user_id, &asset_id, target, settings.strategy.unwrap_or_default());
        inner.store.save_session(&session).await?;

        let leased = inner
            .store
            .try_acquire_lease(&session.id, &inner.instance_id, inner.lease_ttl())
            .await;
        let lease_error = match leased {
            Ok(true) => None,
            Ok(false) => Some(Error::Validation(format!(
                "Session {} is owned by another instance",
                session.id
            ))),
            Err(e) => Some(e),
        };
        if let Some(e) = lease_error {
            session.transition(SessionStatus::Error, Some("Write lease unavailable"))?;
            session.error_message = Some(e.to_string());
            inner.persist(&session).await;
            return Err(e);
        }

        if let Err(e) = inner.custody.authorize_session(&session.id, &user_id).await {
            session.transition(SessionStatus::Error, Some("Custody authorization failed"))?;
            session.error_message = Some(e.to_string());
            inner.persist(&session).await;
            let _ = inner.store.release_lease(&session.id, &inner.instance_id).await;
            return Err(e);
        }

        let status = inner.classifier.engage(&asset_id, settings.classifier.clone());
        if settings.strategy.is_none() {
            session.strategy = status.strategy;
        }
        session.transition(SessionStatus::Running, None)?;
        inner.persist(&session).await;

        let runtime = Arc::new(SessionRuntime {
            session_id: session.id.clone(),
            user_id: user_id.clone(),
            asset_id: asset_id.clone(),
            session: Mutex::new(session.clone()),
            settings,
            wallets,
            cancel: CancellationToken::new(),
            in_flight: AtomicBool::new(false),
            cycle_index: AtomicU64::new(0),
            scheduler: std::sync::Mutex::new(None),
            monitor: std::sync::Mutex::new(None),
        });

        if inner.config.monitor_risk && runtime.settings.risk.enabled {
            self.start_monitor(&runtime, status.phase);
        }

        inner.runtimes.insert(session.id.clone(), Arc::clone(&runtime));

        inner.events.publish(SessionEvent::SessionStarted {
            session_id: session.id.clone(),
            asset_id: asset_id.clone(),
            user_id: user_id.clone(),
            target_volume: target,
            timestamp: Utc::now(),
        });

        let handle = scheduler::spawn(Arc::clone(inner), Arc::clone(&runtime));
        *runtime
            .scheduler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);

        info!(
            session_id = %session.id,
            user = %user_id,
            asset = %asset_id,
            target,
            strategy = %session.strategy,
            wallets = runtime.wallets.len(),
            "Session started"
        );
        Ok(session)
    }

    fn start_monitor(&self, rt: &SessionRuntime, phase: MarketPhase) {
        let subscription = StreamSubscription {
            asset_id: rt.asset_id.clone(),
            wallets: rt.wallets.iter().map(|w| w.address.clone()).collect(),
        };
        let stream = Arc::new(StreamClient::new(self.inner.config.stream.clone(), subscription));

        let hooks: Arc<dyn SessionHooks> = Arc::new(ManagerHooks(Arc::downgrade(&self.inner)));
        let risk = Arc::new(
            RiskManager::new(
                rt.settings.risk.clone(),
                rt.execution_options(phase),
                rt.wallets.clone(),
                Arc::clone(&self.inner.executor),
                Arc::clone(&self.inner.events),
            )
            .with_hooks(hooks)
            .with_classifier(Arc::clone(&self.inner.classifier)),
        );

        // Subscribe before connecting so no event is missed
        risk.start(stream.subscribe());
        stream.start();

        *rt.monitor.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some((stream, risk));
        info!(session_id = %rt.session_id, "Risk monitor attached");
    }

    pub async fn stop_session(&self, session_id: &str, reason: &str) -> Result<Session> {
        self.inner.terminate(session_id, SessionStatus::Stopped, reason).await
    }

    /// Terminal stop that also raises the asset's emergency flag
    pub async fn emergency_stop(&self, session_id: &str, reason: &str) -> Result<Session> {
        self.inner
            .terminate(session_id, SessionStatus::EmergencyStopped, reason)
            .await
    }

    pub async fn pause_session(&self, session_id: &str) -> Result<Session> {
        self.set_running(session_id, SessionStatus::Paused).await
    }

    pub async fn resume_session(&self, session_id: &str) -> Result<Session> {
        self.set_running(session_id, SessionStatus::Running).await
    }

    async fn set_running(&self, session_id: &str, to: SessionStatus) -> Result<Session> {
        let rt = self
            .inner
            .runtimes
            .get(session_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        let mut session = rt.session.lock().await;
        session.transition(to, None)?;
        self.inner.persist(&session).await;
        self.inner.events.publish(SessionEvent::StatusUpdate {
            session_id: session.id.clone(),
            asset_id: session.asset_id.clone(),
            status: session.status,
            strategy: session.strategy,
            executed_volume: session.executed_volume,
            target_volume: session.target_volume,
            trade_count: session.trade_count,
            pnl_sol: session.pnl_sol,
            summary: None,
            timestamp: Utc::now(),
        });
        info!(session_id = %session_id, status = %to, "Session status changed");
        Ok(session.clone())
    }

    /// Live copy if running here, else the stored row
    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let live = self
            .inner
            .runtimes
            .get(session_id)
            .map(|r| Arc::clone(r.value()));
        match live {
            Some(rt) => Ok(Some(rt.session.lock().await.clone())),
            None => self.inner.store.load_session(session_id).await,
        }
    }

    pub async fn list_sessions(&self, user_id: Option<&str>) -> Result<Vec<Session>> {
        self.inner.store.list_sessions(user_id).await
    }

    pub async fn executions(&self, session_id: &str) -> Result<Vec<ExecutionRecord>> {
        self.inner.store.load_executions(session_id).await
    }

    /// Ids of sessions running in this process
    pub fn active_sessions(&self) -> Vec<String> {
        self.inner.runtimes.iter().map(|r| r.key().clone()).collect()
    }

    pub fn risk_snapshot(&self, session_id: &str) -> Option<RiskState> {
        self.inner
            .runtimes
            .get(session_id)
            .and_then(|rt| rt.risk_snapshot())
    }

    /// All events for an asset
    pub fn subscribe(&self, asset_id: &str) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe(asset_id)
    }

    pub fn subscribe_session(&self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe_session(session_id)
    }

    /// Forward market metrics to the classifier
    pub fn update_metrics(&self, asset_id: &str, raw: &RawMetrics) -> Result<()> {
        self.inner.classifier.update_metrics(asset_id, raw).map(|_| ())
    }

    /// Lift a sticky emergency flag so the asset can be traded again
    pub fn clear_emergency(&self, asset_id: &str) -> bool {
        self.inner.classifier.clear_emergency(asset_id)
    }

    /// Wait for a session's scheduler to exit
    pub async fn wait(&self, session_id: &str) {
        let handle = self
            .inner
            .runtimes
            .get(session_id)
            .and_then(|rt| rt.take_scheduler());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(session_id = %session_id, error = %e, "Scheduler task failed");
            }
        }
    }

    /// Stop every session running in this process
    pub async fn shutdown(&self, reason: &str) {
        for session_id in self.active_sessions() {
            if let Err(e) = self.stop_session(&session_id, reason).await {
                warn!(session_id = %session_id, error = %e, "Failed to stop session on shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassifierConfig, Platform, Strategy};
    use crate::executor::ExecutorConfig;
    use crate::planner::RandomizationConfig;
    use crate::testing::{MockCustody, MockVenue, RecordingFees};

    struct Harness {
        venue: Arc<MockVenue>,
        store: Arc<MemoryStore>,
        classifier: Arc<StatusClassifier>,
        manager: SessionManager,
    }

    fn harness(wallets: usize) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let (venue, classifier, manager) = build(wallets, store.clone());
        Harness {
            venue,
            store,
            classifier,
            manager,
        }
    }

    fn build(
        wallets: usize,
        store: Arc<dyn SessionStore>,
    ) -> (Arc<MockVenue>, Arc<StatusClassifier>, SessionManager) {
        let venue = Arc::new(MockVenue::new("bonding_curve", 0.001));
        let custody = Arc::new(MockCustody::with_wallets("user-1", wallets));
        for record in custody.records() {
            venue.set_tokens(&custody.pubkey(&record.id), 1_000.0);
        }
        let executor = Arc::new(TradeExecutor::new(
            venue.clone(),
            venue.clone(),
            custody.clone(),
            Arc::new(RecordingFees::new(100)),
            ExecutorConfig::default(),
        ));
        let classifier = Arc::new(StatusClassifier::new(ClassifierConfig::default()));
        let planner = Arc::new(AllocationPlanner::seeded(RandomizationConfig::default(), 7));
        let manager = SessionManager::new(
            SessionManagerConfig {
                monitor_risk: false,
                ..Default::default()
            },
            store,
            classifier.clone(),
            planner,
            executor,
            custody,
        );
        (venue, classifier, manager)
    }

    /// Memory store that never grants a lease
    #[derive(Default)]
    struct LeaseDenied(MemoryStore);

    #[async_trait]
    impl SessionStore for LeaseDenied {
        async fn save_session(&self, session: &Session) -> Result<()> {
            self.0.save_session(session).await
        }

        async fn load_session(&self, session_id: &str) -> Result<Option<Session>> {
            self.0.load_session(session_id).await
        }

        async fn find_active(&self, user_id: &str, asset_id: &str) -> Result<Option<Session>> {
            self.0.find_active(user_id, asset_id).await
        }

        async fn list_sessions(&self, user_id: Option<&str>) -> Result<Vec<Session>> {
            self.0.list_sessions(user_id).await
        }

        async fn save_settings(&self, user_id: &str, asset_id: &str, settings: &SessionSettings) -> Result<()> {
            self.0.save_settings(user_id, asset_id, settings).await
        }

        async fn load_settings(&self, user_id: &str, asset_id: &str) -> Result<Option<SessionSettings>> {
            self.0.load_settings(user_id, asset_id).await
        }

        async fn append_executions(&self, records: &[ExecutionRecord]) -> Result<()> {
            self.0.append_executions(records).await
        }

        async fn load_executions(&self, session_id: &str) -> Result<Vec<ExecutionRecord>> {
            self.0.load_executions(session_id).await
        }

        async fn try_acquire_lease(&self, _session_id: &str, _owner: &str, _ttl: Duration) -> Result<bool> {
            Ok(false)
        }

        async fn release_lease(&self, _session_id: &str, _owner: &str) -> Result<()> {
            Ok(())
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            trade_interval_secs: 1,
            wallet_count: 3,
            base_volume_sol: 0.1,
            max_volume_sol: 0.5,
            min_wallet_balance_sol: None,
            max_session_loss_pct: None,
            strategy: Some(Strategy::Defensive),
            platform: Platform::BondingCurve,
            randomization: RandomizationConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn request(target: f64, settings: SessionSettings) -> StartSessionRequest {
        StartSessionRequest {
            user_id: "user-1".into(),
            asset_id: "mint".into(),
            target_volume: Some(target),
            settings: Some(settings),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_runs_to_completion() {
        let h = harness(3);
        let mut rx = h.manager.subscribe("mint");

        let session = h.manager.start_session(request(0.25, settings())).await.unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert!(h.classifier.is_engaged("mint"));

        tokio::time::timeout(Duration::from_secs(30), h.manager.wait(&session.id))
            .await
            .unwrap();

        let done = h.manager.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert!(done.target_reached());
        assert_eq!(done.cycle_count, 2);
        assert!(done.ended_at.is_some());
        assert!(h.manager.active_sessions().is_empty());
        assert!(!h.classifier.is_engaged("mint"));

        let log = h.manager.executions(&session.id).await.unwrap();
        assert_eq!(log.len(), 6);

        let kinds: Vec<&str> = drain(&mut rx).iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.first(), Some(&"session_started"));
        assert_eq!(kinds.last(), Some(&"session_stopped"));
        assert_eq!(kinds.iter().filter(|k| **k == "status_update").count(), 2);
        assert!(kinds.contains(&"trade_executed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rule_violation_skips_cycle_but_keeps_running() {
        let h = harness(3);
        let mut rx = h.manager.subscribe("mint");

        let session = h
            .manager
            .start_session(request(
                10.0,
                SessionSettings {
                    wallet_count: 2,
                    ..settings()
                },
            ))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let violations: Vec<SessionEvent> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::Error { violations, .. } if !violations.is_empty()))
            .collect();
        assert!(violations.len() >= 2);

        let live = h.manager.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(live.status, SessionStatus::Running);
        assert!(h.venue.calls().is_empty());

        let stopped = h.manager.stop_session(&session.id, "user request").await.unwrap();
        assert_eq!(stopped.status, SessionStatus::Stopped);
        assert_eq!(stopped.status_reason.as_deref(), Some("user request"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        let after: Vec<&str> = drain(&mut rx).iter().map(|e| e.kind()).collect();
        assert_eq!(after, vec!["session_stopped"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_active_session_rejected() {
        let h = harness(3);
        let session = h.manager.start_session(request(10.0, settings())).await.unwrap();

        let second = h.manager.start_session(request(10.0, settings())).await;
        assert!(matches!(second, Err(Error::Validation(_))));

        h.manager.stop_session(&session.id, "done").await.unwrap();
        assert!(h.manager.start_session(request(10.0, settings())).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_admit_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SessionStore> = Arc::new(JsonFileStore::open(dir.path()).await.unwrap());
        let (_venue, _classifier, manager) = build(3, store.clone());

        let starts: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.start_session(request(100.0, settings())).await })
            })
            .collect();

        let mut started = Vec::new();
        for handle in starts {
            match handle.await.unwrap() {
                Ok(session) => started.push(session),
                Err(e) => assert!(matches!(e, Error::Validation(_))),
            }
        }
        assert_eq!(started.len(), 1);
        assert_eq!(manager.active_sessions().len(), 1);

        let active = store
            .list_sessions(Some("user-1"))
            .await
            .unwrap()
            .into_iter()
            .filter(|s| s.status.is_active())
            .count();
        assert_eq!(active, 1);

        manager.stop_session(&started[0].id, "done").await.unwrap();
        assert!(manager.start_session(request(100.0, settings())).await.is_ok());
        manager.shutdown("test over").await;
    }

    #[tokio::test]
    async fn test_lease_refusal_leaves_no_active_row() {
        let store = Arc::new(LeaseDenied::default());
        let (_venue, classifier, manager) = build(3, store.clone());

        let first = manager.start_session(request(1.0, settings())).await;
        assert!(matches!(first, Err(Error::Validation(_))));

        assert!(store.find_active("user-1", "mint").await.unwrap().is_none());
        let rows = store.list_sessions(Some("user-1")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, SessionStatus::Error);
        assert!(rows[0].error_message.is_some());
        assert!(!classifier.is_engaged("mint"));

        // Not blocked by the failed row
        let second = manager.start_session(request(1.0, settings())).await;
        match second {
            Err(Error::Validation(message)) => assert!(message.contains("another instance")),
            other => panic!("unexpected result {:?}", other.map(|s| s.id)),
        }
    }

    #[tokio::test]
    async fn test_out_of_range_jitter_rejected_at_start() {
        let h = harness(3);
        let result = h
            .manager
            .start_session(request(
                1.0,
                SessionSettings {
                    randomization: RandomizationConfig {
                        interval_jitter_pct: 150.0,
                        ..Default::default()
                    },
                    ..settings()
                },
            ))
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(h.store.list_sessions(None).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_skips_cycles() {
        let h = harness(3);
        let session = h.manager.start_session(request(100.0, settings())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let paused = h.manager.pause_session(&session.id).await.unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);
        let calls = h.venue.calls().len();
        assert!(calls > 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.venue.calls().len(), calls);

        h.manager.resume_session(&session.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(h.venue.calls().len() > calls);

        h.manager.stop_session(&session.id, "done").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_write_after_terminal_status() {
        let h = harness(3);
        h.venue.set_delay(Duration::from_millis(500));

        let session = h.manager.start_session(request(100.0, settings())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stopped = h.manager.stop_session(&session.id, "user request").await.unwrap();
        assert_eq!(stopped.executed_volume, 0.0);

        tokio::time::sleep(Duration::from_secs(5)).await;

        let stored = h.store.load_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Stopped);
        assert_eq!(stored.executed_volume, 0.0);
        assert_eq!(stored.trade_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_stop_is_sticky_per_asset() {
        let h = harness(3);
        let mut rx = h.manager.subscribe("mint");
        let session = h.manager.start_session(request(100.0, settings())).await.unwrap();

        let stopped = h.manager.emergency_stop(&session.id, "manual").await.unwrap();
        assert_eq!(stopped.status, SessionStatus::EmergencyStopped);
        assert!(h.classifier.is_emergency_stopped("mint"));

        let kinds: Vec<&str> = drain(&mut rx).iter().map(|e| e.kind()).collect();
        assert!(kinds.contains(&"emergency_stop"));

        assert!(matches!(
            h.manager.start_session(request(100.0, settings())).await,
            Err(Error::Validation(_))
        ));

        assert!(h.manager.clear_emergency("mint"));
        assert!(h.manager.start_session(request(100.0, settings())).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_risk_escalation_terminates_session() {
        let h = harness(3);
        let session = h.manager.start_session(request(100.0, settings())).await.unwrap();

        let hooks = ManagerHooks(Arc::downgrade(&h.manager.inner));
        hooks.escalate_emergency(&session.id, "loss limit").await;

        let stored = h.store.load_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::EmergencyStopped);
        assert!(h.manager.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let h = harness(1);
        assert!(matches!(
            h.manager.stop_session("missing", "x").await,
            Err(Error::SessionNotFound(_))
        ));
        assert!(matches!(
            h.manager.pause_session("missing").await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected_before_side_effects() {
        let h = harness(3);
        let result = h
            .manager
            .start_session(request(
                1.0,
                SessionSettings {
                    max_volume_sol: -1.0,
                    ..settings()
                },
            ))
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(h.store.list_sessions(None).await.unwrap().is_empty());
        assert!(!h.classifier.is_engaged("mint"));
    }
}
