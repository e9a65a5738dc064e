//! Per-session cycle scheduler
//!
//! One task per session. Each cycle is awaited to completion before the
//! next delay starts, so at most one cycle is ever in flight. A cycle runs
//! in its own task so a panic surfaces as an `error` event instead of
//! killing the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::executor::summarize_executions;
use crate::planner::Randomizer;

use super::events::SessionEvent;
use super::types::{SessionSettings, SessionStatus};
use super::{ManagerInner, SessionRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum CycleOutcome {
    Continue,
    Finished,
}

/// Clears the in-flight flag on drop
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Seeded from the settings when a seed is configured
fn interval_randomizer(settings: &SessionSettings) -> Randomizer {
    let randomization = settings.randomization.clone();
    let seed = randomization.seed;
    Randomizer::new(randomization, seed)
}

pub(super) fn spawn(inner: Arc<ManagerInner>, runtime: Arc<SessionRuntime>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let base = Duration::from_secs(runtime.settings.trade_interval_secs);
        let mut randomizer = interval_randomizer(&runtime.settings);
        let mut first = true;

        info!(session_id = %runtime.session_id, interval_secs = base.as_secs(), "Scheduler started");

        loop {
            if !first {
                let delay = randomizer.jitter_interval(base).max(Duration::from_millis(1));
                tokio::select! {
                    _ = runtime.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            first = false;

            if runtime.cancel.is_cancelled() {
                break;
            }

            let cycle_inner = Arc::clone(&inner);
            let cycle_runtime = Arc::clone(&runtime);
            let outcome = tokio::spawn(async move { cycle_inner.run_cycle(&cycle_runtime).await }).await;

            match outcome {
                Ok(Ok(CycleOutcome::Continue)) => {}
                Ok(Ok(CycleOutcome::Finished)) => break,
                Ok(Err(e)) => {
                    error!(session_id = %runtime.session_id, error = %e, "Cycle failed");
                    inner.report_cycle_error(&runtime, &e.to_string()).await;
                }
                Err(join_error) => {
                    error!(session_id = %runtime.session_id, error = %join_error, "Cycle panicked");
                    inner.report_cycle_error(&runtime, "Cycle aborted unexpectedly").await;
                }
            }
        }

        debug!(session_id = %runtime.session_id, "Scheduler exited");
    })
}

impl ManagerInner {
    /// One plan-execute cycle
    pub(super) async fn run_cycle(&self, rt: &Arc<SessionRuntime>) -> Result<CycleOutcome> {
        if rt.cancel.is_cancelled() {
            return Ok(CycleOutcome::Finished);
        }

        let Some(_flight) = FlightGuard::acquire(&rt.in_flight) else {
            warn!(session_id = %rt.session_id, "Previous cycle still running, tick skipped");
            return Ok(CycleOutcome::Continue);
        };

        let status = rt.session.lock().await.status;
        match status {
            SessionStatus::Paused => {
                debug!(session_id = %rt.session_id, "Session paused, tick skipped");
                return Ok(CycleOutcome::Continue);
            }
            s if s.is_terminal() => return Ok(CycleOutcome::Finished),
            _ => {}
        }

        if !self
            .store
            .try_acquire_lease(&rt.session_id, &self.instance_id, self.lease_ttl())
            .await?
        {
            warn!(session_id = %rt.session_id, "Session lease held by another instance, stopping local scheduler");
            rt.cancel.cancel();
            return Ok(CycleOutcome::Finished);
        }

        if self.classifier.is_emergency_stopped(&rt.asset_id) {
            self.terminate(&rt.session_id, SessionStatus::EmergencyStopped, "Emergency flag raised for asset")
                .await?;
            return Ok(CycleOutcome::Finished);
        }

        let classified = self.classifier.current_status(&rt.asset_id);
        let strategy = rt
            .settings
            .strategy
            .or_else(|| classified.as_ref().map(|s| s.strategy))
            .unwrap_or_default();
        let phase = classified.map(|s| s.phase).unwrap_or(crate::classifier::MarketPhase::BondingCurve);
        let mut options = rt.execution_options(phase);

        let price = match self.executor.quote_price(&options).await {
            Ok(price) => Some(price),
            Err(e) => {
                warn!(session_id = %rt.session_id, error = %e, "Price quote failed");
                None
            }
        };

        let (rules, volume) = {
            let mut session = rt.session.lock().await;
            if rt.cancel.is_cancelled() || session.status.is_terminal() {
                return Ok(CycleOutcome::Finished);
            }
            if let Some(price) = price {
                session.record_price(price);
            }
            session.strategy = strategy;
            (rt.settings.rules_for(&session), session.cycle_volume(&rt.settings))
        };

        let cycle_index = rt.cycle_index.fetch_add(1, Ordering::SeqCst);
        options.seed = options.seed.map(|seed| seed.wrapping_add(cycle_index));
        let wallets = self.planner.select_wallets(
            rt.settings.rotation_mode,
            &rt.wallets,
            rt.settings.wallets_per_cycle,
            cycle_index,
        );

        let plan = self
            .planner
            .generate_execution_plan(strategy, &wallets, Some(volume), &rules)?;

        if plan.is_rejected() {
            let message = plan
                .violations
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            warn!(session_id = %rt.session_id, cycle = cycle_index, violations = %message, "Cycle skipped");
            self.events.publish(SessionEvent::Error {
                session_id: rt.session_id.clone(),
                asset_id: rt.asset_id.clone(),
                message: format!("Plan rejected: {}", message),
                violations: plan.violations.clone(),
                timestamp: chrono::Utc::now(),
            });
            return Ok(CycleOutcome::Continue);
        }

        let records = self.executor.execute_transactions(&plan, &options).await;

        if let Err(e) = self.store.append_executions(&records).await {
            error!(session_id = %rt.session_id, error = %e, "Failed to append execution log");
        }

        for record in records.iter().filter(|r| r.is_success()) {
            self.events.publish(SessionEvent::TradeExecuted {
                session_id: rt.session_id.clone(),
                asset_id: rt.asset_id.clone(),
                record: record.clone(),
            });
        }

        let summary = summarize_executions(&records);

        let completed = {
            let mut session = rt.session.lock().await;
            if rt.cancel.is_cancelled() || session.status.is_terminal() {
                info!(session_id = %rt.session_id, "Session ended during cycle, totals not applied");
                return Ok(CycleOutcome::Finished);
            }

            session.apply_summary(&summary);
            session.cycle_count += 1;

            let completed = session.status == SessionStatus::Running && session.target_reached();
            if completed {
                session.transition(SessionStatus::Completed, Some("Target volume reached"))?;
            }
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
                summary: Some(summary.clone()),
                timestamp: chrono::Utc::now(),
            });

            info!(
                session_id = %session.id,
                cycle = cycle_index,
                strategy = %strategy,
                executed = session.executed_volume,
                target = session.target_volume,
                pnl = session.pnl_sol,
                "Cycle complete"
            );
            completed
        };

        if completed {
            rt.cancel.cancel();
            self.finish(rt, SessionStatus::Completed, Some("Target volume reached".to_string()))
                .await;
            return Ok(CycleOutcome::Finished);
        }

        Ok(CycleOutcome::Continue)
    }

    /// Surface a cycle failure without stopping the scheduler
    pub(super) async fn report_cycle_error(&self, rt: &SessionRuntime, message: &str) {
        {
            let mut session = rt.session.lock().await;
            if !rt.cancel.is_cancelled() && !session.status.is_terminal() {
                session.error_message = Some(message.to_string());
                session.updated_at = chrono::Utc::now();
                self.persist(&session).await;
            }
        }
        self.events
            .publish(SessionEvent::error(&rt.session_id, &rt.asset_id, message));
    }
}
