//! CLI command implementations

use anyhow::{Context, Result};
use solana_sdk::pubkey::Pubkey;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::classifier::{MetricsSnapshot, RawMetrics, StatusClassifier, Strategy};
use crate::config::{Config, StoreKind};
use crate::executor::fees::{FeeCollector, NoFees, TransferFeeCollector};
use crate::executor::TradeExecutor;
use crate::planner::{AllocationPlanner, Randomizer};
use crate::session::{
    JsonFileStore, MemoryStore, Session, SessionEvent, SessionManager, SessionStore,
    StartSessionRequest,
};
use crate::venue::{AggregatorVenue, BondingCurveVenue, ChainClient};
use crate::wallet::{FileCustody, WalletRecord};

/// Open the configured session store
async fn open_store(config: &Config) -> Result<Arc<dyn SessionStore>> {
    match config.persistence.store {
        StoreKind::Memory => {
            warn!("Using in-memory session store, nothing survives a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreKind::File => {
            let store = JsonFileStore::open(&config.persistence.data_dir)
                .await
                .with_context(|| {
                    format!(
                        "Failed to open session store at {}",
                        config.persistence.data_dir.display()
                    )
                })?;
            Ok(Arc::new(store))
        }
    }
}

/// Wire every collaborator into a session manager
async fn build_manager(config: &Config) -> Result<SessionManager> {
    info!("Initializing RPC client...");
    let chain = Arc::new(ChainClient::new(
        &config.rpc.endpoint,
        Duration::from_millis(config.rpc.timeout_ms),
    ));

    let bonding_curve = Arc::new(
        BondingCurveVenue::new(chain.clone(), config.venues.bonding_curve())
            .context("Failed to create bonding-curve venue")?,
    );
    let aggregator = Arc::new(
        AggregatorVenue::new(chain.clone(), config.venues.aggregator())
            .context("Failed to create aggregator venue")?,
    );

    let fees: Arc<dyn FeeCollector> = if config.fees.enabled {
        let fee_wallet = Pubkey::from_str(&config.fees.fee_wallet)
            .context("Invalid fee wallet address")?;
        info!(fee_bps = config.fees.fee_bps, "Platform fees enabled");
        Arc::new(TransferFeeCollector::new(
            chain.clone(),
            fee_wallet,
            config.fees.schedule(),
        ))
    } else {
        info!("Platform fees disabled");
        Arc::new(NoFees)
    };

    let custody = Arc::new(
        FileCustody::load(&config.custody.credentials_dir)
            .context("Failed to load wallet custody")?,
    );

    let executor = Arc::new(TradeExecutor::new(
        bonding_curve,
        aggregator,
        custody.clone(),
        fees,
        config.executor.clone(),
    ));

    let store = open_store(config).await?;
    let classifier = Arc::new(StatusClassifier::new(config.classifier.clone()));
    let planner = Arc::new(AllocationPlanner::new(Randomizer::from_entropy(
        config.session.randomization.clone(),
    )));

    Ok(SessionManager::new(
        config.manager_config(),
        store,
        classifier,
        planner,
        executor,
        custody,
    ))
}

/// Run a volume session until it finishes or Ctrl-C is pressed
pub async fn start(
    config: &Config,
    user_id: &str,
    asset_id: &str,
    target_volume: Option<f64>,
) -> Result<()> {
    info!(user = %user_id, asset = %asset_id, "Starting volume session...");

    let manager = build_manager(config).await?;

    let session = manager
        .start_session(StartSessionRequest {
            user_id: user_id.to_string(),
            asset_id: asset_id.to_string(),
            target_volume,
            settings: None,
        })
        .await
        .context("Failed to start session")?;

    info!(
        session_id = %session.id,
        target = session.target_volume,
        "Session running, press Ctrl-C to stop"
    );

    let mut events = manager.subscribe_session(&session.id);
    let log_events = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            log_event(&event);
        }
    });

    tokio::select! {
        _ = manager.wait(&session.id) => {
            info!(session_id = %session.id, "Session scheduler finished");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown requested, stopping session...");
            manager.shutdown("Stopped by operator").await;
        }
    }

    log_events.abort();

    if let Some(session) = manager.get_session(&session.id).await? {
        print_session(&session);
    }

    Ok(())
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::StatusUpdate {
            executed_volume,
            target_volume,
            trade_count,
            pnl_sol,
            strategy,
            ..
        } => info!(
            strategy = %strategy,
            trades = trade_count,
            pnl = pnl_sol,
            "Volume {:.4}/{:.4} SOL",
            executed_volume,
            target_volume
        ),
        SessionEvent::TradeExecuted { record, .. } => debug!(
            wallet = %record.wallet_id,
            intent = %record.intent,
            volume = record.executed_volume,
            "Trade executed"
        ),
        SessionEvent::RuleTriggered { trigger, price, .. } => {
            warn!(trigger = %trigger, price, "Risk rule triggered")
        }
        SessionEvent::EmergencyStop { reason, .. } => error!("Emergency stop: {}", reason),
        SessionEvent::Error { message, .. } => warn!("Session error: {}", message),
        SessionEvent::SessionStarted { .. } | SessionEvent::SessionStopped { .. } => {
            info!(kind = event.kind(), "Session lifecycle")
        }
    }
}

/// Preview an execution plan without touching the chain
pub fn plan(
    config: &Config,
    strategy: &str,
    wallet_count: usize,
    volume: Option<f64>,
    seed: Option<u64>,
) -> Result<()> {
    let strategy = Strategy::from_str(strategy)?;
    let output = render_plan(config, strategy, wallet_count, volume, seed)?;
    println!("{}", output);
    Ok(())
}

fn render_plan(
    config: &Config,
    strategy: Strategy,
    wallet_count: usize,
    volume: Option<f64>,
    seed: Option<u64>,
) -> Result<String> {
    let randomization = config.session.randomization.clone();
    let planner = match seed {
        Some(seed) => AllocationPlanner::seeded(randomization, seed),
        None => AllocationPlanner::new(Randomizer::from_entropy(randomization)),
    };

    let wallets: Vec<WalletRecord> = (0..wallet_count)
        .map(|i| {
            WalletRecord::new(
                format!("wallet-{}", i + 1),
                "preview",
                Pubkey::new_unique().to_string(),
            )
        })
        .collect();

    let preview = Session::new("preview", "preview", config.session.target_volume_sol, strategy);
    let rules = config.session.rules_for(&preview);
    let plan = planner.generate_execution_plan(strategy, &wallets, volume, &rules)?;

    let mut out = format!(
        "\n=== EXECUTION PLAN ===\n\nStrategy: {}\nVolume: {:.4} SOL\n",
        plan.strategy, plan.total_volume
    );

    if plan.is_rejected() {
        out.push_str("\nREJECTED:\n");
        for violation in &plan.violations {
            out.push_str(&format!("  - {}\n", violation));
        }
        return Ok(out);
    }

    out.push_str(&format!("Transactions: {}\n\n", plan.transactions.len()));
    for tx in &plan.transactions {
        out.push_str(&format!(
            "  {:<10} {:<4} {:>10.6} SOL  {:?}{}\n",
            tx.wallet.id,
            tx.intent,
            tx.volume,
            tx.role,
            if tx.concurrent { " (concurrent)" } else { "" }
        ));
    }
    out.push_str(&format!("\nAllocated: {:.6} SOL\n", plan.allocated_volume()));
    Ok(out)
}

/// Classify a metrics snapshot read from a JSON file
pub async fn classify(config: &Config, metrics_path: &Path) -> Result<()> {
    let status = classify_file(config, metrics_path).await?;
    println!("\n=== CLASSIFICATION ===\n");
    println!("Phase: {}", status.phase);
    println!("Protocol state: {}", status.protocol_state);
    println!("Strategy: {}", status.strategy);
    println!("\nMetrics:");
    println!("{}", serde_json::to_string_pretty(&status.metrics)?);
    Ok(())
}

async fn classify_file(
    config: &Config,
    metrics_path: &Path,
) -> Result<crate::classifier::ClassifierStatus> {
    let content = tokio::fs::read_to_string(metrics_path)
        .await
        .with_context(|| format!("Failed to read {}", metrics_path.display()))?;
    let raw: RawMetrics =
        serde_json::from_str(&content).context("Failed to parse metrics JSON")?;
    let snapshot = MetricsSnapshot::from(&raw);

    let asset_id = metrics_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("asset");
    Ok(StatusClassifier::classify(asset_id, &snapshot, &config.classifier))
}

/// Show a stored session and its execution log
pub async fn status(config: &Config, session_id: &str) -> Result<()> {
    let store = open_store(config).await?;

    let Some(session) = store.load_session(session_id).await? else {
        anyhow::bail!("Session not found: {}", session_id);
    };
    print_session(&session);

    let records = store.load_executions(session_id).await?;
    println!("\n=== RECENT EXECUTIONS ({}) ===\n", records.len());
    if records.is_empty() {
        println!("No executions recorded.");
    }
    for record in records.iter().rev().take(20) {
        println!(
            "  {} {:<10} {:<4} {:>10.6} SOL  {:?}{}",
            record.executed_at.format("%H:%M:%S"),
            record.wallet_id,
            record.intent,
            record.executed_volume,
            record.outcome,
            record
                .reason
                .as_ref()
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        );
    }

    Ok(())
}

fn print_session(session: &Session) {
    println!("\n=== SESSION {} ===\n", session.id);
    println!("User: {}", session.user_id);
    println!("Asset: {}", session.asset_id);
    println!("Status: {}", session.status);
    if let Some(reason) = &session.status_reason {
        println!("Reason: {}", reason);
    }
    println!("Strategy: {}", session.strategy);
    println!(
        "Volume: {:.4} / {:.4} SOL ({:.1}%)",
        session.executed_volume,
        session.target_volume,
        if session.target_volume > 0.0 {
            session.executed_volume / session.target_volume * 100.0
        } else {
            0.0
        }
    );
    println!(
        "Trades: {} ok, {} skipped, {} failed over {} cycles",
        session.trade_count, session.skipped_count, session.failed_count, session.cycle_count
    );
    println!("Fees: {:.6} SOL ({} transfers)", session.fees_paid, session.fee_count);
    println!("P&L: {:+.6} SOL", session.pnl_sol);
    if let Some(error) = &session.error_message {
        println!("Last error: {}", error);
    }
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}
