// =============================================================================
// TraceT Trigger: Main Entry Point
// =============================================================================
//
// Reads alerts, groups them by trigger id, evaluates every active observing
// policy and schedules MWA / ATCA observations for the ones worth observing.
// Decisions and observations are kept in memory and snapshotted to disk.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alert;
mod audit;
mod config;
mod decision;
mod engine;
mod error;
mod geometry;
mod grouping;
mod ingest;
mod orchestrator;
mod pointing;
mod policy;
mod rules;
mod scheduler;
mod skymap;
mod store;
mod types;
mod visibility;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::engine::TriggerEngine;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::policy::PolicyStore;
use crate::scheduler::HttpScheduler;
use crate::skymap::HttpSkyMapSource;
use crate::store::MemoryStore;

/// Alerts buffered between the source and the engine.
const ALERT_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("TraceT trigger service starting");

    let config_path =
        std::env::var("TRACET_CONFIG").unwrap_or_else(|_| "tracet_config.json".into());
    let config_exists = Path::new(&config_path).exists();
    let mut config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %config_path, "Failed to load config, using defaults");
        EngineConfig::default()
    });
    if !config_exists {
        if let Err(e) = config.save(&config_path) {
            warn!(error = %e, "Failed to write default config");
        }
    }
    config.apply_env_overrides();

    info!(
        alerts = %config.alerts_path,
        policies = %config.policies_path,
        store = %config.store_path,
        "Configured inputs"
    );

    // ── 2. Policies ──────────────────────────────────────────────────────
    let policies = Arc::new(PolicyStore::load(&config.policies_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load policies, starting with none");
        PolicyStore::new(Vec::new())
    }));

    // ── 3. Persistence ───────────────────────────────────────────────────
    let store = if Path::new(&config.store_path).exists() {
        match MemoryStore::load(&config.store_path) {
            Ok(store) => store,
            Err(e) => {
                warn!(error = %e, "Failed to load store snapshot, starting empty");
                MemoryStore::new()
            }
        }
    } else {
        MemoryStore::new()
    };
    let store = Arc::new(store);

    // ── 4. Collaborators ─────────────────────────────────────────────────
    let scheduler = Arc::new(HttpScheduler::new(
        config.mwa_scheduler_url.clone(),
        config.atca_scheduler_url.clone(),
        Duration::from_secs(config.schedule_timeout_secs),
    )?);
    let skymaps = Arc::new(HttpSkyMapSource::new(Duration::from_secs(
        config.skymap_timeout_secs,
    ))?);

    let orchestrator = Orchestrator::new(
        scheduler,
        skymaps,
        store.clone(),
        OrchestratorSettings {
            mwa_location: config.mwa_location,
            atca_location: config.atca_location,
            declustering_radius: config.declustering_radius_deg,
            schedule_timeout: Duration::from_secs(config.schedule_timeout_secs),
            creator: config.creator.clone(),
        },
    );

    let engine = Arc::new(TriggerEngine::new(
        policies.clone(),
        store.clone(),
        orchestrator,
        config.max_concurrent_orchestrations,
        config.gw_max_event_age(),
    ));

    // ── 5. Policy refresh loop ───────────────────────────────────────────
    tokio::spawn(policies.clone().run_refresh(
        config.policies_path.clone(),
        Duration::from_secs(config.policy_refresh_secs.max(1)),
    ));

    // ── 6. Store snapshot loop ───────────────────────────────────────────
    let snapshot_store = store.clone();
    let snapshot_path = config.store_path.clone();
    let snapshot_every = Duration::from_secs(config.store_save_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(snapshot_every);
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = snapshot_store.save(&snapshot_path) {
                warn!(error = %e, "periodic store snapshot failed");
            }
        }
    });

    // ── 7. Alert source → engine ─────────────────────────────────────────
    let (tx, rx) = mpsc::channel(ALERT_CHANNEL_CAPACITY);
    let alerts_path = config.alerts_path.clone();
    tokio::spawn(async move {
        if let Err(e) = ingest::run_alert_source(alerts_path, tx).await {
            error!(error = ?e, "alert source failed");
        }
    });
    tokio::spawn(engine.clone().run(rx));

    info!(
        policies = policies.snapshot().len(),
        decisions = store.decision_count(),
        "All subsystems running. Press Ctrl+C to stop."
    );

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping gracefully");

    if let Err(e) = store.save(&config.store_path) {
        error!(error = %e, "Failed to save store snapshot on shutdown");
    }

    info!(
        groups = engine.groups().len(),
        observations = store.observation_count(),
        "TraceT trigger service shut down complete."
    );
    Ok(())
}
