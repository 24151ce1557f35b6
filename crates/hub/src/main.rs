//! Hub entry point: reads config, restores persisted actuator state, opens
//! the CCM multicast bus, and wires up the per-actuator runners, calibration
//! jobs, operator API, and signal handling.
//!
//! Safety features:
//! - Signal handler: SIGTERM/SIGINT → OFF to every energised actuator
//! - Crash detection: unclean snapshot → positions stale → calibration
//! - Per-actuator watchdog: forced OFF at max continuous motor time
//! - Absolute irrigation duration cap, enforced at every priority level
//! - Rain interlock: automatic roof opening refused while rain is detected

mod arbiter;
mod bus;
mod ccm;
mod config;
mod error;
mod fsm;
mod intent;
mod queue;
mod registry;
mod safety;
mod scheduler;
mod state;
mod store;
mod web;

use anyhow::Result;
use std::{env, sync::Arc};
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

use bus::UdpCcmBus;
use registry::ActuatorRegistry;
use state::SystemState;
use store::StateStore;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Structured logging ──────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    let registry = Arc::new(ActuatorRegistry::from_descriptors(cfg.actuators.clone())?);
    if registry.is_empty() {
        warn!("no actuators configured");
    }

    // ── Persisted state ─────────────────────────────────────────────
    let state_path = env::var("STATE_PATH").unwrap_or_else(|_| "actuators.json".to_string());
    let (store, clean) = StateStore::load(&state_path)?;
    if !clean {
        warn!("previous run did not shut down cleanly — restored positions are stale");
    }

    // ── Shared live view ────────────────────────────────────────────
    let shared = Arc::new(RwLock::new(SystemState::new(registry.iter())));
    {
        let mut st = shared.write().await;
        st.record_system("hub started".to_string());
    }

    // ── Bus ─────────────────────────────────────────────────────────
    let ccm_bus = Arc::new(UdpCcmBus::open(&cfg.bus).await?);
    let (rain_tx, rain_rx) = watch::channel(false);
    {
        let bus_cfg = cfg.bus.clone();
        let rx_registry = Arc::clone(&registry);
        let rx_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            if let Err(e) = bus::run_receiver(&bus_cfg, rx_registry, rx_shared, rain_tx).await {
                error!("bus receiver stopped: {e:#}");
            }
        });
    }

    // ── Actuator runners ────────────────────────────────────────────
    let hub = Arc::new(scheduler::spawn_actuators(
        &registry,
        store.clone(),
        ccm_bus,
        Arc::clone(&shared),
        Arc::new(cfg.bus.suffix.clone()),
        &cfg.queue,
        rain_rx,
        !clean,
        cfg.calibration.on_startup,
    ));

    // ── Daily calibration ───────────────────────────────────────────
    tokio::spawn(scheduler::run_daily_calibration(
        Arc::clone(&hub),
        cfg.calibration.daily_reset_hour,
    ));

    // ── Operator API ────────────────────────────────────────────────
    {
        let web_shared = Arc::clone(&shared);
        let web_hub = Arc::clone(&hub);
        let web_store = store.clone();
        tokio::spawn(async move {
            web::serve(web_shared, web_hub, web_store).await;
        });
    }

    info!(
        actuators = registry.len(),
        bus = %format!("{}:{}", cfg.bus.multicast_addr, cfg.bus.port),
        "hub ready"
    );

    // ── Signal handling ─────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason = tokio::select! {
        _ = &mut ctrl_c => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };

    // ── Graceful shutdown ───────────────────────────────────────────
    warn!(signal = exit_reason, "shutting down — stopping all motors");
    hub.shutdown_all().await;
    if let Err(e) = store.mark_clean() {
        error!("failed to mark snapshot clean: {e:#}");
    }
    {
        let mut st = shared.write().await;
        st.record_system(format!("shutdown: {exit_reason}"));
    }

    info!("shutdown complete");
    Ok(())
}
