// =============================================================================
// Meridian engine — main entry point
// =============================================================================
//
// Paper trading only. A config asking for live execution fails closed.
//
// Exit codes:
//   0   normal shutdown
//   1   startup failure (bad config, cache unreachable)
//   2   watchdog permanent shutdown engaged (human intervention required)
//   130 interrupted by SIGINT
//
// Run the watchdog as a SEPARATE process:
//   meridian-watchdog
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meridian::api;
use meridian::broker::{BrokerGateway, FreeDataClient, PaperBroker, SharedPaperBroker};
use meridian::config::EngineConfig;
use meridian::engine::TradingEngine;
use meridian::fabric::BroadcastFabric;
use meridian::storage::{
    AppendLog, ColumnStore, MemoryStateStore, RedisStateStore, StateStore,
};
use meridian::watchdog::HaltMarker;

/// Default append-log rotation: 100 MB active file, ten compressed rotations.
const LOG_MAX_MB: f64 = 100.0;
const LOG_ROTATIONS: usize = 10;

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian engine starting up");

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "startup failed");
            1
        }
    };

    std::process::exit(code);
}

async fn run() -> Result<i32> {
    // ── 1. Configuration ─────────────────────────────────────────────────
    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "config/meridian.json".into());
    let mut config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "config load failed, using defaults");
        EngineConfig::default()
    });

    if let Ok(symbols) = std::env::var("MERIDIAN_SYMBOLS") {
        config.symbols = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    // Live execution fails closed, before anything touches a broker.
    config.validate()?;

    // ── 2. Permanent-shutdown flag ───────────────────────────────────────
    let halt_marker = HaltMarker::new(&config.halt_marker_file);
    if halt_marker.engaged() {
        error!(
            reason = halt_marker.reason().as_deref().unwrap_or("unknown"),
            "watchdog permanent shutdown engaged; refusing to start"
        );
        return Ok(2);
    }

    // ── 3. Storage substrate ─────────────────────────────────────────────
    let log = Arc::new(AppendLog::open(
        &config.storage.append_log_path,
        LOG_MAX_MB,
        LOG_ROTATIONS,
    )?);
    let store = Arc::new(ColumnStore::open(&config.storage.column_store_path)?);

    let cache: Arc<dyn StateStore> = match RedisStateStore::connect(
        &config.storage.cache_url(),
        Duration::from_secs(config.storage.cache_socket_timeout_secs),
    ) {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            if std::env::var("MERIDIAN_ALLOW_MEMORY_CACHE").is_ok() {
                warn!(error = %e, "cache unreachable; degraded in-memory cache (watchdog blind!)");
                Arc::new(MemoryStateStore::new())
            } else {
                return Err(e).context("live state cache unreachable");
            }
        }
    };

    // ── 4. Broker (paper only) ───────────────────────────────────────────
    // The brokerage books live on a shared endpoint so the watchdog's own
    // connection observes the same account this process trades. The engine's
    // credentials come from ITS environment; the watchdog carries different
    // ones.
    let api_key = std::env::var("MERIDIAN_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("MERIDIAN_API_SECRET").unwrap_or_default();
    let broker_url = config.broker.endpoint_url(&api_key, &api_secret);

    let broker: Arc<dyn BrokerGateway> = match SharedPaperBroker::connect(
        &broker_url,
        Duration::from_secs(config.storage.cache_socket_timeout_secs),
        config.broker.spread_bps,
        config.broker.slippage_bps,
    ) {
        Ok(shared) => {
            // Seed the account only if no books exist yet; a restart never
            // resets a live book.
            shared.ensure_account(config.broker.initial_cash)?;
            Arc::new(shared)
        }
        Err(e) => {
            if std::env::var("MERIDIAN_ALLOW_MEMORY_CACHE").is_ok() {
                warn!(error = %e, "brokerage endpoint unreachable; in-process paper broker (watchdog cannot see this account!)");
                Arc::new(PaperBroker::new(
                    config.broker.initial_cash,
                    config.broker.spread_bps,
                    config.broker.slippage_bps,
                ))
            } else {
                return Err(e).context("paper brokerage endpoint unreachable");
            }
        }
    };

    let account = broker.get_account().await.context("account probe failed")?;
    info!(equity = account.equity, "broker account ready");

    // ── 5. PID file (the watchdog's kill handle) ─────────────────────────
    let pid_file = std::path::PathBuf::from(&config.pid_file);
    if let Some(parent) = pid_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&pid_file, format!("{}\n", std::process::id()))
        .with_context(|| format!("failed to write pid file {}", pid_file.display()))?;

    // ── 6. Broadcast fabric + API server ─────────────────────────────────
    let fabric = Arc::new(BroadcastFabric::new(cache.clone()));
    tokio::spawn(fabric.clone().run_sampler());

    let bind_addr =
        std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    {
        let app = api::router(fabric.clone());
        let bind_addr = bind_addr.clone();
        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(listener) => {
                    info!(addr = %bind_addr, "API server listening");
                    if let Err(e) = axum::serve(listener, app).await {
                        error!(error = %e, "API server failed");
                    }
                }
                Err(e) => error!(addr = %bind_addr, error = %e, "API bind failed"),
            }
        });
    }

    // ── 7. Trading engine ────────────────────────────────────────────────
    let mut engine = TradingEngine::new(
        config.clone(),
        broker,
        log.clone(),
        store.clone(),
        cache.clone(),
        Some(FreeDataClient::new()),
        account.equity,
    )?;

    // ── 8. Graceful shutdown wiring ──────────────────────────────────────
    // SIGTERM is the watchdog's graceful stop; SIGINT is an operator ^C.
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let interrupted = Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("sigterm handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    warn!("SIGINT received");
                    interrupted.store(true, std::sync::atomic::Ordering::SeqCst);
                }
                _ = sigterm.recv() => {
                    warn!("SIGTERM received (graceful stop)");
                }
            }
            let _ = stop_tx.send(true);
        });
    }

    info!("all subsystems running");
    engine.run(stop_rx).await;

    // ── 9. Shutdown protocol ─────────────────────────────────────────────
    // Stop producing, flush the log, close the store and cache, drop the
    // PID file, exit.
    if let Err(e) = log.flush() {
        error!(error = %e, "log flush failed");
    }
    if let Err(e) = log.close() {
        error!(error = %e, "log close failed");
    }
    if let Err(e) = store.close() {
        error!(error = %e, "column store close failed");
    }
    if let Err(e) = cache.close() {
        error!(error = %e, "cache close failed");
    }
    if pid_file.exists() {
        let _ = std::fs::remove_file(&pid_file);
    }

    info!("Meridian engine shut down complete");

    if interrupted.load(std::sync::atomic::Ordering::SeqCst) {
        Ok(130)
    } else {
        Ok(0)
    }
}
