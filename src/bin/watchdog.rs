// =============================================================================
// Meridian watchdog — independent supervisor entry point
// =============================================================================
//
// Runs as a completely separate process from the engine:
//   - its own credentials (MERIDIAN_WATCHDOG_* environment),
//   - its own broker connection,
//   - no shared memory with the engine.
//
// It observes the engine through the broker, the cache heartbeat, and the
// PID file; it acts through the broker and OS signals. Kill rules are frozen
// at build time.
//
// Exit codes: 0 on interrupt, 1 on startup failure, 2 when the permanent
// shutdown flag is engaged at startup.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meridian::broker::{BrokerGateway, SharedPaperBroker};
use meridian::config::EngineConfig;
use meridian::storage::{RedisStateStore, StateStore};
use meridian::watchdog::{KillRules, UnixProcessController, Watchdog};

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian watchdog starting up");

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "watchdog startup failed");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    // The watchdog reads the same config file for paths and endpoints only
    // (pid file, halt marker, cache and brokerage endpoints). Kill rules
    // are never configurable.
    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "config/meridian.json".into());
    let config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "config load failed, using defaults");
        EngineConfig::default()
    });

    let check_interval: u64 = std::env::var("MERIDIAN_WATCHDOG_INTERVAL")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);

    // Its own cache connection; the heartbeat key is the only thing shared
    // with the engine, and only through the cache server.
    let cache: Arc<dyn StateStore> = Arc::new(
        RedisStateStore::connect(
            &config.storage.cache_url(),
            Duration::from_secs(config.storage.cache_socket_timeout_secs),
        )
        .context("live state cache unreachable")?,
    );

    // Its own broker connection to the SHARED brokerage endpoint,
    // authenticated with its OWN credentials — never the engine's. Both
    // processes observe the same account; neither can reach into the
    // other's memory. The watchdog never seeds the books: if the engine
    // has not created the account yet there is nothing to supervise, and
    // every poll defers until the books appear.
    let api_key = std::env::var("MERIDIAN_WATCHDOG_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("MERIDIAN_WATCHDOG_API_SECRET").unwrap_or_default();
    let broker_url = config.broker.endpoint_url(&api_key, &api_secret);

    let broker: Arc<dyn BrokerGateway> = Arc::new(
        SharedPaperBroker::connect(
            &broker_url,
            Duration::from_secs(config.storage.cache_socket_timeout_secs),
            config.broker.spread_bps,
            config.broker.slippage_bps,
        )
        .context("paper brokerage endpoint unreachable")?,
    );

    let mut watchdog = Watchdog::new(
        KillRules::default(),
        broker,
        cache,
        Arc::new(UnixProcessController),
        &config.pid_file,
        &config.halt_marker_file,
        Duration::from_secs(check_interval),
    );

    if watchdog.is_permanently_halted() {
        error!("permanent shutdown flag engaged; refusing to monitor");
        return Ok(2);
    }

    tokio::select! {
        _ = watchdog.run() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("watchdog interrupted");
        }
    }

    Ok(0)
}
