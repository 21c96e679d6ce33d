// =============================================================================
// Trading Loop — the per-tick orchestration of the whole engine
// =============================================================================
//
// One tick (~1 s):
//   1. Probe the market clock; closed markets get a heartbeat and nothing else.
//   2. Sync positions from the broker into the cache (broker is TRUTH).
//   3. Friday cutoff: past the configured time, cancel everything, flatten
//      everything, log a risk alert, and generate no signals into a weekend.
//   4. Periodically drain the append log into the column store (ETL).
//   5. Periodically reconcile orders and positions against the broker.
//   6. Per symbol: bars -> regime -> strategies -> signals.
//   7. Drawdown update; a halt skips execution entirely.
//   8. Size, mint, and submit each signal; timeouts hand off to the
//      reconciler and are never retried blind.
//   9. Metrics and heartbeat (TTL = 2x the tick interval).
//
// Every tick runs inside an error boundary: failures are logged as error
// events and the next tick repairs state. Only the graceful-stop signal ends
// the loop.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDateTime, NaiveTime, Utc, Weekday};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::alerter::Alerter;
use crate::broker::{BrokerGateway, FreeDataClient, OrderStatusFilter};
use crate::config::EngineConfig;
use crate::events;
use crate::execution::{map_broker_status, OrderManager, OrderStatus, Reconciler};
use crate::metrics;
use crate::regime::{MarketRegime, RegimeDetector};
use crate::risk::sizer::SizingInputs;
use crate::risk::{DrawdownMonitor, PositionSizer};
use crate::storage::{AppendLog, BarReadMode, ColumnStore, EtlPipeline, StateStore};
use crate::strategy::{EmaCrossover, RsiReversion, Signal, SignalType, Strategy};
use crate::types::{Bar, OrderType, Side};

/// Process name used for heartbeats; the watchdog watches this key.
pub const ENGINE_PROCESS: &str = "engine";

/// Lookback used when fetching bars for regime detection and signals.
const BAR_LOOKBACK_DAYS: i64 = 90;

/// True when `now` is a Friday at or past the cutoff time.
pub fn friday_cutoff_due(now: NaiveDateTime, cutoff: NaiveTime) -> bool {
    now.weekday() == Weekday::Fri && now.time() >= cutoff
}

pub struct TradingEngine {
    config: EngineConfig,
    cutoff: NaiveTime,
    broker: Arc<dyn BrokerGateway>,
    log: Arc<AppendLog>,
    store: Arc<ColumnStore>,
    cache: Arc<dyn StateStore>,
    orders: Arc<OrderManager>,
    reconciler: Reconciler,
    detector: RegimeDetector,
    strategies: Vec<Box<dyn Strategy>>,
    sizer: PositionSizer,
    drawdown: DrawdownMonitor,
    alerter: Alerter,
    etl: Arc<EtlPipeline>,
    /// Fallback bar source when the column store has nothing yet.
    data: Option<FreeDataClient>,
    last_etl: Option<Instant>,
    last_reconcile: Option<Instant>,
    last_heartbeat_event: Option<Instant>,
    last_regime_combined: Option<String>,
}

impl TradingEngine {
    pub fn new(
        config: EngineConfig,
        broker: Arc<dyn BrokerGateway>,
        log: Arc<AppendLog>,
        store: Arc<ColumnStore>,
        cache: Arc<dyn StateStore>,
        data: Option<FreeDataClient>,
        initial_equity: f64,
    ) -> Result<Self> {
        let cutoff = config.friday_cutoff_time()?;

        let orders = Arc::new(OrderManager::new());
        let reconciler = Reconciler::new(orders.clone(), broker.clone(), cache.clone());

        let mut strategies: Vec<Box<dyn Strategy>> = Vec::new();
        if config.strategies.ema_crossover.enabled {
            strategies.push(Box::new(EmaCrossover::new(&config.strategies.ema_crossover)));
        }
        if config.strategies.rsi_mean_reversion.enabled {
            strategies.push(Box::new(RsiReversion::new(
                &config.strategies.rsi_mean_reversion,
            )));
        }

        let etl = Arc::new(EtlPipeline::new(
            log.clone(),
            store.clone(),
            config.etl.batch_interval_secs,
            config.etl.max_batch_size,
        ));

        let sizer = PositionSizer::new(&config.risk);
        let drawdown = DrawdownMonitor::new(
            config.risk.max_daily_drawdown_pct,
            config.risk.max_total_drawdown_pct,
            initial_equity,
        );
        let detector = RegimeDetector::new(&config.regime);

        cache.set_initial_equity(initial_equity)?;

        info!(
            symbols = ?config.symbols,
            strategies = strategies.len(),
            dry_run = config.execution.dry_run,
            "trading engine initialised"
        );

        Ok(Self {
            config,
            cutoff,
            broker,
            log,
            store,
            cache,
            orders,
            reconciler,
            detector,
            strategies,
            sizer,
            drawdown,
            alerter: Alerter::default(),
            etl,
            data,
            last_etl: None,
            last_reconcile: None,
            last_heartbeat_event: None,
            last_regime_combined: None,
        })
    }

    pub fn orders(&self) -> Arc<OrderManager> {
        self.orders.clone()
    }

    /// Run until the graceful-stop signal flips. Every tick failure is
    /// caught, logged as an error event, and survived.
    pub async fn run(&mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let tick = Duration::from_secs(self.config.tick_interval_secs.max(1));
        info!(tick_secs = tick.as_secs(), "trading loop starting");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "tick error");
                        let _ = self.log.write(&events::error_event("tick", &format!("{e:#}")));
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("trading loop stopped (graceful)");
    }

    /// One tick at the current wall clock.
    pub async fn tick(&mut self) -> Result<()> {
        let now = chrono::Local::now().naive_local();
        self.tick_at(now).await
    }

    /// One tick at an explicit local time. Split out so the Friday cutoff
    /// and market-closed paths are drivable in tests.
    pub async fn tick_at(&mut self, now: NaiveDateTime) -> Result<()> {
        // 1. Market clock gate.
        let clock = self.broker.get_clock().await.context("clock probe failed")?;
        if !clock.is_open {
            debug!("market closed");
            self.heartbeat();
            return Ok(());
        }

        // 2. Broker truth into the cache.
        if let Err(e) = self.reconciler.reconcile_positions().await {
            warn!(error = %e, "position sync failed");
        }

        // 3. Friday cutoff: flatten and stand down.
        if friday_cutoff_due(now, self.cutoff) {
            self.force_weekend_flat().await;
            self.heartbeat();
            return Ok(());
        }

        // 4. ETL batch.
        let etl_due = self
            .last_etl
            .map(|t| t.elapsed().as_secs() >= self.config.etl.batch_interval_secs)
            .unwrap_or(true);
        if etl_due {
            if let Err(e) = self.etl.run_once() {
                warn!(error = %e, "etl batch failed");
            }
            self.last_etl = Some(Instant::now());
        }

        // 5. Order + position reconciliation.
        let reconcile_due = self
            .last_reconcile
            .map(|t| t.elapsed().as_secs() >= self.config.execution.reconcile_interval_secs)
            .unwrap_or(true);
        if reconcile_due {
            self.reconciler.reconcile_all().await;
            if let Err(e) = self.reconciler.reconcile_positions().await {
                warn!(error = %e, "position reconciliation failed");
            }
            self.last_reconcile = Some(Instant::now());
        }

        // 6. Signals per symbol.
        let signals = self.collect_signals().await;

        // 7. Portfolio value and drawdown policy.
        let account = self.broker.get_account().await.context("account fetch failed")?;
        let prev_equity = self
            .cache
            .get_state("last_equity")
            .ok()
            .flatten()
            .and_then(|v| v.as_f64());

        let dd = self.drawdown.update(account.equity, prev_equity);
        let halted = self.drawdown.should_halt_trading(&dd);
        let dd_scale = self.drawdown.position_scale(&dd);

        let _ = self
            .cache
            .set_state("last_equity", &serde_json::json!(account.equity));
        let _ = self.cache.push_equity(account.equity);

        if halted {
            let msg = format!(
                "trading halted: total drawdown {:.2}% beyond limit",
                dd.total_drawdown_pct
            );
            self.alerter.critical(&msg);
            let _ = self.log.write(&events::risk_alert_event(
                "drawdown_halt",
                serde_json::json!({
                    "total_drawdown_pct": dd.total_drawdown_pct,
                    "current_drawdown_pct": dd.current_drawdown_pct,
                }),
            ));
        } else {
            // 8. Execute.
            for (signal, regime_scale, slow_vol) in signals {
                let scale = regime_scale * dd_scale;
                if let Err(e) = self
                    .execute_signal(&signal, account.equity, scale, slow_vol)
                    .await
                {
                    warn!(signal_id = %signal.signal_id, error = %e, "signal execution failed");
                }
            }
        }

        // 9. Metrics + heartbeat.
        self.record_metrics(&account, prev_equity, &dd);
        self.heartbeat();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Friday cutoff
    // -------------------------------------------------------------------------

    /// Cancel all open orders, close all positions, and record the alert.
    /// No weekend risk. Idle books are left alone so the cutoff does not
    /// spam the log once flat.
    pub async fn force_weekend_flat(&mut self) {
        let open_orders = match self.broker.list_orders(OrderStatusFilter::Open, 500).await {
            Ok(orders) => orders.len(),
            Err(e) => {
                warn!(error = %e, "open order listing failed during cutoff");
                0
            }
        };
        let positions = match self.broker.list_positions().await {
            Ok(p) => p.len(),
            Err(e) => {
                warn!(error = %e, "position listing failed during cutoff");
                0
            }
        };

        if open_orders == 0 && positions == 0 {
            return;
        }

        warn!(open_orders, positions, "friday cutoff: flattening for the weekend");

        let cancelled = match self.broker.cancel_all_orders().await {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "cancel-all failed during cutoff");
                0
            }
        };
        let closed = match self.broker.close_all_positions().await {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "close-all failed during cutoff");
                0
            }
        };

        if let Err(e) = self.reconciler.reconcile_positions().await {
            warn!(error = %e, "position refresh failed after cutoff");
        }

        self.alerter
            .warning("friday force close: all orders cancelled, all positions closed");
        let _ = self.log.write(&events::risk_alert_event(
            "friday_force_close",
            serde_json::json!({
                "orders_cancelled": cancelled,
                "positions_closed": closed,
            }),
        ));
    }

    // -------------------------------------------------------------------------
    // Signal collection
    // -------------------------------------------------------------------------

    /// Fan each symbol out to the regime detector and every enabled
    /// strategy. Returns signals paired with the regime's position scale and
    /// slow volatility (the sizing input).
    async fn collect_signals(&mut self) -> Vec<(Signal, f64, Option<f64>)> {
        let mut collected = Vec::new();
        let symbols = self.config.symbols.clone();

        for symbol in symbols {
            let bars = match self.fetch_bars(&symbol).await {
                Ok(bars) if !bars.is_empty() => bars,
                Ok(_) => {
                    debug!(symbol, "no bars available, skipping");
                    continue;
                }
                Err(e) => {
                    // Tier violations land here: a hard failure for this
                    // symbol, loudly logged, never silently tolerated.
                    error!(symbol, error = %e, "bar fetch failed");
                    let _ = self
                        .log
                        .write(&events::error_event("bar_fetch", &format!("{symbol}: {e:#}")));
                    continue;
                }
            };

            let regime = self.detector.detect(&bars, Some(symbol.as_str()));
            self.record_regime(&regime);

            let position = self.cache.get_position(&symbol).ok().flatten();

            for strategy in &self.strategies {
                let signals = strategy.generate(&symbol, &bars, Some(&regime), position.as_ref());
                for signal in signals {
                    let _ = self.log.write(&events::signal_event(
                        &signal.symbol,
                        &signal.signal_id,
                        &signal.strategy_id,
                        &signal.signal_type.to_string(),
                        signal.confidence,
                    ));
                    collected.push((signal, regime.position_scale, regime.slow_vol));
                }
            }
        }

        collected
    }

    /// Bars from the column store, falling back to the free data source
    /// (which also seeds the store for next time).
    async fn fetch_bars(&self, symbol: &str) -> Result<Vec<Bar>> {
        let end = Utc::now();
        let start = end - chrono::Duration::days(BAR_LOOKBACK_DAYS);

        let bars = self
            .store
            .get_bars(symbol, start, end, "1Day", BarReadMode::Backtest)?;
        if !bars.is_empty() {
            return Ok(bars);
        }

        if let Some(data) = &self.data {
            match data.get_daily_bars(symbol, BAR_LOOKBACK_DAYS as usize).await {
                Ok(fetched) if !fetched.is_empty() => {
                    if let Err(e) = self.store.insert_bars(&fetched) {
                        warn!(symbol, error = %e, "bar backfill insert failed");
                    }
                    return Ok(fetched);
                }
                Ok(_) => {}
                Err(e) => warn!(symbol, error = %e, "bar fallback fetch failed"),
            }
        }

        Ok(Vec::new())
    }

    fn record_regime(&mut self, regime: &MarketRegime) {
        if let Err(e) = self.store.insert_regime(&regime.to_row()) {
            warn!(error = %e, "regime store write failed");
        }
        if let Ok(value) = serde_json::to_value(regime) {
            let _ = self.cache.set_state("current_regime", &value);
        }

        // The regime-change event fires on change, not on every detection.
        let combined = regime.combined();
        if self.last_regime_combined.as_deref() != Some(&combined) {
            let _ = self.log.write(&events::regime_event(
                regime.symbol.as_deref(),
                serde_json::to_value(regime).unwrap_or_default(),
            ));
            self.last_regime_combined = Some(combined);
        }
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    async fn execute_signal(
        &self,
        signal: &Signal,
        equity: f64,
        scale: f64,
        slow_vol: Option<f64>,
    ) -> Result<()> {
        match signal.signal_type {
            SignalType::Buy => self.execute_buy(signal, equity, scale, slow_vol).await,
            SignalType::Sell | SignalType::Close => self.execute_close(signal).await,
            SignalType::Hold => Ok(()),
        }
    }

    async fn execute_buy(
        &self,
        signal: &Signal,
        equity: f64,
        scale: f64,
        slow_vol: Option<f64>,
    ) -> Result<()> {
        let price = match signal.entry_price {
            Some(price) if price > 0.0 => price,
            _ => {
                warn!(signal_id = %signal.signal_id, "buy signal without a usable entry price");
                return Ok(());
            }
        };

        let size = self.sizer.size(
            equity,
            &signal.symbol,
            price,
            SizingInputs {
                volatility: slow_vol,
                ..Default::default()
            },
            scale,
        );
        debug!(signal_id = %signal.signal_id, rationale = %size.rationale, "position sized");

        if size.shares <= 0.0 {
            return Ok(());
        }

        let order = self.orders.mint(
            &signal.symbol,
            Side::Buy,
            size.shares,
            OrderType::Limit,
            Some(price),
            Some(&signal.strategy_id),
            Some(&signal.signal_id),
        )?;

        self.submit(order.client_order_id.clone()).await
    }

    async fn execute_close(&self, signal: &Signal) -> Result<()> {
        let position = match self.cache.get_position(&signal.symbol)? {
            Some(position) if position.qty.abs() > 0.0 => position,
            _ => {
                debug!(symbol = %signal.symbol, "close signal with no position");
                return Ok(());
            }
        };

        let order = self.orders.mint(
            &signal.symbol,
            Side::Sell,
            position.qty.abs(),
            OrderType::Market,
            None,
            Some(&signal.strategy_id),
            Some(&signal.signal_id),
        )?;

        self.submit(order.client_order_id.clone()).await
    }

    /// Submit an order with the timeout -> UNKNOWN -> reconcile protocol.
    async fn submit(&self, client_order_id: String) -> Result<()> {
        let order = self
            .orders
            .get(&client_order_id)
            .context("minted order vanished")?;

        if self.config.execution.dry_run {
            // Record the intent; never touch the broker.
            info!(client_order_id = %order.client_order_id, "dry run: order intent recorded");
            let _ = self.log.write(&events::order_event(
                events::EventKind::OrderSubmitted,
                &order.symbol,
                &order.client_order_id,
                None,
                order.side,
                order.qty,
                order.limit_price,
                None,
                None,
            ));
            return Ok(());
        }

        let timeout = Duration::from_secs(self.config.execution.submit_timeout_secs.max(5));
        let submit = async {
            match order.order_type {
                OrderType::Limit => {
                    self.broker
                        .submit_limit_order(
                            &order.symbol,
                            order.qty,
                            order.side,
                            order.limit_price.unwrap_or_default(),
                            &order.client_order_id,
                        )
                        .await
                }
                OrderType::Market => {
                    self.broker
                        .submit_market_order(
                            &order.symbol,
                            order.qty,
                            order.side,
                            &order.client_order_id,
                        )
                        .await
                }
            }
        };

        match tokio::time::timeout(timeout, submit).await {
            Ok(Ok(broker_order)) => {
                if map_broker_status(&broker_order.status) == OrderStatus::Failed {
                    warn!(
                        client_order_id = %order.client_order_id,
                        status = %broker_order.status,
                        "order refused by broker"
                    );
                    let _ = self.orders.mark_failed(&order.client_order_id);
                    let _ = self.log.write(&events::order_event(
                        events::EventKind::OrderRejected,
                        &order.symbol,
                        &order.client_order_id,
                        Some(&broker_order.id),
                        order.side,
                        order.qty,
                        order.limit_price,
                        None,
                        None,
                    ));
                    return Ok(());
                }

                let _ = self
                    .orders
                    .mark_submitted(&order.client_order_id, &broker_order.id);
                let _ = self.log.write(&events::order_event(
                    events::EventKind::OrderSubmitted,
                    &order.symbol,
                    &order.client_order_id,
                    Some(&broker_order.id),
                    order.side,
                    order.qty,
                    order.limit_price,
                    None,
                    None,
                ));

                // Paper fills are immediate; reflect them.
                if map_broker_status(&broker_order.status) == OrderStatus::Filled {
                    let fill_price = broker_order
                        .filled_avg_price
                        .or(order.limit_price)
                        .unwrap_or_default();
                    let _ = self.orders.mark_filled(
                        &order.client_order_id,
                        broker_order.filled_qty,
                        fill_price,
                    );
                    let _ = self.log.write(&events::order_event(
                        events::EventKind::OrderFilled,
                        &order.symbol,
                        &order.client_order_id,
                        Some(&broker_order.id),
                        order.side,
                        order.qty,
                        order.limit_price,
                        Some(broker_order.filled_qty),
                        Some(fill_price),
                    ));
                }

                if let Some(updated) = self.orders.get(&order.client_order_id) {
                    let _ = self.cache.set_order(&updated.to_cached());
                }
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(client_order_id = %order.client_order_id, error = %e, "submit failed");
                let _ = self.orders.mark_failed(&order.client_order_id);
                let _ = self.log.write(&events::order_event(
                    events::EventKind::OrderRejected,
                    &order.symbol,
                    &order.client_order_id,
                    None,
                    order.side,
                    order.qty,
                    order.limit_price,
                    None,
                    None,
                ));
                Ok(())
            }
            Err(_elapsed) => {
                // Idempotency risk: escalate to the reconciler, never retry
                // blind.
                warn!(client_order_id = %order.client_order_id, "submit timed out");
                match self.reconciler.handle_timeout(&order.client_order_id).await {
                    Ok(outcome) => {
                        info!(
                            client_order_id = %order.client_order_id,
                            should_retry = outcome.should_retry,
                            "timeout reconciled"
                        );
                    }
                    Err(e) => {
                        // No fresh evidence: the order stays UNKNOWN for the
                        // next sweep.
                        warn!(
                            client_order_id = %order.client_order_id,
                            error = %e,
                            "timeout reconciliation deferred"
                        );
                    }
                }
                Ok(())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Metrics + heartbeat
    // -------------------------------------------------------------------------

    fn record_metrics(
        &mut self,
        account: &crate::broker::Account,
        prev_equity: Option<f64>,
        dd: &crate::risk::DrawdownMetrics,
    ) {
        let positions_value = self
            .cache
            .all_positions()
            .map(|positions| positions.iter().map(|p| p.market_value).sum())
            .unwrap_or(0.0);

        let row = metrics::performance_row(
            &Utc::now().format("%Y-%m-%d").to_string(),
            account.equity,
            account.cash,
            positions_value,
            prev_equity,
            dd,
        );
        if let Err(e) = self.store.insert_performance(&row) {
            warn!(error = %e, "performance snapshot failed");
        }

        if self.drawdown.should_reduce_exposure(dd) {
            self.alerter.warning(&format!(
                "drawdown {:.2}% from peak, exposure reduced",
                dd.current_drawdown_pct
            ));
        }
    }

    fn heartbeat(&mut self) {
        let ttl = self.config.tick_interval_secs.max(1) * 2;
        if let Err(e) = self.cache.send_heartbeat(ENGINE_PROCESS, ttl) {
            warn!(error = %e, "heartbeat write failed");
        }

        // The heartbeat EVENT is throttled; the cache heartbeat is not.
        let due = self
            .last_heartbeat_event
            .map(|t| t.elapsed().as_secs() >= 60)
            .unwrap_or(true);
        if due {
            let _ = self.log.write(&events::heartbeat_event(ENGINE_PROCESS));
            self.last_heartbeat_event = Some(Instant::now());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::storage::MemoryStateStore;
    use chrono::NaiveDate;

    fn local(now: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(now, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn friday_cutoff_predicate() {
        let cutoff = NaiveTime::from_hms_opt(15, 55, 0).unwrap();

        // 2026-07-31 is a Friday.
        assert!(friday_cutoff_due(local("2026-07-31 15:55:00"), cutoff));
        assert!(friday_cutoff_due(local("2026-07-31 15:56:00"), cutoff));
        assert!(friday_cutoff_due(local("2026-07-31 23:00:00"), cutoff));
        assert!(!friday_cutoff_due(local("2026-07-31 15:54:59"), cutoff));
        // Thursday and Saturday at the same time: no.
        assert!(!friday_cutoff_due(local("2026-07-30 16:00:00"), cutoff));
        assert!(!friday_cutoff_due(local("2026-08-01 16:00:00"), cutoff));
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: TradingEngine,
        broker: Arc<PaperBroker>,
        cache: Arc<MemoryStateStore>,
        log: Arc<AppendLog>,
    }

    fn fixture(initial_equity: f64, dry_run: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(AppendLog::open(dir.path().join("events.jsonl"), 100.0, 3).unwrap());
        let store = Arc::new(ColumnStore::open(dir.path().join("analytics.db")).unwrap());
        let cache = Arc::new(MemoryStateStore::new());
        let broker = Arc::new(PaperBroker::new(100_000.0, 10.0, 5.0));

        let mut config = EngineConfig::default();
        config.execution.dry_run = dry_run;
        config.symbols = vec!["AAPL".into()];

        let engine = TradingEngine::new(
            config,
            broker.clone(),
            log.clone(),
            store,
            cache.clone(),
            None,
            initial_equity,
        )
        .unwrap();

        Fixture {
            _dir: dir,
            engine,
            broker,
            cache,
            log,
        }
    }

    fn event_kinds(log: &AppendLog) -> Vec<crate::events::EventKind> {
        log.read_all()
            .unwrap()
            .iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn friday_cutoff_flattens_and_alerts() {
        let mut f = fixture(100_000.0, false);

        // An open position going into Friday afternoon.
        f.broker
            .submit_limit_order("AAPL", 10.0, Side::Buy, 150.0, "seed1")
            .await
            .unwrap();
        f.broker
            .submit_limit_order("MSFT", 5.0, Side::Buy, 200.0, "seed2")
            .await
            .unwrap();
        assert_eq!(f.broker.list_positions().await.unwrap().len(), 2);

        // Friday 15:56 local.
        f.engine
            .tick_at(local("2026-07-31 15:56:00"))
            .await
            .unwrap();

        // Everything flattened, a risk alert written, heartbeat present.
        assert!(f.broker.list_positions().await.unwrap().is_empty());
        let kinds = event_kinds(&f.log);
        assert!(kinds.contains(&crate::events::EventKind::RiskAlert));
        assert!(f.cache.check_heartbeat(ENGINE_PROCESS).unwrap().is_some());

        let alerts: Vec<_> = f
            .log
            .read_all()
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == crate::events::EventKind::RiskAlert)
            .collect();
        assert_eq!(alerts[0].data["type"], "friday_force_close");
        assert_eq!(alerts[0].data["detail"]["positions_closed"], 2);
    }

    #[tokio::test]
    async fn friday_cutoff_is_quiet_when_already_flat() {
        let mut f = fixture(100_000.0, false);

        f.engine
            .tick_at(local("2026-07-31 16:00:00"))
            .await
            .unwrap();

        let kinds = event_kinds(&f.log);
        assert!(!kinds.contains(&crate::events::EventKind::RiskAlert));
    }

    #[tokio::test]
    async fn market_closed_only_heartbeats() {
        let mut f = fixture(100_000.0, false);
        f.broker.set_market_open(false);

        // A Wednesday mid-session time; the clock says closed regardless.
        f.engine
            .tick_at(local("2026-07-29 12:00:00"))
            .await
            .unwrap();

        assert!(f.cache.check_heartbeat(ENGINE_PROCESS).unwrap().is_some());
        // No position sync happened: positions namespace untouched.
        assert!(f.cache.all_positions().unwrap().is_empty());
        // Heartbeat event, nothing else of substance.
        let kinds = event_kinds(&f.log);
        assert!(kinds.iter().all(|k| *k == crate::events::EventKind::Heartbeat));
    }

    #[tokio::test]
    async fn drawdown_halt_writes_alert_and_skips_execution() {
        // Initial equity far above the broker's actual equity: -20% total
        // drawdown, beyond the 10% halt limit.
        let mut f = fixture(125_000.0, false);

        f.engine
            .tick_at(local("2026-07-29 12:00:00"))
            .await
            .unwrap();

        let alerts: Vec<_> = f
            .log
            .read_all()
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == crate::events::EventKind::RiskAlert)
            .collect();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].data["type"], "drawdown_halt");
        // Nothing was minted or submitted under the halt.
        assert!(f.engine.orders.is_empty());
    }

    #[tokio::test]
    async fn healthy_tick_records_metrics_and_equity() {
        let mut f = fixture(100_000.0, false);

        f.engine
            .tick_at(local("2026-07-29 12:00:00"))
            .await
            .unwrap();

        let history = f.cache.equity_history().unwrap();
        assert_eq!(history.len(), 1);
        assert!((history[0] - 100_000.0).abs() < 1e-6);
        assert!(f
            .cache
            .get_state("last_equity")
            .unwrap()
            .unwrap()
            .as_f64()
            .is_some());
    }

    #[tokio::test]
    async fn dry_run_records_intent_without_submission() {
        let f = fixture(100_000.0, true);

        let order = f
            .engine
            .orders
            .mint(
                "AAPL",
                Side::Buy,
                10.0,
                OrderType::Limit,
                Some(150.0),
                None,
                None,
            )
            .unwrap();
        f.engine.submit(order.client_order_id.clone()).await.unwrap();

        // The broker never saw it.
        assert!(f
            .broker
            .get_order_by_client_id(&order.client_order_id)
            .await
            .unwrap()
            .is_none());
        // The intent is on the log.
        let kinds = event_kinds(&f.log);
        assert!(kinds.contains(&crate::events::EventKind::OrderSubmitted));
    }

    #[tokio::test]
    async fn live_submit_fills_and_logs() {
        let f = fixture(100_000.0, false);

        let order = f
            .engine
            .orders
            .mint(
                "AAPL",
                Side::Buy,
                10.0,
                OrderType::Limit,
                Some(150.0),
                Some("ema_crossover"),
                Some("s1"),
            )
            .unwrap();
        f.engine.submit(order.client_order_id.clone()).await.unwrap();

        let tracked = f.engine.orders.get(&order.client_order_id).unwrap();
        assert_eq!(tracked.status, OrderStatus::Filled);
        assert!(tracked.broker_order_id.is_some());

        let kinds = event_kinds(&f.log);
        assert!(kinds.contains(&crate::events::EventKind::OrderSubmitted));
        assert!(kinds.contains(&crate::events::EventKind::OrderFilled));

        // The cache saw the terminal order too.
        let cached = f
            .cache
            .get_order_by_client_id(&order.client_order_id)
            .unwrap()
            .unwrap();
        assert_eq!(cached.status, "filled");
    }

    #[tokio::test]
    async fn rejected_submit_marks_failed() {
        let f = fixture(100_000.0, false);

        // Selling a position we do not hold: the paper broker rejects it.
        let order = f
            .engine
            .orders
            .mint("AAPL", Side::Sell, 10.0, OrderType::Limit, Some(150.0), None, None)
            .unwrap();
        f.engine.submit(order.client_order_id.clone()).await.unwrap();

        assert_eq!(
            f.engine.orders.get(&order.client_order_id).unwrap().status,
            OrderStatus::Failed
        );
        let kinds = event_kinds(&f.log);
        assert!(kinds.contains(&crate::events::EventKind::OrderRejected));
    }

    #[test]
    fn weekday_reference_dates_are_correct() {
        // Guard the dates used above.
        assert_eq!(
            NaiveDate::from_ymd_opt(2026, 7, 31).unwrap().weekday(),
            Weekday::Fri
        );
        assert_eq!(
            NaiveDate::from_ymd_opt(2026, 7, 29).unwrap().weekday(),
            Weekday::Wed
        );
    }
}
